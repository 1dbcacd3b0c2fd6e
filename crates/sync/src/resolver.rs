//! Outcome of a version mismatch reported by the server

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
	issues::IssueKind,
	operation::{OperationKind, SyncOperation},
	record::DomainRecord,
};

/// What the user is told when a conflict discards local data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Notice {
	DeletedElsewhere,
	LocalChangesLost,
	DeleteReverted,
}

impl Notice {
	#[must_use]
	pub const fn issue_kind(self) -> IssueKind {
		match self {
			Self::DeletedElsewhere => IssueKind::DeletedElsewhere,
			Self::LocalChangesLost => IssueKind::LocalChangesLost,
			Self::DeleteReverted => IssueKind::DeleteReverted,
		}
	}

	#[must_use]
	pub const fn message(self) -> &'static str {
		match self {
			Self::DeletedElsewhere => "This item was deleted on another device",
			Self::LocalChangesLost => {
				"This item was changed on another device, your local changes were discarded"
			}
			Self::DeleteReverted => {
				"This item was changed on another device, so it was restored instead of deleted"
			}
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
	/// Forget the entity locally, along with every queued operation for it.
	RemoveLocal { notice: Notice },
	/// Overwrite the local record with the server's state and drop every queued operation.
	AdoptServer {
		version: u64,
		payload: Value,
		notice: Notice,
	},
}

impl Resolution {
	#[must_use]
	pub const fn notice(&self) -> Notice {
		match self {
			Self::RemoveLocal { notice } | Self::AdoptServer { notice, .. } => *notice,
		}
	}
}

/// Decides what happens when the server rejects an operation because its base version is stale.
///
/// Implementations must be deterministic: the same inputs always yield the same resolution.
pub trait ConflictResolver: Send + Sync + 'static {
	/// `server_payload` is `None` when the entity no longer exists on the server. `local` is the
	/// record as currently stored, it may hold edits newer than `op`.
	fn resolve(
		&self,
		op: &SyncOperation,
		local: Option<&DomainRecord>,
		server_version: u64,
		server_payload: Option<&Value>,
	) -> Resolution;
}

/// The server always wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerAuthoritative;

impl ConflictResolver for ServerAuthoritative {
	fn resolve(
		&self,
		op: &SyncOperation,
		_local: Option<&DomainRecord>,
		server_version: u64,
		server_payload: Option<&Value>,
	) -> Resolution {
		match server_payload {
			None => Resolution::RemoveLocal {
				notice: Notice::DeletedElsewhere,
			},
			Some(payload) => Resolution::AdoptServer {
				version: server_version,
				payload: payload.clone(),
				notice: if op.kind == OperationKind::Delete {
					Notice::DeleteReverted
				} else {
					Notice::LocalChangesLost
				},
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use chrono::Utc;
	use serde_json::json;

	use super::*;
	use crate::record::{EntityId, EntityType};

	fn record() -> DomainRecord {
		let mut record = DomainRecord::new_local(
			EntityType::from_static("note"),
			EntityId::new_v4(),
			json!({ "title": "ours" }),
		);
		record.version = 3;
		record
	}

	#[test]
	fn stale_update_adopts_the_server_state() {
		let local = record();
		let op = SyncOperation::update(&local, Utc::now());
		let theirs = json!({ "title": "theirs" });

		let resolution = ServerAuthoritative.resolve(&op, Some(&local), 4, Some(&theirs));

		assert_eq!(
			resolution,
			Resolution::AdoptServer {
				version: 4,
				payload: theirs.clone(),
				notice: Notice::LocalChangesLost,
			}
		);
		// Same inputs, same answer
		assert_eq!(
			ServerAuthoritative.resolve(&op, Some(&local), 4, Some(&theirs)),
			resolution
		);
	}

	#[test]
	fn remote_deletion_removes_the_local_record() {
		let local = record();
		let op = SyncOperation::update(&local, Utc::now());

		let resolution = ServerAuthoritative.resolve(&op, Some(&local), 4, None);

		assert_eq!(resolution.notice(), Notice::DeletedElsewhere);
		assert!(matches!(resolution, Resolution::RemoveLocal { .. }));
	}

	#[test]
	fn losing_delete_restores_the_record() {
		let local = record();
		let op = SyncOperation::delete(&local, Utc::now());

		let resolution =
			ServerAuthoritative.resolve(&op, Some(&local), 5, Some(&json!({ "title": "theirs" })));

		assert_eq!(resolution.notice(), Notice::DeleteReverted);
		assert_eq!(resolution.notice().issue_kind(), IssueKind::DeleteReverted);
	}
}
