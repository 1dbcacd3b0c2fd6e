//! Status channel for the presentation layer

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;

use super::{
	issues::IssueKind,
	operation::{OperationId, OperationKind},
	record::EntityKey,
	resolver::Notice,
};

/// Asynchronous outcome of a queued mutation
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
	/// The server accepted the operation, `version` is `None` for deletions
	Synced {
		key: EntityKey,
		op_id: OperationId,
		kind: OperationKind,
		version: Option<u64>,
	},

	/// A transient failure, the operation will be tried again
	Retrying {
		key: EntityKey,
		op_id: OperationId,
		attempt: u32,
		next_attempt_at: DateTime<Utc>,
		error: String,
	},

	/// Rejected by the server or out of automatic attempts, the record stays dirty
	Failed {
		key: EntityKey,
		op_id: OperationId,
		kind: IssueKind,
		error: String,
	},

	/// A deletion of something the server never saw was settled locally
	Cancelled { key: EntityKey, op_id: OperationId },

	/// The server disagreed with our base version and won
	Conflict {
		key: EntityKey,
		op_id: OperationId,
		notice: Notice,
	},
}

impl SyncEvent {
	#[must_use]
	pub const fn key(&self) -> &EntityKey {
		match self {
			Self::Synced { key, .. }
			| Self::Retrying { key, .. }
			| Self::Failed { key, .. }
			| Self::Cancelled { key, .. }
			| Self::Conflict { key, .. } => key,
		}
	}
}

/// Event bus for broadcasting sync outcomes
#[derive(Debug, Clone)]
pub struct EventBus {
	sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	pub fn emit(&self, event: SyncEvent) {
		if self.sender.send(event).is_err() {
			trace!("No subscribers for sync event");
		}
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.sender.subscribe()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(256)
	}
}
