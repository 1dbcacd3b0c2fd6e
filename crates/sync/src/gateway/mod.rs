//! Contract with the authoritative server

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::{
	operation::OperationId,
	record::{EntityId, EntityType},
};

pub mod memory;

/// What the server answers to an accepted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAck {
	pub id: EntityId,
	/// Version of the entity after the write, always greater than the base version.
	pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
	/// The server's version is not the one the write was based on. `server_payload` is `None`
	/// when the entity was deleted on the server.
	#[error("version conflict, server is at version {server_version}")]
	Conflict {
		server_version: u64,
		server_payload: Option<Value>,
	},
	#[error("request timed out")]
	Timeout,
	#[error("server unreachable: {0}")]
	Unreachable(String),
	#[error("server error <status={status}>: {message}")]
	Server { status: u16, message: String },
	#[error("request rejected <status={status}>: {message}")]
	Rejected { status: u16, message: String },
}

/// How the worker reacts to a [`RemoteError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailureClass {
	/// Handed to the [`ConflictResolver`](crate::ConflictResolver).
	Conflict,
	/// Retried later with backoff.
	Transient,
	/// Dropped and reported, retrying would fail the same way.
	Permanent,
}

impl RemoteError {
	/// Maps a non success HTTP status to the matching error. Request timeouts, throttling and
	/// server side failures are worth retrying, any other status is not.
	#[must_use]
	pub fn from_status(status: u16, message: impl Into<String>) -> Self {
		let message = message.into();

		match status {
			408 | 425 | 429 | 500..=599 => Self::Server { status, message },
			_ => Self::Rejected { status, message },
		}
	}

	#[must_use]
	pub const fn class(&self) -> FailureClass {
		match self {
			Self::Conflict { .. } => FailureClass::Conflict,
			Self::Timeout | Self::Unreachable(_) | Self::Server { .. } => FailureClass::Transient,
			Self::Rejected { .. } => FailureClass::Permanent,
		}
	}
}

/// CRUD endpoints of the server, one set shared by every entity type.
///
/// Every call carries the id of the operation that produced it as idempotency key: the server
/// must answer a repeated key with the outcome of the first call instead of applying it again.
#[async_trait]
pub trait RemoteGateway: Send + Sync + 'static {
	async fn create(
		&self,
		entity_type: &EntityType,
		id: EntityId,
		payload: &Value,
		idempotency_key: OperationId,
	) -> Result<RemoteAck, RemoteError>;

	async fn update(
		&self,
		entity_type: &EntityType,
		id: EntityId,
		payload: &Value,
		base_version: u64,
		idempotency_key: OperationId,
	) -> Result<RemoteAck, RemoteError>;

	async fn delete(
		&self,
		entity_type: &EntityType,
		id: EntityId,
		base_version: u64,
		idempotency_key: OperationId,
	) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn statuses_are_classified() {
		for status in [408, 429, 500, 503] {
			assert_eq!(
				RemoteError::from_status(status, "boom").class(),
				FailureClass::Transient
			);
		}

		for status in [400, 401, 404, 422] {
			assert_eq!(
				RemoteError::from_status(status, "nope").class(),
				FailureClass::Permanent
			);
		}

		assert_eq!(RemoteError::Timeout.class(), FailureClass::Transient);
		assert_eq!(
			RemoteError::Conflict {
				server_version: 4,
				server_payload: None
			}
			.class(),
			FailureClass::Conflict
		);
	}
}
