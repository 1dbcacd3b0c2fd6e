use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::record::{DomainRecord, EntityId, EntityKey, EntityType};

/// Unique identifier of a queued mutation, also sent as the idempotency key on the wire.
pub type OperationId = Uuid;

#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	Serialize,
	Deserialize,
	strum::Display,
	strum::EnumString,
	strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
	Create,
	Update,
	Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationState {
	/// Waiting in the queue, maybe with a backoff deadline.
	Pending,
	/// A remote call for it is in flight.
	Processing,
	/// Ran out of automatic retries, waits for the user to retry or acknowledge it.
	Parked,
}

/// One entry of the [`Outbox`](crate::Outbox).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
	pub id: OperationId,
	pub kind: OperationKind,
	pub entity_type: EntityType,
	pub entity_id: EntityId,
	/// Copy of the payload taken at enqueue time, `None` for deletions.
	pub payload_snapshot: Option<Value>,
	/// Version of the target record as known locally when the operation was enqueued.
	pub base_version: u64,
	pub attempt_count: u32,
	pub last_attempt_at: Option<DateTime<Utc>>,
	pub last_error: Option<String>,
	pub is_processing: bool,
	pub parked: bool,
	pub next_attempt_at: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
}

impl SyncOperation {
	fn from_record(
		kind: OperationKind,
		record: &DomainRecord,
		payload_snapshot: Option<Value>,
		now: DateTime<Utc>,
	) -> Self {
		Self {
			id: OperationId::new_v4(),
			kind,
			entity_type: record.entity_type.clone(),
			entity_id: record.id,
			payload_snapshot,
			base_version: record.version,
			attempt_count: 0,
			last_attempt_at: None,
			last_error: None,
			is_processing: false,
			parked: false,
			next_attempt_at: None,
			created_at: now,
		}
	}

	#[must_use]
	pub fn create(record: &DomainRecord, now: DateTime<Utc>) -> Self {
		Self::from_record(
			OperationKind::Create,
			record,
			Some(record.payload.clone()),
			now,
		)
	}

	#[must_use]
	pub fn update(record: &DomainRecord, now: DateTime<Utc>) -> Self {
		Self::from_record(
			OperationKind::Update,
			record,
			Some(record.payload.clone()),
			now,
		)
	}

	#[must_use]
	pub fn delete(record: &DomainRecord, now: DateTime<Utc>) -> Self {
		Self::from_record(OperationKind::Delete, record, None, now)
	}

	#[must_use]
	pub fn key(&self) -> EntityKey {
		EntityKey::new(self.entity_type.clone(), self.entity_id)
	}

	#[must_use]
	pub const fn state(&self) -> OperationState {
		if self.is_processing {
			OperationState::Processing
		} else if self.parked {
			OperationState::Parked
		} else {
			OperationState::Pending
		}
	}

	/// Never handed to the gateway, so its payload can still be swapped or the whole
	/// operation dropped without the server ever noticing.
	///
	/// `last_attempt_at` is stamped when a worker claims the operation and survives a manual
	/// retry, unlike `attempt_count`.
	#[must_use]
	pub const fn never_attempted(&self) -> bool {
		self.attempt_count == 0
			&& self.last_attempt_at.is_none()
			&& !self.is_processing
			&& !self.parked
	}
}
