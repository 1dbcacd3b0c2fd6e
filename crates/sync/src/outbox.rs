use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, trace, warn};

use super::{
	db::{from_millis, parse_id, to_millis, version_from_db, version_to_db, Database},
	error::Error,
	operation::{OperationId, OperationKind, OperationState, SyncOperation},
	record::{EntityKey, EntityType},
};

const TABLE: &str = "operations";

const OPERATION_COLUMNS: &str = "id, kind, entity_type, entity_id, payload_snapshot, base_version, \
	attempt_count, last_attempt_at, last_error, is_processing, parked, next_attempt_at, created_at";

/// What [`Outbox::enqueue`] did with the operation it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
	/// Stored at the tail of the entity's queue.
	Appended(OperationId),
	/// Its payload was folded into this operation, already queued and not yet sent.
	Coalesced(OperationId),
	/// A deletion that replaced `dropped` updates the server never saw.
	Superseded { op_id: OperationId, dropped: u64 },
	/// A deletion of an entity whose creation never left the device, the whole queue for
	/// that entity was dropped along with it.
	Discarded { dropped: u64 },
}

impl EnqueueOutcome {
	/// The queued operation that now carries the change, if any.
	#[must_use]
	pub const fn op_id(&self) -> Option<OperationId> {
		match self {
			Self::Appended(op_id) | Self::Coalesced(op_id) | Self::Superseded { op_id, .. } => {
				Some(*op_id)
			}
			Self::Discarded { .. } => None,
		}
	}
}

#[derive(sqlx::FromRow)]
struct OperationRow {
	id: String,
	kind: String,
	entity_type: String,
	entity_id: String,
	payload_snapshot: Option<Vec<u8>>,
	base_version: i64,
	attempt_count: i64,
	last_attempt_at: Option<i64>,
	last_error: Option<String>,
	is_processing: bool,
	parked: bool,
	next_attempt_at: Option<i64>,
	created_at: i64,
}

impl TryFrom<OperationRow> for SyncOperation {
	type Error = Error;

	fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
		let millis = |millis: Option<i64>| millis.map(|m| from_millis(TABLE, m)).transpose();

		Ok(Self {
			id: parse_id(TABLE, &row.id)?,
			kind: OperationKind::from_str(&row.kind)
				.map_err(|_| Error::corrupt(TABLE, format!("unknown kind '{}'", row.kind)))?,
			entity_type: EntityType::new(row.entity_type)?,
			entity_id: parse_id(TABLE, &row.entity_id)?,
			payload_snapshot: row
				.payload_snapshot
				.as_deref()
				.map(serde_json::from_slice)
				.transpose()?,
			base_version: version_from_db(TABLE, row.base_version)?,
			attempt_count: u32::try_from(row.attempt_count).map_err(|_| {
				Error::corrupt(TABLE, format!("invalid attempt count {}", row.attempt_count))
			})?,
			last_attempt_at: millis(row.last_attempt_at)?,
			last_error: row.last_error,
			is_processing: row.is_processing,
			parked: row.parked,
			next_attempt_at: millis(row.next_attempt_at)?,
			created_at: from_millis(TABLE, row.created_at)?,
		})
	}
}

fn decode_all(rows: Vec<OperationRow>) -> Result<Vec<SyncOperation>, Error> {
	rows.into_iter().map(SyncOperation::try_from).collect()
}

/// Durable FIFO of pending mutations, one logical queue per entity.
///
/// Only the oldest operation of an entity can ever be handed out, and only while it is neither in
/// flight nor parked, so later changes can never overtake earlier ones on the wire.
#[derive(Debug, Clone)]
pub struct Outbox {
	db: Database,
}

impl Outbox {
	#[must_use]
	pub const fn new(db: Database) -> Self {
		Self { db }
	}

	/// Queues `op` on its own, outside of any record write.
	pub async fn enqueue(&self, op: &SyncOperation) -> Result<EnqueueOutcome, Error> {
		let mut tx = self.db.begin().await?;
		let outcome = Self::enqueue_in(&mut tx, op).await?;
		tx.commit().await?;

		Ok(outcome)
	}

	/// Atomically claims the next eligible operation, marking it as in flight.
	///
	/// An operation is eligible when it is the oldest one of its entity, is neither in flight
	/// nor parked and its backoff deadline, if any, has passed.
	pub async fn dequeue_next(
		&self,
		entity_type: Option<&EntityType>,
		now: DateTime<Utc>,
	) -> Result<Option<SyncOperation>, Error> {
		let entity_type = entity_type.map(EntityType::as_str);

		let claimed = sqlx::query_as::<_, OperationRow>(&format!(
			"UPDATE operations SET is_processing = 1, last_attempt_at = ?
			WHERE seq = (
				SELECT o.seq FROM operations o
				WHERE o.is_processing = 0
				AND o.parked = 0
				AND (o.next_attempt_at IS NULL OR o.next_attempt_at <= ?)
				AND (? IS NULL OR o.entity_type = ?)
				AND o.seq = (
					SELECT MIN(h.seq) FROM operations h
					WHERE h.entity_type = o.entity_type AND h.entity_id = o.entity_id
				)
				ORDER BY o.seq
				LIMIT 1
			)
			RETURNING {OPERATION_COLUMNS}"
		))
		.bind(to_millis(now))
		.bind(to_millis(now))
		.bind(entity_type)
		.bind(entity_type)
		.fetch_optional(self.db.pool())
		.await?
		.map(SyncOperation::try_from)
		.transpose()?;

		if let Some(op) = &claimed {
			trace!(op_id = %op.id, key = %op.key(), kind = %op.kind, "Claimed operation");
		}

		Ok(claimed)
	}

	/// Removes an operation the server acknowledged.
	pub async fn complete(&self, op_id: OperationId) -> Result<bool, Error> {
		let mut conn = self.db.pool().acquire().await?;
		Self::remove_in(&mut conn, op_id).await
	}

	/// Releases an in flight operation after a transient failure, to be tried again no earlier
	/// than `next_attempt_at`.
	pub async fn reschedule(
		&self,
		op_id: OperationId,
		error: &str,
		next_attempt_at: DateTime<Utc>,
	) -> Result<(), Error> {
		let mut conn = self.db.pool().acquire().await?;
		Self::reschedule_in(&mut conn, op_id, error, next_attempt_at).await
	}

	/// Folds consecutive never sent updates of `key` into the operation before them, returning
	/// how many operations were removed.
	pub async fn coalesce(&self, key: &EntityKey) -> Result<u64, Error> {
		let mut tx = self.db.begin().await?;
		let removed = Self::coalesce_in(&mut tx, key).await?;
		tx.commit().await?;

		Ok(removed)
	}

	pub async fn get(&self, op_id: OperationId) -> Result<Option<SyncOperation>, Error> {
		let mut conn = self.db.pool().acquire().await?;
		Self::get_in(&mut conn, op_id).await
	}

	/// Every queued operation, oldest first.
	pub async fn list(&self) -> Result<Vec<SyncOperation>, Error> {
		decode_all(
			sqlx::query_as::<_, OperationRow>(&format!(
				"SELECT {OPERATION_COLUMNS} FROM operations ORDER BY seq"
			))
			.fetch_all(self.db.pool())
			.await?,
		)
	}

	pub async fn pending_for(&self, key: &EntityKey) -> Result<Vec<SyncOperation>, Error> {
		let mut conn = self.db.pool().acquire().await?;
		Self::pending_for_in(&mut conn, key).await
	}

	pub async fn list_parked(&self) -> Result<Vec<SyncOperation>, Error> {
		decode_all(
			sqlx::query_as::<_, OperationRow>(&format!(
				"SELECT {OPERATION_COLUMNS} FROM operations WHERE parked = 1 ORDER BY seq"
			))
			.fetch_all(self.db.pool())
			.await?,
		)
	}

	pub async fn len(&self) -> Result<u64, Error> {
		let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM operations")
			.fetch_one(self.db.pool())
			.await?;

		u64::try_from(count).map_err(|_| Error::corrupt(TABLE, format!("negative count {count}")))
	}

	pub async fn is_empty(&self) -> Result<bool, Error> {
		self.len().await.map(|len| len == 0)
	}

	/// Earliest backoff deadline among the operations that could be claimed once it passes.
	pub async fn next_deadline(&self) -> Result<Option<DateTime<Utc>>, Error> {
		sqlx::query_scalar::<_, Option<i64>>(
			"SELECT MIN(next_attempt_at) FROM operations
			WHERE is_processing = 0 AND parked = 0 AND next_attempt_at IS NOT NULL",
		)
		.fetch_one(self.db.pool())
		.await?
		.map(|millis| from_millis(TABLE, millis))
		.transpose()
	}

	/// Hands back every operation left in flight by a previous run.
	///
	/// Nothing can be in flight when the engine starts, so any marked operation belongs to a
	/// process that died mid request. The server deduplicates by operation id, resending is safe.
	pub async fn release_stale(&self) -> Result<u64, Error> {
		let res = sqlx::query("UPDATE operations SET is_processing = 0 WHERE is_processing = 1")
			.execute(self.db.pool())
			.await?;

		if res.rows_affected() > 0 {
			warn!(
				count = res.rows_affected(),
				"Released operations left in flight by a previous run"
			);
		}

		Ok(res.rows_affected())
	}

	/// Gives back an in flight operation without counting an attempt, for when the worker
	/// could not finish handling it.
	pub(crate) async fn release(&self, op_id: OperationId) -> Result<bool, Error> {
		let res = sqlx::query("UPDATE operations SET is_processing = 0 WHERE id = ?")
			.bind(op_id.to_string())
			.execute(self.db.pool())
			.await?;

		Ok(res.rows_affected() > 0)
	}

	pub(crate) async fn enqueue_in(
		conn: &mut SqliteConnection,
		op: &SyncOperation,
	) -> Result<EnqueueOutcome, Error> {
		let key = op.key();
		let queued = Self::pending_for_in(conn, &key).await?;

		let outcome = match op.kind {
			OperationKind::Create => {
				Self::insert_in(conn, op).await?;
				EnqueueOutcome::Appended(op.id)
			}

			OperationKind::Update => match queued.last() {
				Some(tail)
					if tail.never_attempted()
						&& matches!(tail.kind, OperationKind::Create | OperationKind::Update) =>
				{
					Self::set_snapshot_in(conn, tail.id, op.payload_snapshot.as_ref()).await?;
					EnqueueOutcome::Coalesced(tail.id)
				}
				_ => {
					Self::insert_in(conn, op).await?;
					EnqueueOutcome::Appended(op.id)
				}
			},

			OperationKind::Delete => {
				let unsent_create = queued
					.first()
					.is_some_and(|head| head.kind == OperationKind::Create && head.never_attempted());

				if unsent_create {
					EnqueueOutcome::Discarded {
						dropped: Self::purge_entity_in(conn, &key).await?,
					}
				} else {
					let mut dropped = 0;
					for superseded in queued
						.iter()
						.filter(|queued_op| {
							queued_op.kind == OperationKind::Update && queued_op.never_attempted()
						})
					{
						if Self::remove_in(conn, superseded.id).await? {
							dropped += 1;
						}
					}

					Self::insert_in(conn, op).await?;

					if dropped == 0 {
						EnqueueOutcome::Appended(op.id)
					} else {
						EnqueueOutcome::Superseded {
							op_id: op.id,
							dropped,
						}
					}
				}
			}
		};

		debug!(%key, kind = %op.kind, ?outcome, "Enqueued operation");

		Ok(outcome)
	}

	pub(crate) async fn coalesce_in(
		conn: &mut SqliteConnection,
		key: &EntityKey,
	) -> Result<u64, Error> {
		let mut target: Option<SyncOperation> = None;
		let mut removed = 0;

		for op in Self::pending_for_in(conn, key).await? {
			let foldable = op.kind == OperationKind::Update && op.never_attempted();

			if let Some(into) = target.as_mut().filter(|_| foldable) {
				into.payload_snapshot = op.payload_snapshot;
				Self::remove_in(conn, op.id).await?;
				removed += 1;
				continue;
			}

			if let Some(into) = target.take() {
				Self::set_snapshot_in(conn, into.id, into.payload_snapshot.as_ref()).await?;
			}

			target = (op.never_attempted()
				&& matches!(op.kind, OperationKind::Create | OperationKind::Update))
			.then_some(op);
		}

		if let Some(into) = target {
			Self::set_snapshot_in(conn, into.id, into.payload_snapshot.as_ref()).await?;
		}

		if removed > 0 {
			debug!(%key, removed, "Coalesced queued updates");
		}

		Ok(removed)
	}

	async fn insert_in(conn: &mut SqliteConnection, op: &SyncOperation) -> Result<(), Error> {
		sqlx::query(&format!(
			"INSERT INTO operations ({OPERATION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
		))
		.bind(op.id.to_string())
		.bind(op.kind.as_ref())
		.bind(op.entity_type.as_str())
		.bind(op.entity_id.to_string())
		.bind(
			op.payload_snapshot
				.as_ref()
				.map(serde_json::to_vec)
				.transpose()?,
		)
		.bind(version_to_db(op.base_version))
		.bind(i64::from(op.attempt_count))
		.bind(op.last_attempt_at.map(to_millis))
		.bind(op.last_error.as_deref())
		.bind(op.is_processing)
		.bind(op.parked)
		.bind(op.next_attempt_at.map(to_millis))
		.bind(to_millis(op.created_at))
		.execute(&mut *conn)
		.await?;

		Ok(())
	}

	async fn set_snapshot_in(
		conn: &mut SqliteConnection,
		op_id: OperationId,
		payload: Option<&serde_json::Value>,
	) -> Result<(), Error> {
		sqlx::query("UPDATE operations SET payload_snapshot = ? WHERE id = ?")
			.bind(payload.map(serde_json::to_vec).transpose()?)
			.bind(op_id.to_string())
			.execute(&mut *conn)
			.await?;

		Ok(())
	}

	pub(crate) async fn get_in(
		conn: &mut SqliteConnection,
		op_id: OperationId,
	) -> Result<Option<SyncOperation>, Error> {
		sqlx::query_as::<_, OperationRow>(&format!(
			"SELECT {OPERATION_COLUMNS} FROM operations WHERE id = ?"
		))
		.bind(op_id.to_string())
		.fetch_optional(&mut *conn)
		.await?
		.map(SyncOperation::try_from)
		.transpose()
	}

	pub(crate) async fn pending_for_in(
		conn: &mut SqliteConnection,
		key: &EntityKey,
	) -> Result<Vec<SyncOperation>, Error> {
		decode_all(
			sqlx::query_as::<_, OperationRow>(&format!(
				"SELECT {OPERATION_COLUMNS} FROM operations
				WHERE entity_type = ? AND entity_id = ?
				ORDER BY seq"
			))
			.bind(key.entity_type.as_str())
			.bind(key.id.to_string())
			.fetch_all(&mut *conn)
			.await?,
		)
	}

	pub(crate) async fn has_ops_in(
		conn: &mut SqliteConnection,
		key: &EntityKey,
	) -> Result<bool, Error> {
		sqlx::query_scalar::<_, bool>(
			"SELECT EXISTS (SELECT 1 FROM operations WHERE entity_type = ? AND entity_id = ?)",
		)
		.bind(key.entity_type.as_str())
		.bind(key.id.to_string())
		.fetch_one(&mut *conn)
		.await
		.map_err(Into::into)
	}

	pub(crate) async fn remove_in(
		conn: &mut SqliteConnection,
		op_id: OperationId,
	) -> Result<bool, Error> {
		let res = sqlx::query("DELETE FROM operations WHERE id = ?")
			.bind(op_id.to_string())
			.execute(&mut *conn)
			.await?;

		Ok(res.rows_affected() > 0)
	}

	pub(crate) async fn reschedule_in(
		conn: &mut SqliteConnection,
		op_id: OperationId,
		error: &str,
		next_attempt_at: DateTime<Utc>,
	) -> Result<(), Error> {
		let res = sqlx::query(
			"UPDATE operations
			SET attempt_count = attempt_count + 1, last_error = ?, next_attempt_at = ?, is_processing = 0
			WHERE id = ?",
		)
		.bind(error)
		.bind(to_millis(next_attempt_at))
		.bind(op_id.to_string())
		.execute(&mut *conn)
		.await?;

		if res.rows_affected() == 0 {
			return Err(Error::OperationNotFound(op_id));
		}

		Ok(())
	}

	/// Takes the operation out of rotation after its last automatic attempt failed.
	pub(crate) async fn park_in(
		conn: &mut SqliteConnection,
		op_id: OperationId,
		error: &str,
	) -> Result<(), Error> {
		let res = sqlx::query(
			"UPDATE operations
			SET attempt_count = attempt_count + 1, last_error = ?, next_attempt_at = NULL,
				is_processing = 0, parked = 1
			WHERE id = ?",
		)
		.bind(error)
		.bind(op_id.to_string())
		.execute(&mut *conn)
		.await?;

		if res.rows_affected() == 0 {
			return Err(Error::OperationNotFound(op_id));
		}

		Ok(())
	}

	/// Puts a parked operation back in rotation with a fresh attempt budget.
	pub(crate) async fn unpark_in(
		conn: &mut SqliteConnection,
		op_id: OperationId,
	) -> Result<SyncOperation, Error> {
		let op = Self::expect_parked_in(conn, op_id).await?;

		sqlx::query(
			"UPDATE operations SET parked = 0, attempt_count = 0, next_attempt_at = NULL WHERE id = ?",
		)
		.bind(op_id.to_string())
		.execute(&mut *conn)
		.await?;

		Ok(op)
	}

	pub(crate) async fn expect_parked_in(
		conn: &mut SqliteConnection,
		op_id: OperationId,
	) -> Result<SyncOperation, Error> {
		let op = Self::get_in(conn, op_id)
			.await?
			.ok_or(Error::OperationNotFound(op_id))?;

		match op.state() {
			OperationState::Parked => Ok(op),
			state => Err(Error::UnexpectedOperationState {
				id: op_id,
				state,
				expected: OperationState::Parked,
			}),
		}
	}

	/// Moves the operations of `key` still based on `from` onto the version the server just
	/// acknowledged, so they are not mistaken for conflicts with our own write.
	pub(crate) async fn rebase_in(
		conn: &mut SqliteConnection,
		key: &EntityKey,
		from: u64,
		to: u64,
	) -> Result<u64, Error> {
		let res = sqlx::query(
			"UPDATE operations SET base_version = ?
			WHERE entity_type = ? AND entity_id = ? AND base_version = ?",
		)
		.bind(version_to_db(to))
		.bind(key.entity_type.as_str())
		.bind(key.id.to_string())
		.bind(version_to_db(from))
		.execute(&mut *conn)
		.await?;

		Ok(res.rows_affected())
	}

	pub(crate) async fn purge_entity_in(
		conn: &mut SqliteConnection,
		key: &EntityKey,
	) -> Result<u64, Error> {
		let res = sqlx::query("DELETE FROM operations WHERE entity_type = ? AND entity_id = ?")
			.bind(key.entity_type.as_str())
			.bind(key.id.to_string())
			.execute(&mut *conn)
			.await?;

		Ok(res.rows_affected())
	}
}
