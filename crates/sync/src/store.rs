use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::trace;

use super::{
	db::{from_millis, parse_id, to_millis, version_from_db, version_to_db, Database},
	error::Error,
	record::{DomainRecord, EntityId, EntityKey, EntityType},
};

const TABLE: &str = "records";

const SELECT_RECORD: &str = "SELECT entity_type, id, payload, version, dirty, pending_deletion, last_synced_at FROM records";

#[derive(sqlx::FromRow)]
struct RecordRow {
	entity_type: String,
	id: String,
	payload: Vec<u8>,
	version: i64,
	dirty: bool,
	pending_deletion: bool,
	last_synced_at: Option<i64>,
}

impl TryFrom<RecordRow> for DomainRecord {
	type Error = Error;

	fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
		Ok(Self {
			entity_type: EntityType::new(row.entity_type)?,
			id: parse_id(TABLE, &row.id)?,
			payload: serde_json::from_slice(&row.payload)?,
			version: version_from_db(TABLE, row.version)?,
			dirty: row.dirty,
			pending_deletion: row.pending_deletion,
			last_synced_at: row
				.last_synced_at
				.map(|millis| from_millis(TABLE, millis))
				.transpose()?,
		})
	}
}

/// Durable cache of domain records and their sync metadata.
///
/// Public methods run on their own connection. The crate internal `*_in` variants take a
/// connection so the engine can group a record write with its outbox entry in one transaction.
#[derive(Debug, Clone)]
pub struct LocalStore {
	db: Database,
}

impl LocalStore {
	#[must_use]
	pub const fn new(db: Database) -> Self {
		Self { db }
	}

	pub async fn get(
		&self,
		entity_type: &EntityType,
		id: EntityId,
	) -> Result<Option<DomainRecord>, Error> {
		let mut conn = self.db.pool().acquire().await?;
		Self::get_in(&mut conn, &EntityKey::new(entity_type.clone(), id)).await
	}

	/// Durable write of a whole record. Mutations coming from the user should go through the
	/// [`Repository`](crate::Repository), which also queues the matching operation.
	pub async fn put(&self, record: &DomainRecord) -> Result<(), Error> {
		let mut conn = self.db.pool().acquire().await?;
		Self::put_in(&mut conn, record).await
	}

	/// Clears `dirty` and stores the version acknowledged by the server.
	pub async fn mark_synced(
		&self,
		entity_type: &EntityType,
		id: EntityId,
		server_version: u64,
		synced_at: DateTime<Utc>,
	) -> Result<(), Error> {
		let mut conn = self.db.pool().acquire().await?;
		Self::mark_synced_in(
			&mut conn,
			&EntityKey::new(entity_type.clone(), id),
			server_version,
			synced_at,
		)
		.await
	}

	/// Removes the record after the server confirmed its deletion.
	pub async fn mark_deleted(&self, entity_type: &EntityType, id: EntityId) -> Result<bool, Error> {
		let mut conn = self.db.pool().acquire().await?;
		Self::remove_in(&mut conn, &EntityKey::new(entity_type.clone(), id)).await
	}

	pub async fn list(&self, entity_type: &EntityType) -> Result<Vec<DomainRecord>, Error> {
		sqlx::query_as::<_, RecordRow>(&format!(
			"{SELECT_RECORD} WHERE entity_type = ? ORDER BY rowid"
		))
		.bind(entity_type.as_str())
		.fetch_all(self.db.pool())
		.await?
		.into_iter()
		.map(DomainRecord::try_from)
		.collect()
	}

	/// Records whose payload the server has not acknowledged yet.
	///
	/// Meant for diagnostics and recovery, the outbox is what drives synchronization.
	pub async fn list_dirty(&self, entity_type: &EntityType) -> Result<Vec<DomainRecord>, Error> {
		sqlx::query_as::<_, RecordRow>(&format!(
			"{SELECT_RECORD} WHERE entity_type = ? AND dirty = 1 ORDER BY rowid"
		))
		.bind(entity_type.as_str())
		.fetch_all(self.db.pool())
		.await?
		.into_iter()
		.map(DomainRecord::try_from)
		.collect()
	}

	/// Dirty records of any type with nothing queued in the outbox, left behind by dropped or
	/// acknowledged failures.
	pub async fn list_dirty_unqueued(&self) -> Result<Vec<DomainRecord>, Error> {
		sqlx::query_as::<_, RecordRow>(&format!(
			"{SELECT_RECORD} WHERE dirty = 1 AND NOT EXISTS (
				SELECT 1 FROM operations
				WHERE operations.entity_type = records.entity_type
				AND operations.entity_id = records.id
			) ORDER BY rowid"
		))
		.fetch_all(self.db.pool())
		.await?
		.into_iter()
		.map(DomainRecord::try_from)
		.collect()
	}

	pub(crate) async fn get_in(
		conn: &mut SqliteConnection,
		key: &EntityKey,
	) -> Result<Option<DomainRecord>, Error> {
		sqlx::query_as::<_, RecordRow>(&format!(
			"{SELECT_RECORD} WHERE entity_type = ? AND id = ?"
		))
		.bind(key.entity_type.as_str())
		.bind(key.id.to_string())
		.fetch_optional(&mut *conn)
		.await?
		.map(DomainRecord::try_from)
		.transpose()
	}

	pub(crate) async fn put_in(
		conn: &mut SqliteConnection,
		record: &DomainRecord,
	) -> Result<(), Error> {
		trace!(key = %record.key(), version = record.version, dirty = record.dirty, "Writing record");

		sqlx::query(
			"INSERT INTO records (entity_type, id, payload, version, dirty, pending_deletion, last_synced_at)
			VALUES (?, ?, ?, ?, ?, ?, ?)
			ON CONFLICT (entity_type, id) DO UPDATE SET
				payload = excluded.payload,
				version = excluded.version,
				dirty = excluded.dirty,
				pending_deletion = excluded.pending_deletion,
				last_synced_at = excluded.last_synced_at",
		)
		.bind(record.entity_type.as_str())
		.bind(record.id.to_string())
		.bind(serde_json::to_vec(&record.payload)?)
		.bind(version_to_db(record.version))
		.bind(record.dirty)
		.bind(record.pending_deletion)
		.bind(record.last_synced_at.map(to_millis))
		.execute(&mut *conn)
		.await?;

		Ok(())
	}

	pub(crate) async fn mark_synced_in(
		conn: &mut SqliteConnection,
		key: &EntityKey,
		server_version: u64,
		synced_at: DateTime<Utc>,
	) -> Result<(), Error> {
		Self::set_synced_in(conn, key, server_version, synced_at, false).await
	}

	/// Takes the server version while keeping the record dirty, for when more local changes
	/// are still queued behind the acknowledged one.
	pub(crate) async fn advance_version_in(
		conn: &mut SqliteConnection,
		key: &EntityKey,
		server_version: u64,
		synced_at: DateTime<Utc>,
	) -> Result<(), Error> {
		Self::set_synced_in(conn, key, server_version, synced_at, true).await
	}

	async fn set_synced_in(
		conn: &mut SqliteConnection,
		key: &EntityKey,
		server_version: u64,
		synced_at: DateTime<Utc>,
		dirty: bool,
	) -> Result<(), Error> {
		let res = sqlx::query(
			"UPDATE records SET version = ?, dirty = ?, last_synced_at = ?
			WHERE entity_type = ? AND id = ?",
		)
		.bind(version_to_db(server_version))
		.bind(dirty)
		.bind(to_millis(synced_at))
		.bind(key.entity_type.as_str())
		.bind(key.id.to_string())
		.execute(&mut *conn)
		.await?;

		if res.rows_affected() == 0 {
			return Err(Error::NotFound(key.clone()));
		}

		Ok(())
	}

	pub(crate) async fn remove_in(
		conn: &mut SqliteConnection,
		key: &EntityKey,
	) -> Result<bool, Error> {
		let res = sqlx::query("DELETE FROM records WHERE entity_type = ? AND id = ?")
			.bind(key.entity_type.as_str())
			.bind(key.id.to_string())
			.execute(&mut *conn)
			.await?;

		Ok(res.rows_affected() > 0)
	}
}
