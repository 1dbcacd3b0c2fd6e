//! Database infrastructure using sqlx over SQLite

use std::{path::Path, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{
	sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
	Sqlite, SqlitePool, Transaction,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::error::Error;

/// Each entry brings the schema from `user_version == index` to `index + 1`.
const MIGRATIONS: &[&str] = &[
	// v1: records, outbox and the user facing issues board
	r"
	CREATE TABLE records (
		entity_type TEXT NOT NULL,
		id TEXT NOT NULL,
		payload BLOB NOT NULL,
		version INTEGER NOT NULL DEFAULT 0,
		dirty INTEGER NOT NULL DEFAULT 1,
		pending_deletion INTEGER NOT NULL DEFAULT 0,
		last_synced_at INTEGER,
		PRIMARY KEY (entity_type, id)
	);

	CREATE INDEX records_dirty ON records (entity_type) WHERE dirty = 1;

	CREATE TABLE operations (
		seq INTEGER PRIMARY KEY AUTOINCREMENT,
		id TEXT NOT NULL UNIQUE,
		kind TEXT NOT NULL,
		entity_type TEXT NOT NULL,
		entity_id TEXT NOT NULL,
		payload_snapshot BLOB,
		base_version INTEGER NOT NULL,
		attempt_count INTEGER NOT NULL DEFAULT 0,
		last_attempt_at INTEGER,
		last_error TEXT,
		is_processing INTEGER NOT NULL DEFAULT 0,
		parked INTEGER NOT NULL DEFAULT 0,
		next_attempt_at INTEGER,
		created_at INTEGER NOT NULL
	);

	CREATE INDEX operations_entity ON operations (entity_type, entity_id, seq);

	CREATE TABLE issues (
		entity_type TEXT NOT NULL,
		entity_id TEXT NOT NULL,
		kind TEXT NOT NULL,
		op_id TEXT,
		message TEXT NOT NULL,
		raised_at INTEGER NOT NULL,
		PRIMARY KEY (entity_type, entity_id, kind)
	);
	",
];

/// Shared handle to the SQLite database backing the [`LocalStore`](crate::LocalStore),
/// the [`Outbox`](crate::Outbox) and the [`Issues`](crate::Issues) board
#[derive(Debug, Clone)]
pub struct Database {
	pool: SqlitePool,
}

impl Database {
	/// Open (creating if needed) the database file at `path` and run migrations
	pub async fn open(path: &Path) -> Result<Self, Error> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).map_err(|e| Error::file_io(parent, e))?;
		}

		let options = SqliteConnectOptions::new()
			.filename(path)
			.create_if_missing(true)
			.journal_mode(SqliteJournalMode::Wal)
			.synchronous(SqliteSynchronous::Normal)
			.busy_timeout(Duration::from_secs(5));

		let pool = SqlitePoolOptions::new()
			.max_connections(4)
			.acquire_timeout(Duration::from_secs(8))
			.connect_with(options)
			.await?;

		info!(path = %path.display(), "Opened sync database");

		let db = Self { pool };
		db.migrate().await?;
		Ok(db)
	}

	/// A private in-memory database, gone once the last handle is dropped
	pub async fn in_memory() -> Result<Self, Error> {
		let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

		// Every new connection would see a brand new empty database, so we keep exactly one
		// and never let it expire
		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.min_connections(1)
			.idle_timeout(None)
			.max_lifetime(None)
			.connect_with(options)
			.await?;

		let db = Self { pool };
		db.migrate().await?;
		Ok(db)
	}

	async fn migrate(&self) -> Result<(), Error> {
		let mut tx = self.pool.begin().await?;

		let current = sqlx::query_scalar::<_, i64>("PRAGMA user_version")
			.fetch_one(&mut *tx)
			.await?;

		let current = usize::try_from(current)
			.map_err(|_| Error::corrupt("pragma", format!("negative user_version {current}")))?;

		for (version, migration) in MIGRATIONS.iter().enumerate().skip(current) {
			debug!(to = version + 1, "Applying sync schema migration");
			sqlx::raw_sql(migration).execute(&mut *tx).await?;
			sqlx::raw_sql(&format!("PRAGMA user_version = {}", version + 1))
				.execute(&mut *tx)
				.await?;
		}

		tx.commit().await?;

		if current < MIGRATIONS.len() {
			info!(
				from = current,
				to = MIGRATIONS.len(),
				"Sync schema migrations completed"
			);
		}

		Ok(())
	}

	pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, Error> {
		self.pool.begin().await.map_err(Into::into)
	}

	pub(crate) const fn pool(&self) -> &SqlitePool {
		&self.pool
	}
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
	at.timestamp_millis()
}

pub(crate) fn from_millis(table: &'static str, millis: i64) -> Result<DateTime<Utc>, Error> {
	DateTime::from_timestamp_millis(millis)
		.ok_or_else(|| Error::corrupt(table, format!("timestamp out of range: {millis}")))
}

pub(crate) fn parse_id(table: &'static str, id: &str) -> Result<Uuid, Error> {
	Uuid::parse_str(id).map_err(|e| Error::corrupt(table, format!("invalid id '{id}': {e}")))
}

pub(crate) fn version_to_db(version: u64) -> i64 {
	#[allow(clippy::cast_possible_wrap)]
	// SAFETY: we had to store using i64 due to SQLite limitations, versions never get near 2^63
	{
		version as i64
	}
}

pub(crate) fn version_from_db(table: &'static str, version: i64) -> Result<u64, Error> {
	u64::try_from(version).map_err(|_| Error::corrupt(table, format!("negative version {version}")))
}
