use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::debug;

use super::{
	db::{from_millis, parse_id, to_millis, Database},
	error::Error,
	operation::OperationId,
	record::{EntityKey, EntityType},
};

const TABLE: &str = "issues";

/// Why an entity needs the user's attention.
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
pub enum IssueKind {
	/// The server refused the operation for good (validation, 4xx).
	Rejected,
	/// Every automatic attempt failed, the operation is parked.
	RetriesExhausted,
	/// A conflict discarded local edits in favor of the server's value.
	LocalChangesLost,
	/// The entity was deleted by someone else while we had pending changes.
	DeletedElsewhere,
	/// Our deletion lost against a newer server update, the record is back.
	DeleteReverted,
}

impl IssueKind {
	/// Failures go away once the entity syncs again, notices stay until acknowledged.
	#[must_use]
	pub const fn is_failure(self) -> bool {
		matches!(self, Self::Rejected | Self::RetriesExhausted)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
	pub entity_type: EntityType,
	pub entity_id: uuid::Uuid,
	pub kind: IssueKind,
	pub op_id: Option<OperationId>,
	pub message: String,
	pub raised_at: DateTime<Utc>,
}

impl Issue {
	#[must_use]
	pub fn key(&self) -> EntityKey {
		EntityKey::new(self.entity_type.clone(), self.entity_id)
	}
}

#[derive(sqlx::FromRow)]
struct IssueRow {
	entity_type: String,
	entity_id: String,
	kind: String,
	op_id: Option<String>,
	message: String,
	raised_at: i64,
}

impl TryFrom<IssueRow> for Issue {
	type Error = Error;

	fn try_from(row: IssueRow) -> Result<Self, Self::Error> {
		Ok(Self {
			entity_type: EntityType::new(row.entity_type)?,
			entity_id: parse_id(TABLE, &row.entity_id)?,
			kind: IssueKind::from_str(&row.kind)
				.map_err(|_| Error::corrupt(TABLE, format!("unknown kind '{}'", row.kind)))?,
			op_id: row
				.op_id
				.as_deref()
				.map(|id| parse_id(TABLE, id))
				.transpose()?,
			message: row.message,
			raised_at: from_millis(TABLE, row.raised_at)?,
		})
	}
}

/// Persistent, per-entity board of failures and conflict notices waiting for the user.
///
/// At most one issue of each kind is kept per entity, raising it again replaces the previous one.
#[derive(Debug, Clone)]
pub struct Issues {
	db: Database,
}

impl Issues {
	#[must_use]
	pub const fn new(db: Database) -> Self {
		Self { db }
	}

	pub async fn list(&self) -> Result<Vec<Issue>, Error> {
		sqlx::query_as::<_, IssueRow>(
			"SELECT entity_type, entity_id, kind, op_id, message, raised_at
			FROM issues ORDER BY raised_at, entity_type, entity_id",
		)
		.fetch_all(self.db.pool())
		.await?
		.into_iter()
		.map(Issue::try_from)
		.collect()
	}

	pub async fn for_entity(&self, key: &EntityKey) -> Result<Vec<Issue>, Error> {
		sqlx::query_as::<_, IssueRow>(
			"SELECT entity_type, entity_id, kind, op_id, message, raised_at
			FROM issues WHERE entity_type = ? AND entity_id = ? ORDER BY raised_at",
		)
		.bind(key.entity_type.as_str())
		.bind(key.id.to_string())
		.fetch_all(self.db.pool())
		.await?
		.into_iter()
		.map(Issue::try_from)
		.collect()
	}

	/// Returns whether there was such an issue to acknowledge.
	pub async fn acknowledge(&self, key: &EntityKey, kind: IssueKind) -> Result<bool, Error> {
		let res = sqlx::query("DELETE FROM issues WHERE entity_type = ? AND entity_id = ? AND kind = ?")
			.bind(key.entity_type.as_str())
			.bind(key.id.to_string())
			.bind(kind.as_ref())
			.execute(self.db.pool())
			.await?;

		Ok(res.rows_affected() > 0)
	}

	pub(crate) async fn raise(
		conn: &mut SqliteConnection,
		key: &EntityKey,
		kind: IssueKind,
		op_id: Option<OperationId>,
		message: &str,
		at: DateTime<Utc>,
	) -> Result<(), Error> {
		debug!(%key, %kind, "Raising sync issue");

		sqlx::query(
			"INSERT OR REPLACE INTO issues (entity_type, entity_id, kind, op_id, message, raised_at)
			VALUES (?, ?, ?, ?, ?, ?)",
		)
		.bind(key.entity_type.as_str())
		.bind(key.id.to_string())
		.bind(kind.as_ref())
		.bind(op_id.map(|id| id.to_string()))
		.bind(message)
		.bind(to_millis(at))
		.execute(&mut *conn)
		.await?;

		Ok(())
	}

	/// Drops the failure kinds for `key`, conflict notices are left for the user.
	pub(crate) async fn clear_failures(
		conn: &mut SqliteConnection,
		key: &EntityKey,
	) -> Result<(), Error> {
		sqlx::query(
			"DELETE FROM issues WHERE entity_type = ? AND entity_id = ? AND kind IN (?, ?)",
		)
		.bind(key.entity_type.as_str())
		.bind(key.id.to_string())
		.bind(IssueKind::Rejected.as_ref())
		.bind(IssueKind::RetriesExhausted.as_ref())
		.execute(&mut *conn)
		.await?;

		Ok(())
	}
}
