use std::{io, path::Path};

use thiserror::Error;

use super::{
	operation::{OperationId, OperationState},
	record::EntityKey,
};

#[derive(Debug, Error)]
pub enum Error {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
	#[error("payload serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error("file I/O error: {source}; path: '{}'", path.display())]
	FileIO {
		path: Box<Path>,
		#[source]
		source: io::Error,
	},
	#[error("invalid config: {0}")]
	InvalidConfig(String),
	#[error("invalid entity type: '{0}'")]
	InvalidEntityType(String),
	#[error("corrupt row in `{table}`: {reason}")]
	CorruptRow { table: &'static str, reason: String },
	#[error("payload rejected: {0}")]
	Validation(String),

	#[error("record not found <key='{0}'>")]
	NotFound(EntityKey),
	#[error("record already exists <key='{0}'>")]
	AlreadyExists(EntityKey),
	#[error("record is pending deletion <key='{0}'>")]
	PendingDeletion(EntityKey),
	#[error("operation not found <id='{0}'>")]
	OperationNotFound(OperationId),
	#[error("operation <id='{id}'> is {state}, expected {expected}")]
	UnexpectedOperationState {
		id: OperationId,
		state: OperationState,
		expected: OperationState,
	},
	#[error("record <key='{0}'> is not dirty, nothing to retry")]
	NothingToRetry(EntityKey),
	#[error("record <key='{0}'> already has queued operations")]
	AlreadyQueued(EntityKey),
	#[error("worker slot panicked while processing operation <id='{0}'>")]
	SlotPanicked(OperationId),
}

impl Error {
	pub(crate) fn corrupt(table: &'static str, reason: impl Into<String>) -> Self {
		Self::CorruptRow {
			table,
			reason: reason.into(),
		}
	}

	pub(crate) fn file_io(path: impl AsRef<Path>, source: io::Error) -> Self {
		Self::FileIO {
			path: path.as_ref().into(),
			source,
		}
	}
}
