//!
//! # Sync Engine
//!
//! Offline-first synchronization between a local durable store and one authoritative server.
//!
//! Every local mutation is applied optimistically to the [`LocalStore`] and, in the same
//! transaction, appended to the [`Outbox`]. A pool of [`SyncWorker`] slots drains the outbox
//! against a [`RemoteGateway`], retrying transient failures with exponential backoff and handing
//! version mismatches to a [`ConflictResolver`]. Outcomes that matter to the user are reported
//! through [`SyncEvent`]s and persisted as [`Issue`]s keyed by entity.
//!
//! ## Basic example
//!
//! ```
//! use tl_sync::{InMemoryGateway, SyncConfig, SyncEngine, SyncEntity};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Note {
//!     text: String,
//! }
//!
//! impl SyncEntity for Note {
//!     const ENTITY_TYPE: &'static str = "note";
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tl_sync::Error> {
//!     let gateway = InMemoryGateway::new();
//!     let engine = SyncEngine::in_memory(SyncConfig::default(), gateway.clone()).await?;
//!
//!     let note = engine
//!         .repository()
//!         .create(Note { text: "buy milk".to_string() })
//!         .await?;
//!     assert!(note.dirty);
//!
//!     engine.worker().drain().await?;
//!
//!     let synced = engine.repository().get::<Note>(note.id).await?.expect("record exists");
//!     assert!(!synced.dirty);
//!     assert_eq!(synced.version, 1);
//!
//!     Ok(())
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod clock;
mod config;
mod db;
mod engine;
mod error;
mod events;
mod gateway;
mod issues;
mod locks;
mod operation;
mod outbox;
mod record;
mod repository;
mod resolver;
mod store;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use db::Database;
pub use engine::{RecoveryReport, SyncEngine};
pub use error::Error;
pub use events::{EventBus, SyncEvent};
pub use gateway::{
	memory::{GatewayCall, InMemoryGateway},
	FailureClass, RemoteAck, RemoteError, RemoteGateway,
};
pub use issues::{Issue, IssueKind, Issues};
pub use operation::{OperationId, OperationKind, OperationState, SyncOperation};
pub use outbox::{EnqueueOutcome, Outbox};
pub use record::{DomainRecord, EntityId, EntityKey, EntityType, SyncEntity};
pub use repository::{DeleteOutcome, Repository};
pub use resolver::{ConflictResolver, Notice, Resolution, ServerAuthoritative};
pub use store::LocalStore;
pub use worker::{
	backoff_delay, DrainReport, OperationOutcome, SlotState, SyncTrigger, SyncWorker,
	WorkerHandle,
};
