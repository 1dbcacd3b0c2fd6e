#![allow(dead_code)]

use std::{error::Error as StdError, sync::Arc};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tl_sync::{
	Database, DomainRecord, DrainReport, EntityId, EntityKey, InMemoryGateway, ManualClock,
	ServerAuthoritative, SyncConfig, SyncEngine, SyncEntity, SyncEvent,
};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
	pub text: String,
}

impl SyncEntity for Note {
	const ENTITY_TYPE: &'static str = "note";

	fn validate(&self) -> Result<(), Box<dyn StdError + Send + Sync>> {
		if self.text.trim().is_empty() {
			return Err("note text must not be empty".into());
		}

		Ok(())
	}
}

pub fn note(text: &str) -> Note {
	Note {
		text: text.to_string(),
	}
}

pub fn start_time() -> DateTime<Utc> {
	Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0)
		.single()
		.expect("valid start time")
}

/// For tests that don't go through `#[traced_test]`.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

/// An engine over an in-memory database, talking to an [`InMemoryGateway`] and driven by a
/// [`ManualClock`].
pub struct Harness {
	pub engine: SyncEngine,
	pub gateway: InMemoryGateway,
	pub clock: ManualClock,
}

impl Harness {
	pub async fn new() -> Self {
		Self::with_config(SyncConfig::default()).await
	}

	pub async fn with_config(config: SyncConfig) -> Self {
		let db = Database::in_memory().await.expect("in-memory database");
		Self::with_database(config, db, InMemoryGateway::new()).await
	}

	pub async fn with_database(config: SyncConfig, db: Database, gateway: InMemoryGateway) -> Self {
		let clock = ManualClock::new(start_time());

		let engine = SyncEngine::with_components(
			config,
			db,
			Arc::new(gateway.clone()),
			Arc::new(ServerAuthoritative),
			Arc::new(clock.clone()),
		)
		.await
		.expect("engine");

		Self {
			engine,
			gateway,
			clock,
		}
	}

	pub fn key(&self, id: EntityId) -> EntityKey {
		EntityKey::new(Note::entity_type(), id)
	}

	pub async fn create(&self, text: &str) -> EntityId {
		self.engine
			.repository()
			.create(note(text))
			.await
			.expect("create note")
			.id
	}

	pub async fn update(&self, id: EntityId, text: &str) {
		self.engine
			.repository()
			.update(id, note(text))
			.await
			.expect("update note");
	}

	pub async fn record(&self, id: EntityId) -> Option<DomainRecord<Note>> {
		self.engine
			.repository()
			.get::<Note>(id)
			.await
			.expect("read note")
	}

	pub async fn drain(&self) -> DrainReport {
		self.engine.worker().drain().await.expect("drain outbox")
	}

	pub fn advance_secs(&self, secs: i64) {
		self.clock.advance(chrono::Duration::seconds(secs));
	}

	pub async fn outbox_len(&self) -> u64 {
		self.engine.outbox().len().await.expect("outbox length")
	}
}

/// Everything published so far, without waiting.
pub fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
	let mut events = Vec::new();
	while let Ok(event) = rx.try_recv() {
		events.push(event);
	}
	events
}
