//! Wiring of the sync engine parts

use std::{path::Path, sync::Arc};

use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use super::{
	clock::{Clock, SystemClock},
	config::SyncConfig,
	db::Database,
	error::Error,
	events::{EventBus, SyncEvent},
	gateway::RemoteGateway,
	issues::Issues,
	locks::EntityLocks,
	operation::{OperationId, SyncOperation},
	outbox::Outbox,
	record::{EntityId, EntityKey, EntityType},
	repository::Repository,
	resolver::{ConflictResolver, ServerAuthoritative},
	store::LocalStore,
	worker::{SlotState, SyncTrigger, SyncWorker, WorkerHandle},
};

/// What [`SyncEngine::recover`] found left over by a previous run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
	/// Operations that were in flight when the previous run stopped.
	pub released: u64,
	/// Dirty records with nothing queued, see [`SyncEngine::retry_entity`].
	pub unqueued: Vec<EntityKey>,
}

/// Owns every part of the engine and hands out the narrow interfaces the app needs.
///
/// Nothing here is global: build as many engines as needed, each over its own database.
#[derive(Debug)]
pub struct SyncEngine {
	config: Arc<SyncConfig>,
	db: Database,
	store: LocalStore,
	outbox: Outbox,
	issues: Issues,
	events: EventBus,
	locks: EntityLocks,
	clock: Arc<dyn Clock>,
	worker: SyncWorker,
	repository: Repository,
	pool: Mutex<Option<WorkerHandle>>,
}

impl SyncEngine {
	/// Loads (or creates) the config stored in `data_dir` and opens the database it points to.
	pub async fn open_in(
		data_dir: impl AsRef<Path>,
		gateway: impl RemoteGateway,
	) -> Result<Self, Error> {
		let config = SyncConfig::load_from(data_dir)?;
		Self::open(config, gateway).await
	}

	/// Opens the database at `config.database_path`, or an in-memory one when unset.
	pub async fn open(config: SyncConfig, gateway: impl RemoteGateway) -> Result<Self, Error> {
		let db = match &config.database_path {
			Some(path) => Database::open(path).await?,
			None => Database::in_memory().await?,
		};

		Self::with_components(
			config,
			db,
			Arc::new(gateway),
			Arc::new(ServerAuthoritative),
			Arc::new(SystemClock),
		)
		.await
	}

	pub async fn in_memory(config: SyncConfig, gateway: impl RemoteGateway) -> Result<Self, Error> {
		Self::with_components(
			config,
			Database::in_memory().await?,
			Arc::new(gateway),
			Arc::new(ServerAuthoritative),
			Arc::new(SystemClock),
		)
		.await
	}

	pub async fn with_components(
		config: SyncConfig,
		db: Database,
		gateway: Arc<dyn RemoteGateway>,
		resolver: Arc<dyn ConflictResolver>,
		clock: Arc<dyn Clock>,
	) -> Result<Self, Error> {
		// 1. Config must make sense before anything runs with it
		config.validate()?;
		let config = Arc::new(config);

		// 2. Shared plumbing
		let events = EventBus::new(config.event_capacity);
		let locks = EntityLocks::default();

		// 3. Worker, the repository wakes it up through its trigger channel
		let worker = SyncWorker::new(
			db.clone(),
			gateway,
			resolver,
			Arc::clone(&clock),
			locks.clone(),
			events.clone(),
			Arc::clone(&config),
			async_channel::bounded(1),
		);

		let engine = Self {
			store: LocalStore::new(db.clone()),
			outbox: Outbox::new(db.clone()),
			issues: Issues::new(db.clone()),
			repository: Repository::new(
				db.clone(),
				locks.clone(),
				Arc::clone(&clock),
				worker.clone(),
			),
			config,
			db,
			events,
			locks,
			clock,
			worker,
			pool: Mutex::new(None),
		};

		// 4. Pick up whatever the previous run left behind
		engine.recover().await?;

		Ok(engine)
	}

	/// Releases operations left in flight by a crash and reports dirty records with nothing
	/// queued. Runs once on construction.
	pub async fn recover(&self) -> Result<RecoveryReport, Error> {
		let released = self.outbox.release_stale().await?;

		let unqueued = self
			.store
			.list_dirty_unqueued()
			.await?
			.into_iter()
			.map(|record| record.key())
			.collect::<Vec<_>>();

		if !unqueued.is_empty() {
			warn!(
				count = unqueued.len(),
				"Dirty records without queued operations, they need a manual retry"
			);
		}

		Ok(RecoveryReport { released, unqueued })
	}

	#[must_use]
	pub const fn repository(&self) -> &Repository {
		&self.repository
	}

	#[must_use]
	pub const fn worker(&self) -> &SyncWorker {
		&self.worker
	}

	#[must_use]
	pub const fn store(&self) -> &LocalStore {
		&self.store
	}

	#[must_use]
	pub const fn outbox(&self) -> &Outbox {
		&self.outbox
	}

	#[must_use]
	pub const fn issues(&self) -> &Issues {
		&self.issues
	}

	#[must_use]
	pub fn config(&self) -> &SyncConfig {
		&self.config
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.events.subscribe()
	}

	/// Starts the background worker pool, does nothing if it is already running.
	pub async fn start(&self) {
		let mut pool = self.pool.lock().await;
		if pool.is_none() {
			*pool = Some(self.worker.spawn());
		}
	}

	/// Waits for in flight operations and stops the worker pool.
	pub async fn shutdown(&self) {
		info!("Shutting down sync engine...");

		if let Some(pool) = self.pool.lock().await.take() {
			pool.shutdown().await;
		}
	}

	pub fn trigger(&self, trigger: SyncTrigger) {
		self.worker.wake(trigger);
	}

	pub async fn set_online(&self, online: bool) {
		if let Some(pool) = &*self.pool.lock().await {
			pool.set_online(online).await;
			if online {
				pool.trigger(SyncTrigger::ConnectivityRegained);
			}
		}
	}

	/// The app went to the background, nothing new is sent until [`SyncEngine::resume`].
	pub async fn pause(&self) {
		if let Some(pool) = &*self.pool.lock().await {
			pool.pause().await;
		}
	}

	pub async fn resume(&self) {
		if let Some(pool) = &*self.pool.lock().await {
			pool.resume().await;
			pool.trigger(SyncTrigger::Foreground);
		}
	}

	/// Current state of every worker slot, empty while the pool is stopped.
	pub async fn slot_states(&self) -> Vec<SlotState> {
		self.pool
			.lock()
			.await
			.as_ref()
			.map(WorkerHandle::slot_states)
			.unwrap_or_default()
	}

	/// Puts a parked operation back in the queue with a fresh attempt budget.
	pub async fn retry_operation(&self, op_id: OperationId) -> Result<SyncOperation, Error> {
		let key = self.parked_key(op_id).await?;
		let _guard = self.locks.lock(&key).await;

		let mut tx = self.db.begin().await?;
		let op = Outbox::unpark_in(&mut tx, op_id).await?;
		Issues::clear_failures(&mut tx, &key).await?;
		tx.commit().await?;

		info!(%key, %op_id, "Parked operation re-armed");

		self.worker.wake(SyncTrigger::Flush);

		Ok(op)
	}

	/// Drops a parked operation for good. The record keeps its local changes and stays dirty.
	pub async fn acknowledge_operation(&self, op_id: OperationId) -> Result<SyncOperation, Error> {
		let key = self.parked_key(op_id).await?;
		let _guard = self.locks.lock(&key).await;

		let mut tx = self.db.begin().await?;
		let op = Outbox::expect_parked_in(&mut tx, op_id).await?;
		Outbox::remove_in(&mut tx, op_id).await?;
		Issues::clear_failures(&mut tx, &key).await?;
		tx.commit().await?;

		info!(%key, %op_id, "Parked operation acknowledged and dropped");

		// Operations queued behind it are free to go now
		self.worker.wake(SyncTrigger::Flush);

		Ok(op)
	}

	/// Queues a fresh operation for a dirty record that has none, after its previous one was
	/// rejected or acknowledged.
	pub async fn retry_entity(
		&self,
		entity_type: &EntityType,
		id: EntityId,
	) -> Result<OperationId, Error> {
		let key = EntityKey::new(entity_type.clone(), id);
		let _guard = self.locks.lock(&key).await;

		let mut tx = self.db.begin().await?;

		let record = LocalStore::get_in(&mut tx, &key)
			.await?
			.ok_or_else(|| Error::NotFound(key.clone()))?;

		if !record.dirty && !record.pending_deletion {
			return Err(Error::NothingToRetry(key));
		}

		if Outbox::has_ops_in(&mut tx, &key).await? {
			return Err(Error::AlreadyQueued(key));
		}

		let now = self.clock.now();
		let op = if record.pending_deletion {
			SyncOperation::delete(&record, now)
		} else if record.reached_server() {
			SyncOperation::update(&record, now)
		} else {
			SyncOperation::create(&record, now)
		};

		Outbox::enqueue_in(&mut tx, &op).await?;
		Issues::clear_failures(&mut tx, &key).await?;
		tx.commit().await?;

		info!(%key, op_id = %op.id, kind = %op.kind, "Queued a manual retry");

		self.worker.wake(SyncTrigger::Flush);

		Ok(op.id)
	}

	async fn parked_key(&self, op_id: OperationId) -> Result<EntityKey, Error> {
		self.outbox
			.get(op_id)
			.await?
			.map(|op| op.key())
			.ok_or(Error::OperationNotFound(op_id))
	}
}
