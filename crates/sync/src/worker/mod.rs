//! Drains the outbox against the remote gateway

use std::{
	fmt,
	sync::{Arc, Mutex, PoisonError},
	time::Duration,
};

use async_channel as chan;
use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, trace, warn};

use super::{
	clock::Clock,
	config::SyncConfig,
	db::Database,
	error::Error,
	events::{EventBus, SyncEvent},
	gateway::{FailureClass, RemoteAck, RemoteError, RemoteGateway},
	issues::{IssueKind, Issues},
	locks::EntityLocks,
	operation::{OperationId, OperationKind, SyncOperation},
	outbox::Outbox,
	record::DomainRecord,
	resolver::{ConflictResolver, Notice, Resolution},
	store::LocalStore,
};

mod run;

pub use run::WorkerHandle;

/// Why the worker was woken up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SyncTrigger {
	ConnectivityRegained,
	Timer,
	Flush,
	Foreground,
	/// A mutation was just queued.
	LocalChange,
	/// The earliest backoff deadline passed.
	BackoffElapsed,
}

/// Where a worker slot is in handling its current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
	#[default]
	Idle,
	Dispatching(OperationId),
	AwaitingResponse(OperationId),
	Applying(OperationId),
	Backoff(OperationId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
	/// Acknowledged by the server, `version` is `None` for deletions.
	Synced { version: Option<u64> },
	/// A deletion of something the server never saw, settled without a network call.
	Cancelled,
	Retrying {
		attempt: u32,
		next_attempt_at: DateTime<Utc>,
	},
	/// Permanently refused by the server.
	Rejected,
	/// Parked after the last automatic attempt failed.
	Exhausted,
	Conflict(Notice),
	/// Removed from the outbox while it was in flight.
	Vanished,
}

impl OperationOutcome {
	#[must_use]
	pub const fn is_failure(&self) -> bool {
		matches!(self, Self::Rejected | Self::Exhausted)
	}
}

/// Every operation handled by one [`SyncWorker::drain`] call, in processing order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
	pub outcomes: Vec<(OperationId, OperationOutcome)>,
	/// Operations whose failure could not even be recorded, they were released as they were.
	pub errors: Vec<(OperationId, String)>,
}

impl DrainReport {
	#[must_use]
	pub fn len(&self) -> usize {
		self.outcomes.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.outcomes.is_empty() && self.errors.is_empty()
	}

	#[must_use]
	pub fn synced(&self) -> usize {
		self.count(|outcome| matches!(outcome, OperationOutcome::Synced { .. }))
	}

	#[must_use]
	pub fn retrying(&self) -> usize {
		self.count(|outcome| matches!(outcome, OperationOutcome::Retrying { .. }))
	}

	#[must_use]
	pub fn failed(&self) -> usize {
		self.count(OperationOutcome::is_failure)
	}

	#[must_use]
	pub fn conflicts(&self) -> usize {
		self.count(|outcome| matches!(outcome, OperationOutcome::Conflict(_)))
	}

	#[must_use]
	pub fn cancelled(&self) -> usize {
		self.count(|outcome| matches!(outcome, OperationOutcome::Cancelled))
	}

	fn count(&self, pred: impl Fn(&OperationOutcome) -> bool) -> usize {
		self.outcomes
			.iter()
			.filter(|(_, outcome)| pred(outcome))
			.count()
	}
}

/// `min(max, 2^attempt_count)` seconds, `attempt_count` being the failures before this one.
#[must_use]
pub fn backoff_delay(attempt_count: u32, max: Duration) -> Duration {
	let secs = 1_u64.checked_shl(attempt_count).unwrap_or(u64::MAX);
	Duration::from_secs(secs).min(max)
}

enum Acknowledged {
	Written(RemoteAck),
	Deleted,
}

type Slot = Mutex<SlotState>;

fn set_slot(slot: Option<&Slot>, state: SlotState) {
	if let Some(slot) = slot {
		*slot.lock().unwrap_or_else(PoisonError::into_inner) = state;
	}
}

/// Moves queued operations to the server and applies the answers locally.
///
/// Cheap to clone, clones share everything. Use [`SyncWorker::drain`] for a deterministic pass
/// over every due operation, or [`SyncWorker::spawn`] to run the background pool.
#[derive(Clone)]
pub struct SyncWorker {
	db: Database,
	outbox: Outbox,
	store: LocalStore,
	gateway: Arc<dyn RemoteGateway>,
	resolver: Arc<dyn ConflictResolver>,
	clock: Arc<dyn Clock>,
	locks: EntityLocks,
	events: EventBus,
	config: Arc<SyncConfig>,
	triggers: (chan::Sender<SyncTrigger>, chan::Receiver<SyncTrigger>),
}

impl fmt::Debug for SyncWorker {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SyncWorker")
			.field("config", &self.config)
			.field("clock", &self.clock)
			.finish_non_exhaustive()
	}
}

impl SyncWorker {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		db: Database,
		gateway: Arc<dyn RemoteGateway>,
		resolver: Arc<dyn ConflictResolver>,
		clock: Arc<dyn Clock>,
		locks: EntityLocks,
		events: EventBus,
		config: Arc<SyncConfig>,
		triggers: (chan::Sender<SyncTrigger>, chan::Receiver<SyncTrigger>),
	) -> Self {
		Self {
			outbox: Outbox::new(db.clone()),
			store: LocalStore::new(db.clone()),
			db,
			gateway,
			resolver,
			clock,
			locks,
			events,
			config,
			triggers,
		}
	}

	/// Claims the next due operation and handles it.
	pub async fn run_once(&self) -> Result<Option<(OperationId, OperationOutcome)>, Error> {
		let Some(op) = self.outbox.dequeue_next(None, self.clock.now()).await? else {
			return Ok(None);
		};

		let op_id = op.id;
		self.process(op).await.map(|outcome| Some((op_id, outcome)))
	}

	/// Handles operations until none is due, one at a time.
	///
	/// Operations rescheduled along the way are not due before their backoff deadline, so the
	/// pass always ends. An operation whose failure could not be recorded lands in
	/// [`DrainReport::errors`] instead of ending the pass.
	pub async fn drain(&self) -> Result<DrainReport, Error> {
		let mut report = DrainReport::default();

		while let Some(op) = self.outbox.dequeue_next(None, self.clock.now()).await? {
			let op_id = op.id;

			if report.errors.iter().any(|(failed, _)| *failed == op_id) {
				// Released after a failure we could not record, it is left for the next pass
				self.outbox.release(op_id).await?;
				break;
			}

			match self.process(op).await {
				Ok(outcome) => report.outcomes.push((op_id, outcome)),
				Err(e) => {
					error!(%op_id, %e, "Failed to handle operation");
					report.errors.push((op_id, e.to_string()));
				}
			}
		}

		if !report.is_empty() {
			debug!(
				processed = report.len(),
				synced = report.synced(),
				retrying = report.retrying(),
				failed = report.failed(),
				errors = report.errors.len(),
				"Outbox drained"
			);
		}

		Ok(report)
	}

	/// Handles one operation previously claimed with [`Outbox::dequeue_next`].
	pub async fn process(&self, op: SyncOperation) -> Result<OperationOutcome, Error> {
		self.process_in_slot(op, None).await
	}

	#[instrument(
		skip_all,
		fields(
			op_id = %op.id,
			entity_type = %op.entity_type,
			entity_id = %op.entity_id,
			kind = %op.kind,
			attempt = op.attempt_count + 1,
		)
	)]
	async fn process_in_slot(
		&self,
		op: SyncOperation,
		slot: Option<&Slot>,
	) -> Result<OperationOutcome, Error> {
		let res = match self.dispatch(&op, slot).await {
			Ok(outcome) => Ok(outcome),
			Err(e) => self.settle_failed(&op, e, slot).await,
		};

		set_slot(slot, SlotState::Idle);

		res
	}

	/// Counts a failure to handle `op` on our side as an attempt, so the operation backs off and
	/// is parked once out of attempts, like a transient remote failure.
	///
	/// Only when even that bookkeeping fails is the operation released and the error returned.
	pub(super) async fn settle_failed(
		&self,
		op: &SyncOperation,
		error: Error,
		slot: Option<&Slot>,
	) -> Result<OperationOutcome, Error> {
		warn!(%error, "Failed to process operation, counting it as an attempt");

		let key = op.key();
		let _guard = self.locks.lock(&key).await;

		match self
			.back_off(op, &error.to_string(), self.clock.now(), slot)
			.await
		{
			Ok(outcome) => Ok(outcome),
			Err(e) => {
				error!(%e, "Failed to reschedule operation, releasing it");
				if let Err(e) = self.outbox.release(op.id).await {
					warn!(%e, "Failed to release operation, it will be released on next start");
				}
				Err(error)
			}
		}
	}

	async fn dispatch(
		&self,
		op: &SyncOperation,
		slot: Option<&Slot>,
	) -> Result<OperationOutcome, Error> {
		set_slot(slot, SlotState::Dispatching(op.id));

		if op.kind == OperationKind::Delete {
			let local = self.store.get(&op.entity_type, op.entity_id).await?;
			if !local.as_ref().is_some_and(DomainRecord::reached_server) {
				return self.cancel_locally(op).await;
			}
		}

		set_slot(slot, SlotState::AwaitingResponse(op.id));

		let limit = self.config.request_timeout();

		let response = match (op.kind, op.payload_snapshot.as_ref()) {
			(OperationKind::Create, Some(payload)) => timeout(
				limit,
				self.gateway
					.create(&op.entity_type, op.entity_id, payload, op.id),
			)
			.await
			.map(|res| res.map(Acknowledged::Written)),

			(OperationKind::Update, Some(payload)) => timeout(
				limit,
				self.gateway.update(
					&op.entity_type,
					op.entity_id,
					payload,
					op.base_version,
					op.id,
				),
			)
			.await
			.map(|res| res.map(Acknowledged::Written)),

			(OperationKind::Delete, _) => timeout(
				limit,
				self.gateway
					.delete(&op.entity_type, op.entity_id, op.base_version, op.id),
			)
			.await
			.map(|res| res.map(|()| Acknowledged::Deleted)),

			(kind, None) => {
				return Err(Error::corrupt(
					"operations",
					format!("{kind} operation <id='{}'> has no payload", op.id),
				))
			}
		}
		.unwrap_or(Err(RemoteError::Timeout));

		set_slot(slot, SlotState::Applying(op.id));

		let key = op.key();
		let _guard = self.locks.lock(&key).await;
		let now = self.clock.now();

		match response {
			Ok(ack) => self.apply_success(op, ack, now).await,

			Err(RemoteError::Conflict {
				server_version,
				server_payload,
			}) => {
				self.apply_conflict(op, server_version, server_payload, now)
					.await
			}

			Err(error) if error.class() == FailureClass::Transient => {
				debug!(%error, "Transient failure");
				self.back_off(op, &error.to_string(), now, slot).await
			}

			Err(error) => self.apply_rejection(op, &error, now).await,
		}
	}

	async fn cancel_locally(&self, op: &SyncOperation) -> Result<OperationOutcome, Error> {
		let key = op.key();
		let _guard = self.locks.lock(&key).await;

		let mut tx = self.db.begin().await?;
		LocalStore::remove_in(&mut tx, &key).await?;
		let dropped = Outbox::purge_entity_in(&mut tx, &key).await?;
		Issues::clear_failures(&mut tx, &key).await?;
		tx.commit().await?;

		debug!(dropped, "Deleted an entity the server never saw, nothing to send");

		self.events.emit(SyncEvent::Cancelled { key, op_id: op.id });

		Ok(OperationOutcome::Cancelled)
	}

	async fn apply_success(
		&self,
		op: &SyncOperation,
		ack: Acknowledged,
		now: DateTime<Utc>,
	) -> Result<OperationOutcome, Error> {
		let key = op.key();
		let mut tx = self.db.begin().await?;

		if !Outbox::remove_in(&mut tx, op.id).await? {
			warn!("Operation left the outbox while in flight, ignoring the response");
			return Ok(OperationOutcome::Vanished);
		}

		let version = match ack {
			Acknowledged::Deleted => {
				LocalStore::remove_in(&mut tx, &key).await?;
				Outbox::purge_entity_in(&mut tx, &key).await?;
				None
			}

			Acknowledged::Written(RemoteAck { version, .. }) => {
				let rebased = Outbox::rebase_in(&mut tx, &key, op.base_version, version).await?;

				if Outbox::has_ops_in(&mut tx, &key).await? {
					trace!(rebased, "More changes queued, record stays dirty");
					LocalStore::advance_version_in(&mut tx, &key, version, now).await?;
				} else {
					LocalStore::mark_synced_in(&mut tx, &key, version, now).await?;
				}

				Some(version)
			}
		};

		Issues::clear_failures(&mut tx, &key).await?;
		tx.commit().await?;

		debug!(?version, "Operation synced");

		self.events.emit(SyncEvent::Synced {
			key,
			op_id: op.id,
			kind: op.kind,
			version,
		});

		Ok(OperationOutcome::Synced { version })
	}

	async fn apply_conflict(
		&self,
		op: &SyncOperation,
		server_version: u64,
		server_payload: Option<serde_json::Value>,
		now: DateTime<Utc>,
	) -> Result<OperationOutcome, Error> {
		let key = op.key();
		let mut tx = self.db.begin().await?;

		let local = LocalStore::get_in(&mut tx, &key).await?;

		let resolution = self.resolver.resolve(
			op,
			local.as_ref(),
			server_version,
			server_payload.as_ref(),
		);

		match &resolution {
			Resolution::RemoveLocal { .. } => {
				LocalStore::remove_in(&mut tx, &key).await?;
			}

			Resolution::AdoptServer {
				version, payload, ..
			} => {
				let mut record = local.unwrap_or_else(|| {
					DomainRecord::new_local(key.entity_type.clone(), key.id, payload.clone())
				});
				record.payload = payload.clone();
				record.version = *version;
				record.dirty = false;
				record.pending_deletion = false;
				record.last_synced_at = Some(now);

				LocalStore::put_in(&mut tx, &record).await?;
			}
		}

		let dropped = Outbox::purge_entity_in(&mut tx, &key).await?;

		let notice = resolution.notice();
		Issues::clear_failures(&mut tx, &key).await?;
		Issues::raise(
			&mut tx,
			&key,
			notice.issue_kind(),
			Some(op.id),
			notice.message(),
			now,
		)
		.await?;

		tx.commit().await?;

		info!(
			server_version,
			dropped,
			%notice,
			"Conflict resolved, local changes discarded"
		);

		self.events.emit(SyncEvent::Conflict {
			key,
			op_id: op.id,
			notice,
		});

		Ok(OperationOutcome::Conflict(notice))
	}

	/// Reschedules `op` after a failed attempt, or parks it once out of attempts.
	async fn back_off(
		&self,
		op: &SyncOperation,
		message: &str,
		now: DateTime<Utc>,
		slot: Option<&Slot>,
	) -> Result<OperationOutcome, Error> {
		let key = op.key();
		let attempt = op.attempt_count + 1;

		if attempt >= self.config.max_attempts {
			let mut tx = self.db.begin().await?;
			Outbox::park_in(&mut tx, op.id, message).await?;
			Issues::raise(
				&mut tx,
				&key,
				IssueKind::RetriesExhausted,
				Some(op.id),
				&format!("Gave up after {attempt} attempts: {message}"),
				now,
			)
			.await?;
			tx.commit().await?;

			warn!(error = message, "Out of attempts, operation parked");

			self.events.emit(SyncEvent::Failed {
				key,
				op_id: op.id,
				kind: IssueKind::RetriesExhausted,
				error: message.to_string(),
			});

			return Ok(OperationOutcome::Exhausted);
		}

		let delay = backoff_delay(op.attempt_count, self.config.max_backoff());
		let next_attempt_at = chrono::Duration::from_std(delay)
			.ok()
			.and_then(|delay| now.checked_add_signed(delay))
			.unwrap_or(DateTime::<Utc>::MAX_UTC);

		self.outbox
			.reschedule(op.id, message, next_attempt_at)
			.await?;

		set_slot(slot, SlotState::Backoff(op.id));

		debug!(?delay, "Backing off");

		self.events.emit(SyncEvent::Retrying {
			key,
			op_id: op.id,
			attempt,
			next_attempt_at,
			error: message.to_string(),
		});

		Ok(OperationOutcome::Retrying {
			attempt,
			next_attempt_at,
		})
	}

	async fn apply_rejection(
		&self,
		op: &SyncOperation,
		error: &RemoteError,
		now: DateTime<Utc>,
	) -> Result<OperationOutcome, Error> {
		let key = op.key();
		let message = error.to_string();

		let mut tx = self.db.begin().await?;

		if !Outbox::remove_in(&mut tx, op.id).await? {
			warn!(%error, "Operation left the outbox while in flight, ignoring the rejection");
			return Ok(OperationOutcome::Vanished);
		}

		Issues::raise(
			&mut tx,
			&key,
			IssueKind::Rejected,
			Some(op.id),
			&message,
			now,
		)
		.await?;
		tx.commit().await?;

		warn!(%error, "Operation rejected by the server, dropped");

		self.events.emit(SyncEvent::Failed {
			key,
			op_id: op.id,
			kind: IssueKind::Rejected,
			error: message,
		});

		Ok(OperationOutcome::Rejected)
	}

	pub(crate) fn wake(&self, trigger: SyncTrigger) {
		// A full channel already holds a pending wake up
		if self.triggers.0.try_send(trigger).is_ok() {
			trace!(%trigger, "Worker woken up");
		}
	}

	/// Starts the background pool of `worker_count` slots.
	#[must_use]
	pub fn spawn(&self) -> WorkerHandle {
		run::spawn(self.clone())
	}
}
