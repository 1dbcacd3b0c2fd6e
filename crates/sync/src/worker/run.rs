use std::{
	panic::AssertUnwindSafe,
	pin::pin,
	sync::{Arc, PoisonError},
};

use async_channel as chan;
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use futures_concurrency::stream::Merge;
use tokio::{
	sync::oneshot,
	task::JoinHandle,
	time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, trace, warn};

use super::{
	super::{error::Error, operation::SyncOperation},
	set_slot, OperationOutcome, Slot, SlotState, SyncTrigger, SyncWorker,
};

#[derive(Debug)]
pub(super) enum WorkerMessage {
	SetOnline(bool),
	Pause,
	Resume,
	Shutdown(oneshot::Sender<()>),
}

/// Control surface of the background pool started by [`SyncWorker::spawn`].
#[derive(Debug)]
pub struct WorkerHandle {
	msgs_tx: chan::Sender<WorkerMessage>,
	triggers_tx: chan::Sender<SyncTrigger>,
	slots: Arc<[Slot]>,
	handle: JoinHandle<()>,
}

impl WorkerHandle {
	/// Wakes the pool up so it looks for due operations right away.
	pub fn trigger(&self, trigger: SyncTrigger) {
		// A full channel already holds a pending wake up
		if self.triggers_tx.try_send(trigger).is_ok() {
			trace!(%trigger, "Worker pool triggered");
		}
	}

	/// Nothing is dispatched while offline, operations already in flight finish on their own.
	pub async fn set_online(&self, online: bool) {
		self.send(WorkerMessage::SetOnline(online)).await;
	}

	/// Stops dispatching, for when the app goes to the background. In flight calls run to
	/// completion.
	pub async fn pause(&self) {
		self.send(WorkerMessage::Pause).await;
	}

	pub async fn resume(&self) {
		self.send(WorkerMessage::Resume).await;
	}

	#[must_use]
	pub fn slot_states(&self) -> Vec<SlotState> {
		self.slots
			.iter()
			.map(|slot| *slot.lock().unwrap_or_else(PoisonError::into_inner))
			.collect()
	}

	/// Stops the pool once every in flight operation is settled.
	pub async fn shutdown(self) {
		let (tx, rx) = oneshot::channel();

		self.send(WorkerMessage::Shutdown(tx)).await;

		if rx.await.is_err() {
			warn!("Worker pool exited before acknowledging shutdown");
		}

		if let Err(e) = self.handle.await {
			error!("Worker pool failed to join: {e:#?}");
		}
	}

	async fn send(&self, msg: WorkerMessage) {
		if self.msgs_tx.send(msg).await.is_err() {
			warn!("Worker pool is gone, message dropped");
		}
	}
}

pub(super) fn spawn(worker: SyncWorker) -> WorkerHandle {
	let slots = (0..worker.config.worker_count)
		.map(|_| Slot::default())
		.collect::<Arc<[_]>>();

	let (msgs_tx, msgs_rx) = chan::unbounded();
	let triggers_tx = worker.triggers.0.clone();

	let handle = tokio::spawn(run(worker, msgs_rx, Arc::clone(&slots)));

	WorkerHandle {
		msgs_tx,
		triggers_tx,
		slots,
		handle,
	}
}

enum StreamMessage {
	Commands(WorkerMessage),
	Trigger(SyncTrigger),
	SlotOutput((usize, Result<OperationOutcome, Error>)),
	Tick,
}

struct Pool {
	worker: SyncWorker,
	slots: Arc<[Slot]>,
	free: Vec<usize>,
	output_tx: chan::Sender<(usize, Result<OperationOutcome, Error>)>,
	scheduled_wake: Option<DateTime<Utc>>,
}

async fn run(worker: SyncWorker, msgs_rx: chan::Receiver<WorkerMessage>, slots: Arc<[Slot]>) {
	let (output_tx, output_rx) = chan::bounded(slots.len());

	let poll_interval = worker.config.poll_interval();
	let mut timer = interval_at(Instant::now() + poll_interval, poll_interval);
	timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

	let mut msg_stream = pin!((
		msgs_rx.map(StreamMessage::Commands),
		worker.triggers.1.clone().map(StreamMessage::Trigger),
		output_rx.map(StreamMessage::SlotOutput),
		IntervalStream::new(timer).map(|_| StreamMessage::Tick),
	)
		.merge());

	let mut pool = Pool {
		free: (0..slots.len()).rev().collect(),
		worker,
		slots,
		output_tx,
		scheduled_wake: None,
	};

	let mut online = true;
	let mut paused = false;
	let mut shutdown_ack = None;

	info!(slots = pool.slots.len(), "Sync worker pool started");

	pool.fill().await;

	while let Some(msg) = msg_stream.next().await {
		match msg {
			StreamMessage::Commands(WorkerMessage::SetOnline(is_online)) => {
				if online != is_online {
					info!(online = is_online, "Connectivity changed");
				}
				online = is_online;
			}

			StreamMessage::Commands(WorkerMessage::Pause) => {
				debug!("Worker pool paused");
				paused = true;
			}

			StreamMessage::Commands(WorkerMessage::Resume) => {
				debug!("Worker pool resumed");
				paused = false;
			}

			StreamMessage::Commands(WorkerMessage::Shutdown(ack)) => {
				debug!(in_flight = pool.in_flight(), "Worker pool shutting down");
				shutdown_ack = Some(ack);
			}

			StreamMessage::Trigger(trigger) => {
				trace!(%trigger, "Sync triggered");
				if trigger == SyncTrigger::BackoffElapsed {
					pool.scheduled_wake = None;
				}
			}

			StreamMessage::SlotOutput((slot, res)) => {
				pool.free.push(slot);

				match res {
					Ok(outcome) => trace!(slot, ?outcome, "Slot finished"),
					Err(e) => error!(slot, %e, "Slot failed"),
				}
			}

			StreamMessage::Tick => {
				trace!("Periodic sync check");
				pool.worker.locks.prune();
			}
		}

		if shutdown_ack.is_some() {
			if pool.in_flight() == 0 {
				break;
			}
			continue;
		}

		if online && !paused {
			pool.fill().await;
		}
	}

	if let Some(ack) = shutdown_ack {
		if ack.send(()).is_err() {
			warn!("Shutdown requester went away");
		}
	}

	info!("Sync worker pool stopped");
}

impl Pool {
	fn in_flight(&self) -> usize {
		self.slots.len() - self.free.len()
	}

	/// Hands due operations to free slots, then makes sure we wake up for the next backoff
	/// deadline.
	async fn fill(&mut self) {
		while let Some(slot) = self.free.last().copied() {
			match self
				.worker
				.outbox
				.dequeue_next(None, self.worker.clock.now())
				.await
			{
				Ok(Some(op)) => {
					self.free.pop();
					self.dispatch(slot, op);
				}
				Ok(None) => break,
				Err(e) => {
					error!(%e, "Failed to dequeue operation");
					break;
				}
			}
		}

		if self.free.is_empty() {
			// A finishing slot brings us back here
			return;
		}

		let now = self.worker.clock.now();
		if self.scheduled_wake.is_some_and(|wake| wake <= now) {
			self.scheduled_wake = None;
		}

		match self.worker.outbox.next_deadline().await {
			Ok(Some(deadline))
				if deadline > now && self.scheduled_wake.map_or(true, |wake| deadline < wake) =>
			{
				self.schedule_wake(deadline, now);
			}
			Ok(_) => {}
			Err(e) => error!(%e, "Failed to look up the next backoff deadline"),
		}
	}

	fn dispatch(&self, slot: usize, op: SyncOperation) {
		let worker = self.worker.clone();
		let slots = Arc::clone(&self.slots);
		let output_tx = self.output_tx.clone();

		tokio::spawn(async move {
			let slot_state = Some(&slots[slot]);

			let res = match AssertUnwindSafe(worker.process_in_slot(op.clone(), slot_state))
				.catch_unwind()
				.await
			{
				Ok(res) => res,
				Err(_) => {
					error!(slot, op_id = %op.id, "Slot panicked while handling an operation");
					let res = worker
						.settle_failed(&op, Error::SlotPanicked(op.id), slot_state)
						.await;
					set_slot(slot_state, SlotState::Idle);
					res
				}
			};

			if output_tx.send((slot, res)).await.is_err() {
				warn!(slot, "Worker pool is gone, dropping slot output");
			}
		});
	}

	fn schedule_wake(&mut self, deadline: DateTime<Utc>, now: DateTime<Utc>) {
		let delay = (deadline - now).to_std().unwrap_or_default();

		self.scheduled_wake = Some(deadline);
		let triggers_tx = self.worker.triggers.0.clone();

		trace!(?delay, "Scheduled wake up for the next backoff deadline");

		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			// A failed send means a wake up is already pending or the pool is gone
			let _ = triggers_tx.try_send(SyncTrigger::BackoffElapsed);
		});
	}
}
