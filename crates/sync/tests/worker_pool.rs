use std::time::Duration;

use tl_sync::{
	InMemoryGateway, OperationKind, RemoteError, SlotState, SyncConfig, SyncEngine, SyncEvent,
};
use tokio::{sync::broadcast, time::timeout};

mod common;

use common::{init_tracing, note, Note};

const WAIT: Duration = Duration::from_secs(10);

async fn engine(gateway: &InMemoryGateway) -> SyncEngine {
	init_tracing();

	SyncEngine::in_memory(
		SyncConfig {
			worker_count: 3,
			..SyncConfig::default()
		},
		gateway.clone(),
	)
	.await
	.expect("engine")
}

async fn next_synced(rx: &mut broadcast::Receiver<SyncEvent>) -> SyncEvent {
	loop {
		let event = timeout(WAIT, rx.recv())
			.await
			.expect("timed out waiting for a sync event")
			.expect("event channel open");

		if matches!(event, SyncEvent::Synced { .. }) {
			return event;
		}
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_syncs_local_changes_in_the_background() {
	let gateway = InMemoryGateway::new();
	let engine = engine(&gateway).await;
	let mut events = engine.subscribe();

	engine.start().await;
	assert_eq!(engine.slot_states().await.len(), 3);

	let mut ids = Vec::new();
	for n in 0..5 {
		ids.push(
			engine
				.repository()
				.create(note(&format!("note {n}")))
				.await
				.unwrap()
				.id,
		);
	}

	for _ in 0..ids.len() {
		assert!(matches!(
			next_synced(&mut events).await,
			SyncEvent::Synced {
				kind: OperationKind::Create,
				version: Some(1),
				..
			}
		));
	}

	engine.shutdown().await;

	assert!(engine.outbox().is_empty().await.unwrap());
	assert!(engine.slot_states().await.is_empty());
	assert_eq!(gateway.entity_count(), ids.len());

	for id in ids {
		let record = engine.repository().get::<Note>(id).await.unwrap().unwrap();
		assert!(record.is_clean());
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_wakes_up_after_backoff() {
	let gateway = InMemoryGateway::new();
	let engine = engine(&gateway).await;
	let mut events = engine.subscribe();

	gateway.fail_next(RemoteError::from_status(503, "try later"));

	engine.start().await;
	let id = engine
		.repository()
		.create(note("eventually"))
		.await
		.unwrap()
		.id;

	let retrying = timeout(WAIT, events.recv()).await.unwrap().unwrap();
	assert!(matches!(retrying, SyncEvent::Retrying { attempt: 1, .. }));

	// No trigger other than the backoff deadline
	next_synced(&mut events).await;

	engine.shutdown().await;

	assert_eq!(gateway.call_count(), 2);
	assert!(engine
		.repository()
		.get::<Note>(id)
		.await
		.unwrap()
		.unwrap()
		.is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paused_pool_sends_nothing_until_resumed() {
	let gateway = InMemoryGateway::new();
	let engine = engine(&gateway).await;
	let mut events = engine.subscribe();

	engine.start().await;
	engine.pause().await;
	tokio::time::sleep(Duration::from_millis(50)).await;

	engine
		.repository()
		.create(note("written in the background"))
		.await
		.unwrap();

	tokio::time::sleep(Duration::from_millis(200)).await;
	assert_eq!(gateway.call_count(), 0);
	assert!(engine
		.slot_states()
		.await
		.iter()
		.all(|state| *state == SlotState::Idle));

	engine.resume().await;
	next_synced(&mut events).await;

	engine.shutdown().await;
	assert_eq!(gateway.call_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offline_pool_flushes_on_reconnect() {
	let gateway = InMemoryGateway::new();
	let engine = engine(&gateway).await;
	let mut events = engine.subscribe();

	engine.start().await;
	engine.set_online(false).await;
	tokio::time::sleep(Duration::from_millis(50)).await;

	engine.repository().create(note("on the train")).await.unwrap();
	engine.repository().create(note("in a tunnel")).await.unwrap();

	tokio::time::sleep(Duration::from_millis(200)).await;
	assert_eq!(gateway.call_count(), 0);
	assert_eq!(engine.outbox().len().await.unwrap(), 2);

	engine.set_online(true).await;
	next_synced(&mut events).await;
	next_synced(&mut events).await;

	engine.shutdown().await;
	assert_eq!(gateway.entity_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_waits_for_in_flight_calls() {
	let gateway = InMemoryGateway::new();
	let engine = engine(&gateway).await;

	gateway.set_latency(Some(Duration::from_millis(300)));

	engine.start().await;
	let id = engine
		.repository()
		.create(note("mid flight"))
		.await
		.unwrap()
		.id;

	// Let the slot pick it up
	timeout(WAIT, async {
		while gateway.call_count() == 0 {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.unwrap();

	engine.shutdown().await;

	let record = engine.repository().get::<Note>(id).await.unwrap().unwrap();
	assert!(record.is_clean());
	assert!(engine.outbox().is_empty().await.unwrap());
}
