use serde_json::json;
use tl_sync::{
	Clock, DeleteOutcome, EnqueueOutcome, EntityId, Error, OperationKind, OperationOutcome,
	RemoteError, SyncEntity, SyncEvent, SyncOperation,
};
use tracing_test::traced_test;

mod common;

use common::{drain_events, note, Harness, Note};

#[tokio::test]
#[traced_test]
async fn offline_create_syncs_once_reconnected() {
	let harness = Harness::new().await;
	let mut events = harness.engine.subscribe();

	harness.gateway.set_online(false);

	let id = harness.create("buy milk").await;

	let local = harness.record(id).await.unwrap();
	assert!(local.dirty);
	assert_eq!(local.version, 0);
	assert_eq!(local.payload, note("buy milk"));

	let report = harness.drain().await;
	assert_eq!(report.retrying(), 1);
	assert!(harness.record(id).await.unwrap().dirty);
	assert_eq!(harness.outbox_len().await, 1);

	harness.gateway.set_online(true);
	harness.advance_secs(1);

	let report = harness.drain().await;
	assert_eq!(report.synced(), 1);

	let synced = harness.record(id).await.unwrap();
	assert!(!synced.dirty);
	assert_eq!(synced.version, 1);
	assert!(synced.last_synced_at.is_some());
	assert!(harness.engine.outbox().is_empty().await.unwrap());

	assert_eq!(
		harness.gateway.entity(&harness.key(id)),
		Some((1, json!({ "text": "buy milk" })))
	);

	let events = drain_events(&mut events);
	assert!(matches!(
		events.as_slice(),
		[
			SyncEvent::Retrying { attempt: 1, .. },
			SyncEvent::Synced {
				kind: OperationKind::Create,
				version: Some(1),
				..
			}
		]
	));
}

#[tokio::test]
#[traced_test]
async fn offline_updates_are_sent_as_one_call() {
	let harness = Harness::new().await;

	let id = harness.create("draft").await;
	harness.drain().await;
	let calls_before = harness.gateway.call_count();

	harness.update(id, "second draft").await;
	harness.update(id, "final").await;

	let queued = harness
		.engine
		.outbox()
		.pending_for(&harness.key(id))
		.await
		.unwrap();
	assert_eq!(queued.len(), 1);
	assert_eq!(queued[0].kind, OperationKind::Update);
	assert_eq!(queued[0].payload_snapshot, Some(json!({ "text": "final" })));

	let report = harness.drain().await;
	assert_eq!(report.len(), 1);
	assert_eq!(report.synced(), 1);

	let calls = harness.gateway.calls();
	assert_eq!(calls.len(), calls_before + 1);
	let update = calls.last().unwrap();
	assert_eq!(update.kind, OperationKind::Update);
	assert_eq!(update.base_version, Some(1));
	assert_eq!(update.payload, Some(json!({ "text": "final" })));

	let synced = harness.record(id).await.unwrap();
	assert!(!synced.dirty);
	assert_eq!(synced.version, 2);
	assert_eq!(synced.payload, note("final"));
}

#[tokio::test]
#[traced_test]
async fn deleting_an_unsent_creation_never_reaches_the_server() {
	let harness = Harness::new().await;

	let id = harness.create("typo").await;
	harness.update(id, "still a typo").await;

	assert_eq!(
		harness
			.engine
			.repository()
			.delete::<Note>(id)
			.await
			.unwrap(),
		DeleteOutcome::DiscardedLocally
	);

	assert!(harness.record(id).await.is_none());
	assert!(harness.engine.outbox().is_empty().await.unwrap());
	assert!(harness.drain().await.is_empty());
	assert_eq!(harness.gateway.call_count(), 0);
}

#[tokio::test]
#[traced_test]
async fn deleting_a_synced_record_hides_it_until_confirmed() {
	let harness = Harness::new().await;

	let id = harness.create("old").await;
	harness.drain().await;

	// Never sent, so the deletion replaces it
	harness.update(id, "edited").await;

	let outcome = harness
		.engine
		.repository()
		.delete::<Note>(id)
		.await
		.unwrap();
	let DeleteOutcome::Queued(op_id) = outcome else {
		panic!("expected a queued deletion, got {outcome:?}");
	};

	let pending = harness.record(id).await.unwrap();
	assert!(pending.pending_deletion);
	assert!(harness
		.engine
		.repository()
		.list::<Note>()
		.await
		.unwrap()
		.is_empty());

	let queued = harness
		.engine
		.outbox()
		.pending_for(&harness.key(id))
		.await
		.unwrap();
	assert_eq!(queued.len(), 1);
	assert_eq!(queued[0].id, op_id);
	assert_eq!(queued[0].base_version, 1);

	// Further edits are refused while the deletion is pending
	assert!(matches!(
		harness.engine.repository().update(id, note("late")).await,
		Err(Error::PendingDeletion(_))
	));

	let report = harness.drain().await;
	assert_eq!(
		report.outcomes,
		vec![(op_id, OperationOutcome::Synced { version: None })]
	);

	assert!(harness.record(id).await.is_none());
	assert!(harness.gateway.is_deleted(&harness.key(id)));
	assert_eq!(harness.gateway.call_count(), 2);
}

#[tokio::test]
#[traced_test]
async fn deletion_after_a_failed_creation_attempt_waits_for_it() {
	let harness = Harness::new().await;

	harness
		.gateway
		.fail_next(RemoteError::from_status(503, "maintenance"));

	let id = harness.create("maybe applied").await;
	assert_eq!(harness.drain().await.retrying(), 1);

	// The creation was sent once, it can't be dropped silently anymore
	assert!(matches!(
		harness
			.engine
			.repository()
			.delete::<Note>(id)
			.await
			.unwrap(),
		DeleteOutcome::Queued(_)
	));

	harness.advance_secs(1);
	let report = harness.drain().await;
	assert_eq!(report.synced(), 2);

	let kinds = harness
		.gateway
		.calls()
		.into_iter()
		.map(|call| call.kind)
		.collect::<Vec<_>>();
	assert_eq!(
		kinds,
		[
			OperationKind::Create,
			OperationKind::Create,
			OperationKind::Delete
		]
	);
	assert!(harness.gateway.is_deleted(&harness.key(id)));
	assert!(harness.record(id).await.is_none());
}

#[tokio::test]
#[traced_test]
async fn deletion_behind_a_rejected_creation_is_settled_locally() {
	let harness = Harness::new().await;
	let mut events = harness.engine.subscribe();

	harness
		.gateway
		.fail_next(RemoteError::from_status(503, "maintenance"));

	let id = harness.create("never stored").await;
	assert_eq!(harness.drain().await.retrying(), 1);

	assert!(matches!(
		harness
			.engine
			.repository()
			.delete::<Note>(id)
			.await
			.unwrap(),
		DeleteOutcome::Queued(_)
	));

	harness
		.gateway
		.fail_next(RemoteError::from_status(400, "bad request"));
	harness.advance_secs(1);

	let outcomes = harness
		.drain()
		.await
		.outcomes
		.into_iter()
		.map(|(_, outcome)| outcome)
		.collect::<Vec<_>>();
	assert_eq!(
		outcomes,
		[OperationOutcome::Rejected, OperationOutcome::Cancelled]
	);

	// The server never saw the entity, so there is nothing to delete there
	let kinds = harness
		.gateway
		.calls()
		.into_iter()
		.map(|call| call.kind)
		.collect::<Vec<_>>();
	assert_eq!(kinds, [OperationKind::Create, OperationKind::Create]);

	assert!(harness.record(id).await.is_none());
	assert_eq!(harness.outbox_len().await, 0);
	assert!(harness.engine.issues().list().await.unwrap().is_empty());

	let key = harness.key(id);
	assert!(drain_events(&mut events)
		.iter()
		.any(|event| matches!(event, SyncEvent::Cancelled { key: k, .. } if *k == key)));
}

#[tokio::test]
#[traced_test]
async fn later_changes_never_overtake_earlier_ones() {
	let harness = Harness::new().await;

	harness
		.gateway
		.fail_next(RemoteError::from_status(500, "boom"));

	let id = harness.create("v1").await;
	assert_eq!(harness.drain().await.retrying(), 1);

	// Appended behind the creation that is backing off
	harness.update(id, "v2").await;

	let other = harness.create("unrelated").await;

	// Only the other entity can move while the creation waits
	let report = harness.drain().await;
	assert_eq!(report.len(), 1);
	assert!(!harness.record(other).await.unwrap().dirty);
	assert!(harness.record(id).await.unwrap().dirty);

	harness.advance_secs(1);
	let report = harness.drain().await;
	assert_eq!(report.synced(), 2);

	let calls = harness
		.gateway
		.calls()
		.into_iter()
		.filter(|call| call.key == harness.key(id))
		.collect::<Vec<_>>();
	assert_eq!(calls.len(), 3);
	assert_eq!(calls[0].kind, OperationKind::Create);
	assert_eq!(calls[1].kind, OperationKind::Create);
	assert_eq!(calls[2].kind, OperationKind::Update);
	// Rebased onto the version the creation got
	assert_eq!(calls[2].base_version, Some(1));

	let synced = harness.record(id).await.unwrap();
	assert_eq!(synced.version, 2);
	assert_eq!(synced.payload, note("v2"));
	assert!(!synced.dirty);
}

#[tokio::test]
#[traced_test]
async fn invalid_payloads_are_refused_before_touching_the_store() {
	let harness = Harness::new().await;

	assert!(matches!(
		harness.engine.repository().create(note("   ")).await,
		Err(Error::Validation(_))
	));
	assert!(harness.engine.outbox().is_empty().await.unwrap());

	let id = harness.create("fine").await;
	assert!(matches!(
		harness.engine.repository().update(id, note("")).await,
		Err(Error::Validation(_))
	));
	assert_eq!(harness.record(id).await.unwrap().payload, note("fine"));
}

#[tokio::test]
#[traced_test]
async fn mutations_of_unknown_records_fail() {
	let harness = Harness::new().await;
	let id = EntityId::new_v4();

	assert!(matches!(
		harness.engine.repository().update(id, note("ghost")).await,
		Err(Error::NotFound(_))
	));
	assert!(matches!(
		harness.engine.repository().delete::<Note>(id).await,
		Err(Error::NotFound(_))
	));

	let created = harness.create("original").await;
	assert!(matches!(
		harness
			.engine
			.repository()
			.create_with_id(created, note("copy"))
			.await,
		Err(Error::AlreadyExists(_))
	));
}

#[tokio::test]
#[traced_test]
async fn manual_enqueue_reports_coalescing() {
	let harness = Harness::new().await;

	let id = harness.create("a").await;
	let record = harness
		.engine
		.store()
		.get(&Note::entity_type(), id)
		.await
		.unwrap()
		.unwrap();

	let queued = harness
		.engine
		.outbox()
		.pending_for(&harness.key(id))
		.await
		.unwrap();

	// Folded into the creation, which has not been sent yet
	let outcome = harness
		.engine
		.outbox()
		.enqueue(&SyncOperation::update(&record, harness.clock.now()))
		.await
		.unwrap();
	assert_eq!(outcome, EnqueueOutcome::Coalesced(queued[0].id));
}
