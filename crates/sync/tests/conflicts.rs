use serde_json::json;
use tl_sync::{
	DeleteOutcome, EntityId, IssueKind, Notice, OperationOutcome, RemoteError, SyncEvent,
};
use tracing_test::traced_test;

mod common;

use common::{drain_events, note, Harness, Note};

/// A note the server holds at `version`, created and edited from this device.
async fn synced_note(harness: &Harness, version: u64) -> EntityId {
	let id = harness.create("v1").await;
	harness.drain().await;

	for n in 2..=version {
		harness.update(id, &format!("v{n}")).await;
		harness.drain().await;
	}

	assert_eq!(harness.record(id).await.unwrap().version, version);
	id
}

#[tokio::test]
#[traced_test]
async fn stale_update_gives_way_to_the_server() {
	let harness = Harness::new().await;
	let mut events = harness.engine.subscribe();

	let id = synced_note(&harness, 3).await;
	let key = harness.key(id);

	assert_eq!(
		harness
			.gateway
			.edit_elsewhere(&key, json!({ "text": "from my laptop" })),
		Some(4)
	);
	drain_events(&mut events);

	harness.update(id, "from my phone").await;

	let report = harness.drain().await;
	let [(op_id, OperationOutcome::Conflict(Notice::LocalChangesLost))] =
		report.outcomes.as_slice()
	else {
		panic!("expected a conflict, got {report:?}");
	};

	let call = harness.gateway.calls().pop().unwrap();
	assert_eq!(call.base_version, Some(3));

	let local = harness.record(id).await.unwrap();
	assert_eq!(local.version, 4);
	assert_eq!(local.payload, note("from my laptop"));
	assert!(local.is_clean());
	assert!(harness.engine.outbox().is_empty().await.unwrap());

	let issues = harness.engine.issues().for_entity(&key).await.unwrap();
	assert_eq!(issues.len(), 1);
	assert_eq!(issues[0].kind, IssueKind::LocalChangesLost);
	assert_eq!(issues[0].op_id, Some(*op_id));
	assert_eq!(issues[0].message, Notice::LocalChangesLost.message());

	assert_eq!(
		drain_events(&mut events),
		vec![SyncEvent::Conflict {
			key: key.clone(),
			op_id: *op_id,
			notice: Notice::LocalChangesLost,
		}]
	);

	// Notices stay until the user dismisses them, even across later syncs
	harness.update(id, "from my phone, again").await;
	assert_eq!(harness.drain().await.synced(), 1);
	assert_eq!(harness.engine.issues().for_entity(&key).await.unwrap().len(), 1);

	assert!(harness
		.engine
		.issues()
		.acknowledge(&key, IssueKind::LocalChangesLost)
		.await
		.unwrap());
	assert!(harness.engine.issues().list().await.unwrap().is_empty());
}

#[tokio::test]
#[traced_test]
async fn conflicts_drop_every_queued_change_of_the_entity() {
	let harness = Harness::new().await;

	let id = synced_note(&harness, 1).await;
	let key = harness.key(id);
	harness
		.gateway
		.edit_elsewhere(&key, json!({ "text": "theirs" }));

	harness
		.gateway
		.fail_next(RemoteError::from_status(502, "bad gateway"));
	harness.update(id, "ours").await;
	let other = harness.create("untouched").await;

	let report = harness.drain().await;
	assert_eq!(report.retrying(), 1);
	assert_eq!(report.synced(), 1);

	// Sent once already, so this one queues behind it
	harness.update(id, "ours, edited").await;
	assert_eq!(harness.engine.outbox().pending_for(&key).await.unwrap().len(), 2);

	harness.advance_secs(1);
	let report = harness.drain().await;
	assert_eq!(report.len(), 1);
	assert_eq!(report.conflicts(), 1);

	assert!(harness.engine.outbox().is_empty().await.unwrap());
	assert!(harness.record(other).await.unwrap().is_clean());

	let local = harness.record(id).await.unwrap();
	assert!(local.is_clean());
	assert_eq!(local.payload, note("theirs"));
}

#[tokio::test]
#[traced_test]
async fn updates_to_remotely_deleted_notes_remove_them() {
	let harness = Harness::new().await;

	let id = synced_note(&harness, 2).await;
	let key = harness.key(id);
	assert!(harness.gateway.delete_elsewhere(&key));

	harness.update(id, "edited too late").await;

	let report = harness.drain().await;
	assert!(matches!(
		report.outcomes.as_slice(),
		[(_, OperationOutcome::Conflict(Notice::DeletedElsewhere))]
	));

	assert!(harness.record(id).await.is_none());
	assert!(harness.engine.outbox().is_empty().await.unwrap());

	let issues = harness.engine.issues().list().await.unwrap();
	assert_eq!(issues.len(), 1);
	assert_eq!(issues[0].kind, IssueKind::DeletedElsewhere);
	assert_eq!(issues[0].key(), key);
}

#[tokio::test]
#[traced_test]
async fn stale_deletions_restore_the_server_state() {
	let harness = Harness::new().await;

	let id = synced_note(&harness, 1).await;
	let key = harness.key(id);
	harness
		.gateway
		.edit_elsewhere(&key, json!({ "text": "still needed" }));

	assert!(matches!(
		harness.engine.repository().delete::<Note>(id).await.unwrap(),
		DeleteOutcome::Queued(_)
	));

	let report = harness.drain().await;
	assert!(matches!(
		report.outcomes.as_slice(),
		[(_, OperationOutcome::Conflict(Notice::DeleteReverted))]
	));

	let restored = harness.record(id).await.unwrap();
	assert!(!restored.pending_deletion);
	assert!(restored.is_clean());
	assert_eq!(restored.version, 2);
	assert_eq!(restored.payload, note("still needed"));

	assert_eq!(
		harness
			.engine
			.repository()
			.list::<Note>()
			.await
			.unwrap()
			.len(),
		1
	);
	assert!(!harness.gateway.is_deleted(&key));
}

#[tokio::test]
#[traced_test]
async fn conflict_resolution_is_deterministic() {
	let mut outcomes = Vec::new();

	for _ in 0..2 {
		let harness = Harness::new().await;

		let id = synced_note(&harness, 2).await;
		let key = harness.key(id);
		harness
			.gateway
			.edit_elsewhere(&key, json!({ "text": "server copy" }));
		harness.update(id, "local copy").await;

		let report = harness.drain().await;
		let record = harness.record(id).await.unwrap();
		let issue_kinds = harness
			.engine
			.issues()
			.list()
			.await
			.unwrap()
			.into_iter()
			.map(|issue| issue.kind)
			.collect::<Vec<_>>();

		outcomes.push((
			report
				.outcomes
				.into_iter()
				.map(|(_, outcome)| outcome)
				.collect::<Vec<_>>(),
			record.payload,
			record.version,
			record.dirty,
			issue_kinds,
		));
	}

	assert_eq!(outcomes[0], outcomes[1]);
}
