use std::sync::Arc;

use tracing::debug;

use super::{
	clock::Clock,
	db::Database,
	error::Error,
	issues::Issues,
	locks::EntityLocks,
	operation::{OperationId, SyncOperation},
	outbox::{EnqueueOutcome, Outbox},
	record::{DomainRecord, EntityId, EntityKey, SyncEntity},
	store::LocalStore,
	worker::{SyncTrigger, SyncWorker},
};

/// What became of a deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
	/// The record is hidden and waits for the server to confirm the deletion.
	Queued(OperationId),
	/// The server never heard of the entity, it was removed right away.
	DiscardedLocally,
}

/// Typed mutation API over the [`LocalStore`], the only way user changes should reach it.
///
/// Every mutation is validated, applied locally and queued for the server in a single
/// transaction, then the worker is woken up. None of it ever waits on the network.
#[derive(Debug, Clone)]
pub struct Repository {
	db: Database,
	store: LocalStore,
	locks: EntityLocks,
	clock: Arc<dyn Clock>,
	worker: SyncWorker,
}

impl Repository {
	pub(crate) fn new(
		db: Database,
		locks: EntityLocks,
		clock: Arc<dyn Clock>,
		worker: SyncWorker,
	) -> Self {
		Self {
			store: LocalStore::new(db.clone()),
			db,
			locks,
			clock,
			worker,
		}
	}

	pub async fn create<T: SyncEntity>(&self, payload: T) -> Result<DomainRecord<T>, Error> {
		self.create_with_id(EntityId::new_v4(), payload).await
	}

	/// Like [`Repository::create`] but with an identifier chosen by the caller.
	pub async fn create_with_id<T: SyncEntity>(
		&self,
		id: EntityId,
		payload: T,
	) -> Result<DomainRecord<T>, Error> {
		validate(&payload)?;

		let record = DomainRecord::new_local(T::entity_type(), id, payload);
		let stored = record.encode()?;
		let key = record.key();

		let _guard = self.locks.lock(&key).await;

		let mut tx = self.db.begin().await?;

		if LocalStore::get_in(&mut tx, &key).await?.is_some() {
			return Err(Error::AlreadyExists(key));
		}

		LocalStore::put_in(&mut tx, &stored).await?;
		let outcome =
			Outbox::enqueue_in(&mut tx, &SyncOperation::create(&stored, self.clock.now())).await?;

		tx.commit().await?;

		debug!(%key, ?outcome, "Created record");

		self.worker.wake(SyncTrigger::LocalChange);

		Ok(record)
	}

	/// Replaces the payload of an existing record.
	pub async fn update<T: SyncEntity>(
		&self,
		id: EntityId,
		payload: T,
	) -> Result<DomainRecord<T>, Error> {
		validate(&payload)?;

		let key = EntityKey::new(T::entity_type(), id);
		let encoded = serde_json::to_value(&payload)?;

		let _guard = self.locks.lock(&key).await;

		let mut tx = self.db.begin().await?;

		let mut record = LocalStore::get_in(&mut tx, &key)
			.await?
			.ok_or_else(|| Error::NotFound(key.clone()))?;

		if record.pending_deletion {
			return Err(Error::PendingDeletion(key));
		}

		record.payload = encoded;
		record.dirty = true;

		LocalStore::put_in(&mut tx, &record).await?;
		let outcome =
			Outbox::enqueue_in(&mut tx, &SyncOperation::update(&record, self.clock.now())).await?;

		tx.commit().await?;

		debug!(%key, ?outcome, "Updated record");

		self.worker.wake(SyncTrigger::LocalChange);

		Ok(record.map(|_| payload))
	}

	pub async fn delete<T: SyncEntity>(&self, id: EntityId) -> Result<DeleteOutcome, Error> {
		let key = EntityKey::new(T::entity_type(), id);

		let _guard = self.locks.lock(&key).await;

		let mut tx = self.db.begin().await?;

		let mut record = LocalStore::get_in(&mut tx, &key)
			.await?
			.ok_or_else(|| Error::NotFound(key.clone()))?;

		if record.pending_deletion {
			return Err(Error::PendingDeletion(key));
		}

		let outcome = if !record.reached_server() && !Outbox::has_ops_in(&mut tx, &key).await? {
			// Whatever created it was dropped before reaching the server
			LocalStore::remove_in(&mut tx, &key).await?;
			Issues::clear_failures(&mut tx, &key).await?;
			DeleteOutcome::DiscardedLocally
		} else {
			match Outbox::enqueue_in(&mut tx, &SyncOperation::delete(&record, self.clock.now()))
				.await?
			{
				EnqueueOutcome::Discarded { dropped } => {
					debug!(%key, dropped, "Creation never left the device, dropping it");
					LocalStore::remove_in(&mut tx, &key).await?;
					Issues::clear_failures(&mut tx, &key).await?;
					DeleteOutcome::DiscardedLocally
				}
				queued => {
					record.pending_deletion = true;
					record.dirty = true;
					LocalStore::put_in(&mut tx, &record).await?;

					match queued.op_id() {
						Some(op_id) => DeleteOutcome::Queued(op_id),
						None => DeleteOutcome::DiscardedLocally,
					}
				}
			}
		};

		tx.commit().await?;

		debug!(%key, ?outcome, "Deleted record");

		if matches!(outcome, DeleteOutcome::Queued(_)) {
			self.worker.wake(SyncTrigger::LocalChange);
		}

		Ok(outcome)
	}

	/// The record, pending deletion or not.
	pub async fn get<T: SyncEntity>(&self, id: EntityId) -> Result<Option<DomainRecord<T>>, Error> {
		self.store
			.get(&T::entity_type(), id)
			.await?
			.map(|record| record.decode())
			.transpose()
	}

	/// Every record of type `T` except the ones waiting to be deleted.
	pub async fn list<T: SyncEntity>(&self) -> Result<Vec<DomainRecord<T>>, Error> {
		self.store
			.list(&T::entity_type())
			.await?
			.into_iter()
			.filter(|record| !record.pending_deletion)
			.map(|record| record.decode())
			.collect()
	}
}

fn validate<T: SyncEntity>(payload: &T) -> Result<(), Error> {
	payload
		.validate()
		.map_err(|e| Error::Validation(e.to_string()))
}
