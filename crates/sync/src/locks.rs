use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::record::EntityKey;

/// Serializes every mutation touching one entity, local writes from the [`Repository`] and the
/// apply phase of the [`SyncWorker`] alike.
///
/// Network calls are made without holding the lock, so a slow server never blocks local edits.
///
/// [`Repository`]: crate::Repository
/// [`SyncWorker`]: crate::SyncWorker
#[derive(Debug, Clone, Default)]
pub(crate) struct EntityLocks {
	locks: Arc<DashMap<EntityKey, Arc<Mutex<()>>>>,
}

impl EntityLocks {
	pub(crate) async fn lock(&self, key: &EntityKey) -> OwnedMutexGuard<()> {
		let mutex = Arc::clone(
			self.locks
				.entry(key.clone())
				.or_insert_with(|| Arc::new(Mutex::new(())))
				.value(),
		);

		mutex.lock_owned().await
	}

	/// Forgets locks nobody is holding or waiting on.
	pub(crate) fn prune(&self) {
		self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
	}

	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.locks.len()
	}
}
