//! A server living in memory, used by tests and demos

use std::{
	collections::{HashMap, VecDeque},
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

use super::{
	super::{
		operation::{OperationId, OperationKind},
		record::{EntityId, EntityKey, EntityType},
	},
	RemoteAck, RemoteError, RemoteGateway,
};

/// One request as it reached the [`InMemoryGateway`], failed ones included.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayCall {
	pub kind: OperationKind,
	pub key: EntityKey,
	pub idempotency_key: OperationId,
	pub payload: Option<Value>,
	pub base_version: Option<u64>,
}

#[derive(Debug, Clone)]
struct StoredEntity {
	version: u64,
	payload: Value,
}

#[derive(Debug)]
struct State {
	online: bool,
	latency: Option<Duration>,
	entities: HashMap<EntityKey, StoredEntity>,
	/// Version an entity had when it was deleted.
	tombstones: HashMap<EntityKey, u64>,
	responses: HashMap<OperationId, Result<RemoteAck, RemoteError>>,
	scripted_failures: VecDeque<RemoteError>,
	lost_responses: usize,
	calls: Vec<GatewayCall>,
	applied_writes: usize,
}

/// [`RemoteGateway`] holding the server's state in memory.
///
/// It deduplicates by idempotency key and checks base versions the way the real server does,
/// and it can be told to fail, go offline or lose responses. Clones share the same state.
#[derive(Debug, Clone)]
pub struct InMemoryGateway {
	state: Arc<Mutex<State>>,
}

impl Default for InMemoryGateway {
	fn default() -> Self {
		Self::new()
	}
}

impl InMemoryGateway {
	#[must_use]
	pub fn new() -> Self {
		Self {
			state: Arc::new(Mutex::new(State {
				online: true,
				latency: None,
				entities: HashMap::new(),
				tombstones: HashMap::new(),
				responses: HashMap::new(),
				scripted_failures: VecDeque::new(),
				lost_responses: 0,
				calls: Vec::new(),
				applied_writes: 0,
			})),
		}
	}

	fn state(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// While offline every call fails with [`RemoteError::Unreachable`].
	pub fn set_online(&self, online: bool) {
		self.state().online = online;
	}

	/// Delay applied to every call before it is handled.
	pub fn set_latency(&self, latency: Option<Duration>) {
		self.state().latency = latency;
	}

	/// The next call fails with `error` without being handled.
	pub fn fail_next(&self, error: RemoteError) {
		self.fail_next_n(1, error);
	}

	pub fn fail_next_n(&self, count: usize, error: RemoteError) {
		self.state()
			.scripted_failures
			.extend(std::iter::repeat(error).take(count));
	}

	/// The next call is applied but its response never makes it back, the client sees a
	/// [`RemoteError::Timeout`].
	pub fn lose_next_response(&self) {
		self.state().lost_responses += 1;
	}

	#[must_use]
	pub fn calls(&self) -> Vec<GatewayCall> {
		self.state().calls.clone()
	}

	#[must_use]
	pub fn call_count(&self) -> usize {
		self.state().calls.len()
	}

	/// Writes that actually changed the server's state, replays excluded.
	#[must_use]
	pub fn applied_writes(&self) -> usize {
		self.state().applied_writes
	}

	/// Version and payload the server holds for `key`.
	#[must_use]
	pub fn entity(&self, key: &EntityKey) -> Option<(u64, Value)> {
		self.state()
			.entities
			.get(key)
			.map(|stored| (stored.version, stored.payload.clone()))
	}

	#[must_use]
	pub fn is_deleted(&self, key: &EntityKey) -> bool {
		self.state().tombstones.contains_key(key)
	}

	#[must_use]
	pub fn entity_count(&self) -> usize {
		self.state().entities.len()
	}

	/// Stores an entity as if it had been written by another device.
	pub fn seed(&self, key: EntityKey, version: u64, payload: Value) {
		let mut state = self.state();
		state.tombstones.remove(&key);
		state
			.entities
			.insert(key, StoredEntity { version, payload });
	}

	/// Another device updates `key`, returns the new server version.
	pub fn edit_elsewhere(&self, key: &EntityKey, payload: Value) -> Option<u64> {
		let mut state = self.state();
		let stored = state.entities.get_mut(key)?;
		stored.version += 1;
		stored.payload = payload;
		Some(stored.version)
	}

	/// Another device deletes `key`.
	pub fn delete_elsewhere(&self, key: &EntityKey) -> bool {
		let mut state = self.state();
		match state.entities.remove(key) {
			Some(stored) => {
				state.tombstones.insert(key.clone(), stored.version + 1);
				true
			}
			None => false,
		}
	}

	async fn handle(
		&self,
		call: GatewayCall,
		apply: impl FnOnce(&mut State) -> Result<RemoteAck, RemoteError> + Send,
	) -> Result<RemoteAck, RemoteError> {
		let latency = {
			let mut state = self.state();
			state.calls.push(call.clone());
			state.latency
		};

		if let Some(latency) = latency {
			tokio::time::sleep(latency).await;
		}

		let mut state = self.state();

		if !state.online {
			return Err(RemoteError::Unreachable("offline".to_string()));
		}

		if let Some(error) = state.scripted_failures.pop_front() {
			trace!(key = %call.key, %error, "Scripted gateway failure");
			return Err(error);
		}

		let response = match state.responses.get(&call.idempotency_key) {
			Some(response) => {
				trace!(key = %call.key, op_id = %call.idempotency_key, "Replaying response");
				response.clone()
			}
			None => {
				let response = apply(&mut *state);
				if response.is_ok() {
					state.applied_writes += 1;
				}
				state
					.responses
					.insert(call.idempotency_key, response.clone());
				response
			}
		};

		if state.lost_responses > 0 {
			state.lost_responses -= 1;
			return Err(RemoteError::Timeout);
		}

		response
	}
}

fn conflict(state: &State, key: &EntityKey) -> Option<RemoteError> {
	if let Some(version) = state.tombstones.get(key) {
		return Some(RemoteError::Conflict {
			server_version: *version,
			server_payload: None,
		});
	}

	state.entities.get(key).map(|stored| RemoteError::Conflict {
		server_version: stored.version,
		server_payload: Some(stored.payload.clone()),
	})
}

#[async_trait]
impl RemoteGateway for InMemoryGateway {
	async fn create(
		&self,
		entity_type: &EntityType,
		id: EntityId,
		payload: &Value,
		idempotency_key: OperationId,
	) -> Result<RemoteAck, RemoteError> {
		let key = EntityKey::new(entity_type.clone(), id);
		let call = GatewayCall {
			kind: OperationKind::Create,
			key: key.clone(),
			idempotency_key,
			payload: Some(payload.clone()),
			base_version: None,
		};
		let payload = payload.clone();

		self.handle(call, move |state| {
			if let Some(conflict) = conflict(state, &key) {
				return Err(conflict);
			}

			state
				.entities
				.insert(key, StoredEntity { version: 1, payload });

			Ok(RemoteAck { id, version: 1 })
		})
		.await
	}

	async fn update(
		&self,
		entity_type: &EntityType,
		id: EntityId,
		payload: &Value,
		base_version: u64,
		idempotency_key: OperationId,
	) -> Result<RemoteAck, RemoteError> {
		let key = EntityKey::new(entity_type.clone(), id);
		let call = GatewayCall {
			kind: OperationKind::Update,
			key: key.clone(),
			idempotency_key,
			payload: Some(payload.clone()),
			base_version: Some(base_version),
		};
		let payload = payload.clone();

		self.handle(call, move |state| {
			let current = match state.entities.get(&key) {
				Some(stored) => stored.version,
				None => {
					return Err(conflict(state, &key).unwrap_or_else(|| RemoteError::Rejected {
						status: 404,
						message: format!("{key} not found"),
					}))
				}
			};

			if current != base_version {
				return Err(conflict(state, &key).unwrap_or(RemoteError::Conflict {
					server_version: current,
					server_payload: None,
				}));
			}

			let version = current + 1;
			state
				.entities
				.insert(key, StoredEntity { version, payload });

			Ok(RemoteAck { id, version })
		})
		.await
	}

	async fn delete(
		&self,
		entity_type: &EntityType,
		id: EntityId,
		base_version: u64,
		idempotency_key: OperationId,
	) -> Result<(), RemoteError> {
		let key = EntityKey::new(entity_type.clone(), id);
		let call = GatewayCall {
			kind: OperationKind::Delete,
			key: key.clone(),
			idempotency_key,
			payload: None,
			base_version: Some(base_version),
		};

		self.handle(call, move |state| {
			if let Some(version) = state.tombstones.get(&key) {
				return Ok(RemoteAck {
					id,
					version: *version,
				});
			}

			let Some(stored) = state.entities.get(&key) else {
				return Err(RemoteError::Rejected {
					status: 404,
					message: format!("{key} not found"),
				});
			};

			if stored.version != base_version {
				return Err(RemoteError::Conflict {
					server_version: stored.version,
					server_payload: Some(stored.payload.clone()),
				});
			}

			let version = stored.version + 1;
			state.entities.remove(&key);
			state.tombstones.insert(key, version);

			Ok(RemoteAck { id, version })
		})
		.await
		.map(|_| ())
	}
}
