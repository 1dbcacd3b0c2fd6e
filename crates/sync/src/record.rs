use std::{borrow::Cow, error::Error as StdError, fmt};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::error::Error;

/// Client generated identifier, reused verbatim as the server's identifier.
pub type EntityId = Uuid;

const MAX_ENTITY_TYPE_LEN: usize = 64;

/// Name of the kind of entity a record holds, like `list_item` or `focus_card`.
///
/// The engine never interprets it, it is only used to route calls on the [`RemoteGateway`] and to
/// partition the local tables.
///
/// [`RemoteGateway`]: crate::RemoteGateway
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityType(Cow<'static, str>);

impl EntityType {
	/// Builds an entity type from a compile time constant, callers are responsible for passing a
	/// name that [`EntityType::new`] would accept.
	#[must_use]
	pub const fn from_static(name: &'static str) -> Self {
		Self(Cow::Borrowed(name))
	}

	pub fn new(name: impl Into<String>) -> Result<Self, Error> {
		let name = name.into();

		let valid = !name.is_empty()
			&& name.len() <= MAX_ENTITY_TYPE_LEN
			&& name
				.bytes()
				.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');

		if valid {
			Ok(Self(Cow::Owned(name)))
		} else {
			Err(Error::InvalidEntityType(name))
		}
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for EntityType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl TryFrom<String> for EntityType {
	type Error = Error;

	fn try_from(name: String) -> Result<Self, Self::Error> {
		Self::new(name)
	}
}

impl From<EntityType> for String {
	fn from(entity_type: EntityType) -> Self {
		entity_type.0.into_owned()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
	pub entity_type: EntityType,
	pub id: EntityId,
}

impl EntityKey {
	#[must_use]
	pub const fn new(entity_type: EntityType, id: EntityId) -> Self {
		Self { entity_type, id }
	}
}

impl fmt::Display for EntityKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.entity_type, self.id)
	}
}

/// Plain data that can be moved by the sync engine.
///
/// Implementors are regular serde types, the engine stores them as JSON and hands them to the
/// [`RemoteGateway`](crate::RemoteGateway) as [`serde_json::Value`].
pub trait SyncEntity: Serialize + DeserializeOwned + Send + Sync + 'static {
	const ENTITY_TYPE: &'static str;

	#[must_use]
	fn entity_type() -> EntityType {
		EntityType::from_static(Self::ENTITY_TYPE)
	}

	/// Checked before every local write, a rejected payload never reaches the store.
	fn validate(&self) -> Result<(), Box<dyn StdError + Send + Sync>> {
		Ok(())
	}
}

/// An entity payload together with its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRecord<T = Value> {
	pub entity_type: EntityType,
	pub id: EntityId,
	pub payload: T,
	/// Last version acknowledged by the server, `0` until the creation is confirmed.
	pub version: u64,
	/// `payload` differs from the last value acknowledged by the server.
	pub dirty: bool,
	pub pending_deletion: bool,
	pub last_synced_at: Option<DateTime<Utc>>,
}

impl<T> DomainRecord<T> {
	/// A brand new record, not yet known by the server.
	pub fn new_local(entity_type: EntityType, id: EntityId, payload: T) -> Self {
		Self {
			entity_type,
			id,
			payload,
			version: 0,
			dirty: true,
			pending_deletion: false,
			last_synced_at: None,
		}
	}

	#[must_use]
	pub fn key(&self) -> EntityKey {
		EntityKey::new(self.entity_type.clone(), self.id)
	}

	/// Neither dirty nor waiting for a deletion, so it mirrors the server's view.
	#[must_use]
	pub const fn is_clean(&self) -> bool {
		!self.dirty && !self.pending_deletion
	}

	/// The server acknowledged at least one write for this record.
	#[must_use]
	pub const fn reached_server(&self) -> bool {
		self.last_synced_at.is_some()
	}

	pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DomainRecord<U> {
		DomainRecord {
			entity_type: self.entity_type,
			id: self.id,
			payload: f(self.payload),
			version: self.version,
			dirty: self.dirty,
			pending_deletion: self.pending_deletion,
			last_synced_at: self.last_synced_at,
		}
	}
}

impl<T: Serialize> DomainRecord<T> {
	/// The same record with its payload as JSON, the shape the store works with.
	pub fn encode(&self) -> Result<DomainRecord, Error> {
		Ok(DomainRecord {
			entity_type: self.entity_type.clone(),
			id: self.id,
			payload: serde_json::to_value(&self.payload)?,
			version: self.version,
			dirty: self.dirty,
			pending_deletion: self.pending_deletion,
			last_synced_at: self.last_synced_at,
		})
	}
}

impl DomainRecord {
	pub fn decode<T: DeserializeOwned>(mut self) -> Result<DomainRecord<T>, Error> {
		let payload = serde_json::from_value(self.payload.take())?;
		Ok(self.map(|_| payload))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn entity_type_names_are_validated() {
		assert!(EntityType::new("list_item").is_ok());
		assert!(EntityType::new("focus_card2").is_ok());

		assert!(matches!(
			EntityType::new(""),
			Err(Error::InvalidEntityType(_))
		));
		assert!(matches!(
			EntityType::new("List Item"),
			Err(Error::InvalidEntityType(_))
		));
		assert!(matches!(
			EntityType::new("a".repeat(MAX_ENTITY_TYPE_LEN + 1)),
			Err(Error::InvalidEntityType(_))
		));
	}

	#[test]
	fn entity_type_rejects_invalid_names_when_deserializing() {
		assert!(serde_json::from_str::<EntityType>("\"list_item\"").is_ok());
		assert!(serde_json::from_str::<EntityType>("\"list,item\"").is_err());
	}

	#[test]
	fn new_local_records_wait_for_the_server() {
		let record = DomainRecord::new_local(
			EntityType::from_static("note"),
			EntityId::new_v4(),
			"text".to_string(),
		);

		assert_eq!(record.version, 0);
		assert!(record.dirty);
		assert!(!record.is_clean());
		assert!(!record.reached_server());
	}
}
