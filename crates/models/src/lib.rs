//!
//! # Models
//!
//! Payloads of the entities moved by the sync engine: list items, daily focus cards and
//! anti-todo entries. They are plain serde data, the engine stores and sends them as JSON.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use std::{collections::HashSet, error::Error as StdError};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tl_sync::{EntityId, SyncEntity};

mod tags;

pub use tags::{Tag, Tags, MAX_TAG_LEN};

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_NOTES_LEN: usize = 10_000;
pub const MAX_FOCUS_ITEMS: usize = 3;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
	#[error("title must not be empty")]
	EmptyTitle,
	#[error("title is {len} characters long, at most {max} are allowed")]
	TitleTooLong { len: usize, max: usize },
	#[error("notes are {len} characters long, at most {max} are allowed")]
	NotesTooLong { len: usize, max: usize },
	#[error("invalid tag '{tag}': {reason}")]
	InvalidTag { tag: String, reason: &'static str },
	#[error("a focus card holds at most {max} items, got {count}")]
	TooManyFocusItems { count: usize, max: usize },
	#[error("item <id='{0}'> appears twice on the focus card")]
	DuplicateFocusItem(EntityId),
}

#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	Serialize,
	Deserialize,
	strum::Display,
	strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ListKind {
	Todo,
	Watch,
	Later,
}

#[derive(
	Debug,
	Clone,
	Copy,
	Default,
	PartialEq,
	Eq,
	Hash,
	Serialize,
	Deserialize,
	strum::Display,
	strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ItemStatus {
	#[default]
	Open,
	Done,
	Archived,
}

/// An entry of one of the user's lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
	pub list: ListKind,
	pub title: String,
	#[serde(default)]
	pub notes: Option<String>,
	#[serde(default)]
	pub tags: Tags,
	#[serde(default)]
	pub status: ItemStatus,
	/// Sort key inside its list, lower comes first.
	pub position: u32,
}

impl ListItem {
	#[must_use]
	pub fn new(list: ListKind, title: impl Into<String>, position: u32) -> Self {
		Self {
			list,
			title: title.into(),
			notes: None,
			tags: Tags::new(),
			status: ItemStatus::Open,
			position,
		}
	}

	#[must_use]
	pub fn with_tags(mut self, tags: Tags) -> Self {
		self.tags = tags;
		self
	}

	#[must_use]
	pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
		self.notes = Some(notes.into());
		self
	}

	pub fn check(&self) -> Result<(), ValidationError> {
		check_title(&self.title)?;

		if let Some(notes) = &self.notes {
			let len = notes.chars().count();
			if len > MAX_NOTES_LEN {
				return Err(ValidationError::NotesTooLong {
					len,
					max: MAX_NOTES_LEN,
				});
			}
		}

		Ok(())
	}
}

impl SyncEntity for ListItem {
	const ENTITY_TYPE: &'static str = "list_item";

	fn validate(&self) -> Result<(), Box<dyn StdError + Send + Sync>> {
		self.check().map_err(Into::into)
	}
}

/// The few list items picked to focus on during a given day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusCard {
	pub for_date: NaiveDate,
	/// Ids of [`ListItem`]s, in the order they should be tackled.
	pub items: Vec<EntityId>,
	#[serde(default)]
	pub note: Option<String>,
}

impl FocusCard {
	pub fn check(&self) -> Result<(), ValidationError> {
		if self.items.len() > MAX_FOCUS_ITEMS {
			return Err(ValidationError::TooManyFocusItems {
				count: self.items.len(),
				max: MAX_FOCUS_ITEMS,
			});
		}

		let mut seen = HashSet::with_capacity(self.items.len());
		if let Some(duplicate) = self.items.iter().find(|id| !seen.insert(**id)) {
			return Err(ValidationError::DuplicateFocusItem(*duplicate));
		}

		if let Some(note) = &self.note {
			let len = note.chars().count();
			if len > MAX_NOTES_LEN {
				return Err(ValidationError::NotesTooLong {
					len,
					max: MAX_NOTES_LEN,
				});
			}
		}

		Ok(())
	}
}

impl SyncEntity for FocusCard {
	const ENTITY_TYPE: &'static str = "focus_card";

	fn validate(&self) -> Result<(), Box<dyn StdError + Send + Sync>> {
		self.check().map_err(Into::into)
	}
}

/// Something done that was never on a list, logged after the fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiTodoEntry {
	pub title: String,
	pub accomplished_at: DateTime<Utc>,
	#[serde(default)]
	pub tags: Tags,
}

impl AntiTodoEntry {
	pub fn check(&self) -> Result<(), ValidationError> {
		check_title(&self.title)
	}
}

impl SyncEntity for AntiTodoEntry {
	const ENTITY_TYPE: &'static str = "anti_todo_entry";

	fn validate(&self) -> Result<(), Box<dyn StdError + Send + Sync>> {
		self.check().map_err(Into::into)
	}
}

fn check_title(title: &str) -> Result<(), ValidationError> {
	if title.trim().is_empty() {
		return Err(ValidationError::EmptyTitle);
	}

	let len = title.chars().count();
	if len > MAX_TITLE_LEN {
		return Err(ValidationError::TitleTooLong {
			len,
			max: MAX_TITLE_LEN,
		});
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use std::str::FromStr;

	use serde_json::json;
	use tl_sync::{EntityType, InMemoryGateway, SyncConfig, SyncEngine};

	use super::*;

	#[test]
	fn entity_types_are_valid_names() {
		for name in [
			ListItem::ENTITY_TYPE,
			FocusCard::ENTITY_TYPE,
			AntiTodoEntry::ENTITY_TYPE,
		] {
			assert!(EntityType::new(name).is_ok(), "{name}");
		}
	}

	#[test]
	fn list_items_need_a_title() {
		assert_eq!(
			ListItem::new(ListKind::Todo, "  ", 0).check(),
			Err(ValidationError::EmptyTitle)
		);
		assert!(matches!(
			ListItem::new(ListKind::Todo, "x".repeat(MAX_TITLE_LEN + 1), 0).check(),
			Err(ValidationError::TitleTooLong { .. })
		));
		assert!(ListItem::new(ListKind::Watch, "Dune", 0).check().is_ok());
	}

	#[test]
	fn list_items_fill_missing_fields() {
		let item = serde_json::from_value::<ListItem>(json!({
			"list": "later",
			"title": "Read about CRDTs",
			"position": 3,
		}))
		.unwrap();

		assert_eq!(item.list, ListKind::Later);
		assert_eq!(item.status, ItemStatus::Open);
		assert!(item.tags.is_empty());
		assert_eq!(item.notes, None);

		assert_eq!(ListKind::from_str("watch").unwrap(), ListKind::Watch);
		assert_eq!(ItemStatus::Archived.to_string(), "archived");
	}

	#[test]
	fn focus_cards_are_short_and_unique() {
		let id = EntityId::new_v4();
		let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();

		let card = FocusCard {
			for_date: date,
			items: vec![id, EntityId::new_v4(), id],
			note: None,
		};
		assert_eq!(card.check(), Err(ValidationError::DuplicateFocusItem(id)));

		let card = FocusCard {
			for_date: date,
			items: (0..=MAX_FOCUS_ITEMS).map(|_| EntityId::new_v4()).collect(),
			note: None,
		};
		assert!(matches!(
			card.check(),
			Err(ValidationError::TooManyFocusItems { count: 4, max: 3 })
		));
	}

	#[test]
	fn anti_todo_entries_need_a_title() {
		let entry = AntiTodoEntry {
			title: String::new(),
			accomplished_at: Utc::now(),
			tags: Tags::new(),
		};
		assert!(entry.validate().is_err());
	}

	#[tokio::test]
	async fn list_items_go_through_the_engine() {
		let gateway = InMemoryGateway::new();
		let engine = SyncEngine::in_memory(SyncConfig::default(), gateway.clone())
			.await
			.unwrap();

		let item = ListItem::new(ListKind::Todo, "Call the plumber", 0)
			.with_tags("home, urgent".parse().unwrap())
			.with_notes("before noon");

		let created = engine.repository().create(item.clone()).await.unwrap();
		engine.worker().drain().await.unwrap();

		let (version, payload) = gateway.entity(&created.key()).unwrap();
		assert_eq!(version, 1);
		assert_eq!(payload["list"], json!("todo"));
		assert_eq!(payload["tags"], json!(["home", "urgent"]));

		let stored = engine
			.repository()
			.get::<ListItem>(created.id)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(stored.payload, item);
		assert!(stored.is_clean());

		// Invalid payloads never reach the store
		assert!(engine
			.repository()
			.update(created.id, ListItem::new(ListKind::Todo, "", 0))
			.await
			.is_err());
	}
}
