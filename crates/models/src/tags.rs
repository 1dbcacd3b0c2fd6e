use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::ValidationError;

pub const MAX_TAG_LEN: usize = 32;

/// A single label, stored lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag(String);

impl Tag {
	/// Trims and lower-cases `name`, then checks it is 1 to 32 characters long with no commas or
	/// whitespace.
	pub fn new(name: impl AsRef<str>) -> Result<Self, ValidationError> {
		let name = name.as_ref().trim().to_lowercase();

		if name.is_empty() {
			return Err(ValidationError::InvalidTag {
				tag: name,
				reason: "empty",
			});
		}

		if name.chars().count() > MAX_TAG_LEN {
			return Err(ValidationError::InvalidTag {
				tag: name,
				reason: "longer than 32 characters",
			});
		}

		if name.chars().any(|c| c == ',' || c.is_whitespace()) {
			return Err(ValidationError::InvalidTag {
				tag: name,
				reason: "contains a comma or whitespace",
			});
		}

		Ok(Self(name))
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Tag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl TryFrom<String> for Tag {
	type Error = ValidationError;

	fn try_from(name: String) -> Result<Self, Self::Error> {
		Self::new(name)
	}
}

impl From<Tag> for String {
	fn from(tag: Tag) -> Self {
		tag.0
	}
}

/// Tags of an item in the order they were added, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Tag>", into = "Vec<Tag>")]
pub struct Tags(Vec<Tag>);

impl Tags {
	#[must_use]
	pub const fn new() -> Self {
		Self(Vec::new())
	}

	/// Returns `false` if the tag was already there.
	pub fn insert(&mut self, tag: Tag) -> bool {
		if self.contains(&tag) {
			return false;
		}

		self.0.push(tag);
		true
	}

	pub fn remove(&mut self, tag: &Tag) -> bool {
		let len = self.0.len();
		self.0.retain(|t| t != tag);
		self.0.len() != len
	}

	#[must_use]
	pub fn contains(&self, tag: &Tag) -> bool {
		self.0.contains(tag)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Tag> {
		self.0.iter()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl FromIterator<Tag> for Tags {
	fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
		let mut tags = Self::new();
		for tag in iter {
			tags.insert(tag);
		}
		tags
	}
}

impl From<Vec<Tag>> for Tags {
	fn from(tags: Vec<Tag>) -> Self {
		tags.into_iter().collect()
	}
}

impl From<Tags> for Vec<Tag> {
	fn from(tags: Tags) -> Self {
		tags.0
	}
}

/// Parses a comma separated list like `"home, Errands,home"`, blank entries are skipped.
impl FromStr for Tags {
	type Err = ValidationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		s.split(',')
			.filter(|part| !part.trim().is_empty())
			.map(Tag::new)
			.collect()
	}
}

impl fmt::Display for Tags {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (i, tag) in self.0.iter().enumerate() {
			if i > 0 {
				f.write_str(", ")?;
			}
			f.write_str(tag.as_str())?;
		}
		Ok(())
	}
}
