use std::{
	fmt,
	sync::{Arc, RwLock},
};

use chrono::{DateTime, Duration, Utc};

/// Source of "now" for timestamps and backoff deadlines.
pub trait Clock: fmt::Debug + Send + Sync + 'static {
	fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// A clock that only moves when told to, so backoff deadlines can be reached without sleeping.
#[derive(Debug, Clone)]
pub struct ManualClock(Arc<RwLock<DateTime<Utc>>>);

impl ManualClock {
	#[must_use]
	pub fn new(start: DateTime<Utc>) -> Self {
		Self(Arc::new(RwLock::new(start)))
	}

	pub fn advance(&self, by: Duration) {
		let mut now = self
			.0
			.write()
			.unwrap_or_else(std::sync::PoisonError::into_inner);
		*now += by;
	}

	pub fn set(&self, to: DateTime<Utc>) {
		*self
			.0
			.write()
			.unwrap_or_else(std::sync::PoisonError::into_inner) = to;
	}
}

impl Default for ManualClock {
	fn default() -> Self {
		Self::new(Utc::now())
	}
}

impl Clock for ManualClock {
	fn now(&self) -> DateTime<Utc> {
		*self
			.0
			.read()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
	}
}
