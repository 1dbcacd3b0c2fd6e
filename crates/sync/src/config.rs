//! Engine configuration

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::Error;

const CONFIG_FILE_NAME: &str = "sync.json";

/// Knobs of the sync engine, persisted as JSON next to the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	/// Config schema version
	pub version: u32,

	/// Where the records and operations live, `None` keeps everything in memory
	pub database_path: Option<PathBuf>,

	/// Size of the worker pool, each slot runs at most one remote call at a time
	pub worker_count: usize,

	/// Upper bound for a single remote call
	pub request_timeout_secs: u64,

	/// Automatic attempts before an operation is parked for the user
	pub max_attempts: u32,

	/// Cap for the exponential backoff
	pub max_backoff_secs: u64,

	/// How often the worker looks at the outbox when nothing wakes it up
	pub poll_interval_secs: u64,

	/// Buffer of the status channel, slow subscribers start lagging past it
	pub event_capacity: usize,
}

impl SyncConfig {
	/// Load the configuration stored inside `data_dir`, creating a default one if missing
	pub fn load_from(data_dir: impl AsRef<Path>) -> Result<Self, Error> {
		let config_path = data_dir.as_ref().join(CONFIG_FILE_NAME);

		if config_path.exists() {
			info!(path = %config_path.display(), "Loading sync config");
			let json = fs::read_to_string(&config_path)
				.map_err(|e| Error::file_io(&config_path, e))?;
			let mut config = serde_json::from_str::<Self>(&json)?;

			if config.version < Self::target_version() {
				info!(
					from = config.version,
					to = Self::target_version(),
					"Migrating sync config"
				);
				config.version = Self::target_version();
				config.save(data_dir)?;
			}

			config.validate()?;

			Ok(config)
		} else {
			warn!(path = %config_path.display(), "No sync config found, creating default");
			let config = Self {
				database_path: Some(data_dir.as_ref().join("sync.db")),
				..Self::default()
			};
			config.save(data_dir)?;
			Ok(config)
		}
	}

	pub fn save(&self, data_dir: impl AsRef<Path>) -> Result<(), Error> {
		let data_dir = data_dir.as_ref();
		fs::create_dir_all(data_dir).map_err(|e| Error::file_io(data_dir, e))?;

		let config_path = data_dir.join(CONFIG_FILE_NAME);
		let json = serde_json::to_string_pretty(self)?;
		fs::write(&config_path, json).map_err(|e| Error::file_io(&config_path, e))?;

		info!(path = %config_path.display(), "Saved sync config");
		Ok(())
	}

	pub fn validate(&self) -> Result<(), Error> {
		if self.worker_count == 0 {
			return Err(Error::InvalidConfig(
				"worker_count must be at least 1".to_string(),
			));
		}

		if self.max_attempts == 0 {
			return Err(Error::InvalidConfig(
				"max_attempts must be at least 1".to_string(),
			));
		}

		if self.request_timeout_secs == 0 {
			return Err(Error::InvalidConfig(
				"request_timeout_secs must be at least 1".to_string(),
			));
		}

		if self.poll_interval_secs == 0 {
			return Err(Error::InvalidConfig(
				"poll_interval_secs must be at least 1".to_string(),
			));
		}

		if self.event_capacity == 0 {
			return Err(Error::InvalidConfig(
				"event_capacity must be at least 1".to_string(),
			));
		}

		Ok(())
	}

	#[must_use]
	pub const fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}

	#[must_use]
	pub const fn max_backoff(&self) -> Duration {
		Duration::from_secs(self.max_backoff_secs)
	}

	#[must_use]
	pub const fn poll_interval(&self) -> Duration {
		Duration::from_secs(self.poll_interval_secs)
	}

	const fn target_version() -> u32 {
		1
	}
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			version: Self::target_version(),
			database_path: None,
			worker_count: 4,
			request_timeout_secs: 10,
			max_attempts: 5,
			max_backoff_secs: 300,
			poll_interval_secs: 30,
			event_capacity: 256,
		}
	}
}
