//! Reader configuration

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const CONFIG_FILE_NAME: &str = "jar-sync.json";
pub const DATABASE_FILE_NAME: &str = "jar-sync.db";

/// Tunables of the reconciliation service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	/// Config schema version
	pub version: u32,

	/// SQLite URL of the reconciliation store, must point at a file
	pub database_url: String,

	/// Pooled connections, SQLite wants a single writer
	pub max_connections: u32,

	/// Envelopes a jar may hold back before new ones are dropped
	pub max_pending_per_jar: usize,

	/// Envelopes requested per poll
	pub poll_limit: u32,

	/// Seconds between background polls and re-checks
	pub poll_interval_secs: u64,

	/// Seconds before a relay request is abandoned
	pub request_timeout_secs: u64,

	/// Attempts per backfill before the gap is left for the next re-check
	pub backfill_max_attempts: u32,

	/// First retry delay, doubled per attempt
	pub backfill_retry_base_ms: u64,

	/// Verification results kept per jar
	pub verified_cache_size: usize,

	/// Used when `RUST_LOG` is unset
	pub log_filter: String,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			version: Self::target_version(),
			database_url: format!("sqlite://{DATABASE_FILE_NAME}?mode=rwc"),
			max_connections: 1,
			max_pending_per_jar: 10_000,
			poll_limit: 500,
			poll_interval_secs: 30,
			request_timeout_secs: 15,
			backfill_max_attempts: 4,
			backfill_retry_base_ms: 250,
			verified_cache_size: 1_024,
			log_filter: "jar_core=info,jar_sync=info".to_string(),
		}
	}
}

impl SyncConfig {
	pub const fn target_version() -> u32 {
		1
	}

	/// Defaults with the store placed inside `data_dir`.
	pub fn default_with_dir(data_dir: &Path) -> Self {
		Self {
			database_url: format!(
				"sqlite://{}?mode=rwc",
				data_dir.join(DATABASE_FILE_NAME).display()
			),
			..Self::default()
		}
	}

	/// Loads `jar-sync.json` from `data_dir`, writing the defaults if it is missing.
	pub fn load_from(data_dir: &Path) -> Result<Self> {
		let config_path = Self::path_in(data_dir);

		if config_path.exists() {
			info!("Loading config from {:?}", config_path);
			let json = fs::read_to_string(&config_path)
				.with_context(|| format!("failed to read {}", config_path.display()))?;
			let mut config: Self = serde_json::from_str(&json)
				.with_context(|| format!("failed to parse {}", config_path.display()))?;

			if config.version > Self::target_version() {
				bail!(
					"config version {} is newer than supported version {}",
					config.version,
					Self::target_version()
				);
			}

			if config.version < Self::target_version() {
				info!(
					"Migrating config from v{} to v{}",
					config.version,
					Self::target_version()
				);
				config.version = Self::target_version();
				config.save(data_dir)?;
			}

			config.validate()?;
			Ok(config)
		} else {
			warn!("No config found, creating default at {:?}", config_path);
			let config = Self::default_with_dir(data_dir);
			config.save(data_dir)?;
			Ok(config)
		}
	}

	pub fn save(&self, data_dir: &Path) -> Result<()> {
		fs::create_dir_all(data_dir)?;

		let config_path = Self::path_in(data_dir);
		let json = serde_json::to_string_pretty(self)?;
		fs::write(&config_path, json)
			.with_context(|| format!("failed to write {}", config_path.display()))?;

		info!("Saved config to {:?}", config_path);
		Ok(())
	}

	pub fn validate(&self) -> Result<()> {
		if self.database_url.is_empty() {
			bail!("database_url must not be empty");
		}
		// In-memory databases vanish with their pooled connection
		if self.database_url.contains(":memory:") || self.database_url.contains("mode=memory") {
			bail!("database_url must point at a file, got {}", self.database_url);
		}
		if self.max_connections == 0 {
			bail!("max_connections must be at least 1");
		}
		if self.max_pending_per_jar == 0 {
			bail!("max_pending_per_jar must be at least 1");
		}
		if self.poll_limit == 0 {
			bail!("poll_limit must be at least 1");
		}
		if self.poll_interval_secs == 0 {
			bail!("poll_interval_secs must be at least 1");
		}
		if self.request_timeout_secs == 0 {
			bail!("request_timeout_secs must be at least 1");
		}
		if self.backfill_max_attempts == 0 {
			bail!("backfill_max_attempts must be at least 1");
		}

		Ok(())
	}

	pub fn path_in(data_dir: &Path) -> PathBuf {
		data_dir.join(CONFIG_FILE_NAME)
	}

	pub const fn poll_interval(&self) -> Duration {
		Duration::from_secs(self.poll_interval_secs)
	}

	pub const fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}

	/// Delay before retry `attempt` (1-based), capped at 30 seconds.
	pub fn backfill_retry_delay(&self, attempt: u32) -> Duration {
		let factor = 1u64 << attempt.saturating_sub(1).min(16);
		Duration::from_millis(self.backfill_retry_base_ms.saturating_mul(factor).min(30_000))
	}
}
