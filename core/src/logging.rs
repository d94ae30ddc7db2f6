use std::{fs, path::Path};

use anyhow::{Context, Result};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::SyncConfig;

/// Installs the global subscriber: stdout, plus a daily log file under
/// `{data_dir}/logs` when a data directory is given.
///
/// `RUST_LOG` takes precedence over the configured filter. Keep the returned
/// guard alive for as long as file logs should be flushed.
pub fn init_tracing(config: &SyncConfig, data_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
	let filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(&config.log_filter))
		.context("invalid log filter")?;

	let (file_layer, guard) = match data_dir {
		Some(data_dir) => {
			let logs_dir = data_dir.join("logs");
			fs::create_dir_all(&logs_dir)
				.with_context(|| format!("failed to create {}", logs_dir.display()))?;

			let (writer, guard) = tracing_appender::non_blocking(rolling::daily(logs_dir, "jar-sync.log"));
			let layer = fmt::layer()
				.with_target(true)
				.with_ansi(false)
				.with_writer(writer)
				.boxed();

			(Some(layer), Some(guard))
		}
		None => (None, None),
	};

	tracing_subscriber::registry()
		.with(filter)
		.with(fmt::layer().with_target(true).with_writer(std::io::stdout))
		.with(file_layer)
		.try_init()
		.context("failed to initialize tracing")?;

	Ok(guard)
}
