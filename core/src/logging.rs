use crate::{config::DaemonConfig, error::CoreError};

use sw_utils::error::FileIOError;

use std::{fs::OpenOptions, io, sync::Mutex};

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber: stderr always, plus the log file when one is configured.
///
/// `RUST_LOG` wins over the configured level. Can only succeed once per process.
pub fn init(config: &DaemonConfig) -> Result<(), CoreError> {
	let filter = match EnvFilter::try_from_default_env() {
		Ok(filter) => filter,
		Err(_) => EnvFilter::try_new(&config.log_level)?,
	};

	let file_layer = config
		.log_file
		.as_deref()
		.map(|path| {
			OpenOptions::new()
				.create(true)
				.append(true)
				.open(path)
				.map(|file| {
					fmt::layer()
						.with_writer(Mutex::new(file))
						.with_ansi(false)
						.with_target(true)
						.with_line_number(true)
				})
				.map_err(|e| CoreError::LogFile(FileIOError::new("open log file", path, e)))
		})
		.transpose()?;

	let console_layer = fmt::layer().with_writer(io::stderr).with_target(false);

	tracing_subscriber::registry()
		.with(filter)
		.with(file_layer)
		.with(console_layer)
		.try_init()?;

	if let Some(path) = &config.log_file {
		info!(log_file = %path.display(), "Logging initialized;");
	}

	Ok(())
}
