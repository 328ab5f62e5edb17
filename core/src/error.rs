use crate::config::ConfigError;

use sw_reactor::ReactorError;
use sw_utils::error::FileIOError;

use thiserror::Error;

/// Everything that ends the master loop with a failure
#[derive(Debug, Error)]
pub enum CoreError {
	#[error(transparent)]
	Reactor(#[from] ReactorError),
	#[error(transparent)]
	Watch(#[from] sw_fs_watcher::Error),
	#[error(transparent)]
	Config(#[from] ConfigError),

	// Logging setup
	#[error("invalid log filter: {0}")]
	LogFilter(#[from] tracing_subscriber::filter::ParseError),
	#[error(transparent)]
	LogFile(FileIOError),
	#[error("failed to install the log subscriber: {0}")]
	LogInit(#[from] tracing_subscriber::util::TryInitError),
}
