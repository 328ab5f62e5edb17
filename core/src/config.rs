use sw_fs_watcher::WatchConfig;
use sw_utils::error::FileIOError;

use std::{
	fs,
	path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error(transparent)]
	Read(#[from] FileIOError),
	#[error("failed to parse config '{}': {source}", .path.display())]
	Parse {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},
}

/// Settings of the daemon itself, independent of what it synchronizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
	/// Receives the daemon log and the output of spawned tools
	pub log_file: Option<PathBuf>,
	/// Filter directive used when `RUST_LOG` is not set
	pub log_level: String,
	pub watch: WatchConfig,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self {
			log_file: None,
			log_level: "info".to_string(),
			watch: WatchConfig::default(),
		}
	}
}

impl DaemonConfig {
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let json = fs::read_to_string(path)
			.map_err(FileIOError::on("read config", path))?;

		let config = serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
			path: path.to_path_buf(),
			source,
		})?;

		info!(path = %path.display(), "Loaded daemon config;");

		Ok(config)
	}
}
