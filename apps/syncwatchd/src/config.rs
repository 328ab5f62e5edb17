use sw_core::{ConfigError, DaemonConfig};
use sw_utils::error::FileIOError;

use std::{
	fs,
	path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Seconds to wait after the first change before transferring
const DEFAULT_DELAY_SECS: u64 = 15;

fn default_delay() -> u64 {
	DEFAULT_DELAY_SECS
}

fn default_rsync_binary() -> PathBuf {
	PathBuf::from("rsync")
}

fn default_rsync_args() -> Vec<String> {
	// `-r` has to be explicit, `--files-from` turns off the recursion implied by `-a`
	vec!["-lts".to_string(), "-r".to_string()]
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
	#[serde(flatten)]
	pub daemon: DaemonConfig,
	pub syncs: Vec<SyncConfig>,
}

/// One source tree mirrored to one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
	pub source: PathBuf,
	/// Anything rsync accepts as a destination, remote ones included
	pub target: String,
	#[serde(default = "default_delay")]
	pub delay_secs: u64,
	#[serde(default = "default_rsync_binary")]
	pub rsync_binary: PathBuf,
	#[serde(default = "default_rsync_args")]
	pub rsync_args: Vec<String>,
	/// Globs matched against paths relative to `source`
	#[serde(default)]
	pub excludes: Vec<String>,
}

impl SyncConfig {
	pub fn new(source: PathBuf, target: String) -> Self {
		Self {
			source,
			target,
			delay_secs: default_delay(),
			rsync_binary: default_rsync_binary(),
			rsync_args: default_rsync_args(),
			excludes: Vec::new(),
		}
	}
}

impl AppConfig {
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let json = fs::read_to_string(path)
			.map_err(FileIOError::on("read config", path))?;

		let config: Self = serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
			path: path.to_path_buf(),
			source,
		})?;

		info!(path = %path.display(), syncs = config.syncs.len(), "Loaded config;");

		Ok(config)
	}
}
