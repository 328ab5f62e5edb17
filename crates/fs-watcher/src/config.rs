use serde::{Deserialize, Serialize};

/// Which inotify records count as a content change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifyMode {
	/// Only when a writer closes the file, so half-written files are not reported
	#[default]
	CloseWrite,
	/// Every write
	Modify,
	Both,
}

/// Tuning shared by every notification backend; each one reads the fields it understands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
	pub modify_mode: ModifyMode,
	/// Initial read buffer for inotify and fanotify, in bytes
	pub read_buffer: usize,
	/// Coalescing latency handed to FSEvents
	pub fsevents_latency_ms: u64,
	/// Max kevents fetched per call
	pub kqueue_batch: usize,
}

impl Default for WatchConfig {
	fn default() -> Self {
		Self {
			modify_mode: ModifyMode::default(),
			read_buffer: 4096,
			fsevents_latency_ms: 100,
			kqueue_batch: 64,
		}
	}
}
