use crate::{
	config::WatchConfig,
	error::Result,
	event::{Notice, WatchId},
};

use std::{os::fd::RawFd, path::Path};

pub mod fsevents;

#[cfg(target_os = "linux")]
pub mod fanotify;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(any(
	target_os = "macos",
	target_os = "freebsd",
	target_os = "openbsd",
	target_os = "netbsd",
	target_os = "dragonfly"
))]
pub mod kqueue;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "linux")]
pub type RecommendedBackend = linux::InotifyBackend;

#[cfg(all(target_os = "macos", not(feature = "kqueue")))]
pub type RecommendedBackend = macos::FsEventsBackend;

#[cfg(any(
	all(target_os = "macos", feature = "kqueue"),
	target_os = "freebsd",
	target_os = "openbsd",
	target_os = "netbsd",
	target_os = "dragonfly"
))]
pub type RecommendedBackend = kqueue::KqueueBackend;

/// One kernel notification mechanism.
///
/// A backend owns exactly one descriptor that becomes readable when records are waiting.
/// It never blocks: [`Backend::drain`] reads whatever is available and returns.
pub trait Backend: Sized {
	const NAME: &'static str;

	/// Opens the notification device. Failing here leaves the daemon with nothing to watch.
	fn open(config: &WatchConfig) -> Result<Self>;

	fn descriptor(&self) -> RawFd;

	fn add_watch(&mut self, path: &Path, is_dir: bool) -> Result<WatchId>;

	/// Safe to call for a watch the kernel or an earlier cascade already dropped
	fn remove_watch(&mut self, watch: WatchId);

	/// Decodes every available record into `out`; an overflow is a notice, not an error
	fn drain(&mut self, out: &mut Vec<Notice>) -> Result<()>;

	/// Whether one watch covers the whole subtree below it
	fn recursive(&self) -> bool {
		false
	}
}
