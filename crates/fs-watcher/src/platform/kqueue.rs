//! kqueue backend.
//!
//! Every watch is an open descriptor of the watched directory, registered as a one-shot
//! `EVFILT_VNODE` filter. A delivered event has to be re-armed on the same descriptor unless
//! the vnode went away. Watches live in an arena keyed by monotonically allocated ids; those
//! referenced by a batch are pinned with a refcount until the batch has been decoded, so a
//! removal in the middle of a batch cannot free one that still has events pending.
//!
//! Filters are submitted with raw `kevent` calls: re-arming needs `EV_ONESHOT` per change and
//! the pinned descriptors must stay owned by the arena, neither of which the `kqueue` crate's
//! `Watcher` exposes.

use crate::{
	config::WatchConfig,
	error::{Error, Result},
	event::{EventKind, Notice, Subject, WatchId},
	platform::Backend,
};

use sw_reactor::Timestamp;
use sw_utils::{error::FileIOError, path_to_cstring, set_cloexec};

use std::{
	collections::HashMap,
	fs::File,
	io, mem,
	os::fd::{AsRawFd, FromRawFd, RawFd},
	path::{Path, PathBuf},
	ptr,
};

use tracing::{debug, trace, warn};

const NOTE_FLAGS: u32 = (libc::NOTE_DELETE
	| libc::NOTE_WRITE
	| libc::NOTE_EXTEND
	| libc::NOTE_ATTRIB
	| libc::NOTE_LINK
	| libc::NOTE_RENAME
	| libc::NOTE_REVOKE) as u32;

/// Flags after which the descriptor no longer refers to a watched path
const RETIRE_FLAGS: u32 = (libc::NOTE_DELETE | libc::NOTE_RENAME | libc::NOTE_REVOKE) as u32;

#[cfg(target_os = "macos")]
const OPEN_FLAGS: libc::c_int = libc::O_EVTONLY;

#[cfg(not(target_os = "macos"))]
const OPEN_FLAGS: libc::c_int = libc::O_RDONLY;

#[derive(Debug)]
struct KqWatch {
	file: File,
	path: PathBuf,
	is_dir: bool,
	/// Batches currently holding on to this watch
	refs: u32,
	retired: bool,
}

#[derive(Debug)]
pub struct KqueueBackend {
	queue: File,
	watches: HashMap<WatchId, KqWatch>,
	by_fd: HashMap<RawFd, WatchId>,
	next_watch: u32,
	batch: usize,
}

fn vnode_change(fd: RawFd) -> libc::kevent {
	// SAFETY: kevent is plain old data
	let mut change: libc::kevent = unsafe { mem::zeroed() };
	#[allow(clippy::cast_sign_loss)]
	{
		change.ident = fd as _;
	}
	change.filter = libc::EVFILT_VNODE as _;
	change.flags = (libc::EV_ADD | libc::EV_ONESHOT | libc::EV_CLEAR) as _;
	change.fflags = NOTE_FLAGS as _;
	change
}

/// Most significant change carried by one event's flags
fn kind_of(fflags: u32) -> Option<EventKind> {
	if fflags & RETIRE_FLAGS != 0 {
		Some(EventKind::Delete)
	} else if fflags & (libc::NOTE_WRITE | libc::NOTE_EXTEND | libc::NOTE_LINK) as u32 != 0 {
		Some(EventKind::Modify)
	} else if fflags & libc::NOTE_ATTRIB as u32 != 0 {
		Some(EventKind::Attrib)
	} else {
		None
	}
}

impl KqueueBackend {
	fn arm(&self, fd: RawFd) -> io::Result<()> {
		let change = vnode_change(fd);
		// SAFETY: one valid change, no event list, zero timeout
		let res = unsafe {
			libc::kevent(
				self.queue.as_raw_fd(),
				&change,
				1,
				ptr::null_mut(),
				0,
				ptr::null(),
			)
		};
		if res < 0 {
			return Err(io::Error::last_os_error());
		}
		Ok(())
	}

	fn release(&mut self, watch: WatchId) {
		let Some(entry) = self.watches.get_mut(&watch) else {
			return;
		};
		entry.refs = entry.refs.saturating_sub(1);

		if entry.refs == 0 && entry.retired {
			if let Some(entry) = self.watches.remove(&watch) {
				self.by_fd.remove(&entry.file.as_raw_fd());
				trace!(%watch, path = %entry.path.display(), "Freed retired kqueue watch;");
			}
		}
	}

	fn poll(&self, events: &mut Vec<libc::kevent>) -> io::Result<usize> {
		let zero = libc::timespec {
			tv_sec: 0,
			tv_nsec: 0,
		};
		loop {
			#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
			// SAFETY: `events` has room for `capacity` entries and the timeout outlives the call
			let res = unsafe {
				libc::kevent(
					self.queue.as_raw_fd(),
					ptr::null(),
					0,
					events.as_mut_ptr(),
					events.capacity() as _,
					&zero,
				)
			};
			if res < 0 {
				let err = io::Error::last_os_error();
				if err.kind() == io::ErrorKind::Interrupted {
					continue;
				}
				return Err(err);
			}

			#[allow(clippy::cast_sign_loss)]
			let n = res as usize;
			// SAFETY: the kernel initialized the first `n` entries
			unsafe { events.set_len(n) };
			return Ok(n);
		}
	}
}

impl Backend for KqueueBackend {
	const NAME: &'static str = "kqueue";

	fn open(config: &WatchConfig) -> Result<Self> {
		let open_err = |source| Error::Open {
			backend: Self::NAME,
			source,
		};

		// SAFETY: plain syscall, the descriptor is checked below
		let fd = unsafe { libc::kqueue() };
		if fd < 0 {
			return Err(open_err(io::Error::last_os_error()));
		}
		// SAFETY: `fd` is a fresh descriptor nobody else owns
		let queue = unsafe { File::from_raw_fd(fd) };
		set_cloexec(fd).map_err(open_err)?;

		debug!(%fd, "Opened kqueue;");

		Ok(Self {
			queue,
			watches: HashMap::new(),
			by_fd: HashMap::new(),
			next_watch: 0,
			batch: config.kqueue_batch.max(1),
		})
	}

	fn descriptor(&self) -> RawFd {
		self.queue.as_raw_fd()
	}

	fn add_watch(&mut self, path: &Path, is_dir: bool) -> Result<WatchId> {
		let c_path = path_to_cstring(path)
			.map_err(|e| Error::AddWatch(FileIOError::new("open", path, e)))?;

		// SAFETY: `c_path` is NUL terminated and outlives the call
		let fd = unsafe { libc::open(c_path.as_ptr(), OPEN_FLAGS | libc::O_CLOEXEC) };
		if fd < 0 {
			return Err(Error::AddWatch(FileIOError::new(
				"open",
				path,
				io::Error::last_os_error(),
			)));
		}
		// SAFETY: `fd` is a fresh descriptor nobody else owns
		let file = unsafe { File::from_raw_fd(fd) };

		self.arm(fd)
			.map_err(|e| Error::AddWatch(FileIOError::new("register a kevent for", path, e)))?;

		self.next_watch += 1;
		let watch = WatchId(self.next_watch);
		self.by_fd.insert(fd, watch);
		self.watches.insert(
			watch,
			KqWatch {
				file,
				path: path.to_path_buf(),
				is_dir,
				refs: 0,
				retired: false,
			},
		);

		trace!(%watch, %fd, path = %path.display(), "Added kqueue watch;");

		Ok(watch)
	}

	fn remove_watch(&mut self, watch: WatchId) {
		let Some(entry) = self.watches.get_mut(&watch) else {
			return;
		};

		if entry.refs > 0 {
			// Freed when the batch holding it lets go
			entry.retired = true;
			return;
		}

		if let Some(entry) = self.watches.remove(&watch) {
			// Closing the descriptor drops its filter from the queue
			self.by_fd.remove(&entry.file.as_raw_fd());
			trace!(%watch, path = %entry.path.display(), "Removed kqueue watch;");
		}
	}

	fn drain(&mut self, out: &mut Vec<Notice>) -> Result<()> {
		let mut events = Vec::with_capacity(self.batch);

		loop {
			let n = self.poll(&mut events).map_err(Error::Read)?;
			if n == 0 {
				break;
			}

			let batch = events
				.iter()
				.filter_map(|event| {
					#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
					let fd = event.ident as RawFd;
					self.by_fd.get(&fd).map(|&watch| (watch, event.fflags as u32))
				})
				.collect::<Vec<_>>();

			for (watch, _) in &batch {
				if let Some(entry) = self.watches.get_mut(watch) {
					entry.refs += 1;
				}
			}

			let now = Timestamp::now();
			for &(watch, fflags) in &batch {
				let Some(entry) = self.watches.get(&watch) else {
					continue;
				};
				if let Some(kind) = kind_of(fflags) {
					out.push(Notice::new(kind, entry.is_dir, now, Subject::Watched(watch)));
				}
			}

			for (watch, fflags) in batch {
				if fflags & RETIRE_FLAGS != 0 {
					if let Some(entry) = self.watches.get_mut(&watch) {
						entry.retired = true;
					}
				} else if let Some(entry) = self.watches.get(&watch) {
					if !entry.retired {
						if let Err(e) = self.arm(entry.file.as_raw_fd()) {
							warn!(%watch, ?e, "Failed to re-arm kqueue watch;");
						}
					}
				}
				self.release(watch);
			}

			if n < self.batch {
				break;
			}
			events.clear();
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::fs;

	use tempfile::tempdir;

	#[test]
	fn flags_map_to_the_most_significant_kind() {
		assert_eq!(kind_of(libc::NOTE_WRITE as u32), Some(EventKind::Modify));
		assert_eq!(
			kind_of((libc::NOTE_ATTRIB | libc::NOTE_DELETE) as u32),
			Some(EventKind::Delete)
		);
		assert_eq!(kind_of(libc::NOTE_ATTRIB as u32), Some(EventKind::Attrib));
		assert_eq!(kind_of(0), None);
	}

	#[test]
	fn entry_change_re_arms_and_delete_retires() {
		let dir = tempdir().unwrap();
		let watched = dir.path().join("watched");
		fs::create_dir(&watched).unwrap();

		let mut backend = KqueueBackend::open(&WatchConfig::default()).unwrap();
		let watch = backend.add_watch(&watched, true).unwrap();

		fs::write(watched.join("a"), b"a").unwrap();
		let mut out = Vec::new();
		backend.drain(&mut out).unwrap();
		assert!(out
			.iter()
			.any(|n| n.kind == EventKind::Modify && n.subject == Subject::Watched(watch)));

		// Re-armed, so a second change is seen too
		fs::write(watched.join("b"), b"b").unwrap();
		out.clear();
		backend.drain(&mut out).unwrap();
		assert!(!out.is_empty());

		fs::remove_file(watched.join("a")).unwrap();
		fs::remove_file(watched.join("b")).unwrap();
		fs::remove_dir(&watched).unwrap();
		out.clear();
		backend.drain(&mut out).unwrap();
		assert!(out.iter().any(|n| n.kind == EventKind::Delete));
		assert!(backend.watches.is_empty());

		// Idempotent after the kernel side is gone
		backend.remove_watch(watch);
	}
}
