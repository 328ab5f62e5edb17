//! fanotify backend.
//!
//! Opens a notification group and keeps its descriptor readable in the reactor, but places no
//! marks yet: roots are only remembered. Anything the group does deliver is consumed and its
//! event descriptors closed, so nothing leaks while the mark handling is missing.

use crate::{
	config::WatchConfig,
	error::{Error, Result},
	event::{Notice, WatchId},
	platform::Backend,
};

use std::{
	collections::BTreeMap,
	fs::File,
	io::{self, Read},
	os::fd::{AsRawFd, FromRawFd, RawFd},
	path::{Path, PathBuf},
};

use tracing::{debug, trace, warn};

/// `struct fanotify_event_metadata`
const METADATA_LEN: usize = 24;
const METADATA_VERSION: u8 = 3;

#[derive(Debug)]
pub struct FanotifyBackend {
	group: File,
	roots: BTreeMap<WatchId, PathBuf>,
	next_watch: u32,
	buffer: Vec<u8>,
}

/// Event descriptors carried by the complete records in `buf`
pub(crate) fn event_fds(buf: &[u8]) -> Vec<RawFd> {
	let mut fds = Vec::new();
	let mut offset = 0;

	while buf.len() - offset >= METADATA_LEN {
		let record = &buf[offset..];
		let event_len = u32::from_ne_bytes([record[0], record[1], record[2], record[3]]) as usize;
		let version = record[4];

		if event_len < METADATA_LEN || event_len > record.len() {
			warn!(%event_len, "Malformed fanotify record, dropping the rest of the read;");
			break;
		}
		if version != METADATA_VERSION {
			warn!(%version, "Unexpected fanotify metadata version;");
			break;
		}

		let fd = i32::from_ne_bytes([record[16], record[17], record[18], record[19]]);
		if fd >= 0 {
			fds.push(fd);
		}

		offset += event_len;
	}

	fds
}

impl Backend for FanotifyBackend {
	const NAME: &'static str = "fanotify";

	fn open(config: &WatchConfig) -> Result<Self> {
		#[allow(clippy::cast_sign_loss)]
		// SAFETY: plain syscall, the returned descriptor is checked below
		let fd = unsafe {
			libc::fanotify_init(
				libc::FAN_CLOEXEC | libc::FAN_NONBLOCK | libc::FAN_CLASS_NOTIF,
				(libc::O_RDONLY | libc::O_LARGEFILE) as u32,
			)
		};
		if fd < 0 {
			return Err(Error::Open {
				backend: Self::NAME,
				source: io::Error::last_os_error(),
			});
		}

		debug!(%fd, "Opened fanotify group;");

		Ok(Self {
			// SAFETY: `fd` is a fresh descriptor nobody else owns
			group: unsafe { File::from_raw_fd(fd) },
			roots: BTreeMap::new(),
			next_watch: 0,
			buffer: vec![0; config.read_buffer.max(METADATA_LEN)],
		})
	}

	fn descriptor(&self) -> RawFd {
		self.group.as_raw_fd()
	}

	fn add_watch(&mut self, path: &Path, _is_dir: bool) -> Result<WatchId> {
		self.next_watch += 1;
		let watch = WatchId(self.next_watch);
		self.roots.insert(watch, path.to_path_buf());

		trace!(%watch, path = %path.display(), "Recorded fanotify root without a mark;");

		Ok(watch)
	}

	fn remove_watch(&mut self, watch: WatchId) {
		self.roots.remove(&watch);
	}

	fn drain(&mut self, _out: &mut Vec<Notice>) -> Result<()> {
		loop {
			let n = match self.group.read(&mut self.buffer) {
				Ok(0) => break,
				Ok(n) => n,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
				Err(e) => return Err(Error::Read(e)),
			};

			for fd in event_fds(&self.buffer[..n]) {
				// SAFETY: the kernel handed this descriptor to us and nothing else holds it
				drop(unsafe { File::from_raw_fd(fd) });
			}
		}

		Ok(())
	}

	fn recursive(&self) -> bool {
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use pretty_assertions::assert_eq;

	fn record(fd: i32, extra: usize) -> Vec<u8> {
		let len = (METADATA_LEN + extra) as u32;
		let mut buf = Vec::new();
		buf.extend_from_slice(&len.to_ne_bytes());
		buf.push(METADATA_VERSION);
		buf.push(0);
		buf.extend_from_slice(&(METADATA_LEN as u16).to_ne_bytes());
		buf.extend_from_slice(&(libc::FAN_MODIFY as u64).to_ne_bytes());
		buf.extend_from_slice(&fd.to_ne_bytes());
		buf.extend_from_slice(&4242_i32.to_ne_bytes());
		buf.resize(METADATA_LEN + extra, 0);
		buf
	}

	#[test]
	fn walks_records_of_any_length() {
		let mut buf = record(7, 0);
		buf.extend(record(-1, 8));
		buf.extend(record(9, 0));

		assert_eq!(event_fds(&buf), vec![7, 9]);
	}

	#[test]
	fn stops_at_a_truncated_or_foreign_record() {
		let mut buf = record(7, 0);
		buf.extend(record(8, 16));
		buf.truncate(METADATA_LEN + 30);
		assert_eq!(event_fds(&buf), vec![7]);

		let mut foreign = record(5, 0);
		foreign[4] = METADATA_VERSION + 1;
		assert_eq!(event_fds(&foreign), Vec::<RawFd>::new());
	}
}
