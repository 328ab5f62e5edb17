//! inotify backend.
//!
//! One inotify descriptor carries the records of every watched directory. Records name the
//! entry that changed inside the directory, so renames arrive as two halves that go through
//! the [`Coalescer`].

use crate::{
	coalescer::{Coalescer, PendingMove},
	config::{ModifyMode, WatchConfig},
	error::{Error, Result},
	event::{EventKind, Notice, Subject, WatchId},
	platform::Backend,
};

use sw_reactor::Timestamp;
use sw_utils::{error::FileIOError, set_nonblocking};

use std::{
	collections::HashMap,
	ffi::OsStr,
	io, mem,
	os::fd::{AsRawFd, RawFd},
	path::Path,
};

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use tracing::{debug, trace, warn};

/// `struct inotify_event` without the trailing name
const HEADER_LEN: usize = mem::size_of::<libc::inotify_event>();
const NAME_MAX: usize = 255;
/// Room for the largest possible record
const MAX_RECORD_LEN: usize = HEADER_LEN + NAME_MAX + 1;

fn watch_mask(mode: ModifyMode) -> WatchMask {
	let modify = match mode {
		ModifyMode::CloseWrite => WatchMask::CLOSE_WRITE,
		ModifyMode::Modify => WatchMask::MODIFY,
		ModifyMode::Both => WatchMask::CLOSE_WRITE | WatchMask::MODIFY,
	};

	WatchMask::ATTRIB
		| WatchMask::CREATE
		| WatchMask::DELETE
		| WatchMask::MOVED_FROM
		| WatchMask::MOVED_TO
		| WatchMask::DONT_FOLLOW
		| modify
}

fn watch_id(wd: &WatchDescriptor) -> WatchId {
	// The kernel only hands out positive descriptors
	#[allow(clippy::cast_sign_loss)]
	WatchId(wd.get_watch_descriptor_id() as u32)
}

#[derive(Debug)]
pub struct InotifyBackend {
	inotify: Inotify,
	mask: WatchMask,
	/// Needed again to remove a watch
	descriptors: HashMap<WatchId, WatchDescriptor>,
	buffer: Vec<u8>,
	coalescer: Coalescer,
}

/// One inotify record, keyed by our watch id instead of the kernel descriptor
#[derive(Debug, Clone, Copy)]
pub(crate) struct Record<'a> {
	pub(crate) watch: WatchId,
	pub(crate) mask: EventMask,
	pub(crate) cookie: u32,
	pub(crate) name: Option<&'a OsStr>,
}

impl<'a> From<inotify::Event<&'a OsStr>> for Record<'a> {
	fn from(event: inotify::Event<&'a OsStr>) -> Self {
		Self {
			watch: watch_id(&event.wd),
			mask: event.mask,
			cookie: event.cookie,
			name: event.name,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decoded {
	Complete,
	/// The kernel queue overflowed; the rest of the drain is abandoned
	Overflow,
}

impl InotifyBackend {
	fn grow_buffer(&mut self) {
		let len = self.buffer.len() + MAX_RECORD_LEN;
		debug!(from = self.buffer.len(), to = len, "Growing inotify read buffer;");
		self.buffer.resize(len, 0);
	}
}

impl Backend for InotifyBackend {
	const NAME: &'static str = "inotify";

	fn open(config: &WatchConfig) -> Result<Self> {
		let open_error = |source| Error::Open {
			backend: Self::NAME,
			source,
		};

		let inotify = Inotify::init().map_err(open_error)?;
		// The reactor decides when to read, a read must never wait
		set_nonblocking(inotify.as_raw_fd()).map_err(open_error)?;

		debug!(
			fd = inotify.as_raw_fd(),
			modify_mode = ?config.modify_mode,
			"Opened inotify device;",
		);

		Ok(Self {
			inotify,
			mask: watch_mask(config.modify_mode),
			descriptors: HashMap::new(),
			buffer: vec![0; config.read_buffer.max(HEADER_LEN)],
			coalescer: Coalescer::default(),
		})
	}

	fn descriptor(&self) -> RawFd {
		self.inotify.as_raw_fd()
	}

	fn add_watch(&mut self, path: &Path, is_dir: bool) -> Result<WatchId> {
		let mask = if is_dir {
			self.mask | WatchMask::ONLYDIR
		} else {
			self.mask
		};

		let wd = self
			.inotify
			.watches()
			.add(path, mask)
			.map_err(|e| Error::AddWatch(FileIOError::new("add an inotify watch on", path, e)))?;

		let watch = watch_id(&wd);
		trace!(%watch, path = %path.display(), "Added inotify watch;");
		// The same directory comes back with the same descriptor
		self.descriptors.insert(watch, wd);

		Ok(watch)
	}

	fn remove_watch(&mut self, watch: WatchId) {
		let Some(wd) = self.descriptors.remove(&watch) else {
			trace!(%watch, "Unknown inotify watch;");
			return;
		};

		if let Err(e) = self.inotify.watches().remove(wd) {
			if e.raw_os_error() == Some(libc::EINVAL) {
				// Already dropped by the kernel, usually because the directory is gone
				trace!(%watch, "inotify watch was already removed;");
			} else {
				warn!(%watch, ?e, "Failed to remove inotify watch;");
			}
		}
	}

	fn drain(&mut self, out: &mut Vec<Notice>) -> Result<()> {
		let mut grown = false;

		loop {
			let e = match self.inotify.read_events(&mut self.buffer) {
				Ok(events) => {
					let mut records = events.map(Record::from).peekable();
					if records.peek().is_none() {
						break;
					}

					let now = Timestamp::now();
					if decode(records, &mut self.coalescer, now, out) == Decoded::Overflow {
						warn!("inotify queue overflowed, notifications were lost;");
						return Ok(());
					}
					continue;
				}
				Err(e) => e,
			};

			match e.kind() {
				io::ErrorKind::Interrupted => continue,
				io::ErrorKind::WouldBlock | io::ErrorKind::UnexpectedEof => break,
				// The next record does not fit the buffer
				_ if e.raw_os_error() == Some(libc::EINVAL) && !grown => {
					grown = true;
					self.grow_buffer();
				}
				_ => {
					self.coalescer.finish(out);
					return Err(Error::Read(e));
				}
			}
		}

		self.coalescer.finish(out);

		Ok(())
	}
}

/// Turns one read worth of records into notices, pairing rename halves on the way
pub(crate) fn decode<'a>(
	records: impl IntoIterator<Item = Record<'a>>,
	coalescer: &mut Coalescer,
	timestamp: Timestamp,
	out: &mut Vec<Notice>,
) -> Decoded {
	for Record {
		watch,
		mask,
		cookie,
		name,
	} in records
	{
		if mask.contains(EventMask::Q_OVERFLOW) {
			coalescer.interrupt(out);
			out.push(Notice::overflow(timestamp));
			return Decoded::Overflow;
		}

		let name = match name {
			Some(name) if !name.is_empty() && !mask.contains(EventMask::IGNORED) => {
				name.to_os_string()
			}
			_ => {
				coalescer.interrupt(out);
				continue;
			}
		};

		let is_dir = mask.contains(EventMask::ISDIR);

		if mask.contains(EventMask::MOVED_FROM) {
			coalescer.moved_from(
				PendingMove {
					cookie,
					name,
					watch,
					is_dir,
					recorded_at: timestamp,
				},
				out,
			);
			continue;
		}

		if mask.contains(EventMask::MOVED_TO) {
			coalescer.moved_to(cookie, watch, name, is_dir, timestamp, out);
			continue;
		}

		coalescer.interrupt(out);

		let kind = if mask.contains(EventMask::CREATE) {
			EventKind::Create
		} else if mask.contains(EventMask::DELETE) {
			EventKind::Delete
		} else if mask.intersects(EventMask::CLOSE_WRITE | EventMask::MODIFY) {
			EventKind::Modify
		} else if mask.contains(EventMask::ATTRIB) {
			EventKind::Attrib
		} else {
			trace!(%watch, ?mask, "Dropping inotify record we did not ask for;");
			continue;
		};

		out.push(Notice::new(
			kind,
			is_dir,
			timestamp,
			Subject::Entry { watch, name },
		));
	}

	Decoded::Complete
}
