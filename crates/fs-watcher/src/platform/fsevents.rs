//! Framing between the FSEvents worker thread and the reactor.
//!
//! The run loop thread pairs rename halves and writes one frame per change into a pipe; the
//! reactor side reads whatever bytes are available and only decodes complete frames. None of
//! this touches CoreServices, so it builds and is tested on every platform.
//!
//! Frame layout, all integers little endian:
//! `flags: u32 | path_len: u32 | new_path_len: u32 | path | new_path`
//! where a zero `new_path_len` means no destination.

use crate::event::{EventKind, Notice, Subject};

use sw_reactor::Timestamp;

use std::{
	ffi::OsString,
	os::unix::ffi::{OsStrExt, OsStringExt},
	path::{Path, PathBuf},
};

use bitflags::bitflags;

bitflags! {
	/// `kFSEventStreamEventFlag*` values from CoreServices
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct StreamFlags: u32 {
		const MUST_SCAN_SUBDIRS = 0x0000_0001;
		const USER_DROPPED = 0x0000_0002;
		const KERNEL_DROPPED = 0x0000_0004;
		const IDS_WRAPPED = 0x0000_0008;
		const HISTORY_DONE = 0x0000_0010;
		const ROOT_CHANGED = 0x0000_0020;
		const MOUNT = 0x0000_0040;
		const UNMOUNT = 0x0000_0080;
		const ITEM_CREATED = 0x0000_0100;
		const ITEM_REMOVED = 0x0000_0200;
		const INODE_META_MOD = 0x0000_0400;
		const ITEM_RENAMED = 0x0000_0800;
		const ITEM_MODIFIED = 0x0000_1000;
		const FINDER_INFO_MOD = 0x0000_2000;
		const ITEM_CHANGE_OWNER = 0x0000_4000;
		const ITEM_XATTR_MOD = 0x0000_8000;
		const IS_FILE = 0x0001_0000;
		const IS_DIR = 0x0002_0000;
		const IS_SYMLINK = 0x0004_0000;
		const OWN_EVENT = 0x0008_0000;
		const IS_HARDLINK = 0x0010_0000;
		const IS_LAST_HARDLINK = 0x0020_0000;
		const ITEM_CLONED = 0x0040_0000;
	}
}

impl StreamFlags {
	const LOST: Self = Self::MUST_SCAN_SUBDIRS
		.union(Self::USER_DROPPED)
		.union(Self::KERNEL_DROPPED);

	const METADATA: Self = Self::INODE_META_MOD
		.union(Self::FINDER_INFO_MOD)
		.union(Self::ITEM_CHANGE_OWNER)
		.union(Self::ITEM_XATTR_MOD);

	/// FSEvents merges flags of changes that happened close together, so the most
	/// significant one wins
	pub fn kind(self) -> Option<EventKind> {
		if self.intersects(Self::LOST) {
			Some(EventKind::Overflow)
		} else if self.contains(Self::ITEM_RENAMED) {
			Some(EventKind::Move)
		} else if self.contains(Self::ITEM_REMOVED) {
			Some(EventKind::Delete)
		} else if self.contains(Self::ITEM_CREATED) {
			Some(EventKind::Create)
		} else if self.contains(Self::ITEM_MODIFIED) {
			Some(EventKind::Modify)
		} else if self.intersects(Self::METADATA) {
			Some(EventKind::Attrib)
		} else {
			None
		}
	}
}

const FRAME_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub flags: StreamFlags,
	pub path: PathBuf,
	pub moved_to: Option<PathBuf>,
}

impl Frame {
	pub fn new(flags: StreamFlags, path: impl Into<PathBuf>) -> Self {
		Self {
			flags,
			path: path.into(),
			moved_to: None,
		}
	}

	pub fn encode(&self, buf: &mut Vec<u8>) {
		let path = self.path.as_os_str().as_bytes();
		let new_path = self
			.moved_to
			.as_deref()
			.map_or(&[][..], |p| p.as_os_str().as_bytes());

		buf.extend_from_slice(&self.flags.bits().to_le_bytes());
		buf.extend_from_slice(&len_u32(path).to_le_bytes());
		buf.extend_from_slice(&len_u32(new_path).to_le_bytes());
		buf.extend_from_slice(path);
		buf.extend_from_slice(new_path);
	}

	/// The notice this frame decodes to, `None` for flags that carry no change
	pub fn into_notice(self, timestamp: Timestamp) -> Option<Notice> {
		let kind = self.flags.kind()?;
		if kind == EventKind::Overflow {
			return Some(Notice::overflow(timestamp));
		}

		let is_dir = self.flags.contains(StreamFlags::IS_DIR);

		Some(match (kind, self.moved_to) {
			(EventKind::Move, Some(to)) => {
				Notice::moved(is_dir, timestamp, Subject::Path(self.path), Subject::Path(to))
			}
			// The pairer never sends a rename without its other half
			(EventKind::Move, None) => {
				Notice::new(EventKind::Modify, is_dir, timestamp, Subject::Path(self.path))
			}
			(kind, _) => Notice::new(kind, is_dir, timestamp, Subject::Path(self.path)),
		})
	}
}

#[allow(clippy::cast_possible_truncation)]
fn len_u32(bytes: &[u8]) -> u32 {
	// Paths are bounded by PATH_MAX, far below u32::MAX
	bytes.len() as u32
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
	let mut bytes = [0; 4];
	bytes.copy_from_slice(&buf[at..at + 4]);
	u32::from_le_bytes(bytes)
}

/// Reassembles frames from arbitrary chunks of the pipe
#[derive(Debug, Default)]
pub struct FrameDecoder {
	buf: Vec<u8>,
}

impl FrameDecoder {
	pub fn push(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	/// Bytes of an incomplete frame still waiting for the rest
	pub fn pending(&self) -> usize {
		self.buf.len()
	}

	pub fn next_frame(&mut self) -> Option<Frame> {
		if self.buf.len() < FRAME_HEADER_LEN {
			return None;
		}

		let flags = StreamFlags::from_bits_retain(read_u32(&self.buf, 0));
		let path_len = read_u32(&self.buf, 4) as usize;
		let new_path_len = read_u32(&self.buf, 8) as usize;
		let total = FRAME_HEADER_LEN + path_len + new_path_len;
		if self.buf.len() < total {
			return None;
		}

		let body = self.buf.drain(..total).skip(FRAME_HEADER_LEN).collect::<Vec<_>>();
		let (path, new_path) = body.split_at(path_len);

		Some(Frame {
			flags,
			path: PathBuf::from(OsString::from_vec(path.to_vec())),
			moved_to: (!new_path.is_empty())
				.then(|| PathBuf::from(OsString::from_vec(new_path.to_vec()))),
		})
	}
}

/// Joins the two consecutive records FSEvents reports for one rename.
///
/// Records are pushed in callback order; [`RenamePairer::finish`] runs at the end of every
/// callback batch and settles a rename whose other half never came, as a create when the
/// path exists and as a delete otherwise.
#[derive(Debug, Default)]
pub struct RenamePairer {
	pending: Option<Frame>,
}

impl RenamePairer {
	pub fn push(
		&mut self,
		flags: StreamFlags,
		path: PathBuf,
		exists: impl Fn(&Path) -> bool,
		out: &mut Vec<Frame>,
	) {
		if !flags.contains(StreamFlags::ITEM_RENAMED) {
			self.finish(&exists, out);
			out.push(Frame::new(flags, path));
			return;
		}

		match self.pending.take() {
			Some(from) => out.push(Frame {
				flags: from.flags | (flags & (StreamFlags::IS_DIR | StreamFlags::IS_FILE)),
				path: from.path,
				moved_to: Some(path),
			}),
			None => self.pending = Some(Frame::new(flags, path)),
		}
	}

	pub fn finish(&mut self, exists: impl Fn(&Path) -> bool, out: &mut Vec<Frame>) {
		if let Some(mut lone) = self.pending.take() {
			lone.flags.remove(StreamFlags::ITEM_RENAMED);
			lone.flags.insert(if exists(&lone.path) {
				StreamFlags::ITEM_CREATED
			} else {
				StreamFlags::ITEM_REMOVED
			});
			out.push(lone);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use pretty_assertions::assert_eq;

	const T: Timestamp = Timestamp::from_millis(1);

	fn nothing_exists(_: &Path) -> bool {
		false
	}

	#[test]
	fn frames_survive_arbitrary_chunking() {
		let frames = vec![
			Frame::new(StreamFlags::ITEM_CREATED | StreamFlags::IS_FILE, "/w/a.txt"),
			Frame {
				flags: StreamFlags::ITEM_RENAMED | StreamFlags::IS_DIR,
				path: "/w/old".into(),
				moved_to: Some("/w/new".into()),
			},
			Frame::new(StreamFlags::KERNEL_DROPPED, "/w"),
		];

		let mut bytes = Vec::new();
		for frame in &frames {
			frame.encode(&mut bytes);
		}

		let mut decoder = FrameDecoder::default();
		let mut decoded = Vec::new();
		for chunk in bytes.chunks(5) {
			decoder.push(chunk);
			while let Some(frame) = decoder.next_frame() {
				decoded.push(frame);
			}
		}

		assert_eq!(decoded, frames);
		assert_eq!(decoder.pending(), 0);
	}

	#[test]
	fn partial_tail_waits_for_the_rest() {
		let mut bytes = Vec::new();
		Frame::new(StreamFlags::ITEM_MODIFIED, "/w/file").encode(&mut bytes);
		let split = bytes.len() - 3;

		let mut decoder = FrameDecoder::default();
		decoder.push(&bytes[..split]);
		assert_eq!(decoder.next_frame(), None);
		assert_eq!(decoder.pending(), split);

		decoder.push(&bytes[split..]);
		assert_eq!(
			decoder.next_frame(),
			Some(Frame::new(StreamFlags::ITEM_MODIFIED, "/w/file"))
		);
	}

	#[test]
	fn consecutive_rename_halves_pair_into_one_frame() {
		let mut pairer = RenamePairer::default();
		let mut out = Vec::new();

		pairer.push(
			StreamFlags::ITEM_RENAMED | StreamFlags::IS_FILE,
			"/w/a.txt".into(),
			nothing_exists,
			&mut out,
		);
		assert!(out.is_empty());
		pairer.push(
			StreamFlags::ITEM_RENAMED | StreamFlags::IS_FILE,
			"/w/b.txt".into(),
			nothing_exists,
			&mut out,
		);
		pairer.finish(nothing_exists, &mut out);

		assert_eq!(
			out,
			vec![Frame {
				flags: StreamFlags::ITEM_RENAMED | StreamFlags::IS_FILE,
				path: "/w/a.txt".into(),
				moved_to: Some("/w/b.txt".into()),
			}]
		);
	}

	#[test]
	fn lone_rename_settles_on_whether_the_path_exists() {
		let mut pairer = RenamePairer::default();
		let mut out = Vec::new();

		pairer.push(StreamFlags::ITEM_RENAMED, "/w/left".into(), nothing_exists, &mut out);
		// An unrelated record interrupts the pair
		pairer.push(StreamFlags::ITEM_MODIFIED, "/w/other".into(), nothing_exists, &mut out);
		pairer.push(StreamFlags::ITEM_RENAMED, "/w/arrived".into(), nothing_exists, &mut out);
		pairer.finish(|path| path == Path::new("/w/arrived"), &mut out);

		assert_eq!(
			out,
			vec![
				Frame::new(StreamFlags::ITEM_REMOVED, "/w/left"),
				Frame::new(StreamFlags::ITEM_MODIFIED, "/w/other"),
				Frame::new(StreamFlags::ITEM_CREATED, "/w/arrived"),
			]
		);
	}

	#[test]
	fn frames_become_notices() {
		let moved = Frame {
			flags: StreamFlags::ITEM_RENAMED | StreamFlags::IS_DIR,
			path: "/w/old".into(),
			moved_to: Some("/w/new".into()),
		};
		assert_eq!(
			moved.into_notice(T),
			Some(Notice::moved(
				true,
				T,
				Subject::Path("/w/old".into()),
				Subject::Path("/w/new".into()),
			))
		);

		assert_eq!(
			Frame::new(StreamFlags::USER_DROPPED | StreamFlags::ITEM_CREATED, "/w").into_notice(T),
			Some(Notice::overflow(T))
		);
		assert_eq!(
			Frame::new(StreamFlags::ITEM_XATTR_MOD | StreamFlags::IS_FILE, "/w/f").into_notice(T),
			Some(Notice::new(
				EventKind::Attrib,
				false,
				T,
				Subject::Path("/w/f".into())
			))
		);
		assert_eq!(Frame::new(StreamFlags::HISTORY_DONE, "/w").into_notice(T), None);
	}
}
