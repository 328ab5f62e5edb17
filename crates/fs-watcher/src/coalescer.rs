//! Pairs the split halves of an inotify rename.
//!
//! The kernel reports a rename as a moved-from record on the source directory and a moved-to
//! record on the destination, tied together by a cookie. Only a moved-to arriving right after
//! its moved-from becomes one [`EventKind::Move`]; anything else in between means the file
//! left the watched tree, so the buffered half is flushed as a delete.

use crate::event::{EventKind, Notice, Subject, WatchId};

use sw_reactor::Timestamp;

use std::ffi::OsString;

use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMove {
	pub cookie: u32,
	pub name: OsString,
	pub watch: WatchId,
	pub is_dir: bool,
	pub recorded_at: Timestamp,
}

impl PendingMove {
	fn into_delete(self) -> Notice {
		Notice::new(
			EventKind::Delete,
			self.is_dir,
			self.recorded_at,
			Subject::Entry {
				watch: self.watch,
				name: self.name,
			},
		)
	}
}

#[derive(Debug, Default)]
pub struct Coalescer {
	pending: Option<PendingMove>,
}

impl Coalescer {
	pub fn is_pending(&self) -> bool {
		self.pending.is_some()
	}

	/// Buffers a moved-from half. A half already waiting is flushed first, never replaced.
	pub fn moved_from(&mut self, half: PendingMove, out: &mut Vec<Notice>) {
		self.interrupt(out);
		trace!(cookie = half.cookie, name = ?half.name, "Buffering moved-from half;");
		self.pending = Some(half);
	}

	pub fn moved_to(
		&mut self,
		cookie: u32,
		watch: WatchId,
		name: OsString,
		is_dir: bool,
		timestamp: Timestamp,
		out: &mut Vec<Notice>,
	) {
		let to = Subject::Entry { watch, name };

		match self.pending.take() {
			Some(from) if from.cookie == cookie => {
				out.push(Notice::moved(
					from.is_dir,
					timestamp,
					Subject::Entry {
						watch: from.watch,
						name: from.name,
					},
					to,
				));
			}
			unrelated => {
				if let Some(from) = unrelated {
					out.push(from.into_delete());
				}
				// Moved in from outside the watched tree
				out.push(Notice::moved_in(is_dir, timestamp, to));
			}
		}
	}

	/// Any record other than the matching moved-to ends the chance of pairing
	pub fn interrupt(&mut self, out: &mut Vec<Notice>) {
		if let Some(from) = self.pending.take() {
			trace!(cookie = from.cookie, name = ?from.name, "Flushing unpaired moved-from as delete;");
			out.push(from.into_delete());
		}
	}

	/// End of a drain batch
	pub fn finish(&mut self, out: &mut Vec<Notice>) {
		self.interrupt(out);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use pretty_assertions::assert_eq;

	const T: Timestamp = Timestamp::from_millis(10);

	fn half(cookie: u32, name: &str) -> PendingMove {
		PendingMove {
			cookie,
			name: name.into(),
			watch: WatchId(1),
			is_dir: false,
			recorded_at: T,
		}
	}

	fn entry(watch: u32, name: &str) -> Subject {
		Subject::Entry {
			watch: WatchId(watch),
			name: name.into(),
		}
	}

	#[test]
	fn matching_halves_become_one_move() {
		let mut coalescer = Coalescer::default();
		let mut out = Vec::new();

		coalescer.moved_from(half(7, "a.txt"), &mut out);
		assert!(out.is_empty());
		assert!(coalescer.is_pending());

		coalescer.moved_to(7, WatchId(1), "b.txt".into(), false, T, &mut out);
		coalescer.finish(&mut out);

		assert_eq!(
			out,
			vec![Notice::moved(false, T, entry(1, "a.txt"), entry(1, "b.txt"))]
		);
		assert!(!coalescer.is_pending());
	}

	#[test]
	fn unpaired_half_flushes_as_delete_at_batch_end() {
		let mut coalescer = Coalescer::default();
		let mut out = Vec::new();

		coalescer.moved_from(half(9, "a.txt"), &mut out);
		coalescer.finish(&mut out);

		assert_eq!(
			out,
			vec![Notice::new(EventKind::Delete, false, T, entry(1, "a.txt"))]
		);
	}

	#[test]
	fn lone_moved_to_is_a_create() {
		let mut coalescer = Coalescer::default();
		let mut out = Vec::new();

		coalescer.moved_to(3, WatchId(2), "new".into(), true, T, &mut out);

		assert_eq!(
			out,
			vec![Notice::moved_in(true, T, entry(2, "new"))]
		);
	}

	#[test]
	fn cookie_mismatch_flushes_then_creates() {
		let mut coalescer = Coalescer::default();
		let mut out = Vec::new();

		coalescer.moved_from(half(1, "gone"), &mut out);
		coalescer.moved_to(2, WatchId(1), "arrived".into(), false, T, &mut out);

		assert_eq!(
			out,
			vec![
				Notice::new(EventKind::Delete, false, T, entry(1, "gone")),
				Notice::moved_in(false, T, entry(1, "arrived")),
			]
		);
	}

	#[test]
	fn consecutive_moved_from_never_overwrite() {
		let mut coalescer = Coalescer::default();
		let mut out = Vec::new();

		coalescer.moved_from(half(1, "first"), &mut out);
		coalescer.moved_from(half(2, "second"), &mut out);
		assert_eq!(
			out,
			vec![Notice::new(EventKind::Delete, false, T, entry(1, "first"))]
		);

		// The second half can still pair
		coalescer.moved_to(2, WatchId(1), "renamed".into(), false, T, &mut out);
		assert_eq!(out.len(), 2);
		assert_eq!(out[1].kind, EventKind::Move);
		assert_eq!(out[1].moved_to, Some(entry(1, "renamed")));
	}
}
