use sw_reactor::Timestamp;

use std::{ffi::OsString, fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	Attrib,
	Modify,
	Create,
	Delete,
	Move,
	/// The kernel dropped notifications; a full rescan is advisable
	Overflow,
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Attrib => "attrib",
			Self::Modify => "modify",
			Self::Create => "create",
			Self::Delete => "delete",
			Self::Move => "move",
			Self::Overflow => "overflow",
		})
	}
}

/// A normalized filesystem change, the same on every platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
	pub kind: EventKind,
	pub is_dir: bool,
	pub timestamp: Timestamp,
	pub path: PathBuf,
	/// Destination of a [`EventKind::Move`], `None` for every other kind
	pub new_path: Option<PathBuf>,
}

impl Event {
	pub fn new(kind: EventKind, is_dir: bool, timestamp: Timestamp, path: impl Into<PathBuf>) -> Self {
		Self {
			kind,
			is_dir,
			timestamp,
			path: path.into(),
			new_path: None,
		}
	}

	pub fn moved(
		is_dir: bool,
		timestamp: Timestamp,
		path: impl Into<PathBuf>,
		new_path: impl Into<PathBuf>,
	) -> Self {
		Self {
			kind: EventKind::Move,
			is_dir,
			timestamp,
			path: path.into(),
			new_path: Some(new_path.into()),
		}
	}

	pub fn overflow(timestamp: Timestamp) -> Self {
		Self::new(EventKind::Overflow, false, timestamp, PathBuf::new())
	}
}

/// Backend specific handle of one kernel watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u32);

impl fmt::Display for WatchId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// What a raw notification refers to, before the watch tree resolves it to a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
	/// An entry inside a watched directory (inotify, fanotify)
	Entry { watch: WatchId, name: OsString },
	/// The watched object itself (kqueue)
	Watched(WatchId),
	/// An absolute path reported by the kernel (FSEvents)
	Path(PathBuf),
}

/// A decoded backend record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
	pub kind: EventKind,
	pub is_dir: bool,
	pub timestamp: Timestamp,
	pub subject: Subject,
	/// Set only on [`EventKind::Move`]
	pub moved_to: Option<Subject>,
	/// A create that arrived by rename from outside the tree, so the entry may already have
	/// contents of its own
	pub moved_in: bool,
}

impl Notice {
	pub fn new(kind: EventKind, is_dir: bool, timestamp: Timestamp, subject: Subject) -> Self {
		Self {
			kind,
			is_dir,
			timestamp,
			subject,
			moved_to: None,
			moved_in: false,
		}
	}

	pub fn moved(is_dir: bool, timestamp: Timestamp, from: Subject, to: Subject) -> Self {
		Self {
			moved_to: Some(to),
			..Self::new(EventKind::Move, is_dir, timestamp, from)
		}
	}

	pub fn moved_in(is_dir: bool, timestamp: Timestamp, subject: Subject) -> Self {
		Self {
			moved_in: true,
			..Self::new(EventKind::Create, is_dir, timestamp, subject)
		}
	}

	pub fn overflow(timestamp: Timestamp) -> Self {
		Self::new(
			EventKind::Overflow,
			false,
			timestamp,
			Subject::Path(PathBuf::new()),
		)
	}
}
