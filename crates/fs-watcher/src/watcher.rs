use crate::{
	config::WatchConfig,
	error::Result,
	event::{Event, EventKind, Notice, Subject},
	platform::Backend,
	tree::{NodeId, WatchTree},
};

use sw_reactor::Timestamp;

use std::{
	ffi::OsStr,
	fs, mem,
	os::fd::RawFd,
	path::{Path, PathBuf},
};

use tracing::{debug, trace, warn};

/// A notification backend together with the tree of directories it watches.
///
/// Reading and resolving are split: [`Watcher::read`] only pulls records off the kernel
/// descriptor, [`Watcher::process`] turns them into [`Event`]s and keeps the tree in step
/// with directories that appear, disappear or move.
#[derive(Debug)]
pub struct Watcher<B> {
	backend: B,
	tree: WatchTree,
	notices: Vec<Notice>,
}

impl<B: Backend> Watcher<B> {
	pub fn open(config: &WatchConfig) -> Result<Self> {
		Ok(Self::new(B::open(config)?))
	}

	pub fn new(backend: B) -> Self {
		Self {
			backend,
			tree: WatchTree::default(),
			notices: Vec::new(),
		}
	}

	pub fn descriptor(&self) -> RawFd {
		self.backend.descriptor()
	}

	pub fn backend(&self) -> &B {
		&self.backend
	}

	pub fn tree(&self) -> &WatchTree {
		&self.tree
	}

	pub fn add_tree(
		&mut self,
		path: &Path,
		dest_name: Option<&OsStr>,
		recursive: bool,
		parent: Option<NodeId>,
		skip: &dyn Fn(&Path) -> bool,
	) -> Result<NodeId> {
		self.tree
			.add_tree(&mut self.backend, path, dest_name, recursive, parent, skip)
	}

	pub fn remove_tree(&mut self, name: Option<&OsStr>, parent: NodeId) -> bool {
		self.tree.remove_tree(&mut self.backend, name, parent)
	}

	pub fn resolve_path(&self, node: NodeId) -> Option<PathBuf> {
		self.tree.resolve_path(node)
	}

	pub fn resolve_dest(&self, node: NodeId) -> Option<PathBuf> {
		self.tree.resolve_dest(node)
	}

	/// Pulls every available record off the kernel descriptor, returning how many were decoded
	pub fn read(&mut self) -> Result<usize> {
		let before = self.notices.len();
		self.backend.drain(&mut self.notices)?;
		Ok(self.notices.len() - before)
	}

	/// [`Watcher::read`] followed by [`Watcher::process`]
	pub fn drain(&mut self, skip: &dyn Fn(&Path) -> bool, out: &mut Vec<Event>) -> Result<()> {
		self.read()?;
		self.process(skip, out);
		Ok(())
	}

	/// Resolves buffered records into events, in kernel order.
	///
	/// New directories are watched as they appear (moved in directories with their whole
	/// subtree), and deleted or moved away ones are dropped from the tree. Backends that watch
	/// recursively on their own leave the tree alone.
	pub fn process(&mut self, skip: &dyn Fn(&Path) -> bool, out: &mut Vec<Event>) {
		let maintain_tree = !self.backend.recursive();

		for notice in mem::take(&mut self.notices) {
			let Notice {
				kind,
				is_dir,
				timestamp,
				subject,
				moved_to,
				moved_in,
			} = notice;

			if kind == EventKind::Overflow {
				out.push(Event::overflow(timestamp));
				continue;
			}

			let paths = self.locate(&subject);
			if paths.is_empty() {
				trace!(?subject, %kind, "Dropping notification for a watch no longer in the tree;");
				continue;
			}

			match kind {
				EventKind::Move => {
					let new_paths = moved_to.as_ref().map(|to| self.locate(to)).unwrap_or_default();

					if is_dir && maintain_tree {
						self.forget(&subject);
					}

					match moved_to {
						Some(to) if !new_paths.is_empty() => {
							if is_dir && maintain_tree {
								self.adopt(&to, true, skip);
							}
							for (i, path) in paths.into_iter().enumerate() {
								let new_path = new_paths[i.min(new_paths.len() - 1)].clone();
								out.push(Event::moved(is_dir, timestamp, path, new_path));
							}
						}
						_ => out.extend(
							paths
								.into_iter()
								.map(|path| Event::new(EventKind::Delete, is_dir, timestamp, path)),
						),
					}
				}
				EventKind::Create => {
					if is_dir && maintain_tree {
						self.adopt(&subject, moved_in, skip);
					}
					out.extend(
						paths
							.into_iter()
							.map(|path| Event::new(kind, is_dir, timestamp, path)),
					);
				}
				EventKind::Delete => {
					if is_dir && maintain_tree {
						self.forget(&subject);
					}
					out.extend(
						paths
							.into_iter()
							.map(|path| Event::new(kind, is_dir, timestamp, path)),
					);
				}
				EventKind::Modify if is_dir && maintain_tree => {
					// A directory's own watch firing (kqueue) names no entry, so look for
					// subdirectories that are not watched yet
					let nodes = match &subject {
						Subject::Watched(watch) => self.tree.nodes_for_watch(*watch).to_vec(),
						_ => Vec::new(),
					};
					out.extend(
						paths
							.into_iter()
							.map(|path| Event::new(kind, is_dir, timestamp, path)),
					);
					for node in nodes {
						if let Some(dir) = self.tree.resolve_path(node) {
							self.adopt_new_children(node, &dir, timestamp, skip, out);
						}
					}
				}
				_ => out.extend(
					paths
						.into_iter()
						.map(|path| Event::new(kind, is_dir, timestamp, path)),
				),
			}
		}
	}

	/// Nodes a subject's watch stands for; more than one when nested roots share the watch
	fn holders(&self, subject: &Subject) -> Vec<NodeId> {
		match subject {
			Subject::Entry { watch, .. } | Subject::Watched(watch) => {
				self.tree.nodes_for_watch(*watch).to_vec()
			}
			Subject::Path(_) => Vec::new(),
		}
	}

	/// Every distinct path the subject names
	fn locate(&self, subject: &Subject) -> Vec<PathBuf> {
		let mut paths = Vec::new();

		let mut push = |path: PathBuf| {
			if !paths.contains(&path) {
				paths.push(path);
			}
		};

		match subject {
			Subject::Entry { name, .. } => self
				.holders(subject)
				.into_iter()
				.filter_map(|node| self.tree.resolve_path(node))
				.for_each(|dir| push(dir.join(name))),
			Subject::Watched(_) => self
				.holders(subject)
				.into_iter()
				.filter_map(|node| self.tree.resolve_path(node))
				.for_each(&mut push),
			Subject::Path(path) => push(path.clone()),
		}

		paths
	}

	/// Watches the directory an entry names under every node of its parent's watch
	fn adopt(&mut self, subject: &Subject, recursive: bool, skip: &dyn Fn(&Path) -> bool) {
		let Subject::Entry { name, .. } = subject else {
			return;
		};

		for parent in self.holders(subject) {
			let Some(path) = self.tree.resolve_path(parent).map(|dir| dir.join(name)) else {
				continue;
			};

			if skip(&path) {
				trace!(path = %path.display(), "Not watching excluded directory;");
				continue;
			}

			match self
				.tree
				.add_tree(&mut self.backend, &path, None, recursive, Some(parent), skip)
			{
				Ok(_) => debug!(path = %path.display(), %recursive, "Watching new directory;"),
				// It may already be gone again; its own delete notification follows
				Err(e) => warn!(path = %path.display(), ?e, "Failed to watch new directory;"),
			}
		}
	}

	fn forget(&mut self, subject: &Subject) {
		let name = match subject {
			Subject::Entry { name, .. } => Some(name.as_os_str()),
			Subject::Watched(_) => None,
			Subject::Path(_) => return,
		};

		for node in self.holders(subject) {
			if self.tree.remove_tree(&mut self.backend, name, node) {
				trace!(?subject, ?node, "Dropped directory from the watch tree;");
			}
		}
	}

	fn adopt_new_children(
		&mut self,
		node: NodeId,
		dir: &Path,
		timestamp: Timestamp,
		skip: &dyn Fn(&Path) -> bool,
		out: &mut Vec<Event>,
	) {
		let Ok(entries) = fs::read_dir(dir) else {
			return;
		};

		for entry in entries.flatten() {
			if !entry.file_type().is_ok_and(|kind| kind.is_dir()) {
				continue;
			}
			if self.tree.child(node, &entry.file_name()).is_some() {
				continue;
			}

			let path = entry.path();
			if skip(&path) {
				continue;
			}

			match self
				.tree
				.add_tree(&mut self.backend, &path, None, true, Some(node), skip)
			{
				Ok(_) => out.push(Event::new(EventKind::Create, true, timestamp, path)),
				Err(e) => warn!(path = %path.display(), ?e, "Failed to watch new directory;"),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::{event::WatchId, tree::tests::MockBackend};

	use pretty_assertions::assert_eq;
	use tempfile::tempdir;

	const T: Timestamp = Timestamp::from_millis(5);

	fn no_skip(_: &Path) -> bool {
		false
	}

	fn entry(watch: WatchId, name: &str) -> Subject {
		Subject::Entry {
			watch,
			name: name.into(),
		}
	}

	fn setup(dirs: &[&str]) -> (tempfile::TempDir, Watcher<MockBackend>, NodeId) {
		let dir = tempdir().unwrap();
		for d in dirs {
			fs::create_dir_all(dir.path().join(d)).unwrap();
		}
		let mut watcher = Watcher::new(MockBackend::default());
		let root = watcher
			.add_tree(dir.path(), None, true, None, &no_skip)
			.unwrap();
		(dir, watcher, root)
	}

	fn run(watcher: &mut Watcher<MockBackend>, notices: Vec<Notice>) -> Vec<Event> {
		// The mock delivers nothing itself, so these go through as if just read
		watcher.notices = notices;
		let mut out = Vec::new();
		watcher.drain(&no_skip, &mut out).unwrap();
		out
	}

	#[test]
	fn created_directory_is_watched_without_recursion() {
		let (dir, mut watcher, root) = setup(&[]);
		let root_watch = watcher.tree().watch_of(root).unwrap();
		fs::create_dir_all(dir.path().join("new/inner")).unwrap();

		let events = run(
			&mut watcher,
			vec![Notice::new(EventKind::Create, true, T, entry(root_watch, "new"))],
		);

		assert_eq!(
			events,
			vec![Event::new(EventKind::Create, true, T, dir.path().join("new"))]
		);
		let new = watcher.tree().child(root, OsStr::new("new")).unwrap();
		assert_eq!(watcher.tree().children(new).count(), 0);
		assert_eq!(watcher.backend().live.len(), 2);
	}

	#[test]
	fn moved_in_directory_is_watched_with_its_subtree() {
		let (dir, mut watcher, root) = setup(&[]);
		let root_watch = watcher.tree().watch_of(root).unwrap();
		fs::create_dir_all(dir.path().join("arrived/inner/deeper")).unwrap();

		let events = run(
			&mut watcher,
			vec![Notice::moved_in(true, T, entry(root_watch, "arrived"))],
		);

		assert_eq!(
			events,
			vec![Event::new(EventKind::Create, true, T, dir.path().join("arrived"))]
		);
		assert_eq!(watcher.tree().len(), 4);
	}

	#[test]
	fn deleted_directory_leaves_the_tree() {
		let (dir, mut watcher, root) = setup(&["gone/sub"]);
		let root_watch = watcher.tree().watch_of(root).unwrap();
		assert_eq!(watcher.backend().live.len(), 3);

		let events = run(
			&mut watcher,
			vec![Notice::new(EventKind::Delete, true, T, entry(root_watch, "gone"))],
		);

		assert_eq!(
			events,
			vec![Event::new(EventKind::Delete, true, T, dir.path().join("gone"))]
		);
		assert_eq!(watcher.backend().live.len(), 1);
	}

	#[test]
	fn moved_directory_is_rewatched_with_its_subtree() {
		let (dir, mut watcher, root) = setup(&["from/deep", "to"]);
		let root_watch = watcher.tree().watch_of(root).unwrap();
		let to = watcher.tree().child(root, OsStr::new("to")).unwrap();
		let to_watch = watcher.tree().watch_of(to).unwrap();

		fs::rename(dir.path().join("from"), dir.path().join("to/moved")).unwrap();

		let events = run(
			&mut watcher,
			vec![Notice::moved(
				true,
				T,
				entry(root_watch, "from"),
				entry(to_watch, "moved"),
			)],
		);

		assert_eq!(
			events,
			vec![Event::moved(
				true,
				T,
				dir.path().join("from"),
				dir.path().join("to/moved")
			)]
		);

		let moved = watcher.tree().child(to, OsStr::new("moved")).unwrap();
		let deep = watcher.tree().child(moved, OsStr::new("deep")).unwrap();
		assert_eq!(
			watcher.tree().resolve_path(deep).unwrap(),
			dir.path().join("to/moved/deep")
		);
		assert!(watcher.tree().child(root, OsStr::new("from")).is_none());
		assert_eq!(watcher.backend().live.len(), 4);
	}

	#[test]
	fn move_out_of_the_tree_is_a_delete() {
		let (dir, mut watcher, root) = setup(&["leaving"]);
		let root_watch = watcher.tree().watch_of(root).unwrap();

		let events = run(
			&mut watcher,
			vec![Notice::moved(
				true,
				T,
				entry(root_watch, "leaving"),
				entry(WatchId(999), "elsewhere"),
			)],
		);

		assert_eq!(
			events,
			vec![Event::new(
				EventKind::Delete,
				true,
				T,
				dir.path().join("leaving")
			)]
		);
		assert_eq!(watcher.backend().live.len(), 1);
	}

	#[test]
	fn overflow_and_unknown_watches() {
		let (dir, mut watcher, root) = setup(&[]);
		let root_watch = watcher.tree().watch_of(root).unwrap();

		let events = run(
			&mut watcher,
			vec![
				Notice::new(EventKind::Modify, false, T, entry(WatchId(404), "lost")),
				Notice::overflow(T),
				Notice::new(EventKind::Attrib, false, T, entry(root_watch, "file")),
			],
		);

		assert_eq!(
			events,
			vec![
				Event::overflow(T),
				Event::new(EventKind::Attrib, false, T, dir.path().join("file")),
			]
		);
	}

	#[test]
	fn nested_root_shares_its_watch_with_the_outer_tree() {
		let (dir, mut watcher, outer) = setup(&["sub"]);
		let sub = dir.path().join("sub");
		let inner = watcher.add_tree(&sub, None, true, None, &no_skip).unwrap();
		let shared = watcher.tree().watch_of(inner).unwrap();
		assert_eq!(
			watcher.tree().watch_of(watcher.tree().child(outer, OsStr::new("sub")).unwrap()),
			Some(shared)
		);

		fs::create_dir(sub.join("fresh")).unwrap();
		let events = run(
			&mut watcher,
			vec![Notice::new(EventKind::Create, true, T, entry(shared, "fresh"))],
		);

		// One event for the one directory, watched under both roots
		assert_eq!(
			events,
			vec![Event::new(EventKind::Create, true, T, sub.join("fresh"))]
		);
		assert_eq!(watcher.tree().len(), 5);
		assert_eq!(watcher.backend().live.len(), 3);

		assert!(watcher.remove_tree(None, inner));
		assert_eq!(watcher.backend().live.len(), 3);

		let events = run(
			&mut watcher,
			vec![Notice::new(EventKind::Modify, false, T, entry(shared, "file"))],
		);
		assert_eq!(
			events,
			vec![Event::new(EventKind::Modify, false, T, sub.join("file"))]
		);
	}

	#[test]
	fn watched_directory_change_picks_up_new_subdirectories() {
		let (dir, mut watcher, root) = setup(&[]);
		let root_watch = watcher.tree().watch_of(root).unwrap();
		fs::create_dir_all(dir.path().join("fresh/nested")).unwrap();

		let events = run(
			&mut watcher,
			vec![Notice::new(
				EventKind::Modify,
				true,
				T,
				Subject::Watched(root_watch),
			)],
		);

		assert_eq!(
			events,
			vec![
				Event::new(EventKind::Modify, true, T, dir.path()),
				Event::new(EventKind::Create, true, T, dir.path().join("fresh")),
			]
		);
		assert_eq!(watcher.backend().live.len(), 3);
	}
}
