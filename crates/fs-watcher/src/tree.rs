//! The directories currently under watch.
//!
//! Nodes live in an arena addressed by [`NodeId`]. A root keeps its absolute path, every other
//! node only its own name, so a subtree can be renamed or resolved without touching its
//! descendants. Each live node holds exactly one backend watch; removal walks the subtree
//! post-order so no watch outlives its node.
//!
//! Backends like inotify hand out the same watch for the same directory, so nested or
//! repeated roots end up with several nodes on one watch. The watch is only removed from the
//! backend together with the last node holding it.

use crate::{
	error::{Error, Result},
	event::WatchId,
	platform::Backend,
};

use sw_utils::error::FileIOError;

use std::{
	collections::{BTreeMap, HashMap},
	ffi::{OsStr, OsString},
	fs,
	path::{Path, PathBuf},
};

use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug)]
struct WatchNode {
	watch: WatchId,
	/// Absolute path for roots, a single segment otherwise
	name: OsString,
	dest_name: Option<OsString>,
	parent: Option<NodeId>,
	children: BTreeMap<OsString, NodeId>,
}

#[derive(Debug, Default)]
pub struct WatchTree {
	nodes: Vec<Option<WatchNode>>,
	free: Vec<usize>,
	/// Every node on a watch, oldest first
	by_watch: HashMap<WatchId, Vec<NodeId>>,
	roots: Vec<NodeId>,
}

impl WatchTree {
	pub fn len(&self) -> usize {
		self.nodes.len() - self.free.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn roots(&self) -> &[NodeId] {
		&self.roots
	}

	pub fn contains(&self, node: NodeId) -> bool {
		self.node(node).is_some()
	}

	pub fn node_for_watch(&self, watch: WatchId) -> Option<NodeId> {
		self.nodes_for_watch(watch).first().copied()
	}

	/// All the nodes standing for the directory behind `watch`
	pub fn nodes_for_watch(&self, watch: WatchId) -> &[NodeId] {
		self.by_watch.get(&watch).map_or(&[], Vec::as_slice)
	}

	pub fn watch_of(&self, node: NodeId) -> Option<WatchId> {
		self.node(node).map(|n| n.watch)
	}

	pub fn parent(&self, node: NodeId) -> Option<NodeId> {
		self.node(node).and_then(|n| n.parent)
	}

	pub fn child(&self, parent: NodeId, name: &OsStr) -> Option<NodeId> {
		self.node(parent)
			.and_then(|n| n.children.get(name))
			.copied()
	}

	pub fn children(&self, node: NodeId) -> impl Iterator<Item = (&OsStr, NodeId)> + '_ {
		self.node(node)
			.into_iter()
			.flat_map(|n| n.children.iter().map(|(name, &id)| (name.as_os_str(), id)))
	}

	/// Watches `path` and, when `recursive`, every directory below it that `skip` does not
	/// reject.
	///
	/// With a `parent`, `path` must be a direct child of that node's directory; an existing
	/// child of the same name is replaced. A subdirectory that fails is logged and left out.
	pub fn add_tree<B: Backend>(
		&mut self,
		backend: &mut B,
		path: &Path,
		dest_name: Option<&OsStr>,
		recursive: bool,
		parent: Option<NodeId>,
		skip: &dyn Fn(&Path) -> bool,
	) -> Result<NodeId> {
		let name = match parent {
			Some(parent) => {
				if !self.contains(parent) {
					return Err(Error::UnknownNode(parent));
				}
				let Some(name) = path.file_name() else {
					return Err(Error::AddWatch(FileIOError::new(
						"watch a child without a final segment",
						path,
						std::io::ErrorKind::InvalidInput.into(),
					)));
				};
				if let Some(existing) = self.child(parent, name) {
					debug!(path = %path.display(), "Replacing existing watch tree node;");
					self.remove_node(backend, existing);
				}
				name.to_os_string()
			}
			None => path.as_os_str().to_os_string(),
		};

		let watch = backend.add_watch(path, true)?;
		let node = self.insert(WatchNode {
			watch,
			name,
			dest_name: dest_name.map(OsStr::to_os_string),
			parent,
			children: BTreeMap::new(),
		});

		trace!(path = %path.display(), %watch, ?node, "Watching directory;");

		if !recursive || backend.recursive() {
			return Ok(node);
		}

		let entries = match fs::read_dir(path) {
			Ok(entries) => entries,
			Err(e) => {
				self.remove_node(backend, node);
				return Err(Error::ListDir(FileIOError::new("list", path, e)));
			}
		};

		for entry in entries {
			let entry = match entry {
				Ok(entry) => entry,
				Err(e) => {
					warn!(path = %path.display(), ?e, "Failed to read directory entry;");
					continue;
				}
			};

			let child_name = entry.file_name();
			if child_name == "." || child_name == ".." {
				continue;
			}

			// `file_type` does not follow symlinks, so linked directories stay out of the tree
			if !entry.file_type().is_ok_and(|kind| kind.is_dir()) {
				continue;
			}

			let child_path = entry.path();
			if skip(&child_path) {
				trace!(path = %child_path.display(), "Skipping excluded directory;");
				continue;
			}

			if let Err(e) = self.add_tree(backend, &child_path, None, true, Some(node), skip) {
				warn!(path = %child_path.display(), ?e, "Failed to watch subdirectory, skipping it;");
			}
		}

		Ok(node)
	}

	/// Removes the child `name` of `parent`, or `parent` itself when `name` is `None`, along
	/// with everything below it. Returns whether anything was removed.
	pub fn remove_tree<B: Backend>(
		&mut self,
		backend: &mut B,
		name: Option<&OsStr>,
		parent: NodeId,
	) -> bool {
		let target = match name {
			Some(name) => self.child(parent, name),
			None => self.contains(parent).then_some(parent),
		};

		let Some(target) = target else {
			return false;
		};

		self.remove_node(backend, target);
		true
	}

	fn remove_node<B: Backend>(&mut self, backend: &mut B, node: NodeId) {
		let children = self
			.node(node)
			.map(|n| n.children.values().copied().collect::<Vec<_>>())
			.unwrap_or_default();

		for child in children {
			self.remove_node(backend, child);
		}

		let Some(removed) = self.nodes.get_mut(node.0).and_then(Option::take) else {
			return;
		};
		self.free.push(node.0);

		let last = self.by_watch.get_mut(&removed.watch).map_or(true, |holders| {
			holders.retain(|&holder| holder != node);
			holders.is_empty()
		});
		if last {
			self.by_watch.remove(&removed.watch);
			backend.remove_watch(removed.watch);
		} else {
			trace!(?node, watch = %removed.watch, "Watch still held by another node;");
		}

		match removed.parent {
			Some(parent) => {
				if let Some(parent) = self.node_mut(parent) {
					parent.children.remove(&removed.name);
				}
			}
			None => self.roots.retain(|&root| root != node),
		}

		trace!(?node, watch = %removed.watch, "Removed watch tree node;");
	}

	/// Absolute path of `node`
	pub fn resolve_path(&self, node: NodeId) -> Option<PathBuf> {
		self.resolve(node, |n| &n.name)
	}

	/// Like [`WatchTree::resolve_path`] but with each level's destination name, when set
	pub fn resolve_dest(&self, node: NodeId) -> Option<PathBuf> {
		self.resolve(node, |n| n.dest_name.as_ref().unwrap_or(&n.name))
	}

	fn resolve(&self, node: NodeId, segment: impl Fn(&WatchNode) -> &OsString) -> Option<PathBuf> {
		let mut segments = Vec::new();
		let mut current = Some(node);

		while let Some(id) = current {
			let n = self.node(id)?;
			segments.push(segment(n));
			current = n.parent;
		}

		Some(segments.into_iter().rev().collect())
	}

	fn node(&self, node: NodeId) -> Option<&WatchNode> {
		self.nodes.get(node.0).and_then(Option::as_ref)
	}

	fn node_mut(&mut self, node: NodeId) -> Option<&mut WatchNode> {
		self.nodes.get_mut(node.0).and_then(Option::as_mut)
	}

	fn insert(&mut self, node: WatchNode) -> NodeId {
		let watch = node.watch;
		let parent = node.parent;
		let name = node.name.clone();

		let id = if let Some(slot) = self.free.pop() {
			self.nodes[slot] = Some(node);
			NodeId(slot)
		} else {
			self.nodes.push(Some(node));
			NodeId(self.nodes.len() - 1)
		};

		self.by_watch.entry(watch).or_default().push(id);
		match parent.and_then(|parent| self.node_mut(parent)) {
			Some(parent) => {
				parent.children.insert(name, id);
			}
			None => self.roots.push(id),
		}

		id
	}
}
