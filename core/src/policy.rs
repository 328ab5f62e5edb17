use crate::{daemon::Runtime, error::CoreError};

use sw_fs_watcher::{Backend, Event, NodeId};
use sw_reactor::{Deadline, Reactor, Signal, SpawnError, Timestamp};

use std::{
	ffi::OsStr,
	os::unix::process::ExitStatusExt,
	path::{Path, PathBuf},
	process::ExitStatus,
};

use tracing::debug;

/// When the policy next wants [`Policy::cycle`] to run without any other wake-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alarm {
	At(Timestamp),
	Never,
	Immediate,
}

impl From<Alarm> for Deadline {
	fn from(alarm: Alarm) -> Self {
		match alarm {
			Alarm::At(at) => Self::At(at),
			Alarm::Never => Self::Never,
			Alarm::Immediate => Self::Immediate,
		}
	}
}

/// What a policy may do to the daemon from inside one of its callbacks
pub struct Control<'a, B> {
	reactor: &'a mut Reactor<Runtime<B>>,
	runtime: &'a mut Runtime<B>,
}

impl<'a, B: Backend> Control<'a, B> {
	pub(crate) fn new(reactor: &'a mut Reactor<Runtime<B>>, runtime: &'a mut Runtime<B>) -> Self {
		Self { reactor, runtime }
	}

	/// Starts `binary`, piping `stdin` into it when given; see [`sw_reactor::Spawner::spawn`]
	pub fn spawn<A: AsRef<OsStr>>(
		&mut self,
		binary: impl AsRef<Path>,
		args: impl IntoIterator<Item = A>,
		stdin: Option<&[u8]>,
	) -> Result<u32, SpawnError> {
		self.runtime
			.spawner
			.spawn(&mut *self.reactor, binary, args, stdin)
	}

	/// Watches `path`, optionally with everything below it that `skip` does not exclude
	pub fn add_tree(
		&mut self,
		path: &Path,
		dest_name: Option<&OsStr>,
		recursive: bool,
		parent: Option<NodeId>,
		skip: &dyn Fn(&Path) -> bool,
	) -> sw_fs_watcher::Result<NodeId> {
		self.runtime
			.watcher
			.add_tree(path, dest_name, recursive, parent, skip)
	}

	pub fn remove_tree(&mut self, name: Option<&OsStr>, parent: NodeId) -> bool {
		self.runtime.watcher.remove_tree(name, parent)
	}

	pub fn resolve_path(&self, node: NodeId) -> Option<PathBuf> {
		self.runtime.watcher.resolve_path(node)
	}

	pub fn resolve_dest(&self, node: NodeId) -> Option<PathBuf> {
		self.runtime.watcher.resolve_dest(node)
	}

	pub fn now(&self) -> Timestamp {
		Timestamp::now()
	}

	/// Ends the master loop once the current callback returns
	pub fn terminate(&mut self) {
		debug!("Policy asked the daemon to terminate;");
		self.runtime.terminated = true;
		self.reactor.halt();
	}
}

/// The decisions the daemon leaves to its user: what to watch and what to do about changes.
///
/// Every callback runs on the master loop thread and must not block; long running work goes
/// through [`Control::spawn`].
pub trait Policy {
	/// Called once before the first wait; adds the watched roots
	fn start<B: Backend>(&mut self, control: &mut Control<'_, B>) -> Result<(), CoreError>;

	fn next_alarm(&self, now: Timestamp) -> Alarm;

	fn on_event<B: Backend>(&mut self, event: Event, control: &mut Control<'_, B>);

	/// Events were lost, so whatever the policy tracks may be stale
	fn on_overflow<B: Backend>(&mut self, control: &mut Control<'_, B>);

	fn on_child_exit<B: Backend>(&mut self, pid: u32, status: ExitStatus, control: &mut Control<'_, B>) {
		let _ = (pid, status, control);
	}

	fn on_signal<B: Backend>(&mut self, signal: Signal, control: &mut Control<'_, B>) {
		let _ = (signal, control);
	}

	/// Runs after every wake-up; returning `false` ends the loop
	fn cycle<B: Backend>(&mut self, now: Timestamp, control: &mut Control<'_, B>) -> bool;

	/// Excludes a directory, by its full path, from tree recursion
	fn should_skip(&self, path: &Path) -> bool {
		let _ = path;
		false
	}
}

/// Exit code of a child, with death by signal `n` mapped to `128 + n` like a shell does
pub fn exit_code(status: ExitStatus) -> i32 {
	status
		.code()
		.or_else(|| status.signal().map(|signal| 128 + signal))
		.unwrap_or(-1)
}
