//! Mirrors each watched source to its target with rsync.
//!
//! Changes are collected as paths relative to the source. Once a sync's delay has passed since
//! its first unsent change, the whole batch goes to one rsync through `--files-from` on stdin,
//! NUL separated. Paths that no longer exist are deleted on the target by
//! `--delete-missing-args`. A full transfer runs at start-up, after lost events and after any
//! failed transfer. Each sync runs at most one rsync at a time.

use crate::config::SyncConfig;

use sw_core::{exit_code, Alarm, Backend, Control, CoreError, Event, Policy, Timestamp};

use std::{
	collections::BTreeSet,
	ffi::OsString,
	fs,
	os::unix::ffi::OsStrExt,
	path::{Path, PathBuf},
	process::ExitStatus,
	time::Duration,
};

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// rsync: "partial transfer due to vanished source files"
const EXIT_VANISHED: i32 = 24;

#[derive(Debug, Error)]
pub enum PolicyError {
	#[error("invalid exclude glob: {0}")]
	Glob(#[from] globset::Error),
	#[error("sync source is not usable '{}': {source}", .path.display())]
	Source {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Transfer {
	Full,
	Paths(Vec<PathBuf>),
}

#[derive(Debug)]
struct Running {
	pid: u32,
	transfer: Transfer,
}

#[derive(Debug)]
struct SyncState {
	config: SyncConfig,
	/// Absolute and free of symlinks, so it prefixes every event path
	source: PathBuf,
	excludes: GlobSet,
	delay: Duration,
	pending: BTreeSet<PathBuf>,
	first_change: Option<Timestamp>,
	full: bool,
	/// Nothing starts before this, set after a failure
	backoff: Option<Timestamp>,
	running: Option<Running>,
}

impl SyncState {
	fn new(config: SyncConfig) -> Result<Self, PolicyError> {
		let source = fs::canonicalize(&config.source).map_err(|source| PolicyError::Source {
			path: config.source.clone(),
			source,
		})?;

		let excludes = config
			.excludes
			.iter()
			.map(|s| s.parse::<Glob>())
			.collect::<Result<Vec<_>, _>>()?
			.into_iter()
			.fold(&mut GlobSetBuilder::new(), |builder, glob| builder.add(glob))
			.build()?;

		Ok(Self {
			delay: Duration::from_secs(config.delay_secs),
			config,
			source,
			excludes,
			pending: BTreeSet::new(),
			first_change: None,
			full: true,
			backoff: None,
			running: None,
		})
	}

	fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
		path.strip_prefix(&self.source)
			.ok()
			.filter(|rel| !rel.as_os_str().is_empty())
	}

	fn is_excluded(&self, path: &Path) -> bool {
		self.relative(path)
			.is_some_and(|rel| self.excludes.is_match(rel))
	}

	/// Queues `path` if it belongs to this sync; returns whether it did
	fn record(&mut self, path: &Path, now: Timestamp) -> bool {
		let Some(rel) = self.relative(path) else {
			return false;
		};
		if self.excludes.is_match(rel) {
			return true;
		}

		self.pending.insert(rel.to_path_buf());
		self.first_change.get_or_insert(now);
		true
	}

	fn lost_events(&mut self) {
		self.full = true;
		self.pending.clear();
		self.first_change = None;
	}

	/// The transfer to start now, if any
	fn due(&self, now: Timestamp) -> Option<Transfer> {
		if self.running.is_some() || self.backoff.is_some_and(|at| now.before(at)) {
			return None;
		}
		if self.full {
			return Some(Transfer::Full);
		}

		self.first_change
			.filter(|&first| (first + self.delay).before_or_at(now))
			.map(|_| Transfer::Paths(self.pending.iter().cloned().collect()))
	}

	fn alarm(&self, now: Timestamp) -> Alarm {
		if self.running.is_some() {
			// The child's exit wakes the loop
			return Alarm::Never;
		}

		let ready_at = if self.full {
			Some(now)
		} else {
			self.first_change.map(|first| first + self.delay)
		};

		match (ready_at, self.backoff) {
			(None, _) => Alarm::Never,
			(Some(at), Some(backoff)) => Alarm::At(if at.before(backoff) { backoff } else { at }),
			(Some(at), None) if at.before_or_at(now) => Alarm::Immediate,
			(Some(at), None) => Alarm::At(at),
		}
	}

	fn command(&self, transfer: &Transfer) -> (Vec<OsString>, Option<Vec<u8>>) {
		let mut args = self
			.config
			.rsync_args
			.iter()
			.map(OsString::from)
			.collect::<Vec<_>>();

		let stdin = match transfer {
			Transfer::Full => {
				args.push("--delete".into());
				None
			}
			Transfer::Paths(paths) => {
				args.extend(["--from0", "--files-from=-", "--delete-missing-args"].map(OsString::from));

				let mut list = Vec::new();
				for path in paths {
					list.extend_from_slice(path.as_os_str().as_bytes());
					list.push(0);
				}
				Some(list)
			}
		};

		args.extend(
			self.config
				.excludes
				.iter()
				.map(|glob| OsString::from(format!("--exclude={glob}"))),
		);

		let mut source = self.source.clone().into_os_string();
		source.push("/");
		args.push(source);
		args.push(self.config.target.clone().into());

		(args, stdin)
	}

	/// Records the start of `transfer`; the changes it covers are no longer pending
	fn started(&mut self, pid: u32, transfer: Transfer) {
		if transfer == Transfer::Full {
			self.full = false;
		}
		self.pending.clear();
		self.first_change = None;
		self.backoff = None;
		self.running = Some(Running { pid, transfer });
	}

	fn failed(&mut self, now: Timestamp) {
		// A full transfer repairs whatever the failed one left behind
		self.full = true;
		self.backoff = Some(now + self.delay.max(Duration::from_secs(1)));
	}

	/// Handles the exit of this sync's rsync; false if `pid` was not ours
	fn exited(&mut self, pid: u32, code: i32, now: Timestamp) -> bool {
		if self.running.as_ref().map(|running| running.pid) != Some(pid) {
			return false;
		}
		let Some(Running { transfer, .. }) = self.running.take() else {
			return false;
		};

		let kind = match &transfer {
			Transfer::Full => "full",
			Transfer::Paths(_) => "incremental",
		};

		if code == 0 || code == EXIT_VANISHED {
			info!(
				source = %self.source.display(),
				target = %self.config.target,
				%kind,
				%code,
				"Transfer finished;",
			);
		} else {
			warn!(
				source = %self.source.display(),
				target = %self.config.target,
				%kind,
				%code,
				"Transfer failed, scheduling a full sync;",
			);
			self.failed(now);
		}

		true
	}
}

/// The rsync policy over every configured sync
#[derive(Debug)]
pub struct RsyncPolicy {
	syncs: Vec<SyncState>,
}

impl RsyncPolicy {
	pub fn new(configs: &[SyncConfig]) -> Result<Self, PolicyError> {
		Ok(Self {
			syncs: configs
				.iter()
				.cloned()
				.map(SyncState::new)
				.collect::<Result<_, _>>()?,
		})
	}

	fn run_transfer<B: Backend>(sync: &mut SyncState, transfer: Transfer, control: &mut Control<'_, B>) {
		let (args, stdin) = sync.command(&transfer);

		match control.spawn(&sync.config.rsync_binary, &args, stdin.as_deref()) {
			Ok(pid) => {
				debug!(
					%pid,
					source = %sync.source.display(),
					paths = match &transfer {
						Transfer::Full => 0,
						Transfer::Paths(paths) => paths.len(),
					},
					"Started rsync;",
				);
				sync.started(pid, transfer);
			}
			Err(e) => {
				error!(?e, source = %sync.source.display(), "Failed to start rsync;");
				sync.failed(control.now());
			}
		}
	}
}

impl Policy for RsyncPolicy {
	fn start<B: Backend>(&mut self, control: &mut Control<'_, B>) -> Result<(), CoreError> {
		for i in 0..self.syncs.len() {
			let source = self.syncs[i].source.clone();
			let sync = &self.syncs[i];
			control.add_tree(&source, None, true, None, &|path: &Path| sync.is_excluded(path))?;

			info!(
				source = %source.display(),
				target = %self.syncs[i].config.target,
				"Watching sync source;",
			);
		}

		Ok(())
	}

	fn next_alarm(&self, now: Timestamp) -> Alarm {
		let mut earliest = None;

		for sync in &self.syncs {
			match sync.alarm(now) {
				Alarm::Immediate => return Alarm::Immediate,
				Alarm::At(at) => {
					earliest = Some(earliest.map_or(at, |e: Timestamp| e.min(at)));
				}
				Alarm::Never => {}
			}
		}

		earliest.map_or(Alarm::Never, Alarm::At)
	}

	fn on_event<B: Backend>(&mut self, event: Event, control: &mut Control<'_, B>) {
		let now = control.now();

		for path in [Some(&event.path), event.new_path.as_ref()].into_iter().flatten() {
			if !self.syncs.iter_mut().any(|sync| sync.record(path, now)) {
				debug!(path = %path.display(), "Change outside every sync source;");
			}
		}
	}

	fn on_overflow<B: Backend>(&mut self, _control: &mut Control<'_, B>) {
		warn!("Events were lost, every sync will transfer in full;");
		for sync in &mut self.syncs {
			sync.lost_events();
		}
	}

	fn on_child_exit<B: Backend>(&mut self, pid: u32, status: ExitStatus, control: &mut Control<'_, B>) {
		let code = exit_code(status);
		let now = control.now();

		if !self.syncs.iter_mut().any(|sync| sync.exited(pid, code, now)) {
			debug!(%pid, %code, "Reaped a child that is not an rsync of ours;");
		}
	}

	fn cycle<B: Backend>(&mut self, now: Timestamp, control: &mut Control<'_, B>) -> bool {
		for sync in &mut self.syncs {
			if let Some(transfer) = sync.due(now) {
				Self::run_transfer(sync, transfer, control);
			}
		}

		true
	}

	fn should_skip(&self, path: &Path) -> bool {
		self.syncs.iter().any(|sync| sync.is_excluded(path))
	}
}
