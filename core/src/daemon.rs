use crate::{
	config::DaemonConfig,
	error::CoreError,
	policy::{Control, Policy},
};

use sw_fs_watcher::{Backend, EventKind, RecommendedBackend, Watcher};
use sw_reactor::{reap_children, Interest, Observer, Reactor, Signal, Spawner, Timestamp};

use std::{os::fd::RawFd, path::Path};

use tracing::{debug, error, info, trace, warn};

/// Why [`Daemon::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
	/// `SIGTERM` or `SIGINT`
	Terminated(Signal),
	/// `SIGHUP`: the caller should rebuild the daemon and rescan every watch
	Reset,
	/// The policy ended the loop
	Finished,
}

/// State the reactor callbacks and the policy share; the context of every dispatch pass
#[derive(Debug)]
pub struct Runtime<B> {
	pub(crate) watcher: Watcher<B>,
	pub(crate) spawner: Spawner,
	pub(crate) terminated: bool,
	failure: Option<sw_fs_watcher::Error>,
}

impl<B> Runtime<B> {
	pub fn watcher(&self) -> &Watcher<B> {
		&self.watcher
	}

	pub fn spawner(&self) -> &Spawner {
		&self.spawner
	}
}

/// Observance of the notification backend's descriptor
struct NotifyObserver;

impl<B: Backend> Observer<Runtime<B>> for NotifyObserver {
	fn interest(&self) -> Interest {
		Interest::READABLE
	}

	fn on_readable(&mut self, fd: RawFd, reactor: &mut Reactor<Runtime<B>>, runtime: &mut Runtime<B>) {
		match runtime.watcher.read() {
			Ok(count) => trace!(%fd, %count, "Read filesystem notifications;"),
			Err(e) => {
				error!(%fd, ?e, "Failed to read filesystem notifications;");
				runtime.failure = Some(e);
				reactor.halt();
			}
		}
	}

	fn on_close(&mut self, fd: RawFd) {
		// The watcher owns the descriptor and closes it when dropped
		trace!(%fd, backend = B::NAME, "Notification observance closed;");
	}
}

/// The master loop: waits, turns kernel notifications into events for the policy, reaps
/// children and reacts to signals until something ends it.
#[derive(Debug)]
pub struct Daemon<P> {
	config: DaemonConfig,
	policy: P,
}

impl<P: Policy> Daemon<P> {
	pub fn new(config: DaemonConfig, policy: P) -> Self {
		Self { config, policy }
	}

	pub fn config(&self) -> &DaemonConfig {
		&self.config
	}

	pub fn policy(&self) -> &P {
		&self.policy
	}

	pub fn into_policy(self) -> P {
		self.policy
	}

	/// Runs on the platform's recommended notification backend
	pub fn run(&mut self) -> Result<Shutdown, CoreError> {
		let watcher = Watcher::<RecommendedBackend>::open(&self.config.watch)?;
		info!(backend = RecommendedBackend::NAME, "Opened notification backend;");

		self.run_on(watcher)
	}

	pub fn run_on<B: Backend + 'static>(&mut self, watcher: Watcher<B>) -> Result<Shutdown, CoreError> {
		let mut reactor = Reactor::new()?;
		let mut runtime = Runtime {
			watcher,
			spawner: Spawner::new(self.config.log_file.clone()),
			terminated: false,
			failure: None,
		};

		reactor.watch(runtime.watcher.descriptor(), NotifyObserver);

		let res = self.drive(&mut reactor, &mut runtime);

		reactor.tidy_all();

		match &res {
			Ok(shutdown) => info!(?shutdown, "Daemon loop ended;"),
			Err(e) => error!(?e, "Daemon loop failed;"),
		}

		res
	}

	fn drive<B: Backend>(
		&mut self,
		reactor: &mut Reactor<Runtime<B>>,
		runtime: &mut Runtime<B>,
	) -> Result<Shutdown, CoreError> {
		let policy = &mut self.policy;

		policy.start(&mut Control::new(reactor, runtime))?;
		info!(
			backend = B::NAME,
			watches = runtime.watcher.tree().len(),
			"Daemon started;",
		);

		let mut events = Vec::new();

		loop {
			if runtime.terminated {
				return Ok(Shutdown::Finished);
			}

			let deadline = policy.next_alarm(Timestamp::now()).into();
			let wake = reactor.run_once(runtime, deadline)?;

			if let Some(e) = runtime.failure.take() {
				return Err(e.into());
			}

			runtime
				.watcher
				.process(&|path: &Path| policy.should_skip(path), &mut events);

			for event in events.drain(..) {
				let mut control = Control::new(reactor, runtime);
				if event.kind == EventKind::Overflow {
					warn!("Notification queue overflowed, events were lost;");
					policy.on_overflow(&mut control);
				} else {
					policy.on_event(event, &mut control);
				}

				if runtime.terminated {
					break;
				}
			}

			for exit in reap_children() {
				policy.on_child_exit(exit.pid, exit.status, &mut Control::new(reactor, runtime));
			}

			for signal in wake.signals.signals() {
				debug!(%signal, "Handling signal;");
				policy.on_signal(signal, &mut Control::new(reactor, runtime));

				match signal {
					Signal::Terminate | Signal::Interrupt => {
						return Ok(Shutdown::Terminated(signal))
					}
					Signal::Reset => return Ok(Shutdown::Reset),
					Signal::Child => {}
				}
			}

			if runtime.terminated
				|| !policy.cycle(Timestamp::now(), &mut Control::new(reactor, runtime))
			{
				return Ok(Shutdown::Finished);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::policy::Alarm;

	use sw_fs_watcher::{Event, Notice, Subject, WatchConfig, WatchId};

	use std::{
		fs::File,
		io::{self, Read, Write},
		os::fd::{AsRawFd, FromRawFd},
		path::PathBuf,
		time::Duration,
	};

	use pretty_assertions::assert_eq;
	use tracing_test::traced_test;

	const CREATED: &str = "/pipe/created";

	/// Backend fed by hand: every `o` written to its pipe is an overflow, every `c` a create
	struct PipeBackend {
		source: File,
		sink: File,
		next: u32,
	}

	impl PipeBackend {
		fn sink(&self) -> File {
			self.sink.try_clone().unwrap()
		}
	}

	impl Backend for PipeBackend {
		const NAME: &'static str = "pipe";

		fn open(_config: &WatchConfig) -> sw_fs_watcher::Result<Self> {
			let mut fds = [0; 2];
			assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
			let (source, sink) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
			sw_utils::set_nonblocking(source.as_raw_fd()).unwrap();
			Ok(Self {
				source,
				sink,
				next: 0,
			})
		}

		fn descriptor(&self) -> RawFd {
			self.source.as_raw_fd()
		}

		fn add_watch(&mut self, _path: &Path, _is_dir: bool) -> sw_fs_watcher::Result<WatchId> {
			self.next += 1;
			Ok(WatchId(self.next))
		}

		fn remove_watch(&mut self, _watch: WatchId) {}

		fn drain(&mut self, out: &mut Vec<Notice>) -> sw_fs_watcher::Result<()> {
			let mut buf = [0; 64];
			loop {
				match self.source.read(&mut buf) {
					Ok(0) => return Ok(()),
					Ok(n) => {
						for byte in &buf[..n] {
							let now = Timestamp::now();
							out.push(match byte {
								b'o' => Notice::overflow(now),
								_ => Notice::new(
									EventKind::Create,
									false,
									now,
									Subject::Path(PathBuf::from(CREATED)),
								),
							});
						}
					}
					Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
					Err(e) => return Err(sw_fs_watcher::Error::Read(e)),
				}
			}
		}
	}

	#[derive(Default)]
	struct Recorder {
		sink: Option<File>,
		overflows: usize,
		events: Vec<Event>,
		cycles: usize,
		max_cycles: usize,
		terminate_on_event: bool,
		alarm: Option<Alarm>,
	}

	impl Policy for Recorder {
		fn start<B: Backend>(&mut self, _control: &mut Control<'_, B>) -> Result<(), CoreError> {
			Ok(())
		}

		fn next_alarm(&self, now: Timestamp) -> Alarm {
			self.alarm
				.unwrap_or_else(|| Alarm::At(now + Duration::from_millis(100)))
		}

		fn on_event<B: Backend>(&mut self, event: Event, control: &mut Control<'_, B>) {
			self.events.push(event);
			if self.terminate_on_event {
				control.terminate();
			}
		}

		fn on_overflow<B: Backend>(&mut self, _control: &mut Control<'_, B>) {
			self.overflows += 1;
			if self.overflows == 1 {
				// Keep the loop busy to show it survived the first one
				if let Some(sink) = &mut self.sink {
					sink.write_all(b"o").unwrap();
				}
			}
		}

		fn cycle<B: Backend>(&mut self, _now: Timestamp, _control: &mut Control<'_, B>) -> bool {
			self.cycles += 1;
			self.overflows < 2 && self.cycles < self.max_cycles
		}
	}

	fn daemon(policy: Recorder) -> Daemon<Recorder> {
		Daemon::new(DaemonConfig::default(), policy)
	}

	#[test]
	#[traced_test]
	fn overflow_does_not_end_the_loop() {
		let backend = PipeBackend::open(&WatchConfig::default()).unwrap();
		let mut sink = backend.sink();
		sink.write_all(b"o").unwrap();

		let mut daemon = daemon(Recorder {
			sink: Some(sink),
			max_cycles: 50,
			..Default::default()
		});

		let shutdown = daemon.run_on(Watcher::new(backend)).unwrap();

		assert_eq!(shutdown, Shutdown::Finished);
		assert_eq!(daemon.policy().overflows, 2);
		assert!(daemon.policy().cycles >= 2);
	assert!(logs_contain("Notification queue overflowed"));
	}

	#[test]
	fn terminate_stops_delivery_mid_batch() {
		let backend = PipeBackend::open(&WatchConfig::default()).unwrap();
		backend.sink().write_all(b"ccc").unwrap();

		let mut daemon = daemon(Recorder {
			terminate_on_event: true,
			max_cycles: 50,
			..Default::default()
		});

		assert_eq!(daemon.run_on(Watcher::new(backend)).unwrap(), Shutdown::Finished);

		let events = daemon.into_policy().events;
		assert_eq!(
			events.iter().map(|e| e.path.clone()).collect::<Vec<_>>(),
			vec![PathBuf::from(CREATED)]
		);
		assert_eq!(events[0].kind, EventKind::Create);
	}

	#[test]
	fn control_edits_the_watch_tree() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("docs/drafts")).unwrap();

		let mut reactor = Reactor::new().unwrap();
		let mut runtime = Runtime {
			watcher: Watcher::new(PipeBackend::open(&WatchConfig::default()).unwrap()),
			spawner: Spawner::new(None),
			terminated: false,
			failure: None,
		};
		let mut control = Control::new(&mut reactor, &mut runtime);

		let root = control
			.add_tree(
				dir.path(),
				Some(std::ffi::OsStr::new("mirror")),
				true,
				None,
				&|_: &Path| false,
			)
			.unwrap();
		let docs = control
			.add_tree(&dir.path().join("docs"), None, false, Some(root), &|_: &Path| false)
			.unwrap();

		assert_eq!(control.resolve_path(docs), Some(dir.path().join("docs")));
		assert_eq!(control.resolve_dest(docs), Some(PathBuf::from("mirror/docs")));

		assert!(control.remove_tree(Some(std::ffi::OsStr::new("docs")), root));
		assert!(!control.remove_tree(Some(std::ffi::OsStr::new("docs")), root));
		assert_eq!(control.resolve_path(docs), None);

		control.terminate();

		assert!(runtime.terminated);
		assert_eq!(runtime.watcher().tree().len(), 1);
		assert_eq!(runtime.watcher().tree().parent(root), None);
		assert_eq!(runtime.spawner().log_file(), None);
	}

	#[test]
	fn immediate_alarm_cycles_without_waiting() {
		let backend = PipeBackend::open(&WatchConfig::default()).unwrap();

		let mut daemon = daemon(Recorder {
			alarm: Some(Alarm::Immediate),
			max_cycles: 3,
			..Default::default()
		});

		assert_eq!(daemon.run_on(Watcher::new(backend)).unwrap(), Shutdown::Finished);
		assert_eq!(daemon.policy().cycles, 3);
		assert!(daemon.policy().events.is_empty());
	}
}
