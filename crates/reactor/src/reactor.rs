use crate::{
	error::ReactorError,
	signal::{SignalMask, SignalSet},
	time::Timestamp,
};

use std::{
	collections::BTreeMap,
	fmt, io,
	mem::{self, MaybeUninit},
	os::fd::RawFd,
	ptr,
	time::Duration,
};

use bitflags::bitflags;
use tracing::{debug, trace, warn};

bitflags! {
	/// Which readiness callbacks an observer wants to receive
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct Interest: u8 {
		const READABLE = 0b01;
		const WRITABLE = 0b10;
	}
}

/// A registered descriptor's callbacks.
///
/// Any state the callbacks need lives in the observer itself. `on_close` is mandatory: every
/// observance must be able to release its descriptor, either when it is unwatched or when the
/// whole registry is tidied at shutdown.
pub trait Observer<C> {
	fn interest(&self) -> Interest;

	fn on_readable(&mut self, fd: RawFd, reactor: &mut Reactor<C>, ctx: &mut C) {
		let _ = (fd, reactor, ctx);
	}

	fn on_writable(&mut self, fd: RawFd, reactor: &mut Reactor<C>, ctx: &mut C) {
		let _ = (fd, reactor, ctx);
	}

	fn on_close(&mut self, fd: RawFd);
}

/// How long [`Reactor::run_once`] may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
	At(Timestamp),
	Never,
	Immediate,
}

impl Deadline {
	pub fn timeout(self, now: Timestamp) -> Option<Duration> {
		match self {
			Self::At(at) => Some(now.until(at)),
			Self::Never => None,
			Self::Immediate => Some(Duration::ZERO),
		}
	}
}

/// What a single [`Reactor::run_once`] pass observed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Wake {
	/// Signals delivered during the wait
	pub signals: SignalSet,
	/// A callback asked the reactor to stop dispatching
	pub halted: bool,
	/// Number of ready descriptors reported by the wait
	pub ready: usize,
}

impl Wake {
	pub fn is_shutdown(&self) -> bool {
		self.halted || self.signals.intersects(SignalSet::SHUTDOWN)
	}
}

#[derive(Debug, Default)]
struct Pass {
	current: Option<RawFd>,
	deferred: Vec<RawFd>,
	/// The running callback unwatched and re-registered its own descriptor
	close_current: bool,
}

#[derive(Clone, Copy)]
enum Readiness {
	Readable,
	Writable,
}

struct FdSet(libc::fd_set);

impl FdSet {
	fn new() -> Self {
		let mut raw = MaybeUninit::<libc::fd_set>::zeroed();
		// SAFETY: FD_ZERO fully initializes the set
		unsafe {
			libc::FD_ZERO(raw.as_mut_ptr());
			Self(raw.assume_init())
		}
	}

	fn insert(&mut self, fd: RawFd) {
		// SAFETY: callers checked that `fd` is within FD_SETSIZE
		unsafe { libc::FD_SET(fd, &mut self.0) }
	}

	fn contains(&self, fd: RawFd) -> bool {
		// SAFETY: same as above
		unsafe { libc::FD_ISSET(fd, &self.0) }
	}
}

/// The observance registry and its wait loop.
///
/// Strictly single-threaded: callbacks run to completion one after another and only the
/// `pselect` inside [`Reactor::run_once`] may block the thread.
pub struct Reactor<C> {
	observances: BTreeMap<RawFd, Box<dyn Observer<C>>>,
	pass: Option<Pass>,
	halted: bool,
	mask: SignalMask,
}

impl<C> fmt::Debug for Reactor<C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Reactor")
			.field("observances", &self.observances.keys().collect::<Vec<_>>())
			.field("pass", &self.pass)
			.field("halted", &self.halted)
			.finish_non_exhaustive()
	}
}

impl<C> Reactor<C> {
	/// Creates an empty registry and blocks the daemon signals on the calling thread
	pub fn new() -> Result<Self, ReactorError> {
		Ok(Self {
			observances: BTreeMap::new(),
			pass: None,
			halted: false,
			mask: SignalMask::block().map_err(ReactorError::SignalMask)?,
		})
	}

	/// Registers `observer` for `fd`, replacing (without closing) any previous observer.
	///
	/// An `unwatch` of the same descriptor earlier in the current pass is settled here: the
	/// old observer gets its `on_close` and the new one stays registered past the pass.
	///
	/// `fd` must be below `FD_SETSIZE`, [`Reactor::run_once`] refuses to wait otherwise.
	pub fn watch(&mut self, fd: RawFd, observer: impl Observer<C> + 'static) {
		if !fits_select(fd) {
			warn!(%fd, "Descriptor does not fit in a select set, waiting will fail;");
		}

		if let Some(pass) = &mut self.pass {
			if let Some(at) = pass.deferred.iter().position(|&deferred| deferred == fd) {
				pass.deferred.swap_remove(at);
				if pass.current == Some(fd) {
					pass.close_current = true;
				} else if let Some(mut old) = self.observances.remove(&fd) {
					old.on_close(fd);
					trace!(%fd, "Closed observer unwatched earlier in this pass;");
				}
			}
		}

		if self.observances.insert(fd, Box::new(observer)).is_some() {
			trace!(%fd, "Replaced observer for descriptor;");
		} else {
			trace!(%fd, "Watching descriptor;");
		}
	}

	/// Closes and forgets the observance for `fd`.
	///
	/// Called from inside a readiness callback the removal is deferred until the current
	/// dispatch pass ends; `on_close` still runs exactly once.
	pub fn unwatch(&mut self, fd: RawFd) -> Result<(), ReactorError> {
		if let Some(pass) = &mut self.pass {
			if !self.observances.contains_key(&fd) && pass.current != Some(fd) {
				return Err(ReactorError::UnknownDescriptor(fd));
			}
			if !pass.deferred.contains(&fd) {
				trace!(%fd, "Deferring unwatch until the dispatch pass ends;");
				pass.deferred.push(fd);
			}
			return Ok(());
		}

		let mut observer = self
			.observances
			.remove(&fd)
			.ok_or(ReactorError::UnknownDescriptor(fd))?;
		observer.on_close(fd);
		trace!(%fd, "Unwatched descriptor;");

		Ok(())
	}

	pub fn is_watched(&self, fd: RawFd) -> bool {
		self.observances.contains_key(&fd)
			|| self
				.pass
				.as_ref()
				.is_some_and(|pass| pass.current == Some(fd))
	}

	pub fn len(&self) -> usize {
		self.observances.len()
	}

	pub fn is_empty(&self) -> bool {
		self.observances.is_empty()
	}

	/// Stops dispatching further callbacks in the current pass
	pub fn halt(&mut self) {
		self.halted = true;
	}

	/// Closes every observance and empties the registry
	pub fn tidy_all(&mut self) {
		debug!(count = self.observances.len(), "Tidying all observances;");
		for (fd, mut observer) in mem::take(&mut self.observances) {
			observer.on_close(fd);
		}
	}

	/// Waits for readiness until `deadline` and dispatches the ready callbacks.
	///
	/// `pselect` cannot wait on descriptors at or past `FD_SETSIZE` (1024 on Linux), so a
	/// registry holding one fails with [`ReactorError::DescriptorOutOfRange`] before waiting.
	pub fn run_once(&mut self, ctx: &mut C, deadline: Deadline) -> Result<Wake, ReactorError> {
		if self.observances.is_empty() {
			return Err(ReactorError::NoObservances);
		}
		self.halted = false;

		let mut read_set = FdSet::new();
		let mut write_set = FdSet::new();
		let mut max_fd = -1;

		for (&fd, observer) in &self.observances {
			if !fits_select(fd) {
				return Err(ReactorError::DescriptorOutOfRange(fd));
			}
			let interest = observer.interest();
			if interest.contains(Interest::READABLE) {
				read_set.insert(fd);
			}
			if interest.contains(Interest::WRITABLE) {
				write_set.insert(fd);
			}
			max_fd = max_fd.max(fd);
		}

		let timeout = deadline.timeout(Timestamp::now()).map(|duration| {
			// SAFETY: timespec is plain old data
			let mut ts: libc::timespec = unsafe { mem::zeroed() };
			ts.tv_sec = duration.as_secs().try_into().unwrap_or(libc::time_t::MAX);
			ts.tv_nsec = duration.subsec_nanos().try_into().unwrap_or_default();
			ts
		});

		// SAFETY: both sets are initialized, the timeout outlives the call and the mask is a
		// valid sigset owned by `self`
		let res = unsafe {
			libc::pselect(
				max_fd + 1,
				&mut read_set.0,
				&mut write_set.0,
				ptr::null_mut(),
				timeout
					.as_ref()
					.map_or(ptr::null(), |ts| ts as *const libc::timespec),
				self.mask.wait_mask(),
			)
		};

		let ready = if res < 0 {
			let err = io::Error::last_os_error();
			match err.kind() {
				io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => 0,
				_ => return Err(ReactorError::Wait(err)),
			}
		} else {
			#[allow(clippy::cast_sign_loss)]
			{
				res as usize
			}
		};

		let mut wake = Wake {
			signals: SignalMask::take_pending(),
			halted: false,
			ready,
		};

		if wake.signals.intersects(SignalSet::SHUTDOWN) {
			debug!(signals = ?wake.signals, "Shutdown signal received, skipping dispatch;");
			return Ok(wake);
		}

		if ready > 0 {
			self.dispatch(ctx, &read_set, &write_set);
		}
		wake.halted = self.halted;

		Ok(wake)
	}

	fn dispatch(&mut self, ctx: &mut C, read_set: &FdSet, write_set: &FdSet) {
		let ready = self
			.observances
			.keys()
			.filter_map(|&fd| {
				let readable = read_set.contains(fd);
				let writable = write_set.contains(fd);
				(readable || writable).then_some((fd, readable, writable))
			})
			.collect::<Vec<_>>();

		self.pass = Some(Pass::default());

		for (fd, readable, writable) in ready {
			if readable && !self.halted {
				self.notify(fd, ctx, Readiness::Readable);
			}
			if writable && !self.halted {
				self.notify(fd, ctx, Readiness::Writable);
			}
		}

		let pass = self.pass.take().unwrap_or_default();
		for fd in pass.deferred {
			if let Some(mut observer) = self.observances.remove(&fd) {
				observer.on_close(fd);
				trace!(%fd, "Unwatched descriptor after dispatch pass;");
			}
		}
	}

	fn notify(&mut self, fd: RawFd, ctx: &mut C, readiness: Readiness) {
		// Skip descriptors removed earlier in this pass
		if self
			.pass
			.as_ref()
			.is_some_and(|pass| pass.deferred.contains(&fd))
		{
			return;
		}

		let Some(mut observer) = self.observances.remove(&fd) else {
			return;
		};

		if let Some(pass) = &mut self.pass {
			pass.current = Some(fd);
		}

		match readiness {
			Readiness::Readable => observer.on_readable(fd, self, ctx),
			Readiness::Writable => observer.on_writable(fd, self, ctx),
		}

		let close_old = self.pass.as_mut().is_some_and(|pass| {
			pass.current = None;
			mem::take(&mut pass.close_current)
		});

		if close_old {
			observer.on_close(fd);
			trace!(%fd, "Closed observer replaced by its own callback;");
		} else {
			// A callback that re-registered its own descriptor wins over the old observer
			self.observances.entry(fd).or_insert(observer);
		}
	}
}

/// `FD_SET` is undefined for descriptors outside `0..FD_SETSIZE`
fn fits_select(fd: RawFd) -> bool {
	usize::try_from(fd).is_ok_and(|fd| fd < libc::FD_SETSIZE as usize)
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::{cell::RefCell, rc::Rc};

	#[derive(Default)]
	struct Log {
		closed: Vec<RawFd>,
	}

	struct Recorder {
		log: Rc<RefCell<Log>>,
	}

	impl Observer<()> for Recorder {
		fn interest(&self) -> Interest {
			Interest::READABLE
		}

		fn on_close(&mut self, fd: RawFd) {
			self.log.borrow_mut().closed.push(fd);
		}
	}

	#[test]
	fn deadline_timeouts() {
		let now = Timestamp::from_millis(1_000);

		assert_eq!(Deadline::Never.timeout(now), None);
		assert_eq!(Deadline::Immediate.timeout(now), Some(Duration::ZERO));
		assert_eq!(
			Deadline::At(Timestamp::from_millis(1_250)).timeout(now),
			Some(Duration::from_millis(250))
		);
		assert_eq!(
			Deadline::At(Timestamp::from_millis(900)).timeout(now),
			Some(Duration::ZERO)
		);
	}

	#[test]
	fn descriptor_past_the_select_limit_fails_the_wait() {
		let log = Rc::new(RefCell::new(Log::default()));
		let mut reactor = Reactor::<()>::new().unwrap();

		#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
		let too_high = libc::FD_SETSIZE as RawFd;
		assert!(fits_select(too_high - 1));
		assert!(!fits_select(-1));

		reactor.watch(too_high, Recorder { log: Rc::clone(&log) });

		assert!(matches!(
			reactor.run_once(&mut (), Deadline::Immediate),
			Err(ReactorError::DescriptorOutOfRange(fd)) if fd == too_high
		));
		// Still registered, the caller decides what to drop
		assert!(reactor.is_watched(too_high));
	}

	#[test]
	fn watch_and_unwatch_keep_descriptors_unique() {
		let log = Rc::new(RefCell::new(Log::default()));
		let mut reactor = Reactor::<()>::new().unwrap();

		reactor.watch(7, Recorder { log: Rc::clone(&log) });
		reactor.watch(3, Recorder { log: Rc::clone(&log) });
		// Re-registering replaces without closing
		reactor.watch(7, Recorder { log: Rc::clone(&log) });

		assert_eq!(reactor.len(), 2);
		assert!(log.borrow().closed.is_empty());

		reactor.unwatch(7).unwrap();
		assert_eq!(log.borrow().closed, vec![7]);
		assert!(matches!(
			reactor.unwatch(7),
			Err(ReactorError::UnknownDescriptor(7))
		));

		reactor.tidy_all();
		assert_eq!(log.borrow().closed, vec![7, 3]);
		assert!(reactor.is_empty());
	}

	#[test]
	fn empty_registry_is_fatal() {
		let mut reactor = Reactor::<()>::new().unwrap();

		assert!(matches!(
			reactor.run_once(&mut (), Deadline::Immediate),
			Err(ReactorError::NoObservances)
		));
	}
}
