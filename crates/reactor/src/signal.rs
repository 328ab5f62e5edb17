//! Signal plumbing for the reactor.
//!
//! The daemon signals stay blocked on the reactor thread at all times, except while the
//! thread sits inside `pselect`. That wait atomically swaps in [`SignalMask::wait_mask`], so a
//! child that exits between two cycles is reported by the next wait instead of being lost.
//! The handlers only record which signals arrived; the reactor drains them into a
//! [`SignalSet`] that travels back to the caller with each [`Wake`](crate::Wake).

use std::{
	fmt, io, mem, ptr,
	sync::atomic::{AtomicU32, Ordering},
};

use bitflags::bitflags;
use libc::c_int;
use tracing::trace;

static PENDING: AtomicU32 = AtomicU32::new(0);

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct SignalSet: u32 {
		const CHILD     = 0b0001;
		const TERMINATE = 0b0010;
		const INTERRUPT = 0b0100;
		const RESET     = 0b1000;
	}
}

impl SignalSet {
	/// Signals that end the current dispatch pass
	pub const SHUTDOWN: Self = Self::TERMINATE.union(Self::INTERRUPT).union(Self::RESET);

	pub fn signals(self) -> impl Iterator<Item = Signal> {
		Signal::ALL
			.into_iter()
			.filter(move |signal| self.contains(signal.flag()))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
	/// `SIGCHLD`
	Child,
	/// `SIGTERM`
	Terminate,
	/// `SIGINT`
	Interrupt,
	/// `SIGHUP`, asks for a full reset of the watches
	Reset,
}

impl Signal {
	pub const ALL: [Self; 4] = [Self::Child, Self::Terminate, Self::Interrupt, Self::Reset];

	pub const fn to_raw(self) -> c_int {
		match self {
			Self::Child => libc::SIGCHLD,
			Self::Terminate => libc::SIGTERM,
			Self::Interrupt => libc::SIGINT,
			Self::Reset => libc::SIGHUP,
		}
	}

	pub const fn from_raw(signum: c_int) -> Option<Self> {
		match signum {
			libc::SIGCHLD => Some(Self::Child),
			libc::SIGTERM => Some(Self::Terminate),
			libc::SIGINT => Some(Self::Interrupt),
			libc::SIGHUP => Some(Self::Reset),
			_ => None,
		}
	}

	pub const fn flag(self) -> SignalSet {
		match self {
			Self::Child => SignalSet::CHILD,
			Self::Terminate => SignalSet::TERMINATE,
			Self::Interrupt => SignalSet::INTERRUPT,
			Self::Reset => SignalSet::RESET,
		}
	}
}

impl fmt::Display for Signal {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Child => "SIGCHLD",
			Self::Terminate => "SIGTERM",
			Self::Interrupt => "SIGINT",
			Self::Reset => "SIGHUP",
		})
	}
}

extern "C" fn record(signum: c_int) {
	if let Some(signal) = Signal::from_raw(signum) {
		PENDING.fetch_or(signal.flag().bits(), Ordering::SeqCst);
	}
}

/// Blocks the daemon signals on the current thread for as long as it lives.
pub struct SignalMask {
	wait: libc::sigset_t,
	previous: libc::sigset_t,
}

impl fmt::Debug for SignalMask {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SignalMask").finish_non_exhaustive()
	}
}

impl SignalMask {
	pub fn block() -> io::Result<Self> {
		// SAFETY: the sigset values are initialized by sigemptyset/pthread_sigmask before use,
		// and `record` only touches an atomic, which is async-signal-safe
		unsafe {
			let mut blocked: libc::sigset_t = mem::zeroed();
			libc::sigemptyset(&mut blocked);
			for signal in Signal::ALL {
				libc::sigaddset(&mut blocked, signal.to_raw());
			}

			let mut previous: libc::sigset_t = mem::zeroed();
			let res = libc::pthread_sigmask(libc::SIG_BLOCK, &blocked, &mut previous);
			if res != 0 {
				return Err(io::Error::from_raw_os_error(res));
			}

			for signal in Signal::ALL {
				let mut action: libc::sigaction = mem::zeroed();
				action.sa_sigaction = record as extern "C" fn(c_int) as libc::sighandler_t;
				libc::sigemptyset(&mut action.sa_mask);
				action.sa_flags = if signal == Signal::Child {
					libc::SA_NOCLDSTOP
				} else {
					0
				};
				if libc::sigaction(signal.to_raw(), &action, ptr::null_mut()) != 0 {
					let err = io::Error::last_os_error();
					libc::pthread_sigmask(libc::SIG_SETMASK, &previous, ptr::null_mut());
					return Err(err);
				}
			}

			let mut wait = previous;
			for signal in Signal::ALL {
				libc::sigdelset(&mut wait, signal.to_raw());
			}

			trace!("Daemon signals blocked outside of the reactor wait;");

			Ok(Self { wait, previous })
		}
	}

	/// The mask `pselect` installs for the duration of the wait
	pub fn wait_mask(&self) -> &libc::sigset_t {
		&self.wait
	}

	/// Drains every signal recorded since the last call
	pub fn take_pending() -> SignalSet {
		SignalSet::from_bits_truncate(PENDING.swap(0, Ordering::SeqCst))
	}
}

impl Drop for SignalMask {
	fn drop(&mut self) {
		// SAFETY: restores the mask captured in `block` on the same thread
		unsafe {
			libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, ptr::null_mut());
		}
	}
}
