//!
//! # Reactor
//!
//! The single event loop of the sync daemon. It keeps a registry of observed descriptors
//! (kernel notification devices, child stdin pipes, anything else the policy cares about),
//! blocks in one `pselect` bounded by a deadline the caller computes, and dispatches the
//! readiness callbacks of whatever woke it up.
//!
//! Alongside it live the pieces that share its thread:
//! - a wrapping monotonic [`Timestamp`] clock used for alarm deadlines;
//! - signal handling that turns `SIGCHLD`, `SIGTERM`, `SIGINT` and `SIGHUP` into a [`SignalSet`]
//!   returned from every pass instead of global flags;
//! - a [`Spawner`] that starts external tools and feeds their stdin without blocking, plus
//!   [`reap_children`] to collect their exit status.
//!
//! ## Basic example
//!
//! ```no_run
//! use sw_reactor::{Deadline, Interest, Observer, Reactor};
//! use std::os::fd::RawFd;
//!
//! struct Counter;
//!
//! impl Observer<usize> for Counter {
//!     fn interest(&self) -> Interest {
//!         Interest::READABLE
//!     }
//!
//!     fn on_readable(&mut self, _fd: RawFd, _reactor: &mut Reactor<usize>, wakes: &mut usize) {
//!         *wakes += 1;
//!     }
//!
//!     fn on_close(&mut self, _fd: RawFd) {}
//! }
//!
//! let mut reactor = Reactor::new().unwrap();
//! reactor.watch(0, Counter);
//!
//! let mut wakes = 0;
//! while !reactor.run_once(&mut wakes, Deadline::Never).unwrap().is_shutdown() {
//!     println!("stdin became readable {wakes} times");
//! }
//! reactor.tidy_all();
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod error;
mod process;
mod reactor;
mod signal;
mod time;

pub use error::{ReactorError, SpawnError};
pub use process::{reap_children, ChildExit, Feed, PipeWrite, Spawner};
pub use reactor::{Deadline, Interest, Observer, Reactor, Wake};
pub use signal::{Signal, SignalSet};
pub use time::Timestamp;
