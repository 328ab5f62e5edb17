//!
//! # Filesystem watcher
//!
//! Turns the notification formats of the different kernels into one stream of [`Event`]s.
//!
//! Each platform mechanism is a [`Backend`] that owns a single readable descriptor and decodes
//! whatever the kernel queued into [`Notice`]s, raw records still addressed by watch id. The
//! [`Watcher`] pairs a backend with a [`WatchTree`], the arena of watched directories, and
//! resolves those notices into absolute paths while adding and dropping watches as
//! directories come and go.
//!
//! Backends:
//! - inotify on Linux, with split renames merged back by the [`Coalescer`];
//! - kqueue on the BSDs (and on macOS with the `kqueue` feature);
//! - FSEvents on macOS, run on a worker thread that frames its records through a pipe;
//! - fanotify on Linux, which opens a group but does not place marks yet.
//!
//! The descriptor is meant to be registered in a `sw_reactor::Reactor`; reading it never
//! blocks.

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

mod coalescer;
mod config;
mod error;
mod event;
mod tree;
mod watcher;

pub mod platform;

pub use coalescer::{Coalescer, PendingMove};
pub use config::{ModifyMode, WatchConfig};
pub use error::{Error, Result};
pub use event::{Event, EventKind, Notice, Subject, WatchId};
pub use platform::{
	fsevents::{Frame, FrameDecoder, RenamePairer, StreamFlags},
	Backend, RecommendedBackend,
};
pub use tree::{NodeId, WatchTree};
pub use watcher::Watcher;
