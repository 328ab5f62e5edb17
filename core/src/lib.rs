//!
//! # Syncwatch core
//!
//! Ties the pieces of the daemon together: a [`Daemon`] owns the reactor, the filesystem
//! watcher and the process spawner, and drives a [`Policy`] with the events they produce.
//! What the policy does about a change (batching, delays, which tool to run) is entirely up
//! to it; it acts on the daemon through a [`Control`] handed to every callback.
//!
//! Also home to the ambient daemon setup shared by binaries: [`DaemonConfig`] and
//! [`logging::init`].

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

mod config;
mod daemon;
mod error;
mod policy;

pub mod logging;

pub use config::{ConfigError, DaemonConfig};
pub use daemon::{Daemon, Runtime, Shutdown};
pub use error::CoreError;
pub use policy::{exit_code, Alarm, Control, Policy};

pub use sw_fs_watcher::{Backend, Event, EventKind, NodeId, WatchConfig};
pub use sw_reactor::{Signal, Timestamp};
