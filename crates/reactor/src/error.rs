use std::{io, os::fd::RawFd, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReactorError {
	#[error("no descriptors are being observed; nothing could ever wake the reactor")]
	NoObservances,
	#[error("tried to unwatch a descriptor that is not observed <fd='{0}'>")]
	UnknownDescriptor(RawFd),
	#[error("descriptor does not fit in a select set <fd='{0}'>")]
	DescriptorOutOfRange(RawFd),
	#[error("failed to block daemon signals: {0}")]
	SignalMask(#[source] io::Error),
	#[error("multiplexed wait failed: {0}")]
	Wait(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum SpawnError {
	#[error("failed to spawn '{}': {source}", .binary.display())]
	Spawn {
		binary: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("failed to prepare the stdin pipe of child <pid='{pid}'>: {source}")]
	Pipe {
		pid: u32,
		#[source]
		source: io::Error,
	},
	#[error(transparent)]
	Reactor(#[from] ReactorError),
}
