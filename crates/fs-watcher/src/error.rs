use crate::tree::NodeId;

use sw_utils::error::FileIOError;

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("failed to open the {backend} notification device: {source}")]
	Open {
		backend: &'static str,
		#[source]
		source: io::Error,
	},
	#[error(transparent)]
	AddWatch(FileIOError),
	#[error(transparent)]
	ListDir(FileIOError),
	#[error("failed to read notifications: {0}")]
	Read(#[source] io::Error),
	#[error("watch tree node is gone <node='{0:?}'>")]
	UnknownNode(NodeId),
	#[error("notification worker failed: {0}")]
	Worker(String),
}
