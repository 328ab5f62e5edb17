use std::{
	fmt::Display,
	io,
	path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::error;

/// Report an error with tracing
pub fn report_error(res: &Result<(), impl Display>) {
	if let Err(e) = res {
		error!("{e:#}");
	}
}

/// I/O failure on a path, named after the operation that hit it.
///
/// Renders as `failed to <op> '<path>': <source>`, so wrapping errors can stay transparent.
#[derive(Error, Debug)]
#[error("failed to {op} '{}': {source}", .path.display())]
pub struct FileIOError {
	pub op: &'static str,
	pub path: PathBuf,
	#[source]
	pub source: io::Error,
}

impl FileIOError {
	pub fn new(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
		Self {
			op,
			path: path.into(),
			source,
		}
	}

	/// Builds the error for a `map_err` on an operation over `path`
	pub fn on<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Self + 'a {
		move |source| Self::new(op, path, source)
	}

	pub fn kind(&self) -> io::ErrorKind {
		self.source.kind()
	}
}
