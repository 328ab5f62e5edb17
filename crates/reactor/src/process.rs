//! Child process spawning and reaping.
//!
//! Children get their stdout and stderr pointed at the daemon log file when one is configured.
//! Text for their stdin goes through a non-blocking pipe: one write is attempted right away and
//! whatever does not fit is handed to the reactor as a [`PipeWrite`] observer that keeps
//! writing on write readiness until the buffer is drained.

use crate::{
	error::SpawnError,
	reactor::{Interest, Observer, Reactor},
};

use sw_utils::set_nonblocking;

use std::{
	ffi::OsStr,
	fmt,
	fs::{File, OpenOptions},
	io::{self, Write},
	os::{
		fd::{AsRawFd, OwnedFd, RawFd},
		unix::process::ExitStatusExt,
	},
	path::{Path, PathBuf},
	process::{Command, ExitStatus, Stdio},
};

use tracing::{debug, error, trace, warn};

/// Exit status of a reaped child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
	pub pid: u32,
	pub status: ExitStatus,
}

/// Result of handing a buffer to a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
	/// Everything was written and the pipe is already closed
	Drained,
	/// The rest is written by an observer registered for this descriptor
	Pending(RawFd),
	/// The write failed, the pipe was closed and the text dropped
	Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
	Done,
	Partial,
}

/// An in-flight write of a child's stdin text
pub struct PipeWrite {
	pid: u32,
	pipe: Option<File>,
	buffer: Vec<u8>,
	written: usize,
}

impl fmt::Debug for PipeWrite {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PipeWrite")
			.field("pid", &self.pid)
			.field("fd", &self.pipe.as_ref().map(AsRawFd::as_raw_fd))
			.field("len", &self.buffer.len())
			.field("written", &self.written)
			.finish()
	}
}

impl PipeWrite {
	/// `pipe` must already be in non-blocking mode
	pub fn new(pid: u32, pipe: File, buffer: Vec<u8>) -> Self {
		Self {
			pid,
			pipe: Some(pipe),
			buffer,
			written: 0,
		}
	}

	/// Attempts one write and registers the remainder with the reactor
	pub fn feed<C>(mut self, reactor: &mut Reactor<C>) -> Feed {
		match self.write_once() {
			Ok(Progress::Done) => {
				trace!(pid = self.pid, bytes = self.written, "Child stdin written in one go;");
				Feed::Drained
			}
			Ok(Progress::Partial) => {
				let Some(fd) = self.pipe.as_ref().map(AsRawFd::as_raw_fd) else {
					return Feed::Abandoned;
				};
				debug!(
					pid = self.pid,
					written = self.written,
					remaining = self.buffer.len() - self.written,
					"Pipe is full, finishing the write on write readiness;",
				);
				reactor.watch(fd, self);
				Feed::Pending(fd)
			}
			Err(e) => {
				warn!(pid = self.pid, ?e, "Failed to write child stdin, abandoning it;");
				Feed::Abandoned
			}
		}
	}

	fn write_once(&mut self) -> io::Result<Progress> {
		let Some(pipe) = self.pipe.as_mut() else {
			return Err(io::Error::from(io::ErrorKind::BrokenPipe));
		};

		loop {
			match pipe.write(&self.buffer[self.written..]) {
				Ok(n) => {
					self.written += n;
					break;
				}
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
				Err(e) => return Err(e),
			}
		}

		Ok(if self.written == self.buffer.len() {
			Progress::Done
		} else {
			Progress::Partial
		})
	}

	fn pump(&mut self) -> io::Result<Progress> {
		loop {
			let before = self.written;
			match self.write_once()? {
				Progress::Done => return Ok(Progress::Done),
				Progress::Partial if self.written == before => return Ok(Progress::Partial),
				Progress::Partial => continue,
			}
		}
	}
}

impl<C> Observer<C> for PipeWrite {
	fn interest(&self) -> Interest {
		Interest::WRITABLE
	}

	fn on_writable(&mut self, fd: RawFd, reactor: &mut Reactor<C>, _: &mut C) {
		match self.pump() {
			Ok(Progress::Partial) => return,
			Ok(Progress::Done) => {
				trace!(pid = self.pid, bytes = self.written, "Finished writing child stdin;");
			}
			Err(e) => {
				warn!(
					pid = self.pid,
					written = self.written,
					?e,
					"Failed to write child stdin, abandoning it;",
				);
			}
		}

		if let Err(e) = reactor.unwatch(fd) {
			error!(?e, "Failed to unwatch drained pipe;");
		}
	}

	fn on_close(&mut self, fd: RawFd) {
		trace!(%fd, pid = self.pid, "Closing child stdin pipe;");
		self.pipe.take();
	}
}

/// Starts external tools on behalf of the policy
#[derive(Debug, Clone, Default)]
pub struct Spawner {
	log_file: Option<PathBuf>,
}

impl Spawner {
	pub fn new(log_file: Option<PathBuf>) -> Self {
		Self { log_file }
	}

	pub fn log_file(&self) -> Option<&Path> {
		self.log_file.as_deref()
	}

	/// Runs `binary` with `args`, feeding `stdin` to it when non-empty.
	///
	/// Returns once the child has started; its exit status is collected later by
	/// [`reap_children`]. A broken stdin pipe is logged but does not fail the spawn.
	pub fn spawn<C, A>(
		&self,
		reactor: &mut Reactor<C>,
		binary: impl AsRef<Path>,
		args: impl IntoIterator<Item = A>,
		stdin: Option<&[u8]>,
	) -> Result<u32, SpawnError>
	where
		A: AsRef<OsStr>,
	{
		let binary = binary.as_ref();
		let stdin = stdin.filter(|text| !text.is_empty());

		let mut command = Command::new(binary);
		command
			.args(args)
			.stdin(if stdin.is_some() {
				Stdio::piped()
			} else {
				Stdio::null()
			});

		if let Some(log_file) = &self.log_file {
			match open_log(log_file) {
				Ok((stdout, stderr)) => {
					command.stdout(stdout).stderr(stderr);
				}
				// The child still runs, writing wherever the daemon writes
				Err(e) => warn!(
					?e,
					log_file = %log_file.display(),
					"Failed to redirect child output to the log file;",
				),
			}
		}

		let mut child = command.spawn().map_err(|source| SpawnError::Spawn {
			binary: binary.to_path_buf(),
			source,
		})?;
		let pid = child.id();

		debug!(%pid, binary = %binary.display(), "Spawned child process;");

		if let (Some(text), Some(pipe)) = (stdin, child.stdin.take()) {
			let pipe = File::from(OwnedFd::from(pipe));
			set_nonblocking(pipe.as_raw_fd()).map_err(|source| SpawnError::Pipe { pid, source })?;
			PipeWrite::new(pid, pipe, text.to_vec()).feed(reactor);
		}

		// Dropping the handle neither kills nor waits; `reap_children` collects the status
		drop(child);

		Ok(pid)
	}
}

fn open_log(log_file: &Path) -> io::Result<(File, File)> {
	let stdout = OpenOptions::new()
		.create(true)
		.append(true)
		.open(log_file)?;
	let stderr = stdout.try_clone()?;
	Ok((stdout, stderr))
}

/// Collects every child that has already exited, without blocking
pub fn reap_children() -> Vec<ChildExit> {
	let mut exits = Vec::new();

	loop {
		let mut status = 0;
		// SAFETY: WNOHANG never blocks and `status` is a valid out pointer
		let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
		match pid {
			0 => break,
			-1 => {
				let err = io::Error::last_os_error();
				if err.kind() == io::ErrorKind::Interrupted {
					continue;
				}
				if err.raw_os_error() != Some(libc::ECHILD) {
					warn!(?err, "Failed to reap children;");
				}
				break;
			}
			pid => {
				#[allow(clippy::cast_sign_loss)]
				let exit = ChildExit {
					pid: pid as u32,
					status: ExitStatus::from_raw(status),
				};
				trace!(pid = exit.pid, status = %exit.status, "Reaped child;");
				exits.push(exit);
			}
		}
	}

	exits
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::{io::Read, os::fd::FromRawFd};

	fn pipe() -> (File, File) {
		let mut fds = [0; 2];
		// SAFETY: `fds` has room for both ends
		assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
		// SAFETY: both descriptors were just created and are owned by nobody else
		unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) }
	}

	#[test]
	fn small_text_drains_immediately() {
		let mut reactor = Reactor::<()>::new().unwrap();
		let (mut reader, writer) = pipe();
		set_nonblocking(writer.as_raw_fd()).unwrap();

		let feed = PipeWrite::new(1, writer, b"hello".to_vec()).feed(&mut reactor);
		assert_eq!(feed, Feed::Drained);
		assert!(reactor.is_empty());

		let mut received = Vec::new();
		reader.read_to_end(&mut received).unwrap();
		assert_eq!(received, b"hello");
	}

	#[test]
	fn broken_pipe_is_abandoned() {
		let mut reactor = Reactor::<()>::new().unwrap();
		let (reader, writer) = pipe();
		set_nonblocking(writer.as_raw_fd()).unwrap();
		drop(reader);

		// Rust ignores SIGPIPE, so the write reports EPIPE instead of killing the test
		let feed = PipeWrite::new(1, writer, b"lost".to_vec()).feed(&mut reactor);
		assert_eq!(feed, Feed::Abandoned);
		assert!(reactor.is_empty());
	}

	#[test]
	fn reaping_without_children_is_empty() {
		// Other tests may have children in flight; this only checks we never block
		let _ = reap_children();
	}
}
