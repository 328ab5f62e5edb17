use std::{
	ffi::CString,
	io,
	os::{fd::RawFd, unix::ffi::OsStrExt},
	path::Path,
};

pub mod error;

/// Converts a path into a NUL-terminated string for the libc watch calls
pub fn path_to_cstring(path: impl AsRef<Path>) -> io::Result<CString> {
	CString::new(path.as_ref().as_os_str().as_bytes()).map_err(|_| {
		io::Error::new(
			io::ErrorKind::InvalidInput,
			format!(
				"path contains an interior NUL byte: <path='{}'>",
				path.as_ref().display()
			),
		)
	})
}

/// Puts a descriptor in non-blocking mode
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
	// SAFETY: fcntl only inspects and updates the flags of the given descriptor
	let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
	if flags < 0 {
		return Err(io::Error::last_os_error());
	}
	if flags & libc::O_NONBLOCK != 0 {
		return Ok(());
	}
	// SAFETY: same as above
	if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(())
}

/// Marks a descriptor close-on-exec, so spawned tools never inherit it
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
	// SAFETY: fcntl only inspects and updates the flags of the given descriptor
	let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
	if flags < 0 {
		return Err(io::Error::last_os_error());
	}
	// SAFETY: same as above
	if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(())
}
