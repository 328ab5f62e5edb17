//! FSEvents backend.
//!
//! CoreServices only delivers FSEvents on a run loop, so a worker thread owns the stream and
//! forwards every change as a frame through a pipe. The reactor only ever sees the read end
//! of that pipe. Adding or removing a root restarts the stream with the new path list.

use crate::{
	config::WatchConfig,
	error::{Error, Result},
	event::{Notice, WatchId},
	platform::{
		fsevents::{Frame, FrameDecoder, RenamePairer, StreamFlags},
		Backend,
	},
};

use sw_reactor::Timestamp;
use sw_utils::{error::report_error, set_cloexec, set_nonblocking};

use std::{
	collections::BTreeMap,
	ffi::{c_char, c_void, CStr, OsStr},
	fs::File,
	io::{self, Read, Write},
	os::{
		fd::{AsRawFd, FromRawFd, RawFd},
		unix::ffi::OsStrExt,
	},
	path::{Path, PathBuf},
	ptr,
	sync::mpsc,
	thread,
};

use fsevent_sys::{self as fs, core_foundation as cf};
use tracing::{debug, error, trace, warn};

const READ_CHUNK: usize = 16 * 1024;

#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
	fn CFRunLoopIsWaiting(runloop: cf::CFRunLoopRef) -> u8;
}

/// Lives on the worker thread, handed to every callback through the stream context
struct StreamContext {
	sink: File,
	pairer: RenamePairer,
	frames: Vec<Frame>,
	bytes: Vec<u8>,
}

impl StreamContext {
	fn flush(&mut self) {
		self.bytes.clear();
		for frame in self.frames.drain(..) {
			frame.encode(&mut self.bytes);
		}
		if let Err(e) = self.sink.write_all(&self.bytes) {
			warn!(?e, "Failed to forward FSEvents to the reactor;");
		}
	}
}

fn path_exists(path: &Path) -> bool {
	path.symlink_metadata().is_ok()
}

extern "C" fn stream_callback(
	_stream: fs::ConstFSEventStreamRef,
	info: *mut c_void,
	num_events: usize,
	event_paths: *mut c_void,
	event_flags: *const fs::FSEventStreamEventFlags,
	_event_ids: *const fs::FSEventStreamEventId,
) {
	// SAFETY: `info` is the context passed to FSEventStreamCreate; it outlives the stream and
	// is only touched from the run loop thread
	let ctx = unsafe { &mut *info.cast::<StreamContext>() };
	let paths = event_paths.cast::<*const c_char>();

	for i in 0..num_events {
		// SAFETY: without kFSEventStreamCreateFlagUseCFTypes both arrays hold `num_events`
		// C strings and flags
		let (path, flags) = unsafe { (CStr::from_ptr(*paths.add(i)), *event_flags.add(i)) };
		let path = PathBuf::from(OsStr::from_bytes(path.to_bytes()));

		ctx.pairer.push(
			StreamFlags::from_bits_retain(flags),
			path,
			path_exists,
			&mut ctx.frames,
		);
	}

	ctx.pairer.finish(path_exists, &mut ctx.frames);
	ctx.flush();
}

struct RunLoop(cf::CFRunLoopRef);

// SAFETY: CFRunLoopStop may be called from any thread
unsafe impl Send for RunLoop {}

struct Stream(fs::FSEventStreamRef);

// SAFETY: the stream is created here and then only used by the worker thread
unsafe impl Send for Stream {}

struct Worker {
	runloop: RunLoop,
	handle: thread::JoinHandle<()>,
}

pub struct FsEventsBackend {
	source: File,
	sink: File,
	latency: cf::CFTimeInterval,
	roots: BTreeMap<WatchId, PathBuf>,
	next_watch: u32,
	worker: Option<Worker>,
	decoder: FrameDecoder,
	chunk: Vec<u8>,
}

impl std::fmt::Debug for FsEventsBackend {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FsEventsBackend")
			.field("source", &self.source.as_raw_fd())
			.field("roots", &self.roots)
			.field("running", &self.worker.is_some())
			.finish_non_exhaustive()
	}
}

impl FsEventsBackend {
	fn stop(&mut self) {
		if let Some(Worker { runloop, handle }) = self.worker.take() {
			// A stop sent before the worker enters CFRunLoopRun would be lost
			// SAFETY: the run loop stays valid until the worker thread returns
			while unsafe { CFRunLoopIsWaiting(runloop.0) } == 0 && !handle.is_finished() {
				thread::yield_now();
			}
			// SAFETY: as above
			unsafe { cf::CFRunLoopStop(runloop.0) };
			if handle.join().is_err() {
				error!("FSEvents worker thread panicked;");
			}
		}
	}

	fn restart(&mut self) -> Result<()> {
		self.stop();

		if self.roots.is_empty() {
			return Ok(());
		}

		let sink = self.sink.try_clone().map_err(Error::Read)?;

		// SAFETY: CoreFoundation calls on objects created and released right here
		let paths = unsafe {
			let paths = cf::CFArrayCreateMutable(cf::kCFAllocatorDefault, 0, &cf::kCFTypeArrayCallBacks);
			for root in self.roots.values() {
				let Some(root) = root.to_str() else {
					warn!(path = %root.display(), "Skipping FSEvents root that is not valid UTF-8;");
					continue;
				};
				let mut err: cf::CFErrorRef = ptr::null_mut();
				let cf_path = cf::str_path_to_cfstring_ref(root, &mut err);
				if cf_path.is_null() {
					if !err.is_null() {
						cf::CFRelease(err.cast());
					}
					warn!(path = %root, "Failed to convert FSEvents root;");
					continue;
				}
				cf::CFArrayAppendValue(paths, cf_path);
				cf::CFRelease(cf_path);
			}
			paths
		};

		let context = Box::into_raw(Box::new(StreamContext {
			sink,
			pairer: RenamePairer::default(),
			frames: Vec::new(),
			bytes: Vec::new(),
		}));

		let stream_context = fs::FSEventStreamContext {
			version: 0,
			info: context.cast(),
			retain: None,
			release: None,
			copy_description: None,
		};

		// SAFETY: every pointer handed over is valid; the stream copies the path array
		let stream = unsafe {
			let stream = fs::FSEventStreamCreate(
				cf::kCFAllocatorDefault,
				stream_callback,
				&stream_context,
				paths,
				fs::kFSEventStreamEventIdSinceNow,
				self.latency,
				fs::kFSEventStreamCreateFlagFileEvents | fs::kFSEventStreamCreateFlagNoDefer,
			);
			cf::CFRelease(paths);
			Stream(stream)
		};

		let (tx, rx) = mpsc::sync_channel(1);
		let context = ContextPtr(context);

		let handle = thread::Builder::new()
			.name("fsevents".to_string())
			.spawn(move || {
				// Move the wrappers whole, not just their raw pointer fields
				let stream = stream;
				let context = context;

				// SAFETY: the stream is scheduled, run and torn down on this thread only
				unsafe {
					let runloop = cf::CFRunLoopGetCurrent();
					fs::FSEventStreamScheduleWithRunLoop(stream.0, runloop, cf::kCFRunLoopDefaultMode);

					if fs::FSEventStreamStart(stream.0) == 0 {
						fs::FSEventStreamInvalidate(stream.0);
						fs::FSEventStreamRelease(stream.0);
						drop(Box::from_raw(context.0));
						let _ = tx.send(Err(()));
						return;
					}

					if tx.send(Ok(RunLoop(runloop))).is_err() {
						fs::FSEventStreamStop(stream.0);
					} else {
						// Returns once `stop` calls CFRunLoopStop
						cf::CFRunLoopRun();
						fs::FSEventStreamStop(stream.0);
					}

					fs::FSEventStreamInvalidate(stream.0);
					fs::FSEventStreamRelease(stream.0);
					drop(Box::from_raw(context.0));
				}
			})
			.map_err(|e| Error::Worker(e.to_string()))?;

		match rx.recv() {
			Ok(Ok(runloop)) => {
				debug!(roots = self.roots.len(), "FSEvents stream started;");
				self.worker = Some(Worker { runloop, handle });
				Ok(())
			}
			_ => {
				let _ = handle.join();
				Err(Error::Worker("FSEventStreamStart failed".to_string()))
			}
		}
	}
}

struct ContextPtr(*mut StreamContext);

// SAFETY: ownership of the context moves to the worker thread, nothing else touches it
unsafe impl Send for ContextPtr {}

impl Drop for FsEventsBackend {
	fn drop(&mut self) {
		self.stop();
	}
}

impl Backend for FsEventsBackend {
	const NAME: &'static str = "fsevents";

	fn open(config: &WatchConfig) -> Result<Self> {
		let open_err = |source| Error::Open {
			backend: Self::NAME,
			source,
		};

		let mut fds = [0; 2];
		// SAFETY: `fds` has room for both ends
		if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
			return Err(open_err(io::Error::last_os_error()));
		}
		// SAFETY: both ends were just created and are owned by nobody else
		let (source, sink) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };

		set_nonblocking(source.as_raw_fd()).map_err(open_err)?;
		set_cloexec(source.as_raw_fd()).map_err(open_err)?;
		set_cloexec(sink.as_raw_fd()).map_err(open_err)?;

		#[allow(clippy::cast_precision_loss)]
		let latency = config.fsevents_latency_ms as f64 / 1000.0;

		Ok(Self {
			source,
			sink,
			latency,
			roots: BTreeMap::new(),
			next_watch: 0,
			worker: None,
			decoder: FrameDecoder::default(),
			chunk: vec![0; READ_CHUNK],
		})
	}

	fn descriptor(&self) -> RawFd {
		self.source.as_raw_fd()
	}

	fn add_watch(&mut self, path: &Path, _is_dir: bool) -> Result<WatchId> {
		self.next_watch += 1;
		let watch = WatchId(self.next_watch);
		self.roots.insert(watch, path.to_path_buf());

		if let Err(e) = self.restart() {
			self.roots.remove(&watch);
			// Keep watching the roots we had
			report_error(&self.restart());
			return Err(e);
		}

		trace!(%watch, path = %path.display(), "Added FSEvents root;");

		Ok(watch)
	}

	fn remove_watch(&mut self, watch: WatchId) {
		if self.roots.remove(&watch).is_some() {
			report_error(&self.restart());
		}
	}

	fn drain(&mut self, out: &mut Vec<Notice>) -> Result<()> {
		loop {
			match self.source.read(&mut self.chunk) {
				Ok(0) => break,
				Ok(n) => self.decoder.push(&self.chunk[..n]),
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
				Err(e) => return Err(Error::Read(e)),
			}
		}

		let now = Timestamp::now();
		while let Some(frame) = self.decoder.next_frame() {
			out.extend(frame.into_notice(now));
		}

		Ok(())
	}

	fn recursive(&self) -> bool {
		true
	}
}
