//! End to end run of the daemon binary
//!
//! The rsync binary is replaced by a shell script that appends its arguments and whatever it
//! reads on stdin to files in a scratch directory, so the test can follow which transfers the
//! daemon starts: a full one at start-up, then an incremental one per batch of changes.

#![cfg(target_os = "linux")]

use std::{
	fs,
	os::unix::fs::PermissionsExt,
	path::{Path, PathBuf},
	process::{Child, Command, Stdio},
	thread,
	time::{Duration, Instant},
};

use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(10);

struct Setup {
	_dir: TempDir,
	source: PathBuf,
	calls: PathBuf,
	stdin: PathBuf,
	config: PathBuf,
}

fn setup() -> Setup {
	let dir = tempfile::tempdir().unwrap();
	let source = dir.path().join("source");
	let record = dir.path().join("record");
	fs::create_dir(&source).unwrap();
	fs::create_dir(&record).unwrap();
	fs::write(source.join("existing.txt"), b"old").unwrap();

	let calls = record.join("calls");
	let stdin = record.join("stdin");

	let script = dir.path().join("fake-rsync");
	fs::write(
		&script,
		format!(
			"#!/bin/sh\nprintf '%s\\n' \"$*\" >> '{}'\ncat >> '{}'\n",
			calls.display(),
			stdin.display()
		),
	)
	.unwrap();
	fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

	let config = dir.path().join("syncwatchd.json");
	fs::write(
		&config,
		serde_json::json!({
			"log_level": "debug",
			"syncs": [{
				"source": source,
				"target": dir.path().join("target"),
				"delay_secs": 0,
				"rsync_binary": script,
				"excludes": ["*.tmp"],
			}]
		})
		.to_string(),
	)
	.unwrap();

	Setup {
		_dir: dir,
		source,
		calls,
		stdin,
		config,
	}
}

fn spawn(config: &Path) -> Child {
	Command::new(env!("CARGO_BIN_EXE_syncwatchd"))
		.arg("--config")
		.arg(config)
		.stdin(Stdio::null())
		.stdout(Stdio::null())
		.stderr(Stdio::null())
		.spawn()
		.unwrap()
}

fn wait_for(what: &str, check: impl Fn() -> bool) {
	let start = Instant::now();
	while !check() {
		assert!(start.elapsed() < TIMEOUT, "timed out waiting for {what}");
		thread::sleep(Duration::from_millis(50));
	}
}

fn read(path: &Path) -> String {
	fs::read_to_string(path).unwrap_or_default()
}

fn terminate(mut child: Child) {
	let pid = libc::pid_t::try_from(child.id()).unwrap();
	assert_eq!(unsafe { libc::kill(pid, libc::SIGTERM) }, 0);

	let start = Instant::now();
	loop {
		if let Some(status) = child.try_wait().unwrap() {
			assert!(status.success(), "daemon exited with {status}");
			return;
		}
		assert!(start.elapsed() < TIMEOUT, "daemon ignored SIGTERM");
		thread::sleep(Duration::from_millis(50));
	}
}

#[test]
fn full_then_incremental_transfer() {
	let setup = setup();
	let child = spawn(&setup.config);

	wait_for("the start-up transfer", || {
		read(&setup.calls).lines().any(|line| line.contains("--delete "))
	});
	let first = read(&setup.calls);
	assert!(first.contains("--exclude=*.tmp"), "calls: {first}");
	assert!(!first.contains("--files-from"), "calls: {first}");

	// Give the watches a moment past the first transfer before changing anything
	thread::sleep(Duration::from_millis(200));
	fs::write(setup.source.join("scratch.tmp"), b"skip me").unwrap();
	fs::write(setup.source.join("new.txt"), b"new").unwrap();

	wait_for("the incremental transfer", || {
		read(&setup.stdin).split('\0').any(|path| path == "new.txt")
	});

	let calls = read(&setup.calls);
	let incremental = calls
		.lines()
		.find(|line| line.contains("--files-from=-"))
		.unwrap();
	assert!(incremental.contains("--from0"), "calls: {calls}");
	assert!(incremental.contains("--delete-missing-args"), "calls: {calls}");
	assert!(!read(&setup.stdin).contains("scratch.tmp"));

	terminate(child);
}

#[test]
fn missing_source_fails_at_start() {
	let setup = setup();
	fs::remove_dir_all(&setup.source).unwrap();

	let status = Command::new(env!("CARGO_BIN_EXE_syncwatchd"))
		.arg("--config")
		.arg(&setup.config)
		.stderr(Stdio::null())
		.status()
		.unwrap();

	assert!(!status.success());
	assert!(read(&setup.calls).is_empty());
}
