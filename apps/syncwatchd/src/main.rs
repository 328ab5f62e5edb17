use std::{path::PathBuf, process::ExitCode};

use anyhow::{bail, Context, Result};
use clap::Parser;
use sw_core::{logging, Daemon, Shutdown};
use tracing::{error, info};

mod config;
mod policy;

use config::{AppConfig, SyncConfig};
use policy::RsyncPolicy;

#[derive(Parser, Debug)]
#[command(
	name = "syncwatchd",
	about = "Watches directory trees and mirrors their changes with rsync"
)]
struct Cli {
	/// JSON config file with daemon settings and syncs
	#[arg(long)]
	config: Option<PathBuf>,

	/// Log file for the daemon and the rsync output
	#[arg(long)]
	log_file: Option<PathBuf>,

	/// Log filter used when RUST_LOG is not set
	#[arg(long)]
	log_level: Option<String>,

	/// Seconds to wait after a change before transferring (all syncs)
	#[arg(long)]
	delay: Option<u64>,

	/// Directory to watch, shorthand for a single sync
	#[arg(requires = "target")]
	source: Option<PathBuf>,

	/// Where `source` is mirrored to
	target: Option<String>,
}

impl Cli {
	/// Config file contents overridden by the command line
	fn load_config(&self) -> Result<AppConfig> {
		let mut config = match &self.config {
			Some(path) => AppConfig::load(path)?,
			None => AppConfig::default(),
		};

		if let Some(log_file) = &self.log_file {
			config.daemon.log_file = Some(log_file.clone());
		}
		if let Some(log_level) = &self.log_level {
			config.daemon.log_level = log_level.clone();
		}
		if let (Some(source), Some(target)) = (&self.source, &self.target) {
			config
				.syncs
				.push(SyncConfig::new(source.clone(), target.clone()));
		}
		if let Some(delay) = self.delay {
			for sync in &mut config.syncs {
				sync.delay_secs = delay;
			}
		}

		if config.syncs.is_empty() {
			bail!("nothing to watch; pass SOURCE TARGET or a config with syncs");
		}

		Ok(config)
	}
}

fn run(cli: &Cli) -> Result<()> {
	let mut config = cli.load_config()?;
	logging::init(&config.daemon)?;

	loop {
		let policy = RsyncPolicy::new(&config.syncs).context("invalid sync")?;
		let mut daemon = Daemon::new(config.daemon.clone(), policy);

		match daemon.run()? {
			Shutdown::Reset => {
				info!("Reset requested, rebuilding every watch;");
				// Logging stays as first set up, everything else follows the file
				config = cli.load_config()?;
			}
			Shutdown::Terminated(signal) => {
				info!(%signal, "Terminating;");
				return Ok(());
			}
			Shutdown::Finished => return Ok(()),
		}
	}
}

fn main() -> ExitCode {
	let cli = Cli::parse();

	match run(&cli) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			if tracing::dispatcher::has_been_set() {
				error!("{e:#}");
			} else {
				eprintln!("syncwatchd: {e:#}");
			}
			ExitCode::FAILURE
		}
	}
}
