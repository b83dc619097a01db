//! CLI surface: everything here is an override layered on top of the TOML
//! config file, matching the precedence file < flags used throughout the
//! rest of this driver's config handling.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "docdb-server", about = "Multi-tenant document DB scheduler front end")]
pub struct CliOpts {
	/// Path to a TOML config file.
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Override `DataDir`.
	#[arg(short, long, value_name = "DIR")]
	pub data_dir: Option<PathBuf>,

	/// Override `SocketPath`.
	#[arg(short, long, value_name = "PATH")]
	pub socket: Option<PathBuf>,

	/// Repeatable: -v info, -vv debug, -vvv+ trace.
	#[arg(short, long, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Override `ConfiguredWorkers` (0 = autoscale).
	#[arg(long)]
	pub workers: Option<usize>,
}

impl CliOpts {
	pub fn parse_args() -> Self {
		CliOpts::parse()
	}

	pub fn log_level(&self) -> log::LevelFilter {
		match self.verbose {
			0 => log::LevelFilter::Info,
			1 => log::LevelFilter::Debug,
			_ => log::LevelFilter::Trace,
		}
	}
}
