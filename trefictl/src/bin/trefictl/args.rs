//! Arguments

// Imports
use std::path::PathBuf;

/// Arguments
#[derive(Debug)]
#[derive(clap::Parser)]
pub struct Args {
	/// Log file
	///
	/// Specifies a file to perform verbose logging to.
	/// You can use `RUST_LOG_FILE` to set filtering options
	#[clap(long = "log-file")]
	pub log_file: Option<PathBuf>,

	/// Whether to append to the log file
	#[clap(long = "log-file-append")]
	pub log_file_append: bool,

	/// Config file
	///
	/// If not given, the default configuration is used.
	#[clap(long = "config")]
	pub config_file: Option<PathBuf>,

	/// Prints the configuration and exits
	#[clap(long = "print-config")]
	pub print_config: bool,

	/// Number of ticks to run for.
	///
	/// Runs forever if not given.
	#[clap(long = "ticks")]
	pub ticks: Option<u64>,

	/// Runs against simulated, in-memory, registers instead of the memory controller
	#[clap(long = "simulate")]
	pub simulate: bool,

	/// Temperature of every simulated channel, in celsius
	#[clap(long = "simulate-temp", requires = "simulate", default_value_t = 45)]
	pub simulate_temp: u8,

	/// Bandwidth input
	///
	/// File (or fifo) with one JSON bandwidth sample per line.
	/// Required if bandwidth monitoring is enabled.
	#[clap(long = "bandwidth-input")]
	pub bandwidth_input: Option<PathBuf>,
}
