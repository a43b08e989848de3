//! Adaptive DRAM refresh interval controller (`trefictl`)

// Modules
mod args;
mod config;

// Imports
use {
	self::{args::Args, config::Config},
	anyhow::Context,
	clap::Parser,
	std::{fs, io},
	trefictl::{
		bandwidth::{BandwidthSampler, JsonLinesSampler},
		pci::PciConfigSpace,
		register::{ChannelRegisters, MemoryConfigSpace, RegisterPort},
		scheduler,
		Scheduler,
	},
	trefictl_util::logger,
};

fn main() -> Result<(), anyhow::Error> {
	// Get arguments
	let args = Args::parse();
	logger::pre_init::debug(format!("Args: {args:?}"));

	// Initialize logging
	logger::init(args.log_file.as_deref(), args.log_file_append);

	// Read the config file
	let config = match &args.config_file {
		Some(config_path) => {
			let config_file = fs::File::open(config_path).context("Unable to open config file")?;
			serde_json::from_reader::<_, Config>(config_file).context("Unable to parse config file")?
		},
		None => Config::default(),
	};
	if args.print_config {
		serde_json::to_writer_pretty(io::stdout(), &config).context("Unable to write config")?;
		println!();
		return Ok(());
	}
	tracing::debug!(?config, "Loaded config");
	let scheduler_config = config.scheduler_config().context("Invalid config")?;

	// Open the bandwidth input, if any
	let sampler = match &args.bandwidth_input {
		Some(input_path) => {
			let input_file = fs::File::open(input_path).context("Unable to open bandwidth input")?;
			Some(JsonLinesSampler::new(io::BufReader::new(input_file), config.channel_count))
		},
		None => None,
	};

	match args.simulate {
		true => {
			let ports = (0..config.channel_count)
				.map(|_| {
					let mut thermal = MemoryConfigSpace::new();
					thermal.set(config.offsets.temperature, u32::from(args.simulate_temp));
					ChannelRegisters::new(thermal, MemoryConfigSpace::new(), config.offsets)
				})
				.collect();
			self::run(scheduler_config, ports, sampler, args.ticks)
		},
		false => {
			anyhow::ensure!(
				config.channels.len() == config.channel_count,
				"Configured {} channel addresses, but {} channels",
				config.channels.len(),
				config.channel_count
			);
			let ports = config
				.channels
				.iter()
				.map(|address| -> Result<_, anyhow::Error> {
					let thermal = PciConfigSpace::open(address.thermal())?;
					let error = PciConfigSpace::open(address.error())?;
					Ok(ChannelRegisters::new(thermal, error, config.offsets))
				})
				.collect::<Result<Vec<_>, anyhow::Error>>()
				.context("Unable to access memory controller registers, check that we have access to PCI configuration space")?;
			self::run(scheduler_config, ports, sampler, args.ticks)
		},
	}
}

/// Runs the scheduler over `ports`
fn run<P: RegisterPort, S: BandwidthSampler>(
	config: scheduler::Config,
	ports: Vec<P>,
	sampler: Option<S>,
	ticks: Option<u64>,
) -> Result<(), anyhow::Error> {
	let mut scheduler = Scheduler::new(config, ports, sampler).context("Unable to create scheduler")?;
	tracing::info!(
		channels = scheduler.channels().len(),
		tick_period = ?scheduler.config().tick_period,
		bandwidth_monitor = scheduler.detector().is_enabled(),
		"Starting"
	);

	scheduler.run(ticks).context("Unable to run scheduler")
}
