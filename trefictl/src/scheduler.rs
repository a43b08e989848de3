//! Round-robin scheduler
//!
//! Each tick services a single channel: read its temperature and error
//! counters, decide the next tREFI and commit it. Channels are visited in
//! order, so every channel is serviced once per sweep.

// Imports
use {
	crate::{
		bandwidth::{AnomalyMargins, BandwidthAnomalyDetector, BandwidthSampler},
		ceiling::TemperatureCeiling,
		channel::{Channel, ChannelIdx},
		controller::RefreshIntervalController,
		error_tracker::{ErrorHysteresisTracker, ErrorSample, ErrorVerdict},
		register::{RegisterPort, TREFI_MASK},
	},
	anyhow::Context,
	itertools::Itertools,
	std::{
		fmt,
		thread,
		time::{Duration, Instant},
	},
	trefictl_util::DisplayWrapper,
};

/// Scheduler configuration
#[derive(Clone, Debug)]
pub struct Config {
	/// Base tREFI, the starting interval of every channel
	pub base_trefi: u32,

	/// tREFI increment per quiet tick
	pub step_inc: u32,

	/// tREFI decrement (doubled) per error tick
	pub step_dec: u32,

	/// Ceiling
	pub ceiling: TemperatureCeiling,

	/// Number of channels
	pub channel_count: usize,

	/// Whether active errors are latched across ticks
	pub error_hysteresis: bool,

	/// Whether bandwidth spikes reset the interval
	pub bandwidth_monitor: bool,

	/// Ticks per bandwidth averaging phase
	pub average_loop_count: usize,

	/// Bandwidth anomaly margins
	pub margins: AnomalyMargins,

	/// Time between ticks
	pub tick_period: Duration,

	/// Time between status reports
	pub status_period: Duration,
}

impl Config {
	/// Validates this configuration
	pub fn validate(&self) -> Result<(), anyhow::Error> {
		anyhow::ensure!(self.channel_count > 0, "Channel count must be at least 1");
		anyhow::ensure!(
			(2..=TREFI_MASK).contains(&self.base_trefi),
			"Base tREFI {} must be within 2..={TREFI_MASK}",
			self.base_trefi
		);
		anyhow::ensure!(self.step_inc > 0, "tREFI increment must be positive");
		anyhow::ensure!(self.step_dec > 0, "tREFI decrement must be positive");

		let floor = self.base_trefi.div_ceil(2);
		let min_ceiling = self.ceiling.min_ceiling();
		anyhow::ensure!(
			min_ceiling >= floor,
			"Lowest tREFI ceiling {min_ceiling} is below the tREFI floor {floor}"
		);

		if self.bandwidth_monitor {
			anyhow::ensure!(self.average_loop_count > 0, "Average loop count must be at least 1");
			for (name, margin) in [
				("read absolute", self.margins.read_abs),
				("write absolute", self.margins.write_abs),
				("read relative", self.margins.read_rel),
				("write relative", self.margins.write_rel),
			] {
				anyhow::ensure!(
					margin.is_finite() && margin >= 0.0,
					"The {name} margin must be a non-negative number, found {margin}"
				);
			}
		}

		anyhow::ensure!(!self.tick_period.is_zero(), "Tick period must be positive");

		Ok(())
	}
}

/// Report of a single tick
#[derive(PartialEq, Clone, Copy, Debug)]
pub struct TickReport {
	/// Channel serviced
	pub channel_idx: ChannelIdx,

	/// Temperature read
	pub temperature: u8,

	/// Error sample read
	pub sample: ErrorSample,

	/// Error verdict
	pub verdict: ErrorVerdict,

	/// Ceiling applied
	pub ceiling: u32,

	/// Whether a bandwidth reset was applied
	pub reset: bool,

	/// tREFI before this tick
	pub prev_trefi: u32,

	/// tREFI committed on this tick
	pub trefi: u32,
}

/// Scheduler
#[derive(Debug)]
pub struct Scheduler<P, S> {
	/// Config
	config: Config,

	/// Error tracker
	tracker: ErrorHysteresisTracker,

	/// Controller
	controller: RefreshIntervalController,

	/// Bandwidth anomaly detector
	detector: BandwidthAnomalyDetector,

	/// Bandwidth sampler
	sampler: Option<S>,

	/// Last time bandwidth was sampled
	last_sample_time: Instant,

	/// Channels
	channels: Vec<Channel<P>>,

	/// Next channel to service
	next_channel: usize,

	/// Total ticks
	ticks: u64,
}

impl<P: RegisterPort, S: BandwidthSampler> Scheduler<P, S> {
	/// Creates a scheduler, initializing every channel.
	///
	/// # Errors
	/// Returns an error if the configuration is invalid, if the number of ports
	/// or sampled channels doesn't match the configured channel count, or if
	/// any channel can't be initialized.
	pub fn new(config: Config, ports: Vec<P>, sampler: Option<S>) -> Result<Self, anyhow::Error> {
		config.validate().context("Invalid configuration")?;
		anyhow::ensure!(
			ports.len() == config.channel_count,
			"Found {} channel register ports, but configured {} channels",
			ports.len(),
			config.channel_count
		);

		let sampler = match (config.bandwidth_monitor, sampler) {
			(true, Some(sampler)) => {
				anyhow::ensure!(
					sampler.channel_count() == config.channel_count,
					"Bandwidth sampler reports {} channels, but configured {} channels",
					sampler.channel_count(),
					config.channel_count
				);
				Some(sampler)
			},
			(true, None) => anyhow::bail!("Bandwidth monitoring is enabled, but no bandwidth source was given"),
			(false, Some(_)) => {
				tracing::warn!("Bandwidth monitoring is disabled, ignoring bandwidth source");
				None
			},
			(false, None) => None,
		};

		let channels = ports
			.into_iter()
			.enumerate()
			.map(|(idx, port)| Channel::init(ChannelIdx::new(idx), port, config.base_trefi))
			.collect::<Result<Vec<_>, _>>()
			.context("Unable to initialize channels")?;

		Ok(Self {
			tracker: ErrorHysteresisTracker::new(config.error_hysteresis),
			controller: RefreshIntervalController::new(config.base_trefi, config.step_inc, config.step_dec),
			detector: BandwidthAnomalyDetector::new(
				config.bandwidth_monitor,
				config.channel_count,
				config.average_loop_count,
				config.margins,
			),
			sampler,
			last_sample_time: Instant::now(),
			channels,
			next_channel: 0,
			ticks: 0,
			config,
		})
	}

	/// Services the next channel.
	///
	/// # Errors
	/// Returns an error if sampling bandwidth or accessing the channel's registers fails.
	pub fn tick(&mut self) -> Result<TickReport, anyhow::Error> {
		let channel_idx = self.next_channel;
		self.next_channel = (self.next_channel + 1) % self.channels.len();
		self.ticks += 1;

		// Sample the bandwidth of all channels and latch any resets until each channel's turn
		if let Some(sampler) = &mut self.sampler {
			let now = Instant::now();
			let bandwidths = sampler
				.sample(now.duration_since(self.last_sample_time))
				.context("Unable to sample bandwidth")?;
			self.last_sample_time = now;
			anyhow::ensure!(
				bandwidths.len() == self.channels.len(),
				"Bandwidth sampler returned {} channels, expected {}",
				bandwidths.len(),
				self.channels.len()
			);
			tracing::trace!(?bandwidths, "Sampled bandwidth");

			let resets = self.detector.observe(&bandwidths);
			for (channel, reset) in self.channels.iter_mut().zip(resets) {
				channel.pending_reset |= reset;
			}
		}

		let channel = &mut self.channels[channel_idx];
		let idx = channel.idx();

		let temperature = channel
			.port
			.read_temperature()
			.with_context(|| format!("Unable to read temperature of channel {idx}"))?;
		let ceiling = self.config.ceiling.ceiling(temperature);
		channel.last_temperature = Some(temperature);
		channel.last_ceiling = Some(ceiling);

		let raw_errors = channel
			.port
			.read_error_register()
			.with_context(|| format!("Unable to read error counters of channel {idx}"))?;
		let sample = ErrorSample::decode(raw_errors);
		let verdict = self.tracker.update(sample, &mut channel.errors);

		let reset = std::mem::take(&mut channel.pending_reset);
		let prev_trefi = channel.trefi.current;
		let trefi = self
			.controller
			.step(&mut channel.port, verdict, ceiling, reset, &mut channel.trefi)
			.with_context(|| format!("Unable to update tREFI of channel {idx}"))?;

		match (reset, verdict) {
			(true, _) => tracing::info!(%idx, prev_trefi, trefi, "Bandwidth reset, halved tREFI"),
			(false, ErrorVerdict::ErrorActive { r1, r0 }) =>
				tracing::info!(%idx, r1, r0, ?sample, prev_trefi, trefi, "Errors active, decreased tREFI"),
			(false, ErrorVerdict::ErrorClearing { r1, r0 }) =>
				tracing::info!(%idx, r1, r0, prev_trefi, trefi, "Errors cleared, decreased tREFI"),
			(false, ErrorVerdict::NoError) => (),
		}
		tracing::debug!(%idx, temperature, ceiling, ?verdict, reset, prev_trefi, trefi, "Serviced channel");

		Ok(TickReport {
			channel_idx: idx,
			temperature,
			sample,
			verdict,
			ceiling,
			reset,
			prev_trefi,
			trefi,
		})
	}

	/// Runs the scheduler for `max_ticks` ticks, or forever if `None`.
	///
	/// Ticks are spaced `tick_period` apart, measured from the start of each tick.
	pub fn run(&mut self, max_ticks: Option<u64>) -> Result<(), anyhow::Error> {
		// Note: We start in the past so that we output right away at the start
		let status_period = self.config.status_period;
		let mut last_status_time = Instant::now().checked_sub(status_period).unwrap_or_else(Instant::now);
		let mut next_tick_time = Instant::now();

		let mut ticks_run = 0;
		while max_ticks.map_or(true, |max_ticks| ticks_run < max_ticks) {
			self.tick()?;
			ticks_run += 1;

			let cur_time = Instant::now();
			if cur_time.duration_since(last_status_time) >= status_period {
				tracing::info!("Status: {}", DisplayWrapper::new(|f| self.fmt_status(f)));
				last_status_time = cur_time;
			}

			// If we're running late, don't try to catch up
			next_tick_time += self.config.tick_period;
			match next_tick_time.checked_duration_since(Instant::now()) {
				Some(sleep_duration) => thread::sleep(sleep_duration),
				None => next_tick_time = Instant::now(),
			}
		}

		Ok(())
	}
}

impl<P, S> Scheduler<P, S> {
	/// Returns the config
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Returns all channels
	pub fn channels(&self) -> &[Channel<P>] {
		&self.channels
	}

	/// Returns all channels, mutably
	pub fn channels_mut(&mut self) -> &mut [Channel<P>] {
		&mut self.channels
	}

	/// Returns the bandwidth anomaly detector
	pub fn detector(&self) -> &BandwidthAnomalyDetector {
		&self.detector
	}

	/// Returns the total number of ticks
	pub fn ticks(&self) -> u64 {
		self.ticks
	}

	/// Formats a status report of every channel to `f`.
	pub fn fmt_status(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
		// Note: Start with a newline, since we're a multi-line output
		f.pad("\n")?;

		for (channel_idx, channel) in self.channels.iter().enumerate() {
			let idx = channel.idx();
			let trefi = channel.trefi().current;
			let temperature = channel
				.last_temperature()
				.map_or_else(|| "?".to_owned(), |temp| format!("{temp}°C"));
			let ceiling = channel
				.last_ceiling()
				.map_or_else(|| "?".to_owned(), |ceiling| ceiling.to_string());
			let errors = channel.errors();
			let active_ranks = [("r1", errors.active_r1), ("r0", errors.active_r0)]
				.into_iter()
				.filter(|&(_, active)| active)
				.map(|(rank, _)| rank)
				.join(", ");
			let suppressed = self
				.detector
				.histories()
				.get(channel_idx)
				.is_some_and(|history| history.is_suppressed());

			writeln!(
				f,
				"Channel {idx}: tREFI {trefi} / {ceiling} ({temperature}), active errors: [{active_ranks}], \
				 suppressed: {suppressed}"
			)?;
		}

		let trefis = self
			.channels
			.iter()
			.map(|channel| f64::from(channel.trefi().current))
			.collect::<average::Variance>();
		let (min_trefi, max_trefi) = self
			.channels
			.iter()
			.map(|channel| channel.trefi().current)
			.minmax()
			.into_option()
			.unwrap_or((0, 0));
		writeln!(
			f,
			"Average tREFI: {:.2} ± {:.2} ({min_trefi}..{max_trefi}), ticks: {}",
			trefis.mean(),
			trefis.error(),
			self.ticks
		)?;

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{
			bandwidth::NoBandwidth,
			register::{ChannelRegisters, MemoryConfigSpace, RegisterOffsets},
		},
	};

	fn config(channel_count: usize) -> Config {
		Config {
			base_trefi: 7280,
			step_inc: 64,
			step_dec: 64,
			ceiling: TemperatureCeiling::from_base_trefi(7280),
			channel_count,
			error_hysteresis: true,
			bandwidth_monitor: false,
			average_loop_count: 10,
			margins: AnomalyMargins {
				read_abs:  50.0,
				write_abs: 50.0,
				read_rel:  10.0,
				write_rel: 10.0,
			},
			tick_period: Duration::from_millis(1),
			status_period: Duration::from_secs(60),
		}
	}

	fn ports(channel_count: usize) -> Vec<ChannelRegisters<MemoryConfigSpace>> {
		(0..channel_count)
			.map(|_| {
				let mut thermal = MemoryConfigSpace::new();
				thermal.set(0x150, 25);
				ChannelRegisters::new(thermal, MemoryConfigSpace::new(), RegisterOffsets::default())
			})
			.collect()
	}

	#[test]
	fn default_like_config_is_valid() {
		config(4).validate().unwrap();
	}

	#[test]
	fn invalid_configs_are_rejected() {
		let mut bad = config(4);
		bad.channel_count = 0;
		assert!(bad.validate().is_err());

		let mut bad = config(4);
		bad.step_dec = 0;
		assert!(bad.validate().is_err());

		let mut bad = config(4);
		bad.ceiling = TemperatureCeiling::Fixed(1000);
		assert!(bad.validate().is_err());

		let mut bad = config(4);
		bad.bandwidth_monitor = true;
		bad.average_loop_count = 0;
		assert!(bad.validate().is_err());
	}

	#[test]
	fn channel_count_mismatch_is_fatal() {
		let res = Scheduler::<_, NoBandwidth>::new(config(4), ports(3), None);
		assert!(res.is_err());
	}

	#[test]
	fn missing_bandwidth_source_is_fatal() {
		let mut config = config(2);
		config.bandwidth_monitor = true;
		let res = Scheduler::<_, NoBandwidth>::new(config, ports(2), None);
		assert!(res.is_err());
	}

	#[test]
	fn services_channels_round_robin() {
		let mut scheduler = Scheduler::<_, NoBandwidth>::new(config(3), ports(3), None).unwrap();
		let serviced = (0..7)
			.map(|_| scheduler.tick().unwrap().channel_idx.to_usize())
			.collect::<Vec<_>>();
		assert_eq!(serviced, [0, 1, 2, 0, 1, 2, 0]);
		assert_eq!(scheduler.ticks(), 7);
	}

	#[test]
	fn only_serviced_channel_changes() {
		let mut scheduler = Scheduler::<_, NoBandwidth>::new(config(2), ports(2), None).unwrap();
		let report = scheduler.tick().unwrap();
		assert_eq!(report.channel_idx.to_usize(), 0);
		assert_eq!(report.trefi, 7280 + 64);
		assert_eq!(scheduler.channels()[0].trefi().current, 7280 + 64);
		assert_eq!(scheduler.channels()[1].trefi().current, 7280);
	}

	#[test]
	fn status_lists_every_channel() {
		let mut scheduler = Scheduler::<_, NoBandwidth>::new(config(2), ports(2), None).unwrap();
		scheduler.tick().unwrap();
		let status = DisplayWrapper::new(|f| scheduler.fmt_status(f)).to_string();
		assert!(status.contains("Channel A: tREFI 7344 / 28210 (25°C)"), "{status}");
		assert!(status.contains("Channel B: tREFI 7280 / ? (?)"), "{status}");
	}

	#[test]
	fn run_stops_after_max_ticks() {
		let mut scheduler = Scheduler::<_, NoBandwidth>::new(config(2), ports(2), None).unwrap();
		scheduler.run(Some(5)).unwrap();
		assert_eq!(scheduler.ticks(), 5);
	}
}
