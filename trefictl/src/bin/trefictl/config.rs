//! Configuration

// Imports
use {
	anyhow::Context,
	std::time::Duration,
	trefictl::{
		bandwidth::AnomalyMargins,
		pci::PciLocation,
		register::RegisterOffsets,
		scheduler,
		TemperatureCeiling,
	},
};

/// Configuration
#[derive(Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
	/// Base tREFI, in memory-clock cycles
	pub base_trefi: u32,

	// tREFI increment / decrement steps
	pub step_inc: u32,
	pub step_dec: u32,

	/// Whether the ceiling follows temperature
	pub temperature_ceiling: bool,

	/// Ceiling slope, per celsius.
	///
	/// Derived from `base_trefi` if not given, along with `temp_offset`.
	pub temp_slope: Option<f64>,

	/// Ceiling offset
	pub temp_offset: Option<f64>,

	/// Ceiling used when `temperature_ceiling` is disabled.
	///
	/// Defaults to 4 times `base_trefi`.
	pub fixed_ceiling: Option<u32>,

	/// Number of channels
	pub channel_count: usize,

	/// Whether active errors are latched across ticks
	pub error_hysteresis: bool,

	/// Whether bandwidth spikes reset the interval
	pub bandwidth_monitor: bool,

	/// Ticks per bandwidth averaging phase
	pub average_loop_count: usize,

	// Bandwidth anomaly margins
	pub read_abs_margin:  f64,
	pub write_abs_margin: f64,
	pub read_rel_margin:  f64,
	pub write_rel_margin: f64,

	/// Time to sweep all channels once (in seconds)
	pub sweep_period_secs: f64,

	/// Debug output period (in seconds)
	pub debug_output_period_secs: f64,

	/// Register offsets
	pub offsets: RegisterOffsets,

	/// Channel addresses
	pub channels: Vec<ChannelAddress>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			base_trefi:               7280,
			step_inc:                 0x40,
			step_dec:                 0x40,
			temperature_ceiling:      true,
			temp_slope:               None,
			temp_offset:              None,
			fixed_ceiling:            None,
			channel_count:            4,
			error_hysteresis:         true,
			bandwidth_monitor:        false,
			average_loop_count:       10,
			read_abs_margin:          50.0,
			write_abs_margin:         50.0,
			read_rel_margin:          10.0,
			write_rel_margin:         10.0,
			sweep_period_secs:        0.4,
			debug_output_period_secs: 5.0,
			offsets:                  RegisterOffsets::default(),
			channels:                 ChannelAddress::defaults(),
		}
	}
}

impl Config {
	/// Builds the scheduler configuration
	pub fn scheduler_config(&self) -> Result<scheduler::Config, anyhow::Error> {
		let ceiling = match (self.temperature_ceiling, self.temp_slope, self.temp_offset) {
			(false, ..) => TemperatureCeiling::Fixed(self.fixed_ceiling.unwrap_or(4 * self.base_trefi)),
			(true, Some(slope), Some(offset)) => TemperatureCeiling::Linear { slope, offset },
			(true, None, None) => TemperatureCeiling::from_base_trefi(self.base_trefi),
			(true, ..) => anyhow::bail!("`temp_slope` and `temp_offset` must be given together"),
		};

		anyhow::ensure!(self.channel_count > 0, "Channel count must be at least 1");
		let sweep_period =
			Duration::try_from_secs_f64(self.sweep_period_secs).context("Invalid sweep period")?;
		let channel_count = u32::try_from(self.channel_count).context("Too many channels")?;
		let tick_period = sweep_period / channel_count;
		let status_period =
			Duration::try_from_secs_f64(self.debug_output_period_secs).context("Invalid debug output period")?;

		Ok(scheduler::Config {
			base_trefi: self.base_trefi,
			step_inc: self.step_inc,
			step_dec: self.step_dec,
			ceiling,
			channel_count: self.channel_count,
			error_hysteresis: self.error_hysteresis,
			bandwidth_monitor: self.bandwidth_monitor,
			average_loop_count: self.average_loop_count,
			margins: AnomalyMargins {
				read_abs:  self.read_abs_margin,
				write_abs: self.write_abs_margin,
				read_rel:  self.read_rel_margin,
				write_rel: self.write_rel_margin,
			},
			tick_period,
			status_period,
		})
	}
}

/// Channel address
#[derive(Clone, Copy, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct ChannelAddress {
	pub group:            u16,
	pub bus:              u8,
	pub device:           u8,
	pub thermal_function: u8,
	pub error_function:   u8,
}

impl ChannelAddress {
	/// Default addresses of channels `A` through `D`
	pub fn defaults() -> Vec<Self> {
		[(0x14, 0x0, 0x2), (0x14, 0x1, 0x3), (0x15, 0x0, 0x2), (0x15, 0x1, 0x3)]
			.into_iter()
			.map(|(device, thermal_function, error_function)| Self {
				group: 0,
				bus: 0xff,
				device,
				thermal_function,
				error_function,
			})
			.collect()
	}

	/// Returns the location of the thermal-control function
	pub fn thermal(&self) -> PciLocation {
		PciLocation {
			group:    self.group,
			bus:      self.bus,
			device:   self.device,
			function: self.thermal_function,
		}
	}

	/// Returns the location of the error-count function
	pub fn error(&self) -> PciLocation {
		PciLocation {
			function: self.error_function,
			..self.thermal()
		}
	}
}
