//! Bandwidth anomaly detection
//!
//! Every channel keeps two accumulation phases. One accumulates the current
//! bandwidth while the other, settled, one serves as the baseline. They swap
//! roles every `average_loop_count` ticks. Once a baseline exists, a sample
//! far enough above it signals a reset for that channel, after which the
//! channel is suppressed for `average_loop_count²` ticks.

// Imports
use {
	anyhow::Context,
	average::{Estimate, Mean},
	std::{io, time::Duration},
};

/// Bandwidth of a single channel, in MB/s
#[derive(PartialEq, Clone, Copy, Debug)]
pub struct ChannelBandwidth {
	/// Read bandwidth
	pub read_mbps: f64,

	/// Write bandwidth
	pub write_mbps: f64,
}

impl ChannelBandwidth {
	/// Sentinel for channels that were skipped as inactive
	pub const INACTIVE: Self = Self {
		read_mbps:  -1.0,
		write_mbps: -1.0,
	};

	/// Creates a new bandwidth sample
	pub fn new(read_mbps: f64, write_mbps: f64) -> Self {
		Self { read_mbps, write_mbps }
	}

	/// Returns if this is an inactive sample, rather than a measurement
	pub fn is_inactive(&self) -> bool {
		self.read_mbps < 0.0 || self.write_mbps < 0.0
	}
}

/// Converts a count of 64-byte transactions over `elapsed` into MB/s
pub fn mbps_from_events(events: u64, elapsed: Duration) -> f64 {
	let secs = elapsed.as_secs_f64();
	match secs > 0.0 {
		true => events as f64 * 64.0 / 1_000_000.0 / secs,
		false => 0.0,
	}
}

/// Bandwidth sampler
pub trait BandwidthSampler {
	/// Returns the number of channels this sampler reports
	fn channel_count(&self) -> usize;

	/// Samples the bandwidth of every channel over the last `elapsed`.
	///
	/// Channels skipped as inactive are reported as [`ChannelBandwidth::INACTIVE`].
	fn sample(&mut self, elapsed: Duration) -> Result<Vec<ChannelBandwidth>, anyhow::Error>;
}

/// Sampler for when bandwidth monitoring is disabled
#[derive(Clone, Copy, Debug)]
pub struct NoBandwidth;

impl BandwidthSampler for NoBandwidth {
	fn channel_count(&self) -> usize {
		0
	}

	fn sample(&mut self, _elapsed: Duration) -> Result<Vec<ChannelBandwidth>, anyhow::Error> {
		Ok(vec![])
	}
}

/// Sampler reading one JSON line per tick.
///
/// Each line is either an array of `[read_mbps, write_mbps]` pairs, or an object
/// `{"events": [[reads, writes], ...]}` of 64-byte transactions counted since the
/// previous line. `null` marks an inactive channel. Once the input ends, every
/// channel is reported inactive.
#[derive(Debug)]
pub struct JsonLinesSampler<R> {
	/// Reader
	reader: R,

	/// Number of channels
	channel_count: usize,

	/// Line buffer
	line: String,

	/// Whether we've hit the end of the input
	exhausted: bool,
}

/// Line of a [`JsonLinesSampler`]
#[derive(Debug)]
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum SampleLine {
	Bandwidth(Vec<Option<[f64; 2]>>),
	Events { events: Vec<Option<[u64; 2]>> },
}

impl<R: io::BufRead> JsonLinesSampler<R> {
	/// Creates a new sampler over `reader`
	pub fn new(reader: R, channel_count: usize) -> Self {
		Self {
			reader,
			channel_count,
			line: String::new(),
			exhausted: false,
		}
	}
}

impl<R: io::BufRead> BandwidthSampler for JsonLinesSampler<R> {
	fn channel_count(&self) -> usize {
		self.channel_count
	}

	fn sample(&mut self, elapsed: Duration) -> Result<Vec<ChannelBandwidth>, anyhow::Error> {
		let inactive = vec![ChannelBandwidth::INACTIVE; self.channel_count];
		if self.exhausted {
			return Ok(inactive);
		}

		// Skip any blank lines
		self.line.clear();
		while self.line.trim().is_empty() {
			self.line.clear();
			let bytes_read = self
				.reader
				.read_line(&mut self.line)
				.context("Unable to read bandwidth sample")?;
			if bytes_read == 0 {
				tracing::warn!("Bandwidth input ended, treating all channels as inactive");
				self.exhausted = true;
				return Ok(inactive);
			}
		}

		let line = serde_json::from_str::<SampleLine>(&self.line)
			.with_context(|| format!("Unable to parse bandwidth sample {:?}", self.line.trim()))?;
		let bandwidths = match line {
			SampleLine::Bandwidth(pairs) => pairs
				.into_iter()
				.map(|pair| match pair {
					Some([read, write]) => ChannelBandwidth::new(read, write),
					None => ChannelBandwidth::INACTIVE,
				})
				.collect::<Vec<_>>(),
			SampleLine::Events { events } => events
				.into_iter()
				.map(|pair| match pair {
					Some([reads, writes]) => ChannelBandwidth::new(
						self::mbps_from_events(reads, elapsed),
						self::mbps_from_events(writes, elapsed),
					),
					None => ChannelBandwidth::INACTIVE,
				})
				.collect(),
		};
		anyhow::ensure!(
			bandwidths.len() == self.channel_count,
			"Bandwidth sample had {} channels, expected {}",
			bandwidths.len(),
			self.channel_count
		);

		Ok(bandwidths)
	}
}

/// Anomaly margins
#[derive(PartialEq, Clone, Copy, Debug)]
pub struct AnomalyMargins {
	/// Minimum read bandwidth for a read anomaly
	pub read_abs: f64,

	/// Minimum read bandwidth for a write anomaly
	pub write_abs: f64,

	/// Read bandwidth must exceed the baseline by this factor
	pub read_rel: f64,

	/// Write bandwidth must exceed the baseline by this factor
	pub write_rel: f64,
}

/// Accumulation phase
#[derive(Clone, Debug)]
struct Phase {
	read:  Mean,
	write: Mean,
}

impl Phase {
	fn new() -> Self {
		Self {
			read:  Mean::new(),
			write: Mean::new(),
		}
	}

	fn add(&mut self, bandwidth: ChannelBandwidth) {
		self.read.add(bandwidth.read_mbps);
		self.write.add(bandwidth.write_mbps);
	}

	/// Returns the average of this phase, if it has any samples
	fn average(&self) -> Option<ChannelBandwidth> {
		match self.read.len() {
			0 => None,
			_ => Some(ChannelBandwidth::new(self.read.mean(), self.write.mean())),
		}
	}
}

/// Per-channel bandwidth history
#[derive(Clone, Debug)]
pub struct BandwidthHistory {
	/// Both phases
	phases: [Phase; 2],

	/// Whether resets are currently suppressed
	suppressed: bool,

	/// Ticks since the last reset
	ticks_since_reset: u64,
}

impl BandwidthHistory {
	fn new() -> Self {
		Self {
			phases:            [Phase::new(), Phase::new()],
			suppressed:        false,
			ticks_since_reset: 0,
		}
	}

	/// Returns if resets are currently suppressed
	pub fn is_suppressed(&self) -> bool {
		self.suppressed
	}

	/// Returns the baseline of phase `phase_idx`
	fn baseline(&self, phase_idx: usize) -> Option<ChannelBandwidth> {
		self.phases[phase_idx].average()
	}
}

/// Bandwidth anomaly detector
#[derive(Clone, Debug)]
pub struct BandwidthAnomalyDetector {
	/// Whether detection is enabled
	enabled: bool,

	/// Margins
	margins: AnomalyMargins,

	/// Ticks per phase
	average_loop_count: usize,

	/// Per-channel history
	histories: Vec<BandwidthHistory>,

	/// Index of the accumulating phase
	active_phase: usize,

	/// Ticks accumulated into the active phase
	loop_count: usize,

	/// Whether a baseline has settled
	steady_state: bool,
}

impl BandwidthAnomalyDetector {
	/// Creates a new detector for `channel_count` channels
	pub fn new(enabled: bool, channel_count: usize, average_loop_count: usize, margins: AnomalyMargins) -> Self {
		Self {
			enabled,
			margins,
			average_loop_count,
			histories: vec![BandwidthHistory::new(); channel_count],
			active_phase: 0,
			loop_count: 0,
			steady_state: false,
		}
	}

	/// Returns if this detector is enabled
	pub fn is_enabled(&self) -> bool {
		self.enabled
	}

	/// Returns if a baseline has settled
	pub fn is_steady(&self) -> bool {
		self.steady_state
	}

	/// Returns the history of every channel
	pub fn histories(&self) -> &[BandwidthHistory] {
		&self.histories
	}

	/// Returns the current baseline of channel `channel_idx`
	pub fn baseline(&self, channel_idx: usize) -> Option<ChannelBandwidth> {
		match self.steady_state {
			true => self.histories.get(channel_idx)?.baseline(self.active_phase ^ 1),
			false => None,
		}
	}

	/// Number of ticks a channel stays suppressed after a reset
	pub fn suppress_ticks(&self) -> u64 {
		(self.average_loop_count as u64).pow(2)
	}

	/// Observes one tick of bandwidth samples, returning which channels should reset.
	///
	/// # Panics
	/// Panics if `bandwidths` doesn't have one sample per channel.
	pub fn observe(&mut self, bandwidths: &[ChannelBandwidth]) -> Vec<bool> {
		assert_eq!(
			bandwidths.len(),
			self.histories.len(),
			"Expected one bandwidth sample per channel"
		);
		if !self.enabled {
			return vec![false; self.histories.len()];
		}

		// Lift any suppression that has run its course
		let suppress_ticks = self.suppress_ticks();
		for history in self.histories.iter_mut().filter(|history| history.suppressed) {
			history.ticks_since_reset += 1;
			if history.ticks_since_reset >= suppress_ticks {
				history.suppressed = false;
			}
		}

		// Settle the phase if it's full
		self.loop_count += 1;
		if self.loop_count >= self.average_loop_count {
			self.loop_count = 0;
			self.active_phase ^= 1;
			for history in &mut self.histories {
				history.phases[self.active_phase] = Phase::new();
			}

			if !self.steady_state {
				tracing::debug!("Bandwidth baseline reached steady state");
			}
			self.steady_state = true;
		}

		// Then accumulate the sample into the active phase
		for (history, &bandwidth) in self.histories.iter_mut().zip(bandwidths) {
			if !bandwidth.is_inactive() {
				history.phases[self.active_phase].add(bandwidth);
			}
		}

		if !self.steady_state {
			return vec![false; self.histories.len()];
		}

		let settled_phase = self.active_phase ^ 1;
		let margins = self.margins;
		self.histories
			.iter_mut()
			.zip(bandwidths)
			.enumerate()
			.map(|(channel_idx, (history, &bandwidth))| {
				if history.suppressed || bandwidth.is_inactive() {
					return false;
				}
				let Some(baseline) = history.baseline(settled_phase) else {
					return false;
				};

				let read_anomaly =
					bandwidth.read_mbps > baseline.read_mbps * margins.read_rel && bandwidth.read_mbps > margins.read_abs;
				// TODO: The absolute write margin is checked against the read bandwidth,
				//       confirm whether it should be checked against the write bandwidth.
				let write_anomaly = bandwidth.write_mbps > baseline.write_mbps * margins.write_rel &&
					bandwidth.read_mbps > margins.write_abs;

				if read_anomaly || write_anomaly {
					tracing::info!(
						channel_idx,
						?bandwidth,
						?baseline,
						read_anomaly,
						write_anomaly,
						"Bandwidth spike, resetting channel"
					);
					history.suppressed = true;
					history.ticks_since_reset = 0;
				}

				read_anomaly || write_anomaly
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const MARGINS: AnomalyMargins = AnomalyMargins {
		read_abs:  50.0,
		write_abs: 50.0,
		read_rel:  10.0,
		write_rel: 10.0,
	};

	fn detector(channel_count: usize) -> BandwidthAnomalyDetector {
		BandwidthAnomalyDetector::new(true, channel_count, 10, MARGINS)
	}

	fn settle(detector: &mut BandwidthAnomalyDetector, bandwidth: ChannelBandwidth) {
		let channel_count = detector.histories().len();
		for _ in 0..10 {
			let resets = detector.observe(&vec![bandwidth; channel_count]);
			assert!(resets.iter().all(|&reset| !reset));
		}
	}

	#[test]
	fn read_spike_over_settled_baseline() {
		let mut detector = detector(1);
		settle(&mut detector, ChannelBandwidth::new(100.0, 0.0));
		assert!(detector.is_steady());
		assert_eq!(detector.baseline(0), Some(ChannelBandwidth::new(100.0, 0.0)));

		assert_eq!(detector.observe(&[ChannelBandwidth::new(1200.0, 0.0)]), [true]);

		// Only a single tick
		assert_eq!(detector.observe(&[ChannelBandwidth::new(1200.0, 0.0)]), [false]);
	}

	#[test]
	fn read_spike_on_phase_boundary() {
		let mut detector = detector(1);
		settle(&mut detector, ChannelBandwidth::new(100.0, 0.0));

		// Fill the rest of the next phase, so the spike lands on the tick that settles it
		for _ in 0..9 {
			assert_eq!(detector.observe(&[ChannelBandwidth::new(100.0, 0.0)]), [false]);
		}
		assert_eq!(detector.observe(&[ChannelBandwidth::new(1200.0, 0.0)]), [true]);
		assert_eq!(detector.baseline(0), Some(ChannelBandwidth::new(100.0, 0.0)));
	}

	#[test]
	fn no_reset_before_steady_state() {
		let mut detector = detector(1);
		assert_eq!(detector.observe(&[ChannelBandwidth::new(100.0, 0.0)]), [false]);
		for _ in 0..8 {
			assert_eq!(detector.observe(&[ChannelBandwidth::new(5000.0, 0.0)]), [false]);
		}
		assert!(!detector.is_steady());
	}

	#[test]
	fn spike_must_clear_both_margins() {
		let mut detector = detector(1);
		settle(&mut detector, ChannelBandwidth::new(2.0, 0.0));

		// Over the relative margin, but not the absolute one
		assert_eq!(detector.observe(&[ChannelBandwidth::new(40.0, 0.0)]), [false]);

		// Over the absolute margin, but not the relative one
		let mut detector = self::detector(1);
		settle(&mut detector, ChannelBandwidth::new(100.0, 0.0));
		assert_eq!(detector.observe(&[ChannelBandwidth::new(900.0, 0.0)]), [false]);
	}

	#[test]
	fn write_absolute_margin_uses_read_bandwidth() {
		let mut detector = detector(1);
		settle(&mut detector, ChannelBandwidth::new(10.0, 10.0));

		// Large write spike, but quiet reads
		assert_eq!(detector.observe(&[ChannelBandwidth::new(20.0, 5000.0)]), [false]);

		// The same write spike with reads over the write margin
		assert_eq!(detector.observe(&[ChannelBandwidth::new(60.0, 5000.0)]), [true]);
	}

	#[test]
	fn reset_is_suppressed_for_loop_count_squared() {
		let mut detector = detector(1);
		settle(&mut detector, ChannelBandwidth::new(100.0, 0.0));
		let spike = [ChannelBandwidth::new(100_000.0, 0.0)];

		assert_eq!(detector.observe(&spike), [true]);
		for tick in 1..detector.suppress_ticks() {
			assert_eq!(detector.observe(&spike), [false], "Reset fired again on tick {tick}");
			assert!(detector.histories()[0].is_suppressed());
		}

		// Note: The sustained spike has since become the baseline, so
		//       we need an even larger one to trigger again.
		assert_eq!(detector.observe(&[ChannelBandwidth::new(1e9, 0.0)]), [true]);
	}

	#[test]
	fn channels_are_independent() {
		let mut detector = detector(2);
		settle(&mut detector, ChannelBandwidth::new(100.0, 0.0));
		let resets = detector.observe(&[ChannelBandwidth::new(100.0, 0.0), ChannelBandwidth::new(1200.0, 0.0)]);
		assert_eq!(resets, [false, true]);
	}

	#[test]
	fn inactive_samples_are_skipped() {
		let mut detector = detector(2);
		for tick in 0..10 {
			let other = match tick % 2 {
				0 => ChannelBandwidth::INACTIVE,
				_ => ChannelBandwidth::new(100.0, 0.0),
			};
			detector.observe(&[ChannelBandwidth::new(100.0, 0.0), other]);
		}

		// Inactive ticks don't drag the baseline down
		assert_eq!(detector.baseline(1), Some(ChannelBandwidth::new(100.0, 0.0)));
		assert_eq!(
			detector.observe(&[ChannelBandwidth::INACTIVE, ChannelBandwidth::INACTIVE]),
			[false, false]
		);
	}

	#[test]
	fn disabled_never_resets() {
		let mut detector = BandwidthAnomalyDetector::new(false, 1, 10, MARGINS);
		for _ in 0..30 {
			assert_eq!(detector.observe(&[ChannelBandwidth::new(1e9, 1e9)]), [false]);
		}
	}

	#[test]
	fn events_to_mbps() {
		assert_eq!(mbps_from_events(1_000_000, Duration::from_secs(1)), 64.0);
		assert_eq!(mbps_from_events(500_000, Duration::from_millis(500)), 64.0);
		assert_eq!(mbps_from_events(10, Duration::ZERO), 0.0);
	}

	#[test]
	fn json_lines_sampler() {
		let input = "[[100.0, 20.0], null]\n\n{\"events\": [[1000000, 0], [0, 2000000]]}\n";
		let mut sampler = JsonLinesSampler::new(input.as_bytes(), 2);

		let sample = sampler.sample(Duration::from_secs(1)).unwrap();
		assert_eq!(sample, [ChannelBandwidth::new(100.0, 20.0), ChannelBandwidth::INACTIVE]);

		let sample = sampler.sample(Duration::from_secs(1)).unwrap();
		assert_eq!(sample, [ChannelBandwidth::new(64.0, 0.0), ChannelBandwidth::new(0.0, 128.0)]);

		let sample = sampler.sample(Duration::from_secs(1)).unwrap();
		assert_eq!(sample, [ChannelBandwidth::INACTIVE; 2]);
	}

	#[test]
	fn json_lines_sampler_rejects_wrong_channel_count() {
		let mut sampler = JsonLinesSampler::new("[[1.0, 1.0]]\n".as_bytes(), 2);
		assert!(sampler.sample(Duration::from_secs(1)).is_err());
	}
}
