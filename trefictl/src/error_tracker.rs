//! Error hysteresis tracking
//!
//! Each channel exposes a correctable-error register with two ranks, each
//! with a 15-bit counter and an overflow bit. A rank becomes "active" when
//! its counter grows (or overflows), and only clears once a later tick shows
//! the counters have stopped growing.

// Imports
use trefictl_util::RegisterBits;

/// Error sample, decoded from the raw error-count register
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
pub struct ErrorSample {
	/// Rank 1 overflow (bit 31)
	pub rank1_overflow: bool,

	/// Rank 1 count (bits 30..16)
	pub rank1_count: u16,

	/// Rank 0 overflow (bit 15)
	pub rank0_overflow: bool,

	/// Rank 0 count (bits 14..0)
	pub rank0_count: u16,
}

impl ErrorSample {
	/// Decodes a raw error-count register
	pub fn decode(raw: u32) -> Self {
		Self {
			rank1_overflow: raw.bit(31),
			rank1_count:    raw.bits(16, 15) as u16,
			rank0_overflow: raw.bit(15),
			rank0_count:    raw.bits(0, 15) as u16,
		}
	}

	/// Returns if either rank overflowed
	pub fn has_overflow(&self) -> bool {
		self.rank1_overflow || self.rank0_overflow
	}
}

/// Per-channel error state, kept across ticks
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
pub struct ErrorState {
	/// If rank 1 has an active error
	pub active_r1: bool,

	/// If rank 0 has an active error
	pub active_r0: bool,

	/// Rank 1 count seen on the previous tick
	pub prev_count_r1: u16,

	/// Rank 0 count seen on the previous tick
	pub prev_count_r0: u16,
}

impl ErrorState {
	/// Returns if any rank is active
	pub fn is_active(&self) -> bool {
		self.active_r1 || self.active_r0
	}
}

/// Verdict of a single [`ErrorHysteresisTracker::update`]
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ErrorVerdict {
	/// No error, and none active.
	///
	/// The interval may grow.
	NoError,

	/// Counters grew or overflowed.
	///
	/// Holds the ranks active after this tick.
	ErrorActive { r1: bool, r0: bool },

	/// Counters stopped growing while a rank was active.
	///
	/// Holds the ranks cleared on this tick.
	ErrorClearing { r1: bool, r0: bool },
}

impl ErrorVerdict {
	/// Returns if this verdict should shrink the interval
	pub fn is_error(&self) -> bool {
		!matches!(self, Self::NoError)
	}
}

/// Error hysteresis tracker
#[derive(Clone, Copy, Debug)]
pub struct ErrorHysteresisTracker {
	/// Whether active errors are latched across ticks.
	///
	/// Without it, every tick is judged on its own and
	/// [`ErrorVerdict::ErrorClearing`] is never produced.
	hysteresis: bool,
}

impl ErrorHysteresisTracker {
	/// Creates a new tracker
	pub fn new(hysteresis: bool) -> Self {
		Self { hysteresis }
	}

	/// Updates `state` with `sample`, returning the verdict for this tick
	pub fn update(&self, sample: ErrorSample, state: &mut ErrorState) -> ErrorVerdict {
		let grew_r1 = sample.rank1_overflow || sample.rank1_count > state.prev_count_r1;
		let grew_r0 = sample.rank0_overflow || sample.rank0_count > state.prev_count_r0;
		let no_growth = !sample.has_overflow() &&
			sample.rank1_count <= state.prev_count_r1 &&
			sample.rank0_count <= state.prev_count_r0;

		let verdict = match (no_growth, self.hysteresis) {
			// Counters grew, without latching
			(false, false) => ErrorVerdict::ErrorActive {
				r1: grew_r1,
				r0: grew_r0,
			},

			// Counters grew, latch every rank that did
			(false, true) => {
				state.active_r1 |= grew_r1;
				state.active_r0 |= grew_r0;
				tracing::debug!(?sample, grew_r1, grew_r0, "Detected error");

				ErrorVerdict::ErrorActive {
					r1: state.active_r1,
					r0: state.active_r0,
				}
			},

			// Counters are still, but a rank was active, so clear it
			(true, true) if state.is_active() => {
				let verdict = ErrorVerdict::ErrorClearing {
					r1: state.active_r1,
					r0: state.active_r0,
				};
				state.active_r1 = false;
				state.active_r0 = false;

				verdict
			},

			(true, _) => ErrorVerdict::NoError,
		};

		state.prev_count_r1 = sample.rank1_count;
		state.prev_count_r0 = sample.rank0_count;

		verdict
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample(rank1_count: u16, rank0_count: u16) -> ErrorSample {
		ErrorSample {
			rank1_count,
			rank0_count,
			..ErrorSample::default()
		}
	}

	#[test]
	fn decode_layout() {
		assert_eq!(ErrorSample::decode(0x8000_0000), ErrorSample {
			rank1_overflow: true,
			..ErrorSample::default()
		});
		assert_eq!(ErrorSample::decode(0x0003_8005), ErrorSample {
			rank1_overflow: false,
			rank1_count:    3,
			rank0_overflow: true,
			rank0_count:    5,
		});
		assert_eq!(ErrorSample::decode(0xffff_ffff), ErrorSample {
			rank1_overflow: true,
			rank1_count:    0x7fff,
			rank0_overflow: true,
			rank0_count:    0x7fff,
		});
	}

	#[test]
	fn quiet_channel_has_no_error() {
		let tracker = ErrorHysteresisTracker::new(true);
		let mut state = ErrorState::default();
		for _ in 0..4 {
			assert_eq!(tracker.update(sample(0, 0), &mut state), ErrorVerdict::NoError);
		}
		assert_eq!(state, ErrorState::default());
	}

	#[test]
	fn overflow_activates_rank() {
		let tracker = ErrorHysteresisTracker::new(true);
		let mut state = ErrorState::default();
		let verdict = tracker.update(ErrorSample::decode(0x8000_0000), &mut state);
		assert_eq!(verdict, ErrorVerdict::ErrorActive { r1: true, r0: false });
		assert!(state.active_r1);
		assert!(!state.active_r0);
	}

	#[test]
	fn no_flap_on_increase_then_plateau() {
		let tracker = ErrorHysteresisTracker::new(true);
		let mut state = ErrorState::default();

		// Quiet, then grows for three ticks, then plateaus
		let counts = [0, 0, 1, 2, 3, 3, 3, 3];
		let mut active = vec![];
		let mut verdicts = vec![];
		for count in counts {
			verdicts.push(tracker.update(sample(0, count), &mut state));
			active.push(state.active_r0);
		}

		assert_eq!(active, [false, false, true, true, true, false, false, false]);
		assert_eq!(verdicts[2], ErrorVerdict::ErrorActive { r1: false, r0: true });
		assert_eq!(verdicts[5], ErrorVerdict::ErrorClearing { r1: false, r0: true });
		assert_eq!(verdicts[6], ErrorVerdict::NoError);
	}

	#[test]
	fn growth_on_one_rank_keeps_other_latched() {
		let tracker = ErrorHysteresisTracker::new(true);
		let mut state = ErrorState::default();

		tracker.update(sample(1, 0), &mut state);
		let verdict = tracker.update(sample(1, 1), &mut state);
		assert_eq!(verdict, ErrorVerdict::ErrorActive { r1: true, r0: true });

		let verdict = tracker.update(sample(1, 1), &mut state);
		assert_eq!(verdict, ErrorVerdict::ErrorClearing { r1: true, r0: true });
		assert!(!state.is_active());
	}

	#[test]
	fn counter_wrap_without_overflow_is_not_growth() {
		let tracker = ErrorHysteresisTracker::new(true);
		let mut state = ErrorState {
			prev_count_r0: 0x7ffe,
			..ErrorState::default()
		};
		assert_eq!(tracker.update(sample(0, 2), &mut state), ErrorVerdict::NoError);
		assert_eq!(state.prev_count_r0, 2);
	}

	#[test]
	fn previous_counts_always_update() {
		let tracker = ErrorHysteresisTracker::new(true);
		let mut state = ErrorState::default();
		tracker.update(sample(7, 9), &mut state);
		assert_eq!((state.prev_count_r1, state.prev_count_r0), (7, 9));
		tracker.update(sample(2, 1), &mut state);
		assert_eq!((state.prev_count_r1, state.prev_count_r0), (2, 1));
	}

	#[test]
	fn without_hysteresis_nothing_latches() {
		let tracker = ErrorHysteresisTracker::new(false);
		let mut state = ErrorState::default();
		assert_eq!(
			tracker.update(sample(1, 0), &mut state),
			ErrorVerdict::ErrorActive { r1: true, r0: false }
		);
		assert!(!state.is_active());
		assert_eq!(tracker.update(sample(1, 0), &mut state), ErrorVerdict::NoError);
	}
}
