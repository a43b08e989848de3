//! Refresh interval controller

// Imports
use {
	crate::{error_tracker::ErrorVerdict, register::RegisterPort},
	anyhow::Context,
};

/// Per-channel tREFI state
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct TrefiState {
	/// Current tREFI, in memory-clock cycles
	pub current: u32,

	/// Non-tREFI bits of the thermal-control register, captured at startup
	pub constant_bits: u32,
}

/// Refresh interval controller.
///
/// Grows the interval slowly while the channel is quiet and shrinks it by
/// twice the decrement step whenever an error is, or was just, active.
#[derive(Clone, Copy, Debug)]
pub struct RefreshIntervalController {
	/// Base tREFI
	base_trefi: u32,

	/// Increment step
	step_inc: u32,

	/// Decrement step.
	///
	/// Each error tick subtracts twice this.
	step_dec: u32,
}

impl RefreshIntervalController {
	/// Creates a new controller
	pub fn new(base_trefi: u32, step_inc: u32, step_dec: u32) -> Self {
		Self {
			base_trefi,
			step_inc,
			step_dec,
		}
	}

	/// Returns the base tREFI
	pub fn base_trefi(&self) -> u32 {
		self.base_trefi
	}

	/// Returns the hard floor, half of the base tREFI (rounded up)
	pub fn floor(&self) -> u32 {
		self.base_trefi.div_ceil(2)
	}

	/// Computes the next tREFI from `current`.
	///
	/// The result is always within `floor()..=ceiling`, provided the floor
	/// doesn't exceed `ceiling`.
	pub fn adjust(&self, verdict: ErrorVerdict, ceiling: u32, reset: bool, current: u32) -> u32 {
		let next = match (reset, verdict) {
			// Bandwidth spike, back off immediately
			(true, _) => current / 2,

			(false, ErrorVerdict::NoError) => match current < ceiling.saturating_sub(self.step_inc) {
				true => current + self.step_inc,
				false => ceiling,
			},

			(false, ErrorVerdict::ErrorActive { .. } | ErrorVerdict::ErrorClearing { .. }) =>
				current.saturating_sub(2 * self.step_dec),
		};

		next.min(ceiling).max(self.floor())
	}

	/// Adjusts `state` and commits the new tREFI through `port`.
	///
	/// Returns the committed value.
	pub fn step<P: RegisterPort>(
		&self,
		port: &mut P,
		verdict: ErrorVerdict,
		ceiling: u32,
		reset: bool,
		state: &mut TrefiState,
	) -> Result<u32, anyhow::Error> {
		let next = self.adjust(verdict, ceiling, reset, state.current);
		port.write_trefi(state.constant_bits, next)
			.context("Unable to commit tREFI")?;
		state.current = next;

		Ok(next)
	}
}
