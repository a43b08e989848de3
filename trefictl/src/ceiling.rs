//! Temperature-derived tREFI ceiling
//!
//! Hotter DRAM leaks charge faster, so the longest allowed refresh interval
//! shrinks linearly as temperature rises.

// Imports
use crate::register::TREFI_MASK;

/// Temperature ceiling
#[derive(PartialEq, Clone, Copy, Debug)]
pub enum TemperatureCeiling {
	/// `offset - slope * temp`, with `temp` clamped to `MIN_TEMP..=MAX_TEMP`
	Linear { slope: f64, offset: f64 },

	/// Constant ceiling, regardless of temperature
	Fixed(u32),
}

impl TemperatureCeiling {
	/// Coldest temperature the linear ceiling distinguishes
	pub const MIN_TEMP: u8 = 5;
	/// Hottest temperature the linear ceiling distinguishes
	pub const MAX_TEMP: u8 = 85;

	/// Ceiling at `MIN_TEMP`, as a multiple of the base tREFI
	pub const COLD_FACTOR: f64 = 4.5;
	/// Ceiling at `MAX_TEMP`, as a multiple of the base tREFI
	pub const HOT_FACTOR: f64 = 2.0;

	/// Derives the linear slope and offset from `base_trefi`.
	///
	/// Returns `(slope, offset)` such that the ceiling is `COLD_FACTOR * base_trefi`
	/// at `MIN_TEMP` and `HOT_FACTOR * base_trefi` at `MAX_TEMP`.
	pub fn slope_offset(base_trefi: u32) -> (f64, f64) {
		let base = f64::from(base_trefi);
		let temp_span = f64::from(Self::MAX_TEMP - Self::MIN_TEMP);
		let slope = (Self::COLD_FACTOR - Self::HOT_FACTOR) * base / temp_span;
		let offset = Self::COLD_FACTOR * base + slope * f64::from(Self::MIN_TEMP);

		(slope, offset)
	}

	/// Creates the linear ceiling derived from `base_trefi`
	pub fn from_base_trefi(base_trefi: u32) -> Self {
		let (slope, offset) = Self::slope_offset(base_trefi);
		Self::Linear { slope, offset }
	}

	/// Returns the maximum allowed tREFI at `temp_celsius`.
	///
	/// Never exceeds the width of the tREFI field.
	pub fn ceiling(&self, temp_celsius: u8) -> u32 {
		match *self {
			Self::Linear { slope, offset } => {
				let temp = temp_celsius.clamp(Self::MIN_TEMP, Self::MAX_TEMP);
				let ceiling = offset - slope * f64::from(temp);

				// Note: `as` saturates, but we also want to stay within the field
				ceiling.clamp(0.0, f64::from(TREFI_MASK)) as u32
			},
			Self::Fixed(ceiling) => ceiling.min(TREFI_MASK),
		}
	}

	/// Returns the lowest ceiling this can produce
	pub fn min_ceiling(&self) -> u32 {
		match self {
			Self::Linear { slope, .. } if *slope < 0.0 => self.ceiling(Self::MIN_TEMP),
			_ => self.ceiling(Self::MAX_TEMP),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn endpoints_follow_base() {
		let ceiling = TemperatureCeiling::from_base_trefi(7280);
		assert_eq!(ceiling.ceiling(5), 32760);
		assert_eq!(ceiling.ceiling(85), 14560);
		assert_eq!(ceiling.ceiling(25), 28210);
	}

	#[test]
	fn temperature_is_clamped() {
		let ceiling = TemperatureCeiling::from_base_trefi(7280);
		assert_eq!(ceiling.ceiling(0), ceiling.ceiling(5));
		assert_eq!(ceiling.ceiling(120), ceiling.ceiling(85));
		assert_eq!(ceiling.ceiling(u8::MAX), ceiling.ceiling(85));
	}

	#[test]
	fn monotonic_in_temperature() {
		for base in [3900, 7280, 7282] {
			let ceiling = TemperatureCeiling::from_base_trefi(base);
			for temp in 5..85 {
				assert!(
					ceiling.ceiling(temp) >= ceiling.ceiling(temp + 1),
					"Ceiling grew from {temp} to {}, base {base}",
					temp + 1
				);
			}
		}
	}

	#[test]
	fn never_exceeds_field() {
		let ceiling = TemperatureCeiling::from_base_trefi(0x7fff);
		assert_eq!(ceiling.ceiling(5), TREFI_MASK);
		assert_eq!(TemperatureCeiling::Fixed(u32::MAX).ceiling(40), TREFI_MASK);
	}

	#[test]
	fn fixed_ignores_temperature() {
		let ceiling = TemperatureCeiling::Fixed(0x71c0);
		assert_eq!(ceiling.ceiling(5), 0x71c0);
		assert_eq!(ceiling.ceiling(95), 0x71c0);
		assert_eq!(ceiling.min_ceiling(), 0x71c0);
	}
}
