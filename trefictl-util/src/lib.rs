//! Utilities

// Modules
pub mod logger;

// Imports
use std::{cell::RefCell, fmt};

/// Extension trait for reading bitfields out of raw 32-bit register values
#[extend::ext(name = RegisterBits)]
pub impl u32 {
	/// Returns if bit `idx` is set
	fn bit(self, idx: u32) -> bool {
		(self >> idx) & 0x1 != 0
	}

	/// Returns the `len` bits starting at bit `lsb`, shifted down to bit 0.
	///
	/// `len` must be within `1..=32`.
	fn bits(self, lsb: u32, len: u32) -> u32 {
		(self >> lsb) & (u32::MAX >> (32 - len))
	}
}

/// Displays through a formatting closure, for multi-line reports built on the fly
pub struct DisplayWrapper<F: FnMut(&mut fmt::Formatter) -> fmt::Result>(RefCell<F>);

impl<F: FnMut(&mut fmt::Formatter) -> fmt::Result> DisplayWrapper<F> {
	/// Wraps `func`
	#[must_use]
	pub const fn new(func: F) -> Self {
		Self(RefCell::new(func))
	}
}

impl<F: FnMut(&mut fmt::Formatter) -> fmt::Result> fmt::Display for DisplayWrapper<F> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		// Note: Formatting never re-enters the same wrapper
		self.0.borrow_mut()(f)
	}
}
