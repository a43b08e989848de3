//! Register access
//!
//! The control loop only ever sees a channel through [`RegisterPort`].
//! Raw 32-bit configuration-space access lives behind [`ConfigSpace`], so
//! the same channel wiring works over real PCI devices and over an
//! in-memory register file.

// Imports
use {
	anyhow::Context,
	std::collections::HashMap,
	trefictl_util::RegisterBits,
};

/// Mask of the tREFI field in the thermal-control register
pub const TREFI_MASK: u32 = 0x7fff;

/// Register port for a single channel
pub trait RegisterPort {
	/// Reads the channel temperature, in celsius.
	///
	/// This is the low 8 bits of the thermal-control register.
	fn read_temperature(&mut self) -> Result<u8, anyhow::Error>;

	/// Reads the thermal-control register, split into its tREFI field and the remaining bits
	fn read_trefi(&mut self) -> Result<ThermalControl, anyhow::Error>;

	/// Writes `constant_bits | (value & TREFI_MASK)` to the thermal-control register
	fn write_trefi(&mut self, constant_bits: u32, value: u32) -> Result<(), anyhow::Error>;

	/// Reads the raw error-count register
	fn read_error_register(&mut self) -> Result<u32, anyhow::Error>;
}

/// Thermal-control register, split
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct ThermalControl {
	/// Every bit outside of the tREFI field.
	///
	/// Preserved verbatim on every write.
	pub constant_bits: u32,

	/// tREFI field, in memory-clock cycles
	pub trefi: u32,
}

impl ThermalControl {
	/// Splits a raw register value
	pub fn from_raw(raw: u32) -> Self {
		Self {
			constant_bits: raw & !TREFI_MASK,
			trefi:         raw.bits(0, 15),
		}
	}

	/// Joins this register back into a raw value
	pub fn to_raw(self) -> u32 {
		(self.constant_bits & !TREFI_MASK) | (self.trefi & TREFI_MASK)
	}
}

/// Raw 32-bit configuration space
pub trait ConfigSpace {
	/// Reads the register at `offset`
	fn read32(&mut self, offset: u32) -> Result<u32, anyhow::Error>;

	/// Writes `value` to the register at `offset`
	fn write32(&mut self, offset: u32, value: u32) -> Result<(), anyhow::Error>;
}

/// Register offsets within a channel's configuration spaces
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RegisterOffsets {
	/// Temperature register (thermal-control space)
	pub temperature: u32,

	/// tREFI register (thermal-control space)
	pub trefi: u32,

	/// Error count register (error space)
	pub error_count: u32,
}

impl Default for RegisterOffsets {
	fn default() -> Self {
		Self {
			temperature: 0x150,
			trefi:       0x214,
			error_count: 0x104,
		}
	}
}

/// Registers of a single channel, over two configuration spaces
#[derive(Debug)]
pub struct ChannelRegisters<C> {
	/// Thermal-control space
	thermal: C,

	/// Error-count space
	error: C,

	/// Offsets
	offsets: RegisterOffsets,
}

impl<C: ConfigSpace> ChannelRegisters<C> {
	/// Creates the channel registers
	pub fn new(thermal: C, error: C, offsets: RegisterOffsets) -> Self {
		Self {
			thermal,
			error,
			offsets,
		}
	}

	/// Returns the thermal-control space
	pub fn thermal(&self) -> &C {
		&self.thermal
	}

	/// Returns the thermal-control space, mutably
	pub fn thermal_mut(&mut self) -> &mut C {
		&mut self.thermal
	}

	/// Returns the error-count space, mutably
	pub fn error_mut(&mut self) -> &mut C {
		&mut self.error
	}
}

impl<C: ConfigSpace> RegisterPort for ChannelRegisters<C> {
	fn read_temperature(&mut self) -> Result<u8, anyhow::Error> {
		let raw = self
			.thermal
			.read32(self.offsets.temperature)
			.context("Unable to read temperature register")?;
		tracing::trace!(raw = format_args!("{raw:#x}"), "Read temperature register");

		Ok(raw.bits(0, 8) as u8)
	}

	fn read_trefi(&mut self) -> Result<ThermalControl, anyhow::Error> {
		let raw = self
			.thermal
			.read32(self.offsets.trefi)
			.context("Unable to read tREFI register")?;
		tracing::trace!(raw = format_args!("{raw:#x}"), "Read tREFI register");

		Ok(ThermalControl::from_raw(raw))
	}

	fn write_trefi(&mut self, constant_bits: u32, value: u32) -> Result<(), anyhow::Error> {
		let raw = ThermalControl {
			constant_bits,
			trefi: value,
		}
		.to_raw();
		tracing::trace!(raw = format_args!("{raw:#x}"), "Writing tREFI register");

		self.thermal
			.write32(self.offsets.trefi, raw)
			.context("Unable to write tREFI register")
	}

	fn read_error_register(&mut self) -> Result<u32, anyhow::Error> {
		let raw = self
			.error
			.read32(self.offsets.error_count)
			.context("Unable to read error count register")?;
		tracing::trace!(raw = format_args!("{raw:#x}"), "Read error count register");

		Ok(raw)
	}
}

/// In-memory configuration space.
///
/// Unwritten registers read as `0`.
#[derive(Clone, Default, Debug)]
pub struct MemoryConfigSpace {
	/// Registers, by offset
	registers: HashMap<u32, u32>,
}

impl MemoryConfigSpace {
	/// Creates an empty configuration space
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the register at `offset`
	pub fn get(&self, offset: u32) -> u32 {
		self.registers.get(&offset).copied().unwrap_or(0)
	}

	/// Sets the register at `offset`
	pub fn set(&mut self, offset: u32, value: u32) {
		self.registers.insert(offset, value);
	}
}

impl ConfigSpace for MemoryConfigSpace {
	fn read32(&mut self, offset: u32) -> Result<u32, anyhow::Error> {
		Ok(self.get(offset))
	}

	fn write32(&mut self, offset: u32, value: u32) -> Result<(), anyhow::Error> {
		self.set(offset, value);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn channel() -> ChannelRegisters<MemoryConfigSpace> {
		ChannelRegisters::new(
			MemoryConfigSpace::new(),
			MemoryConfigSpace::new(),
			RegisterOffsets::default(),
		)
	}

	#[test]
	fn thermal_control_split() {
		let reg = ThermalControl::from_raw(0xdead_9c70);
		assert_eq!(reg.constant_bits, 0xdead_8000);
		assert_eq!(reg.trefi, 0x1c70);
		assert_eq!(reg.to_raw(), 0xdead_9c70);
	}

	#[test]
	fn temperature_is_low_byte() {
		let mut regs = channel();
		regs.thermal_mut().set(0x150, 0x1234_5619);
		assert_eq!(regs.read_temperature().unwrap(), 0x19);
	}

	#[test]
	fn write_preserves_constant_bits() {
		let mut regs = channel();
		regs.thermal_mut().set(0x214, 0xabcd_8123);

		let reg = regs.read_trefi().unwrap();
		regs.write_trefi(reg.constant_bits, 0xffff_1c70).unwrap();

		// Note: Bits above the field in `value` must not leak into the constant bits
		assert_eq!(regs.thermal_mut().get(0x214), 0xabcd_9c70);
	}

	#[test]
	fn error_register_uses_error_space() {
		let mut regs = channel();
		regs.error_mut().set(0x104, 0x8000_0001);
		regs.thermal_mut().set(0x104, 0x1);
		assert_eq!(regs.read_error_register().unwrap(), 0x8000_0001);
	}
}
