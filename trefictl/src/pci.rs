//! PCI configuration space access through sysfs

// Imports
use {
	crate::register::ConfigSpace,
	anyhow::Context,
	byteorder::{ByteOrder, LittleEndian},
	std::{fmt, fs, os::unix::fs::FileExt, path::PathBuf},
};

/// PCI function location
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct PciLocation {
	/// Segment group
	pub group: u16,

	/// Bus
	pub bus: u8,

	/// Device
	pub device: u8,

	/// Function
	pub function: u8,
}

impl PciLocation {
	/// Returns the sysfs path of this function's configuration space
	pub fn sysfs_config_path(&self) -> PathBuf {
		PathBuf::from(format!("/sys/bus/pci/devices/{self}/config"))
	}
}

impl fmt::Display for PciLocation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{:04x}:{:02x}:{:02x}.{:x}",
			self.group, self.bus, self.device, self.function
		)
	}
}

/// Configuration space of a PCI function, accessed through sysfs.
///
/// Offsets past the first 256 bytes require the kernel to expose the
/// extended configuration space, which in turn requires root.
#[derive(Debug)]
pub struct PciConfigSpace {
	/// Location
	location: PciLocation,

	/// Config file
	file: fs::File,
}

impl PciConfigSpace {
	/// Opens the configuration space of the function at `location`
	pub fn open(location: PciLocation) -> Result<Self, anyhow::Error> {
		let path = location.sysfs_config_path();
		let file = fs::OpenOptions::new()
			.read(true)
			.write(true)
			.open(&path)
			.with_context(|| format!("Unable to open PCI configuration space {path:?}"))?;

		Ok(Self { location, file })
	}

	/// Returns the location of this function
	pub fn location(&self) -> PciLocation {
		self.location
	}
}

impl ConfigSpace for PciConfigSpace {
	fn read32(&mut self, offset: u32) -> Result<u32, anyhow::Error> {
		let mut bytes = [0; 4];
		self.file
			.read_exact_at(&mut bytes, u64::from(offset))
			.with_context(|| format!("Unable to read {}@{offset:#x}", self.location))?;

		Ok(LittleEndian::read_u32(&bytes))
	}

	fn write32(&mut self, offset: u32, value: u32) -> Result<(), anyhow::Error> {
		let mut bytes = [0; 4];
		LittleEndian::write_u32(&mut bytes, value);
		self.file
			.write_all_at(&bytes, u64::from(offset))
			.with_context(|| format!("Unable to write {value:#x} to {}@{offset:#x}", self.location))
	}
}
