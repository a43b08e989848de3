//! Memory channels

// Imports
use {
	crate::{controller::TrefiState, error_tracker::ErrorState, register::RegisterPort},
	anyhow::Context,
	std::fmt,
};

/// Channel index
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Debug)]
pub struct ChannelIdx(usize);

impl ChannelIdx {
	/// Creates a channel index
	pub fn new(idx: usize) -> Self {
		Self(idx)
	}

	/// Returns this index as a `usize`
	pub fn to_usize(self) -> usize {
		self.0
	}
}

impl fmt::Display for ChannelIdx {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// Note: Channels are lettered `A`, `B`, ..., falling back to numbers past `Z`
		match u8::try_from(self.0) {
			Ok(idx @ 0..=25) => write!(f, "{}", char::from(b'A' + idx)),
			_ => write!(f, "#{}", self.0),
		}
	}
}

/// Memory channel.
///
/// Owns its register port along with all state kept across ticks.
#[derive(Debug)]
pub struct Channel<P> {
	/// Index
	idx: ChannelIdx,

	/// Register port
	pub(crate) port: P,

	/// Error state
	pub(crate) errors: ErrorState,

	/// tREFI state
	pub(crate) trefi: TrefiState,

	/// Whether a bandwidth reset is waiting for this channel's next tick
	pub(crate) pending_reset: bool,

	/// Last temperature read, if any
	pub(crate) last_temperature: Option<u8>,

	/// Last ceiling applied, if any
	pub(crate) last_ceiling: Option<u32>,
}

impl<P: RegisterPort> Channel<P> {
	/// Initializes a channel.
	///
	/// Captures the constant bits of the thermal-control register and
	/// writes `base_trefi` as the starting interval.
	pub fn init(idx: ChannelIdx, mut port: P, base_trefi: u32) -> Result<Self, anyhow::Error> {
		let reg = port
			.read_trefi()
			.with_context(|| format!("Unable to read initial tREFI of channel {idx}"))?;
		port.write_trefi(reg.constant_bits, base_trefi)
			.with_context(|| format!("Unable to write initial tREFI of channel {idx}"))?;
		tracing::info!(
			%idx,
			prev_trefi = reg.trefi,
			base_trefi,
			constant_bits = format_args!("{:#x}", reg.constant_bits),
			"Initialized channel"
		);

		Ok(Self {
			idx,
			port,
			errors: ErrorState::default(),
			trefi: TrefiState {
				current:       base_trefi,
				constant_bits: reg.constant_bits,
			},
			pending_reset: false,
			last_temperature: None,
			last_ceiling: None,
		})
	}
}

impl<P> Channel<P> {
	/// Returns this channel's index
	pub fn idx(&self) -> ChannelIdx {
		self.idx
	}

	/// Returns the register port
	pub fn port(&self) -> &P {
		&self.port
	}

	/// Returns the register port, mutably
	pub fn port_mut(&mut self) -> &mut P {
		&mut self.port
	}

	/// Returns the error state
	pub fn errors(&self) -> &ErrorState {
		&self.errors
	}

	/// Returns the tREFI state
	pub fn trefi(&self) -> &TrefiState {
		&self.trefi
	}

	/// Returns if a bandwidth reset is pending
	pub fn has_pending_reset(&self) -> bool {
		self.pending_reset
	}

	/// Returns the last temperature read
	pub fn last_temperature(&self) -> Option<u8> {
		self.last_temperature
	}

	/// Returns the last ceiling applied
	pub fn last_ceiling(&self) -> Option<u32> {
		self.last_ceiling
	}
}
