//! Adaptive DRAM refresh interval controller (`trefictl`)
//!
//! Polls per-channel error counters and temperatures and tunes each
//! channel's tREFI, optionally backing off when bandwidth spikes.

// Modules
pub mod bandwidth;
pub mod ceiling;
pub mod channel;
pub mod controller;
pub mod error_tracker;
pub mod pci;
pub mod register;
pub mod scheduler;

// Exports
pub use self::{
	bandwidth::{BandwidthAnomalyDetector, BandwidthSampler, ChannelBandwidth},
	ceiling::TemperatureCeiling,
	channel::{Channel, ChannelIdx},
	controller::{RefreshIntervalController, TrefiState},
	error_tracker::{ErrorHysteresisTracker, ErrorSample, ErrorState, ErrorVerdict},
	register::{ChannelRegisters, ConfigSpace, RegisterPort},
	scheduler::Scheduler,
};
