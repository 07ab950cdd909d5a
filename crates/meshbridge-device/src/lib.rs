//! Device Port: the capability boundary between the bridge and a physical or
//! simulated mesh radio.
//!
//! - [`port`]: the `DevicePort` trait, error type, and destination resolution.
//! - [`live`]: serial-backed implementation over a real device.
//! - [`mock`]: scripted or randomized implementation for development/testing.
//! - [`scenarios`]: placeholder substitution for scripted mock playback.

pub mod live;
pub mod mock;
pub mod port;
pub mod scenarios;

pub use port::{DestinationError, DeviceError, DevicePort, DeviceResult};
