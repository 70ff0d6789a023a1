//! # Cathode Heating Control Library
//!
//! Drives cathode heater power supplies toward a target emission current and watches the
//! cathode clamps for overtemperature.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: The serial command channel, the 9014 power supply driver, background
//!   voltage ramps, the temperature sensor capability, and simulated devices.
//! - **`cathode`**: The per-channel control loop (setpoint derivation through the
//!   interpolation models) and the overtemperature safety poll.
//! - **`model`**: The interpolation model contract and a piecewise-linear implementation.
//! - **`config`**: Configuration loaded from TOML and `CATHODE_` environment variables.
//! - **`error`**: Layered error types, from transport faults up to channel-scoped failures.
//! - **`logging`**: `tracing` subscriber setup.

pub mod cathode;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod model;

pub use cathode::{CathodeControlLoop, CathodeEvent, ChannelHardware, ChannelSnapshot};
pub use config::CathodeConfig;
pub use error::{CathodeError, CathodeResult, DriverError, TransportError};
