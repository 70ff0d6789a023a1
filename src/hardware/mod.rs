//! Hardware Layer
//!
//! Serial transport, the 9014 power supply driver, background voltage ramps, the
//! temperature sensor capability, and simulated devices for running without a bench.

pub mod capabilities;
pub mod mock;
pub mod power_supply_9014;
pub mod ramp;
pub mod serial_adapter;

pub use capabilities::TemperatureSensor;
pub use power_supply_9014::{DisplayReading, PowerSupply9014, PresetProgram, RegulationMode};
pub use ramp::{RampController, RampHandle, RampOutcome};
pub use serial_adapter::CommandChannel;
