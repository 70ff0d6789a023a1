//! Hardware capabilities consumed by the control loop.
//!
//! The temperature-controller bus driver lives outside this crate; the control loop only
//! needs the two operations below. Implementations must be thread-safe and must not block
//! the runtime (use `spawn_blocking` for synchronous bus access).

use anyhow::Result;
use async_trait::async_trait;

/// Capability: Temperature Readout
///
/// One sensor per cathode clamp.
///
/// # Contract
/// - `read_temperature` returns `None` when no valid reading could be obtained; the
///   safety poll treats that as "no new sample", never as a safe temperature.
/// - `perform_echoback_test` runs the bus round-trip diagnostic and returns its
///   human-readable result.
#[async_trait]
pub trait TemperatureSensor: Send + Sync {
    /// Read the current temperature in °C.
    async fn read_temperature(&self) -> Option<f64>;

    /// Run the echoback diagnostic against the controller.
    async fn perform_echoback_test(&self) -> Result<String>;
}
