//! 9014 Programmable DC Power Supply Driver
//!
//! Protocol Overview:
//! - Format: fixed ASCII commands (NOT SCPI), CR-terminated
//! - Baud: 9600, 8N1, no flow control
//! - Every "set" command is acknowledged with the literal `OK`
//! - Voltages and currents travel as unsigned 4-digit hundredths (`0500` = 5.00)
//!
//! | Command | Meaning |
//! |---|---|
//! | `SOUT{0\|1}` / `GOUT` | output off/on, query |
//! | `VOLT {preset}{vvvv}` / `CURR {preset}{iiii}` | preset voltage/current |
//! | `SOVP{vvvv}` / `SOCP{iiii}` / `GOVP` / `GOCP` | protection limits |
//! | `GETD` | display readout, 11 characters `VVVVVCCCCCM` |
//! | `SETD{preset}{vvvv}{iiii}` / `GETS{preset}` | preset configuration |
//! | `GABC` / `SABC{preset}` | preset selection |
//! | `GDLT{index}` / `SDLT{index}{dd}` | delta time |
//! | `GSWT` / `SSWT{ddd}` | sweep time |
//! | `RUNP{first}{end}` / `STOP` | sweep run/stop |
//! | `SESS` / `ENDS` | keyboard lock/unlock |
//! | `GALL` | dump all settings |
//! | `SETM...` | program three presets at once |
//!
//! A rejected or unanswered command is always reported as a [`DriverError`] and logged;
//! nothing is retried here. Callers must not assume the device changed state unless the
//! call returned `Ok`.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::error::{DisplayDecodeError, DriverError};
use crate::hardware::serial_adapter::CommandChannel;

/// Literal acknowledgement token for accepted commands.
pub const ACK: &str = "OK";

/// Largest magnitude representable in a 4-digit hundredths field.
pub const MAX_SETPOINT: f64 = 99.99;

/// Length of the `GETD` display payload.
pub const DISPLAY_PAYLOAD_LEN: usize = 11;

const PRESET_SLOTS: usize = 10;

/// Encode a magnitude as an unsigned, zero-padded, 4-digit hundredths field.
///
/// `5.0` becomes `"0500"`. Negative, non-finite and values above 99.99 are rejected.
pub fn encode_hundredths(what: &'static str, value: f64) -> Result<String, DriverError> {
    if !value.is_finite() || value < 0.0 {
        return Err(DriverError::Encode { what, value });
    }
    let hundredths = (value * 100.0).round();
    if hundredths > 9999.0 {
        return Err(DriverError::Encode { what, value });
    }
    Ok(format!("{:04}", hundredths as u32))
}

/// Inverse of [`encode_hundredths`]. Returns `None` unless the field is exactly 4 digits.
pub fn decode_hundredths(field: &str) -> Option<f64> {
    if field.len() != 4 || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse::<u32>().ok().map(|n| f64::from(n) / 100.0)
}

fn check_digit(preset: u8) -> Result<u8, DriverError> {
    if preset > 9 {
        Err(DriverError::InvalidPreset(preset))
    } else {
        Ok(preset)
    }
}

/// Output regulation mode reported in the last `GETD` character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegulationMode {
    /// Constant voltage
    ConstantVoltage,
    /// Constant current
    ConstantCurrent,
    /// The reading could not be obtained or decoded
    Err,
}

impl fmt::Display for RegulationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegulationMode::ConstantVoltage => write!(f, "CV Mode"),
            RegulationMode::ConstantCurrent => write!(f, "CC Mode"),
            RegulationMode::Err => write!(f, "Err"),
        }
    }
}

/// Decoded front-panel readout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DisplayReading {
    /// Output voltage in V
    pub voltage_v: f64,
    /// Output current in A
    pub current_a: f64,
    /// Regulation mode
    pub mode: RegulationMode,
}

impl DisplayReading {
    /// Sentinel returned when the readout failed: `(0.0, 0.0, Err)`.
    pub fn error() -> Self {
        Self {
            voltage_v: 0.0,
            current_a: 0.0,
            mode: RegulationMode::Err,
        }
    }

    /// True for the [`error`](Self::error) sentinel.
    pub fn is_error(&self) -> bool {
        self.mode == RegulationMode::Err
    }

    /// Strictly decode an 11-character `VVVVVCCCCCM` payload.
    ///
    /// Characters 0-4 are millivolts, 5-9 milliamps, and 10 is the mode flag
    /// (`'0'` constant voltage, any other digit constant current).
    pub fn decode(payload: &str) -> Result<Self, DisplayDecodeError> {
        let payload = payload.trim();
        if payload.len() != DISPLAY_PAYLOAD_LEN {
            return Err(DisplayDecodeError::Length(payload.chars().count()));
        }
        if !payload.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DisplayDecodeError::NonNumeric(payload.to_string()));
        }

        let field = |range: std::ops::Range<usize>| -> Result<f64, DisplayDecodeError> {
            payload[range]
                .parse::<u32>()
                .map(|n| f64::from(n) / 1000.0)
                .map_err(|_| DisplayDecodeError::NonNumeric(payload.to_string()))
        };

        let mode = if &payload[10..11] == "0" {
            RegulationMode::ConstantVoltage
        } else {
            RegulationMode::ConstantCurrent
        };

        Ok(Self {
            voltage_v: field(0..5)?,
            current_a: field(5..10)?,
            mode,
        })
    }
}

/// One preset slot for [`PowerSupply9014::configure_presets`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresetProgram {
    /// Voltage in V
    pub voltage_v: f64,
    /// Current in A
    pub current_a: f64,
    /// Sweep dwell time in seconds (0-999)
    pub sweep_time_s: u16,
}

/// Typed operations over the 9014 ASCII command set.
pub struct PowerSupply9014 {
    channel: CommandChannel,
    // Last acknowledged VOLT setpoint per preset
    last_voltage: Mutex<[Option<f64>; PRESET_SLOTS]>,
}

impl fmt::Debug for PowerSupply9014 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerSupply9014")
            .field("channel", &self.channel)
            .finish()
    }
}

impl PowerSupply9014 {
    /// Wrap an open command channel.
    pub fn new(channel: CommandChannel) -> Self {
        Self {
            channel,
            last_voltage: Mutex::new([None; PRESET_SLOTS]),
        }
    }

    /// Underlying transport.
    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    /// Last voltage the device acknowledged for `preset`, if any.
    pub fn last_commanded_voltage(&self, preset: u8) -> Option<f64> {
        self.last_voltage
            .lock()
            .get(preset as usize)
            .copied()
            .flatten()
    }

    /// Send a command and return the raw response.
    pub async fn query(&self, command: &str) -> Result<String, DriverError> {
        self.channel.send(command).await.map_err(|e| {
            error!(port = self.channel.port_name(), command, error = %e, "Command failed");
            DriverError::from(e)
        })
    }

    /// Send a command that must be answered with [`ACK`].
    async fn expect_ack(&self, command: &str) -> Result<(), DriverError> {
        let response = self.query(command).await?;
        if response.trim() == ACK {
            debug!(port = self.channel.port_name(), command, "Acknowledged");
            Ok(())
        } else {
            error!(
                port = self.channel.port_name(),
                command,
                response = %response,
                "Command not acknowledged"
            );
            Err(DriverError::Nacked {
                command: command.to_string(),
                response,
            })
        }
    }

    /// Switch the output on or off (`SOUT1` / `SOUT0`).
    pub async fn set_output(&self, enabled: bool) -> Result<(), DriverError> {
        self.expect_ack(&format!("SOUT{}", u8::from(enabled))).await
    }

    /// Raw output status (`GOUT`).
    pub async fn get_output_status(&self) -> Result<String, DriverError> {
        self.query("GOUT").await
    }

    /// Set the voltage of `preset` (`VOLT {preset}{vvvv}`).
    #[instrument(skip(self), fields(port = self.channel.port_name()), level = "debug")]
    pub async fn set_voltage(&self, preset: u8, volts: f64) -> Result<(), DriverError> {
        let preset = check_digit(preset)?;
        let field = encode_hundredths("voltage", volts)?;
        self.expect_ack(&format!("VOLT {}{}", preset, field)).await?;
        self.last_voltage.lock()[preset as usize] = Some(volts);
        Ok(())
    }

    /// Set the current of `preset` (`CURR {preset}{iiii}`).
    #[instrument(skip(self), fields(port = self.channel.port_name()), level = "debug")]
    pub async fn set_current(&self, preset: u8, amps: f64) -> Result<(), DriverError> {
        let preset = check_digit(preset)?;
        let field = encode_hundredths("current", amps)?;
        self.expect_ack(&format!("CURR {}{}", preset, field)).await
    }

    /// Set the overvoltage protection limit (`SOVP{vvvv}`).
    pub async fn set_over_voltage_protection(&self, volts: f64) -> Result<(), DriverError> {
        let field = encode_hundredths("overvoltage limit", volts)?;
        self.expect_ack(&format!("SOVP{}", field)).await
    }

    /// Set the overcurrent protection limit (`SOCP{iiii}`).
    pub async fn set_over_current_protection(&self, amps: f64) -> Result<(), DriverError> {
        let field = encode_hundredths("overcurrent limit", amps)?;
        self.expect_ack(&format!("SOCP{}", field)).await
    }

    /// Raw overvoltage protection limit (`GOVP`).
    pub async fn get_over_voltage_protection(&self) -> Result<String, DriverError> {
        self.query("GOVP").await
    }

    /// Raw overcurrent protection limit (`GOCP`).
    pub async fn get_over_current_protection(&self) -> Result<String, DriverError> {
        self.query("GOCP").await
    }

    /// Raw display payload (`GETD`).
    pub async fn get_display_readings(&self) -> Result<String, DriverError> {
        self.query("GETD").await
    }

    /// Decoded display readout.
    ///
    /// Fails closed: a transport fault or a malformed payload is logged and yields
    /// [`DisplayReading::error`].
    pub async fn get_voltage_current_mode(&self) -> DisplayReading {
        let payload = match self.get_display_readings().await {
            Ok(payload) => payload,
            Err(_) => return DisplayReading::error(),
        };
        match DisplayReading::decode(&payload) {
            Ok(reading) => reading,
            Err(e) => {
                error!(
                    port = self.channel.port_name(),
                    payload = %payload,
                    error = %e,
                    "Failed to decode display readings"
                );
                DisplayReading::error()
            }
        }
    }

    /// Store voltage and current into a preset (`SETD{preset}{vvvv}{iiii}`).
    pub async fn set_preset(&self, preset: u8, volts: f64, amps: f64) -> Result<(), DriverError> {
        let preset = check_digit(preset)?;
        let v = encode_hundredths("voltage", volts)?;
        let i = encode_hundredths("current", amps)?;
        self.expect_ack(&format!("SETD{}{}{}", preset, v, i)).await
    }

    /// Raw settings of a preset (`GETS{preset}`).
    pub async fn get_settings(&self, preset: u8) -> Result<String, DriverError> {
        let preset = check_digit(preset)?;
        self.query(&format!("GETS{}", preset)).await
    }

    /// Raw active preset selection (`GABC`).
    pub async fn get_preset_selection(&self) -> Result<String, DriverError> {
        self.query("GABC").await
    }

    /// Select the active preset (`SABC{preset}`).
    pub async fn set_preset_selection(&self, preset: u8) -> Result<(), DriverError> {
        let preset = check_digit(preset)?;
        self.expect_ack(&format!("SABC{}", preset)).await
    }

    /// Raw delta time (`GDLT{index}`).
    pub async fn get_delta_time(&self, index: u8) -> Result<String, DriverError> {
        let index = check_digit(index)?;
        self.query(&format!("GDLT{}", index)).await
    }

    /// Set delta time in seconds, 0-99 (`SDLT{index}{dd}`).
    pub async fn set_delta_time(&self, index: u8, seconds: u8) -> Result<(), DriverError> {
        let index = check_digit(index)?;
        if seconds > 99 {
            return Err(DriverError::InvalidField {
                what: "delta time",
                value: u32::from(seconds),
            });
        }
        self.expect_ack(&format!("SDLT{}{:02}", index, seconds)).await
    }

    /// Raw sweep time (`GSWT`).
    pub async fn get_sweep_time(&self) -> Result<String, DriverError> {
        self.query("GSWT").await
    }

    /// Set sweep time in seconds, 0-999 (`SSWT{ddd}`).
    pub async fn set_sweep_time(&self, seconds: u16) -> Result<(), DriverError> {
        if seconds > 999 {
            return Err(DriverError::InvalidField {
                what: "sweep time",
                value: u32::from(seconds),
            });
        }
        self.expect_ack(&format!("SSWT{:03}", seconds)).await
    }

    /// Sweep from preset `first` to preset `end` (`RUNP{first}{end}`).
    pub async fn run_sweep(&self, first: u8, end: u8) -> Result<(), DriverError> {
        let first = check_digit(first)?;
        let end = check_digit(end)?;
        self.expect_ack(&format!("RUNP{}{}", first, end)).await
    }

    /// Stop a running sweep (`STOP`).
    pub async fn stop_sweep(&self) -> Result<(), DriverError> {
        self.expect_ack("STOP").await
    }

    /// Lock the front-panel keyboard (`SESS`).
    pub async fn disable_keyboard(&self) -> Result<(), DriverError> {
        self.expect_ack("SESS").await
    }

    /// Unlock the front-panel keyboard (`ENDS`).
    pub async fn enable_keyboard(&self) -> Result<(), DriverError> {
        self.expect_ack("ENDS").await
    }

    /// Raw dump of every setting (`GALL`).
    pub async fn get_all_information(&self) -> Result<String, DriverError> {
        self.query("GALL").await
    }

    /// Program three presets in one command (`SETM`).
    pub async fn configure_presets(&self, presets: &[PresetProgram; 3]) -> Result<(), DriverError> {
        let mut command = String::from("SETM");
        for preset in presets {
            if preset.sweep_time_s > 999 {
                return Err(DriverError::InvalidField {
                    what: "sweep time",
                    value: u32::from(preset.sweep_time_s),
                });
            }
            command.push_str(&encode_hundredths("voltage", preset.voltage_v)?);
            command.push_str(&encode_hundredths("current", preset.current_a)?);
            command.push_str(&format!("{:03}", preset.sweep_time_s));
        }
        self.expect_ack(&command).await
    }

    /// Release the serial port. The driver is unusable afterwards.
    pub async fn close(&self) {
        self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_hundredths() {
        assert_eq!(encode_hundredths("voltage", 5.0).unwrap(), "0500");
        assert_eq!(encode_hundredths("voltage", 0.0).unwrap(), "0000");
        assert_eq!(encode_hundredths("voltage", 99.99).unwrap(), "9999");
        assert_eq!(encode_hundredths("current", 3.004).unwrap(), "0300");
        assert_eq!(encode_hundredths("current", 0.999).unwrap(), "0100");
    }

    #[test]
    fn rejects_unrepresentable_values() {
        assert!(encode_hundredths("voltage", 100.0).is_err());
        assert!(encode_hundredths("voltage", -0.5).is_err());
        assert!(encode_hundredths("voltage", f64::NAN).is_err());
        assert!(encode_hundredths("voltage", f64::INFINITY).is_err());
    }

    #[test]
    fn hundredths_round_trip_within_resolution() {
        for n in 0..=9999u32 {
            let volts = f64::from(n) / 100.0;
            let field = encode_hundredths("voltage", volts).unwrap();
            let back = decode_hundredths(&field).unwrap();
            assert!((back - volts).abs() <= 0.01, "{volts} -> {field} -> {back}");
        }
        assert!(decode_hundredths("050").is_none());
        assert!(decode_hundredths("05a0").is_none());
    }

    #[test]
    fn decodes_display_payload() {
        let reading = DisplayReading::decode("05000010000").unwrap();
        assert_eq!(reading.voltage_v, 5.0);
        assert_eq!(reading.current_a, 1.0);
        assert_eq!(reading.mode, RegulationMode::ConstantVoltage);

        let cc = DisplayReading::decode("12345006781\r\n").unwrap();
        assert_eq!(cc.voltage_v, 12.345);
        assert_eq!(cc.current_a, 0.678);
        assert_eq!(cc.mode, RegulationMode::ConstantCurrent);
        assert_eq!(cc.mode.to_string(), "CC Mode");
    }

    #[test]
    fn display_decode_fails_closed() {
        assert_eq!(
            DisplayReading::decode("050001000"),
            Err(DisplayDecodeError::Length(9))
        );
        assert_eq!(
            DisplayReading::decode("050001000OK").unwrap_err(),
            DisplayDecodeError::NonNumeric("050001000OK".to_string())
        );
        assert!(DisplayReading::decode("").is_err());
        assert!(DisplayReading::decode("0500-010000").is_err());
    }

    #[test]
    fn error_sentinel() {
        let sentinel = DisplayReading::error();
        assert!(sentinel.is_error());
        assert_eq!(
            (sentinel.voltage_v, sentinel.current_a, sentinel.mode.to_string()),
            (0.0, 0.0, "Err".to_string())
        );
    }

    #[tokio::test]
    async fn mock_placeholder_is_not_an_acknowledgement() {
        let psu = PowerSupply9014::new(CommandChannel::mock("COM1"));
        let err = psu.set_voltage(1, 5.0).await.unwrap_err();
        match err {
            DriverError::Nacked { command, response } => {
                assert_eq!(command, "VOLT 10500");
                assert_eq!(response, "Mock response based on VOLT 10500");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(psu.last_commanded_voltage(1), None);
        assert!(psu.get_voltage_current_mode().await.is_error());
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_the_port() {
        let psu = PowerSupply9014::new(CommandChannel::mock("COM1"));
        assert!(matches!(
            psu.set_voltage(12, 1.0).await,
            Err(DriverError::InvalidPreset(12))
        ));
        assert!(matches!(
            psu.set_delta_time(1, 100).await,
            Err(DriverError::InvalidField { .. })
        ));
        assert!(matches!(
            psu.set_sweep_time(1000).await,
            Err(DriverError::InvalidField { .. })
        ));
        assert!(matches!(
            psu.set_current(1, 120.0).await,
            Err(DriverError::Encode { .. })
        ));
    }
}
