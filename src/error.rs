//! Error types for the cathode heating subsystem.
//!
//! Errors are layered the same way the hardware stack is:
//!
//! - **`TransportError`**: the serial line itself failed (no response within the timeout,
//!   an I/O fault, or the port was closed). Nothing can be assumed about device state.
//! - **`DriverError`**: the power supply protocol layer. An acknowledged command is `Ok(())`;
//!   a reply other than `OK` is `Nacked`, and a transport fault is wrapped as `Transport`.
//!   Values that cannot be represented in the fixed-width command fields are rejected
//!   before anything is written to the port.
//! - **`DisplayDecodeError`**: the fixed-width `GETD` payload did not validate.
//! - **`ModelError`**: an input fell outside a fitted interpolation curve.
//! - **`CathodeError`**: channel-scoped failures surfaced by the control loop.
//!
//! Every error is channel-scoped. None of them is fatal to the process.

use thiserror::Error;

/// Convenience alias for control-loop results.
pub type CathodeResult<T> = std::result::Result<T, CathodeError>;

/// Failure of a single request/response exchange on a `CommandChannel`.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No response received for command '{command}'")]
    NoResponse { command: String },

    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command channel is closed")]
    Closed,
}

/// Failure of a typed power supply operation.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Command '{command}' not acknowledged: '{response}'")]
    Nacked { command: String, response: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{what} value {value} cannot be encoded in the command field")]
    Encode { what: &'static str, value: f64 },

    #[error("Preset {0} is not a single-digit preset index")]
    InvalidPreset(u8),

    #[error("{what} value {value} is outside the accepted range")]
    InvalidField { what: &'static str, value: u32 },
}

impl DriverError {
    /// True when the device never answered, as opposed to answering with a refusal.
    pub fn is_transport(&self) -> bool {
        matches!(self, DriverError::Transport(_))
    }
}

/// Strict decode failure for the 11-character `GETD` display payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisplayDecodeError {
    #[error("Display payload must be 11 characters, got {0}")]
    Length(usize),

    #[error("Display payload '{0}' contains non-numeric fields")]
    NonNumeric(String),
}

/// Interpolation domain and data faults.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Value {value} is outside the fitted range [{min}, {max}]")]
    OutOfDomain { value: f64, min: f64, max: f64 },

    #[error("Invalid model data: {0}")]
    InvalidData(String),
}

/// Channel-scoped failures surfaced by the cathode control loop.
#[derive(Error, Debug)]
pub enum CathodeError {
    #[error("Unknown cathode channel {0}")]
    UnknownChannel(usize),

    #[error("Disable the output of cathode {0} before setting a new target current")]
    OutputEnabled(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No power supply attached to cathode {0}")]
    SupplyNotConnected(String),

    #[error("Temperature controller unit {0} is not connected or initialized")]
    SensorNotConnected(usize),

    #[error("Temperature sensor error: {0}")]
    Sensor(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_distinguished_from_nacks() {
        let nack = DriverError::Nacked {
            command: "VOLT 10500".into(),
            response: "ERR".into(),
        };
        assert!(!nack.is_transport());

        let timeout: DriverError = TransportError::NoResponse {
            command: "GETD".into(),
        }
        .into();
        assert!(timeout.is_transport());
        assert_eq!(timeout.to_string(), "No response received for command 'GETD'");
    }

    #[test]
    fn output_enabled_message_names_the_cathode() {
        let err = CathodeError::OutputEnabled("B".into());
        assert!(err.to_string().contains("cathode B"));
    }
}
