//! Per-cathode state record.
//!
//! A [`Channel`] holds everything the control loop and the safety poll know about one
//! cathode. It is always accessed through a lock owned by the control loop; nothing here
//! touches hardware.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ChannelConfig;

/// A derived quantity that is either known or outside a model's fitted range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Predicted {
    /// Value inside the model domain
    Valid(f64),
    /// Input fell outside the model domain
    OutOfRange,
}

impl Predicted {
    /// The value, if valid.
    pub fn value(&self) -> Option<f64> {
        match self {
            Predicted::Valid(v) => Some(*v),
            Predicted::OutOfRange => None,
        }
    }

    /// Formats with `precision` decimals, or `N/A`.
    pub fn display(&self, precision: usize) -> String {
        match self {
            Predicted::Valid(v) => format!("{:.*}", precision, v),
            Predicted::OutOfRange => "N/A".to_string(),
        }
    }
}

/// Derived setpoint fields, always replaced as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Predictions {
    /// Ideal emission current in mA
    pub emission_current_ma: Predicted,
    /// Heater current in A
    pub heater_current_a: Predicted,
    /// Heater voltage in V
    pub heater_voltage_v: Predicted,
    /// Grid current in mA
    pub grid_current_ma: Predicted,
    /// Cathode temperature in °C
    pub temperature_c: Predicted,
}

impl Predictions {
    /// Every field `Valid(0.0)`.
    pub fn zeroed() -> Self {
        let zero = Predicted::Valid(0.0);
        Self {
            emission_current_ma: zero,
            heater_current_a: zero,
            heater_voltage_v: zero,
            grid_current_ma: zero,
            temperature_c: zero,
        }
    }

    /// Every field `OutOfRange`.
    pub fn out_of_range() -> Self {
        let oor = Predicted::OutOfRange;
        Self {
            emission_current_ma: oor,
            heater_current_a: oor,
            heater_voltage_v: oor,
            grid_current_ma: oor,
            temperature_c: oor,
        }
    }

    /// Only the commanded heater voltage is known.
    pub fn voltage_only(volts: f64) -> Self {
        Self {
            heater_voltage_v: Predicted::Valid(volts),
            ..Self::out_of_range()
        }
    }

    /// True when no field is out of range.
    pub fn all_valid(&self) -> bool {
        [
            self.emission_current_ma,
            self.heater_current_a,
            self.heater_voltage_v,
            self.grid_current_ma,
            self.temperature_c,
        ]
        .iter()
        .all(|p| matches!(p, Predicted::Valid(_)))
    }
}

/// Setpoint state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControlState {
    /// Zero target, nothing applied
    Idle,
    /// Deriving setpoints from a new target
    ComputingSetpoint,
    /// Setpoints derived and pushed to the supply
    Applied,
    /// Target outside the model domain; nothing pushed
    OutOfRange,
}

/// Overtemperature status of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OvertempStatus {
    /// Latest reading at or below the limit
    Normal,
    /// Latest reading above the limit
    Overtemp,
}

impl OvertempStatus {
    /// Status for one reading. Equal to the limit is still `Normal`.
    pub fn evaluate(measured_c: f64, limit_c: f64) -> Self {
        if measured_c > limit_c {
            OvertempStatus::Overtemp
        } else {
            OvertempStatus::Normal
        }
    }
}

impl fmt::Display for OvertempStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OvertempStatus::Normal => write!(f, "Normal"),
            OvertempStatus::Overtemp => write!(f, "OVERTEMP!"),
        }
    }
}

/// One timestamped temperature reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureSample {
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
    /// Reading in °C
    pub celsius: f64,
}

/// Bounded, oldest-first temperature history.
#[derive(Debug, Clone)]
pub struct TemperatureHistory {
    capacity: usize,
    samples: VecDeque<TemperatureSample>,
}

impl TemperatureHistory {
    /// Empty history holding at most `capacity` samples (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a sample, evicting the oldest when full.
    pub fn push(&mut self, sample: TemperatureSample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when no sample has been recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &TemperatureSample> {
        self.samples.iter()
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<&TemperatureSample> {
        self.samples.back()
    }
}

/// Status change produced by recording a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    /// Status before the reading
    pub from: OvertempStatus,
    /// Status after the reading
    pub to: OvertempStatus,
}

/// State of one cathode.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Display label
    pub label: String,
    /// Requested emission current in mA
    pub target_current_ma: f64,
    /// Target divided by the collection efficiency, in mA
    pub ideal_emission_current_ma: f64,
    /// Derived setpoints
    pub predictions: Predictions,
    /// Setpoint state machine
    pub state: ControlState,
    /// Whether the supply output is on (as last acknowledged)
    pub output_enabled: bool,
    /// Overtemperature threshold in °C
    pub overtemp_limit_c: f64,
    /// Overvoltage protection limit in V
    pub overvoltage_limit_v: f64,
    /// Overcurrent protection limit in A
    pub overcurrent_limit_a: f64,
    /// Latest temperature reading in °C
    pub measured_temperature_c: Option<f64>,
    /// Recent temperature readings
    pub history: TemperatureHistory,
    /// Overtemperature status for the latest reading
    pub status: OvertempStatus,
}

impl Channel {
    /// Fresh channel with configured limits and zeroed setpoints.
    pub fn new(config: &ChannelConfig, history_capacity: usize) -> Self {
        Self {
            label: config.label.clone(),
            target_current_ma: 0.0,
            ideal_emission_current_ma: 0.0,
            predictions: Predictions::zeroed(),
            state: ControlState::Idle,
            output_enabled: false,
            overtemp_limit_c: config.overtemp_limit_c,
            overvoltage_limit_v: config.overvoltage_limit_v,
            overcurrent_limit_a: config.overcurrent_limit_a,
            measured_temperature_c: None,
            history: TemperatureHistory::new(history_capacity),
            status: OvertempStatus::Normal,
        }
    }

    /// Store a reading, append it to the history and recompute the status.
    ///
    /// Returns the transition when the status changed.
    pub fn record_temperature(
        &mut self,
        celsius: f64,
        timestamp: DateTime<Utc>,
    ) -> Option<StatusTransition> {
        self.measured_temperature_c = Some(celsius);
        self.history.push(TemperatureSample { timestamp, celsius });

        let from = self.status;
        self.status = OvertempStatus::evaluate(celsius, self.overtemp_limit_c);
        (from != self.status).then_some(StatusTransition {
            from,
            to: self.status,
        })
    }

    /// Serializable copy for presentation layers.
    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            label: self.label.clone(),
            target_current_ma: self.target_current_ma,
            ideal_emission_current_ma: self.ideal_emission_current_ma,
            predictions: self.predictions,
            state: self.state,
            output_enabled: self.output_enabled,
            overtemp_limit_c: self.overtemp_limit_c,
            overvoltage_limit_v: self.overvoltage_limit_v,
            overcurrent_limit_a: self.overcurrent_limit_a,
            measured_temperature_c: self.measured_temperature_c,
            history: self.history.iter().copied().collect(),
            status: self.status,
        }
    }
}

/// Point-in-time copy of a [`Channel`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    /// Display label
    pub label: String,
    /// Requested emission current in mA
    pub target_current_ma: f64,
    /// Ideal emission current in mA
    pub ideal_emission_current_ma: f64,
    /// Derived setpoints
    pub predictions: Predictions,
    /// Setpoint state
    pub state: ControlState,
    /// Output on/off
    pub output_enabled: bool,
    /// Overtemperature threshold in °C
    pub overtemp_limit_c: f64,
    /// Overvoltage limit in V
    pub overvoltage_limit_v: f64,
    /// Overcurrent limit in A
    pub overcurrent_limit_a: f64,
    /// Latest reading in °C
    pub measured_temperature_c: Option<f64>,
    /// Recent readings, oldest first
    pub history: Vec<TemperatureSample>,
    /// Overtemperature status
    pub status: OvertempStatus,
}
