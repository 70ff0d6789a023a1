//! Cathode Control Loop
//!
//! Converts a requested emission current into heater supply setpoints and keeps the
//! per-channel state the safety poll and presentation layers observe.
//!
//! ## Setpoint derivation
//!
//! ```text
//! target_mA ──÷ 0.72──▶ ideal emission (mA)
//!                          │ log10(mA / 1000), inverse lookup
//!                          ▼
//!                    heater current (A) ──▶ heater voltage (V)
//!                          │                 (voltage model)
//!                          ▼
//!                    true temperature (K) ──▶ °C
//! grid current = 0.28 × ideal emission
//! ```
//!
//! Derived fields are published as one [`Predictions`] value, so a reader never sees a
//! mix of two computations. Voltage and current are then pushed to preset 1; a refused
//! push is logged but the displayed prediction is kept.
//!
//! ## Concurrency
//!
//! Each channel's record sits behind a `parking_lot::Mutex` that is never held across an
//! await. Setpoint changes (target current, manual voltage, output, ramps) additionally
//! queue on a per-channel async lock and cancel any in-flight ramp before touching the
//! supply. The safety poll only takes the record lock, so it never waits on a setpoint
//! change or a ramp.

pub mod channel;
pub mod safety;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

use crate::config::{ChannelConfig, RampConfig, SafetyConfig};
use crate::error::{CathodeError, CathodeResult, ModelError};
use crate::hardware::capabilities::TemperatureSensor;
use crate::hardware::power_supply_9014::{encode_hundredths, DisplayReading, PowerSupply9014};
use crate::hardware::ramp::{RampCallback, RampController, RampHandle, RampOutcome, RAMP_PRESET};
use crate::model::CathodeModels;

pub use channel::{
    Channel, ChannelSnapshot, ControlState, OvertempStatus, Predicted, Predictions,
    StatusTransition, TemperatureHistory, TemperatureSample,
};
pub use safety::{ChannelPoll, SafetyPollHandle};

/// Number of cathodes the subsystem drives.
pub const MAX_CHANNELS: usize = 3;

/// Fraction of the emission current that reaches the collector.
pub const COLLECTION_EFFICIENCY: f64 = 0.72;

/// Fraction of the emission current intercepted by the grid.
pub const GRID_FRACTION: f64 = 0.28;

/// 0 °C in kelvin.
pub const KELVIN_OFFSET: f64 = 273.15;

/// Preset that carries the heater setpoints.
pub const SETPOINT_PRESET: u8 = RAMP_PRESET;

const EVENT_CAPACITY: usize = 256;

/// Notifications for presentation layers.
#[derive(Debug, Clone, Serialize)]
pub enum CathodeEvent {
    /// New predictions were published
    PredictionsUpdated {
        /// Channel index
        channel: usize,
        /// Setpoint state after the update
        state: ControlState,
        /// Published predictions
        predictions: Predictions,
    },
    /// Output switched (acknowledged by the supply)
    OutputChanged {
        /// Channel index
        channel: usize,
        /// New output state
        enabled: bool,
    },
    /// A temperature reading was recorded
    TemperatureSampled {
        /// Channel index
        channel: usize,
        /// Reading in °C
        celsius: f64,
        /// Status after the reading
        status: OvertempStatus,
    },
    /// Overtemperature status changed
    StatusChanged {
        /// Channel index
        channel: usize,
        /// Previous status
        from: OvertempStatus,
        /// New status
        to: OvertempStatus,
    },
    /// A heater voltage ramp ended
    RampFinished {
        /// Channel index
        channel: usize,
        /// How it ended
        outcome: RampOutcome,
    },
}

/// Devices attached to one cathode.
#[derive(Default)]
pub struct ChannelHardware {
    /// Heater power supply
    pub supply: Option<Arc<PowerSupply9014>>,
    /// Clamp temperature controller
    pub sensor: Option<Arc<dyn TemperatureSensor>>,
}

struct ChannelSlot {
    label: String,
    state: Arc<Mutex<Channel>>,
    supply: Option<Arc<PowerSupply9014>>,
    ramp: Option<RampController>,
    sensor: Option<Arc<dyn TemperatureSensor>>,
    setpoint: tokio::sync::Mutex<()>,
}

impl ChannelSlot {
    fn supply(&self) -> CathodeResult<&Arc<PowerSupply9014>> {
        self.supply
            .as_ref()
            .ok_or_else(|| CathodeError::SupplyNotConnected(self.label.clone()))
    }

    async fn cancel_ramp(&self) {
        if let Some(ramp) = &self.ramp {
            if ramp.cancel().await {
                info!(cathode = %self.label, "Cancelled in-flight voltage ramp");
            }
        }
    }
}

/// Per-channel setpoint and safety state machine for up to [`MAX_CHANNELS`] cathodes.
pub struct CathodeControlLoop {
    slots: Vec<ChannelSlot>,
    models: Arc<CathodeModels>,
    safety: SafetyConfig,
    ramp: RampConfig,
    events: broadcast::Sender<CathodeEvent>,
}

impl CathodeControlLoop {
    /// Empty control loop. Add cathodes with [`add_channel`](Self::add_channel).
    pub fn new(models: CathodeModels, safety: SafetyConfig, ramp: RampConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            slots: Vec::new(),
            models: Arc::new(models),
            safety,
            ramp,
            events,
        }
    }

    /// Register a cathode and return its channel index.
    pub fn add_channel(
        &mut self,
        config: &ChannelConfig,
        hardware: ChannelHardware,
    ) -> CathodeResult<usize> {
        if self.slots.len() >= MAX_CHANNELS {
            return Err(CathodeError::InvalidInput(format!(
                "at most {} cathodes are supported",
                MAX_CHANNELS
            )));
        }

        let index = self.slots.len();
        let ramp = hardware
            .supply
            .as_ref()
            .map(|supply| RampController::new(Arc::clone(supply), self.ramp.clone()));

        if hardware.supply.is_none() {
            warn!(cathode = %config.label, "No power supply attached");
        }

        self.slots.push(ChannelSlot {
            label: config.label.clone(),
            state: Arc::new(Mutex::new(Channel::new(
                config,
                self.safety.history_capacity,
            ))),
            supply: hardware.supply,
            ramp,
            sensor: hardware.sensor,
            setpoint: tokio::sync::Mutex::new(()),
        });

        info!(cathode = %config.label, index, port = %config.port, "Cathode channel registered");
        Ok(index)
    }

    /// Number of registered cathodes.
    pub fn channel_count(&self) -> usize {
        self.slots.len()
    }

    /// Safety settings in use.
    pub fn safety_settings(&self) -> &SafetyConfig {
        &self.safety
    }

    /// Subscribe to control-loop events.
    pub fn subscribe(&self) -> broadcast::Receiver<CathodeEvent> {
        self.events.subscribe()
    }

    fn slot(&self, channel: usize) -> CathodeResult<&ChannelSlot> {
        self.slots
            .get(channel)
            .ok_or(CathodeError::UnknownChannel(channel))
    }

    fn emit(&self, event: CathodeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish(&self, channel: usize, slot: &ChannelSlot, state: ControlState, predictions: Predictions) {
        {
            let mut ch = slot.state.lock();
            ch.predictions = predictions;
            ch.state = state;
        }
        self.emit(CathodeEvent::PredictionsUpdated {
            channel,
            state,
            predictions,
        });
    }

    /// Point-in-time copy of a channel.
    pub fn snapshot(&self, channel: usize) -> CathodeResult<ChannelSnapshot> {
        Ok(self.slot(channel)?.state.lock().snapshot())
    }

    /// Copies of every channel.
    pub fn snapshots(&self) -> Vec<ChannelSnapshot> {
        self.slots.iter().map(|s| s.state.lock().snapshot()).collect()
    }

    /// Request a target emission current in mA.
    ///
    /// Rejected without any state change while the output is enabled. A zero target
    /// resets the channel and pushes zero setpoints; a target outside the emission
    /// model marks every prediction out of range and sends nothing.
    #[instrument(skip(self), level = "debug")]
    pub async fn set_target_current(
        &self,
        channel: usize,
        target_ma: f64,
    ) -> CathodeResult<ControlState> {
        let slot = self.slot(channel)?;
        if !target_ma.is_finite() || target_ma < 0.0 {
            warn!(cathode = %slot.label, target_ma, "Invalid input for target current");
            return Err(CathodeError::InvalidInput(format!(
                "target current {} mA",
                target_ma
            )));
        }

        let _guard = slot.setpoint.lock().await;
        if slot.state.lock().output_enabled {
            warn!(
                cathode = %slot.label,
                "Disable the output before setting a new target current"
            );
            return Err(CathodeError::OutputEnabled(slot.label.clone()));
        }
        slot.cancel_ramp().await;

        let ideal_ma = target_ma / COLLECTION_EFFICIENCY;
        {
            let mut ch = slot.state.lock();
            ch.state = ControlState::ComputingSetpoint;
            ch.target_current_ma = target_ma;
            ch.ideal_emission_current_ma = ideal_ma;
        }
        info!(
            cathode = %slot.label,
            ideal_emission_ma = format_args!("{:.3}", ideal_ma),
            "Calculated ideal emission current"
        );

        if ideal_ma == 0.0 {
            self.reset_setpoints(slot).await;
            self.publish(channel, slot, ControlState::Idle, Predictions::zeroed());
            return Ok(ControlState::Idle);
        }

        if !emission_in_range(&self.models, ideal_ma) {
            warn!(
                cathode = %slot.label,
                ideal_emission_ma = ideal_ma,
                "Desired emission current is outside the range of the model"
            );
            self.publish(channel, slot, ControlState::OutOfRange, Predictions::out_of_range());
            return Ok(ControlState::OutOfRange);
        }

        let predictions = match derive_from_emission(&self.models, ideal_ma) {
            Ok(p) => p,
            Err(e) => {
                warn!(cathode = %slot.label, error = %e, "Setpoint derivation out of range");
                self.publish(channel, slot, ControlState::OutOfRange, Predictions::out_of_range());
                return Ok(ControlState::OutOfRange);
            }
        };

        let (Some(volts), Some(amps)) = (
            predictions.heater_voltage_v.value(),
            predictions.heater_current_a.value(),
        ) else {
            self.publish(channel, slot, ControlState::OutOfRange, Predictions::out_of_range());
            return Ok(ControlState::OutOfRange);
        };

        // Display reflects the intended target even if the supply refuses it
        self.publish(channel, slot, ControlState::Applied, predictions);
        self.push_setpoints(slot, volts, amps).await;

        info!(
            cathode = %slot.label,
            heater_voltage_v = format_args!("{:.2}", volts),
            heater_current_a = format_args!("{:.2}", amps),
            "Heater setpoints applied"
        );
        Ok(ControlState::Applied)
    }

    async fn reset_setpoints(&self, slot: &ChannelSlot) {
        let Some(supply) = &slot.supply else {
            return;
        };
        let volt = supply.set_voltage(SETPOINT_PRESET, 0.0).await;
        let curr = supply.set_current(SETPOINT_PRESET, 0.0).await;
        if volt.is_ok() && curr.is_ok() {
            info!(cathode = %slot.label, "Reset power supply settings");
        } else {
            error!(cathode = %slot.label, "Failed to reset power supply settings");
        }
    }

    async fn push_setpoints(&self, slot: &ChannelSlot, volts: f64, amps: f64) {
        let Some(supply) = &slot.supply else {
            warn!(cathode = %slot.label, "No power supply attached; setpoints not sent");
            return;
        };
        if let Err(e) = supply.set_voltage(SETPOINT_PRESET, volts).await {
            error!(cathode = %slot.label, volts, error = %e, "Failed to set heater voltage");
        }
        if let Err(e) = supply.set_current(SETPOINT_PRESET, amps).await {
            error!(cathode = %slot.label, amps, error = %e, "Failed to set heater current");
        }
    }

    /// Set the heater voltage directly and back-compute the other predictions.
    ///
    /// The heater current comes from the voltage model. Emission current, grid current and
    /// temperature are derived from that current separately: if they fall outside the
    /// emission model only those three fields become out of range.
    #[instrument(skip(self), level = "debug")]
    pub async fn set_manual_voltage(
        &self,
        channel: usize,
        volts: f64,
    ) -> CathodeResult<Predictions> {
        let slot = self.slot(channel)?;
        encode_hundredths("heater voltage", volts).map_err(CathodeError::from)?;

        let _guard = slot.setpoint.lock().await;
        slot.cancel_ramp().await;

        let predictions = match derive_from_heater_voltage(&self.models, volts) {
            Ok(p) => p,
            Err(e) => {
                warn!(cathode = %slot.label, volts, error = %e, "Heater voltage outside the voltage model");
                self.publish(channel, slot, ControlState::OutOfRange, Predictions::voltage_only(volts));
                return Err(e.into());
            }
        };
        let Some(heater_current) = predictions.heater_current_a.value() else {
            return Err(CathodeError::InvalidInput(format!("heater voltage {} V", volts)));
        };
        info!(
            cathode = %slot.label,
            heater_current_a = format_args!("{:.3}", heater_current),
            volts = format_args!("{:.3}", volts),
            "Interpolated heater current from manual voltage"
        );
        if predictions.emission_current_ma.value().is_none() {
            warn!(cathode = %slot.label, "Emission current is out of the interpolation range");
        }

        self.push_setpoints(slot, volts, heater_current).await;

        self.publish(channel, slot, ControlState::Applied, predictions);
        info!(cathode = %slot.label, volts, "Manual heater voltage set");
        Ok(predictions)
    }

    /// Ramp the heater voltage toward `target_v` in the background.
    ///
    /// Replaces any ramp already running on this channel. `rate_v_per_s` defaults to
    /// the configured ramp rate. When the ramp ends, every prediction is recomputed from the
    /// voltage it stopped at, as for a manual voltage.
    pub async fn ramp_heater_voltage(
        &self,
        channel: usize,
        target_v: f64,
        rate_v_per_s: Option<f64>,
    ) -> CathodeResult<RampHandle> {
        let slot = self.slot(channel)?;
        let ramp = match &slot.ramp {
            Some(ramp) => ramp,
            None => return Err(CathodeError::SupplyNotConnected(slot.label.clone())),
        };
        let rate = rate_v_per_s.unwrap_or(ramp.settings().default_rate_v_per_s);

        let _guard = slot.setpoint.lock().await;

        let state = Arc::clone(&slot.state);
        let models = Arc::clone(&self.models);
        let events = self.events.clone();
        let label = slot.label.clone();
        let on_complete: RampCallback = Box::new(move |outcome: &RampOutcome| {
            let (control_state, predictions) = predictions_at_voltage(&models, outcome.voltage_v());
            {
                let mut ch = state.lock();
                ch.predictions = predictions;
                ch.state = control_state;
            }
            let _ = events.send(CathodeEvent::PredictionsUpdated {
                channel,
                state: control_state,
                predictions,
            });
            if !outcome.is_success() {
                warn!(cathode = %label, ?outcome, "Heater voltage ramp did not complete");
            }
            let _ = events.send(CathodeEvent::RampFinished {
                channel,
                outcome: outcome.clone(),
            });
        });

        Ok(ramp.ramp_voltage(target_v, rate, Some(on_complete)).await?)
    }

    /// Stop the channel's ramp, if one is running.
    pub async fn cancel_ramp(&self, channel: usize) -> CathodeResult<bool> {
        let slot = self.slot(channel)?;
        Ok(match &slot.ramp {
            Some(ramp) => ramp.cancel().await,
            None => false,
        })
    }

    /// Switch the heater output. The recorded state changes only when the supply acknowledges.
    pub async fn set_output(&self, channel: usize, enabled: bool) -> CathodeResult<()> {
        let slot = self.slot(channel)?;
        let supply = slot.supply()?;
        let _guard = slot.setpoint.lock().await;

        let on_off = if enabled { "ON" } else { "OFF" };
        match supply.set_output(enabled).await {
            Ok(()) => {
                slot.state.lock().output_enabled = enabled;
                info!(cathode = %slot.label, "Heater output {}", on_off);
                self.emit(CathodeEvent::OutputChanged { channel, enabled });
                Ok(())
            }
            Err(e) => {
                error!(cathode = %slot.label, error = %e, "No response: toggling heater output {}", on_off);
                Err(e.into())
            }
        }
    }

    /// Raw output status reported by the supply (`GOUT`).
    pub async fn output_status(&self, channel: usize) -> CathodeResult<String> {
        let slot = self.slot(channel)?;
        let status = slot.supply()?.get_output_status().await?;
        info!(cathode = %slot.label, status = %status, "Heater output status");
        Ok(status)
    }

    /// Decoded front-panel readout of the channel's supply.
    pub async fn read_display(&self, channel: usize) -> CathodeResult<DisplayReading> {
        let slot = self.slot(channel)?;
        Ok(slot.supply()?.get_voltage_current_mode().await)
    }

    /// Set the overtemperature threshold in °C. Takes effect on the next poll.
    pub fn set_overtemp_limit(&self, channel: usize, limit_c: f64) -> CathodeResult<()> {
        let slot = self.slot(channel)?;
        if !limit_c.is_finite() {
            warn!(cathode = %slot.label, "Invalid input for overtemperature limit");
            return Err(CathodeError::InvalidInput(format!(
                "overtemperature limit {}",
                limit_c
            )));
        }
        slot.state.lock().overtemp_limit_c = limit_c;
        info!(
            cathode = %slot.label,
            "Set overtemperature limit to {:.2}°C", limit_c
        );
        Ok(())
    }

    /// Set and push the overvoltage protection limit (`SOVP`).
    pub async fn set_overvoltage_limit(&self, channel: usize, limit_v: f64) -> CathodeResult<()> {
        let slot = self.slot(channel)?;
        if let Some(supply) = &slot.supply {
            supply.set_over_voltage_protection(limit_v).await?;
        } else {
            encode_hundredths("overvoltage limit", limit_v)?;
        }
        slot.state.lock().overvoltage_limit_v = limit_v;
        info!(cathode = %slot.label, "Set overvoltage limit to {:.2} V", limit_v);
        Ok(())
    }

    /// Set and push the overcurrent protection limit (`SOCP`).
    pub async fn set_overcurrent_limit(&self, channel: usize, limit_a: f64) -> CathodeResult<()> {
        let slot = self.slot(channel)?;
        if let Some(supply) = &slot.supply {
            supply.set_over_current_protection(limit_a).await?;
        } else {
            encode_hundredths("overcurrent limit", limit_a)?;
        }
        slot.state.lock().overcurrent_limit_a = limit_a;
        info!(cathode = %slot.label, "Set overcurrent limit to {:.2} A", limit_a);
        Ok(())
    }

    fn sensor(&self, unit: usize) -> CathodeResult<&Arc<dyn TemperatureSensor>> {
        unit.checked_sub(1)
            .and_then(|i| self.slots.get(i))
            .and_then(|slot| slot.sensor.as_ref())
            .ok_or(CathodeError::SensorNotConnected(unit))
    }

    /// Read temperature controller `unit` (1-based) and log the value.
    pub async fn read_and_log_temperature(&self, unit: usize) -> CathodeResult<f64> {
        let result = match self.sensor(unit) {
            Ok(sensor) => sensor
                .read_temperature()
                .await
                .ok_or_else(|| CathodeError::Sensor("Failed to read temperature".to_string())),
            Err(e) => Err(e),
        };
        match &result {
            Ok(celsius) => info!(unit, "Temperature from unit {}: {:.2} °C", unit, celsius),
            Err(e) => error!(unit, error = %e, "Error reading temperature"),
        }
        result
    }

    /// Run the echoback diagnostic on temperature controller `unit` (1-based).
    pub async fn perform_echoback_test(&self, unit: usize) -> CathodeResult<String> {
        let result = match self.sensor(unit) {
            Ok(sensor) => sensor
                .perform_echoback_test()
                .await
                .map_err(|e| CathodeError::Sensor(e.to_string())),
            Err(e) => Err(e),
        };
        match &result {
            Ok(outcome) => info!(unit, result = %outcome, "Echoback test result"),
            Err(e) => error!(unit, error = %e, "Failed to perform echoback test"),
        }
        result
    }

    /// Stop every ramp and release every supply.
    pub async fn shutdown(&self) {
        for slot in &self.slots {
            slot.cancel_ramp().await;
            if let Some(supply) = &slot.supply {
                supply.close().await;
            }
        }
        info!(channels = self.slots.len(), "Cathode control loop shut down");
    }
}

fn emission_in_range(models: &CathodeModels, ideal_ma: f64) -> bool {
    let (min, max) = models.emission_current.y_range();
    ideal_ma >= min * 1000.0 && ideal_ma <= max * 1000.0
}

/// Predictions for an ideal emission current in mA.
pub(crate) fn derive_from_emission(
    models: &CathodeModels,
    ideal_ma: f64,
) -> Result<Predictions, ModelError> {
    let emission = models.emission_current.as_ref();
    let ideal_a = ideal_ma / 1000.0;
    let lookup = if emission.log_transform() {
        ideal_a.log10()
    } else {
        ideal_a
    };

    let heater_current = emission.interpolate(lookup, true)?;
    let heater_voltage = models.heater_voltage.interpolate(heater_current, false)?;
    let temperature_k = models.true_temperature.interpolate(heater_current, false)?;

    Ok(Predictions {
        emission_current_ma: Predicted::Valid(ideal_ma),
        heater_current_a: Predicted::Valid(heater_current),
        heater_voltage_v: Predicted::Valid(heater_voltage),
        grid_current_ma: Predicted::Valid(GRID_FRACTION * ideal_ma),
        temperature_c: Predicted::Valid(temperature_k - KELVIN_OFFSET),
    })
}

/// Predictions for a heater voltage.
///
/// Fails only when the voltage is outside the voltage model. Emission, grid current and
/// temperature are filled in independently of each other; those the models cannot
/// reach are out of range.
pub(crate) fn derive_from_heater_voltage(
    models: &CathodeModels,
    volts: f64,
) -> Result<Predictions, ModelError> {
    let heater_current = models.heater_voltage.interpolate(volts, true)?;
    let mut predictions = Predictions {
        heater_current_a: Predicted::Valid(heater_current),
        heater_voltage_v: Predicted::Valid(volts),
        ..Predictions::out_of_range()
    };
    if let Ok((emission_ma, temperature_c)) = derive_from_heater_current(models, heater_current) {
        predictions.emission_current_ma = Predicted::Valid(emission_ma);
        predictions.grid_current_ma = Predicted::Valid(GRID_FRACTION * emission_ma);
        predictions.temperature_c = Predicted::Valid(temperature_c);
    }
    Ok(predictions)
}

/// Channel state and predictions for a supply left at `volts` by a ramp.
fn predictions_at_voltage(models: &CathodeModels, volts: f64) -> (ControlState, Predictions) {
    if volts == 0.0 {
        return (ControlState::Idle, Predictions::zeroed());
    }
    match derive_from_heater_voltage(models, volts) {
        Ok(p) => (ControlState::Applied, p),
        Err(_) => (ControlState::OutOfRange, Predictions::voltage_only(volts)),
    }
}

/// Emission current (mA) and temperature (°C) for a heater current.
pub(crate) fn derive_from_heater_current(
    models: &CathodeModels,
    heater_current: f64,
) -> Result<(f64, f64), ModelError> {
    let emission = models.emission_current.as_ref();
    let fitted = emission.interpolate(heater_current, false)?;
    let emission_a = if emission.log_transform() {
        10f64.powf(fitted)
    } else {
        fitted
    };
    let emission_ma = emission_a * 1000.0;

    let (min, max) = emission.y_range();
    if emission_ma < min * 1000.0 || emission_ma > max * 1000.0 {
        return Err(ModelError::OutOfDomain {
            value: emission_ma,
            min: min * 1000.0,
            max: max * 1000.0,
        });
    }

    let temperature_k = models.true_temperature.interpolate(heater_current, false)?;
    Ok((emission_ma, temperature_k - KELVIN_OFFSET))
}
