//! Mock Hardware Implementations
//!
//! Simulated devices for running the subsystem without a bench.
//!
//! # Available Mocks
//!
//! - `MockPowerSupply` - Simulated 9014 supply answering the ASCII command set over an
//!   in-memory duplex pipe, recording every command it receives
//! - `MockTemperatureSensor` - Simulated clamp temperature controller (random walk,
//!   fixed, or scripted readings)
//!
//! The simulated supply can be told to refuse voltage commands after a number of
//! acknowledgements, to go silent, or to return a fixed display payload, which is how
//! the failure paths of the driver and the ramp are exercised.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

use crate::hardware::capabilities::TemperatureSensor;
use crate::hardware::serial_adapter::CommandChannel;

// =============================================================================
// MockPowerSupply - Simulated 9014 supply
// =============================================================================

const PRESETS: usize = 10;

#[derive(Debug)]
struct SupplyState {
    output: bool,
    voltage: [f64; PRESETS],
    current: [f64; PRESETS],
    ovp: f64,
    ocp: f64,
    selected: u8,
    delta_time: [u8; PRESETS],
    sweep_time: u16,
    sweeping: bool,
    keyboard_locked: bool,
    received: Vec<String>,
    volt_acks: usize,
    fail_voltage_after: Option<usize>,
    silent: bool,
    display_payload: Option<String>,
}

impl Default for SupplyState {
    fn default() -> Self {
        Self {
            output: false,
            voltage: [0.0; PRESETS],
            current: [0.0; PRESETS],
            ovp: 50.0,
            ocp: 10.0,
            selected: 1,
            delta_time: [0; PRESETS],
            sweep_time: 0,
            sweeping: false,
            keyboard_locked: false,
            received: Vec::new(),
            volt_acks: 0,
            fail_voltage_after: None,
            silent: false,
            display_payload: None,
        }
    }
}

fn all_digits(field: &str) -> bool {
    !field.is_empty() && field.bytes().all(|b| b.is_ascii_digit())
}

fn digits(field: &str) -> Option<u32> {
    if !all_digits(field) {
        return None;
    }
    field.parse().ok()
}

fn preset_and_hundredths(rest: &str) -> Option<(usize, f64)> {
    if rest.len() != 5 {
        return None;
    }
    let preset = digits(&rest[..1])? as usize;
    let value = f64::from(digits(&rest[1..])?) / 100.0;
    Some((preset, value))
}

fn hundredths(value: f64) -> String {
    format!("{:04}", (value * 100.0).round() as u32)
}

impl SupplyState {
    fn respond(&mut self, command: &str) -> String {
        const OK: &str = "OK";
        const ERR: &str = "ERR";

        match command {
            "SOUT0" => {
                self.output = false;
                return OK.into();
            }
            "SOUT1" => {
                self.output = true;
                return OK.into();
            }
            "GOUT" => return if self.output { "1" } else { "0" }.into(),
            "GOVP" => return hundredths(self.ovp),
            "GOCP" => return hundredths(self.ocp),
            "GABC" => return self.selected.to_string(),
            "GSWT" => return format!("{:03}", self.sweep_time),
            "STOP" => {
                self.sweeping = false;
                return OK.into();
            }
            "SESS" => {
                self.keyboard_locked = true;
                return OK.into();
            }
            "ENDS" => {
                self.keyboard_locked = false;
                return OK.into();
            }
            "GETD" => return self.display(),
            "GALL" => {
                return format!(
                    "{}{}{}{}{:03}",
                    u8::from(self.output),
                    self.selected,
                    hundredths(self.ovp),
                    hundredths(self.ocp),
                    self.sweep_time
                )
            }
            _ => {}
        }

        if let Some(rest) = command.strip_prefix("VOLT ") {
            return match preset_and_hundredths(rest) {
                Some(_) if self.fail_voltage_after.is_some_and(|n| self.volt_acks >= n) => {
                    ERR.into()
                }
                Some((preset, volts)) => {
                    self.voltage[preset] = volts;
                    self.volt_acks += 1;
                    OK.into()
                }
                None => ERR.into(),
            };
        }
        if let Some(rest) = command.strip_prefix("CURR ") {
            return match preset_and_hundredths(rest) {
                Some((preset, amps)) => {
                    self.current[preset] = amps;
                    OK.into()
                }
                None => ERR.into(),
            };
        }
        if let Some(rest) = command.strip_prefix("SOVP") {
            return match digits(rest).filter(|_| rest.len() == 4) {
                Some(n) => {
                    self.ovp = f64::from(n) / 100.0;
                    OK.into()
                }
                None => ERR.into(),
            };
        }
        if let Some(rest) = command.strip_prefix("SOCP") {
            return match digits(rest).filter(|_| rest.len() == 4) {
                Some(n) => {
                    self.ocp = f64::from(n) / 100.0;
                    OK.into()
                }
                None => ERR.into(),
            };
        }
        if let Some(rest) = command.strip_prefix("SETD") {
            if rest.len() == 9 {
                if let (Some(p), Some(v), Some(i)) =
                    (digits(&rest[..1]), digits(&rest[1..5]), digits(&rest[5..]))
                {
                    self.voltage[p as usize] = f64::from(v) / 100.0;
                    self.current[p as usize] = f64::from(i) / 100.0;
                    return OK.into();
                }
            }
            return ERR.into();
        }
        if let Some(rest) = command.strip_prefix("GETS") {
            return match digits(rest).filter(|_| rest.len() == 1) {
                Some(p) => format!(
                    "{}{}",
                    hundredths(self.voltage[p as usize]),
                    hundredths(self.current[p as usize])
                ),
                None => ERR.into(),
            };
        }
        if let Some(rest) = command.strip_prefix("SABC") {
            return match digits(rest).filter(|_| rest.len() == 1) {
                Some(p) => {
                    self.selected = p as u8;
                    OK.into()
                }
                None => ERR.into(),
            };
        }
        if let Some(rest) = command.strip_prefix("GDLT") {
            return match digits(rest).filter(|_| rest.len() == 1) {
                Some(i) => format!("{:02}", self.delta_time[i as usize]),
                None => ERR.into(),
            };
        }
        if let Some(rest) = command.strip_prefix("SDLT") {
            if rest.len() == 3 {
                if let (Some(i), Some(t)) = (digits(&rest[..1]), digits(&rest[1..])) {
                    self.delta_time[i as usize] = t as u8;
                    return OK.into();
                }
            }
            return ERR.into();
        }
        if let Some(rest) = command.strip_prefix("SSWT") {
            return match digits(rest).filter(|_| rest.len() == 3) {
                Some(t) => {
                    self.sweep_time = t as u16;
                    OK.into()
                }
                None => ERR.into(),
            };
        }
        if let Some(rest) = command.strip_prefix("RUNP") {
            return match digits(rest).filter(|_| rest.len() == 2) {
                Some(_) => {
                    self.sweeping = true;
                    OK.into()
                }
                None => ERR.into(),
            };
        }
        if let Some(rest) = command.strip_prefix("SETM") {
            if rest.len() == 33 && all_digits(rest) {
                for slot in 0..3 {
                    let base = slot * 11;
                    let v = digits(&rest[base..base + 4]).unwrap_or(0);
                    let i = digits(&rest[base + 4..base + 8]).unwrap_or(0);
                    self.voltage[slot + 1] = f64::from(v) / 100.0;
                    self.current[slot + 1] = f64::from(i) / 100.0;
                }
                return OK.into();
            }
            return ERR.into();
        }

        ERR.into()
    }

    fn display(&self) -> String {
        if let Some(payload) = &self.display_payload {
            return payload.clone();
        }
        let preset = self.selected as usize;
        let (volts, amps) = if self.output {
            (self.voltage[preset], self.current[preset])
        } else {
            (0.0, 0.0)
        };
        format!(
            "{:05}{:05}0",
            (volts * 1000.0).round() as u32,
            (amps * 1000.0).round() as u32
        )
    }
}

/// Simulated 9014 power supply on the far end of a duplex pipe.
pub struct MockPowerSupply {
    state: Arc<Mutex<SupplyState>>,
    task: JoinHandle<()>,
}

impl MockPowerSupply {
    /// Start a simulated supply and return a command channel connected to it.
    pub fn spawn(port_name: &str, timeout: Duration) -> (CommandChannel, Self) {
        let (host, device) = tokio::io::duplex(1024);
        let state = Arc::new(Mutex::new(SupplyState::default()));
        let task = tokio::spawn(serve(device, Arc::clone(&state)));
        let channel = CommandChannel::from_stream(port_name, host, timeout);
        (channel, Self { state, task })
    }

    /// Every command received so far, without terminators.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().received.clone()
    }

    /// Received commands starting with `prefix`.
    pub fn commands_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Forget the received command log.
    pub fn clear_commands(&self) {
        self.state.lock().received.clear();
    }

    /// Refuse every `VOLT` command after `acks` have been acknowledged.
    pub fn fail_voltage_after(&self, acks: usize) {
        let mut state = self.state.lock();
        state.fail_voltage_after = Some(state.volt_acks + acks);
    }

    /// Stop answering (commands are still recorded).
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Answer `GETD` with a fixed payload instead of the simulated readout.
    pub fn set_display_payload(&self, payload: Option<&str>) {
        self.state.lock().display_payload = payload.map(str::to_string);
    }

    /// Simulated output state.
    pub fn output_enabled(&self) -> bool {
        self.state.lock().output
    }

    /// Simulated voltage of `preset`.
    pub fn voltage(&self, preset: usize) -> f64 {
        self.state.lock().voltage.get(preset).copied().unwrap_or(0.0)
    }

    /// Simulated current of `preset`.
    pub fn current(&self, preset: usize) -> f64 {
        self.state.lock().current.get(preset).copied().unwrap_or(0.0)
    }

    /// Simulated protection limits `(ovp, ocp)`.
    pub fn protection_limits(&self) -> (f64, f64) {
        let state = self.state.lock();
        (state.ovp, state.ocp)
    }

    /// Whether the front panel is locked.
    pub fn keyboard_locked(&self) -> bool {
        self.state.lock().keyboard_locked
    }
}

impl Drop for MockPowerSupply {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(device: DuplexStream, state: Arc<Mutex<SupplyState>>) {
    let (reader, mut writer) = tokio::io::split(device);
    let mut reader = BufReader::new(reader);
    let mut frame = Vec::new();

    loop {
        frame.clear();
        match reader.read_until(b'\r', &mut frame).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = String::from_utf8_lossy(&frame)
            .trim_end_matches('\r')
            .to_string();

        let reply = {
            let mut state = state.lock();
            state.received.push(command.clone());
            if state.silent {
                None
            } else {
                Some(state.respond(&command))
            }
        };

        if let Some(reply) = reply {
            let line = format!("{}\r\n", reply);
            if writer.write_all(line.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

// =============================================================================
// MockTemperatureSensor - Simulated clamp temperature controller
// =============================================================================

#[derive(Debug)]
enum Readings {
    RandomWalk { last: f64, min: f64, max: f64, step: f64 },
    Fixed(Option<f64>),
    Scripted(VecDeque<Option<f64>>),
}

/// Simulated temperature controller unit.
///
/// The default drifts between 20 and 22 °C in steps of at most 0.05 °C.
#[derive(Debug)]
pub struct MockTemperatureSensor {
    readings: Mutex<Readings>,
    connected: Mutex<bool>,
}

impl MockTemperatureSensor {
    /// Random-walk sensor around room temperature.
    pub fn new() -> Self {
        Self::with_readings(Readings::RandomWalk {
            last: 20.0,
            min: 20.0,
            max: 22.0,
            step: 0.05,
        })
    }

    /// Sensor that always reads `celsius`.
    pub fn fixed(celsius: f64) -> Self {
        Self::with_readings(Readings::Fixed(Some(celsius)))
    }

    /// Sensor that replays `readings` in order, then reads `None`.
    pub fn scripted(readings: impl IntoIterator<Item = Option<f64>>) -> Self {
        Self::with_readings(Readings::Scripted(readings.into_iter().collect()))
    }

    fn with_readings(readings: Readings) -> Self {
        Self {
            readings: Mutex::new(readings),
            connected: Mutex::new(true),
        }
    }

    /// Switch to a fixed reading.
    pub fn set_temperature(&self, celsius: f64) {
        *self.readings.lock() = Readings::Fixed(Some(celsius));
    }

    /// Simulate the controller dropping off the bus.
    pub fn set_connected(&self, connected: bool) {
        *self.connected.lock() = connected;
    }
}

impl Default for MockTemperatureSensor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TemperatureSensor for MockTemperatureSensor {
    async fn read_temperature(&self) -> Option<f64> {
        if !*self.connected.lock() {
            return None;
        }
        let mut readings = self.readings.lock();
        match &mut *readings {
            Readings::RandomWalk {
                last,
                min,
                max,
                step,
            } => {
                let delta = rand::thread_rng().gen_range(-*step..=*step);
                *last = (*last + delta).clamp(*min, *max);
                Some(*last)
            }
            Readings::Fixed(value) => *value,
            Readings::Scripted(queue) => queue.pop_front().flatten(),
        }
    }

    async fn perform_echoback_test(&self) -> Result<String> {
        if *self.connected.lock() {
            Ok("Echoback test passed".to_string())
        } else {
            Err(anyhow!("No echoback from temperature controller"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_supply_acknowledges_setpoints() {
        let (channel, supply) = MockPowerSupply::spawn("sim", Duration::from_millis(200));

        assert_eq!(channel.send("VOLT 10500").await.unwrap(), "OK");
        assert_eq!(channel.send("CURR 10300").await.unwrap(), "OK");
        assert_eq!(channel.send("SOUT1").await.unwrap(), "OK");
        assert_eq!(channel.send("GETD").await.unwrap(), "05000030000");
        assert_eq!(channel.send("BOGUS").await.unwrap(), "ERR");

        assert_eq!(supply.voltage(1), 5.0);
        assert_eq!(supply.current(1), 3.0);
        assert!(supply.output_enabled());
        assert_eq!(
            supply.commands(),
            vec!["VOLT 10500", "CURR 10300", "SOUT1", "GETD", "BOGUS"]
        );
    }

    #[tokio::test]
    async fn simulated_supply_refuses_after_limit() {
        let (channel, supply) = MockPowerSupply::spawn("sim", Duration::from_millis(200));
        supply.fail_voltage_after(1);

        assert_eq!(channel.send("VOLT 10010").await.unwrap(), "OK");
        assert_eq!(channel.send("VOLT 10020").await.unwrap(), "ERR");
    }

    #[tokio::test]
    async fn simulated_supply_accepts_three_preset_program() {
        let (channel, supply) = MockPowerSupply::spawn("sim", Duration::from_millis(200));

        assert_eq!(
            channel.send("SETM010000500100200010002003000150030").await.unwrap(),
            "OK"
        );
        assert_eq!(supply.voltage(1), 1.0);
        assert_eq!(supply.current(3), 1.5);
        assert_eq!(channel.send("SETM0100005001").await.unwrap(), "ERR");
        assert_eq!(
            channel.send("SETM01000050010020001000200300015003X").await.unwrap(),
            "ERR"
        );
    }

    #[tokio::test]
    async fn scripted_sensor_replays_then_runs_dry() {
        let sensor = MockTemperatureSensor::scripted([Some(21.0), None, Some(250.0)]);
        assert_eq!(sensor.read_temperature().await, Some(21.0));
        assert_eq!(sensor.read_temperature().await, None);
        assert_eq!(sensor.read_temperature().await, Some(250.0));
        assert_eq!(sensor.read_temperature().await, None);
    }

    #[tokio::test]
    async fn random_walk_stays_in_band() {
        let sensor = MockTemperatureSensor::new();
        for _ in 0..200 {
            let t = sensor.read_temperature().await.unwrap();
            assert!((20.0..=22.0).contains(&t));
        }
    }

    #[tokio::test]
    async fn disconnected_sensor() {
        let sensor = MockTemperatureSensor::fixed(30.0);
        sensor.set_connected(false);
        assert_eq!(sensor.read_temperature().await, None);
        assert!(sensor.perform_echoback_test().await.is_err());
    }
}
