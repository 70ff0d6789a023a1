//! Integration tests for the cathode control loop and safety poll
//!
//! Curves used throughout:
//! - heater voltage: 2 A → 4 V, 3 A → 5 V, 4 A → 6 V
//! - emission (log10): 2.5 A → 30 mA, 3 A → 100 mA, 4 A → 1000 mA
//! - true temperature: 2 A → 1800 K, 3 A → 2000 K, 4 A → 2200 K

use std::sync::Arc;
use std::time::Duration;

use cathode_heating::cathode::{
    CathodeControlLoop, CathodeEvent, ChannelHardware, ControlState, OvertempStatus, Predicted,
    Predictions,
};
use cathode_heating::config::{ChannelConfig, RampConfig, SafetyConfig};
use cathode_heating::error::CathodeError;
use cathode_heating::hardware::mock::{MockPowerSupply, MockTemperatureSensor};
use cathode_heating::hardware::{PowerSupply9014, TemperatureSensor};
use cathode_heating::model::{CathodeModels, PiecewiseLinearModel};
use tracing_test::traced_test;

fn models() -> CathodeModels {
    CathodeModels::new(
        Box::new(PiecewiseLinearModel::new(vec![2.0, 3.0, 4.0], vec![4.0, 5.0, 6.0], false).unwrap()),
        Box::new(
            PiecewiseLinearModel::new(vec![2.5, 3.0, 4.0], vec![0.03, 0.1, 1.0], true).unwrap(),
        ),
        Box::new(
            PiecewiseLinearModel::new(vec![2.0, 3.0, 4.0], vec![1800.0, 2000.0, 2200.0], false)
                .unwrap(),
        ),
    )
}

struct Bench {
    control: CathodeControlLoop,
    sim: MockPowerSupply,
    sensor: Arc<MockTemperatureSensor>,
}

fn bench_with(safety: SafetyConfig, sensor: MockTemperatureSensor) -> Bench {
    let (port, sim) = MockPowerSupply::spawn("sim-a", Duration::from_millis(100));
    let sensor = Arc::new(sensor);
    let mut control = CathodeControlLoop::new(models(), safety, RampConfig::default());
    let as_sensor: Arc<dyn TemperatureSensor> = sensor.clone();
    control
        .add_channel(
            &ChannelConfig::new("A", "sim-a"),
            ChannelHardware {
                supply: Some(Arc::new(PowerSupply9014::new(port))),
                sensor: Some(as_sensor),
            },
        )
        .unwrap();
    Bench {
        control,
        sim,
        sensor,
    }
}

fn bench() -> Bench {
    bench_with(SafetyConfig::default(), MockTemperatureSensor::fixed(25.0))
}

fn approx(p: Predicted, expected: f64) -> bool {
    p.value().is_some_and(|v| (v - expected).abs() < 1e-6)
}

// =============================================================================
// Target current
// =============================================================================

#[tokio::test]
async fn test_target_72ma_end_to_end() {
    let b = bench();

    let state = b.control.set_target_current(0, 72.0).await.unwrap();
    assert_eq!(state, ControlState::Applied);

    let snap = b.control.snapshot(0).unwrap();
    assert!((snap.ideal_emission_current_ma - 100.0).abs() < 1e-9);
    assert_eq!(snap.target_current_ma, 72.0);
    assert!(approx(snap.predictions.emission_current_ma, 100.0));
    assert!(approx(snap.predictions.heater_current_a, 3.0));
    assert!(approx(snap.predictions.heater_voltage_v, 5.0));
    assert!(approx(snap.predictions.grid_current_ma, 28.0));
    assert!(approx(snap.predictions.temperature_c, 1726.85));
    assert_eq!(snap.predictions.temperature_c.display(0), "1727");
    assert_eq!(snap.predictions.grid_current_ma.display(2), "28.00");

    assert_eq!(b.sim.commands(), vec!["VOLT 10500", "CURR 10300"]);
}

#[tokio::test]
async fn test_zero_target_sends_only_zero_setpoints() {
    let b = bench();
    b.control.set_target_current(0, 72.0).await.unwrap();
    b.sim.clear_commands();

    let state = b.control.set_target_current(0, 0.0).await.unwrap();

    assert_eq!(state, ControlState::Idle);
    let snap = b.control.snapshot(0).unwrap();
    assert_eq!(snap.predictions, Predictions::zeroed());
    assert_eq!(b.sim.commands(), vec!["VOLT 10000", "CURR 10000"]);
}

#[tokio::test]
async fn test_target_rejected_while_output_enabled() {
    let b = bench();
    b.control.set_output(0, true).await.unwrap();
    b.sim.clear_commands();
    let before = b.control.snapshot(0).unwrap();

    let err = b.control.set_target_current(0, 72.0).await.unwrap_err();

    assert!(matches!(err, CathodeError::OutputEnabled(ref label) if label == "A"));
    assert_eq!(b.control.snapshot(0).unwrap(), before);
    assert!(b.sim.commands().is_empty());
}

#[tokio::test]
async fn test_out_of_range_target_sends_nothing() {
    let b = bench();

    // 1000 mA / 0.72 is above the 1000 mA top of the emission curve
    let state = b.control.set_target_current(0, 1000.0).await.unwrap();
    assert_eq!(state, ControlState::OutOfRange);
    let snap = b.control.snapshot(0).unwrap();
    assert_eq!(snap.predictions, Predictions::out_of_range());
    assert_eq!(snap.state, ControlState::OutOfRange);

    // 10 mA / 0.72 is below 30 mA
    let state = b.control.set_target_current(0, 10.0).await.unwrap();
    assert_eq!(state, ControlState::OutOfRange);

    assert!(b.sim.commands().is_empty());
}

#[tokio::test]
async fn test_invalid_target_is_rejected() {
    let b = bench();
    assert!(matches!(
        b.control.set_target_current(0, -5.0).await,
        Err(CathodeError::InvalidInput(_))
    ));
    assert!(matches!(
        b.control.set_target_current(0, f64::NAN).await,
        Err(CathodeError::InvalidInput(_))
    ));
    assert!(matches!(
        b.control.set_target_current(7, 72.0).await,
        Err(CathodeError::UnknownChannel(7))
    ));
}

#[tokio::test]
async fn test_refused_setpoint_keeps_predictions() {
    let b = bench();
    b.sim.fail_voltage_after(0);

    let state = b.control.set_target_current(0, 72.0).await.unwrap();

    assert_eq!(state, ControlState::Applied);
    assert!(approx(b.control.snapshot(0).unwrap().predictions.heater_voltage_v, 5.0));
    assert_eq!(b.sim.commands(), vec!["VOLT 10500", "CURR 10300"]);
    assert_eq!(b.sim.voltage(1), 0.0);
}

#[tokio::test]
async fn test_new_target_cancels_running_ramp() {
    let b = bench();
    let handle = b.control.ramp_heater_voltage(0, 5.0, Some(0.1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    b.control.set_target_current(0, 72.0).await.unwrap();

    let outcome = handle.wait().await;
    assert!(!outcome.is_success());
    // The target's setpoints are the last voltage command on the wire
    let volts = b.sim.commands_with_prefix("VOLT");
    assert_eq!(volts.last().unwrap(), "VOLT 10500");
}

#[tokio::test(start_paused = true)]
async fn test_ramp_end_recomputes_every_prediction() {
    let b = bench();
    b.control.set_target_current(0, 72.0).await.unwrap();

    let outcome = b
        .control
        .ramp_heater_voltage(0, 6.0, Some(1.0))
        .await
        .unwrap()
        .wait()
        .await;
    assert!(outcome.is_success());

    let snapshot = b.control.snapshot(0).unwrap();
    let p = snapshot.predictions;
    assert_eq!(snapshot.state, ControlState::Applied);
    assert!(approx(p.heater_voltage_v, 6.0));
    assert!(approx(p.heater_current_a, 4.0));
    assert!(approx(p.emission_current_ma, 1000.0));
    assert!(approx(p.grid_current_ma, 280.0));
    assert!(approx(p.temperature_c, 1926.85));
}

#[tokio::test(start_paused = true)]
async fn test_ramp_below_voltage_model_leaves_only_voltage() {
    let b = bench();
    b.control.set_target_current(0, 72.0).await.unwrap();

    let outcome = b
        .control
        .ramp_heater_voltage(0, 3.5, Some(1.0))
        .await
        .unwrap()
        .wait()
        .await;
    assert!(outcome.is_success());

    let snapshot = b.control.snapshot(0).unwrap();
    assert_eq!(snapshot.state, ControlState::OutOfRange);
    assert_eq!(snapshot.predictions, Predictions::voltage_only(3.5));
}

// =============================================================================
// Manual voltage
// =============================================================================

#[tokio::test]
async fn test_manual_voltage_derives_every_field() {
    let b = bench();

    let p = b.control.set_manual_voltage(0, 5.0).await.unwrap();

    assert!(approx(p.heater_voltage_v, 5.0));
    assert!(approx(p.heater_current_a, 3.0));
    assert!(approx(p.emission_current_ma, 100.0));
    assert!(approx(p.grid_current_ma, 28.0));
    assert!(approx(p.temperature_c, 1726.85));
    assert_eq!(b.sim.commands(), vec!["VOLT 10500", "CURR 10300"]);
}

#[tokio::test]
async fn test_manual_voltage_out_of_emission_range_is_field_level() {
    let b = bench();

    // 4.2 V → 2.2 A, below the emission curve's 2.5 A
    let p = b.control.set_manual_voltage(0, 4.2).await.unwrap();

    assert!(approx(p.heater_voltage_v, 4.2));
    assert!(approx(p.heater_current_a, 2.2));
    assert_eq!(p.emission_current_ma, Predicted::OutOfRange);
    assert_eq!(p.grid_current_ma, Predicted::OutOfRange);
    assert_eq!(p.temperature_c, Predicted::OutOfRange);
    assert_eq!(b.control.snapshot(0).unwrap().predictions, p);
    assert_eq!(b.sim.commands(), vec!["VOLT 10420", "CURR 10220"]);
}

#[tokio::test]
async fn test_manual_voltage_outside_voltage_model() {
    let b = bench();

    let err = b.control.set_manual_voltage(0, 7.0).await.unwrap_err();

    assert!(matches!(err, CathodeError::Model(_)));
    let snap = b.control.snapshot(0).unwrap();
    assert_eq!(snap.predictions.heater_current_a, Predicted::OutOfRange);
    assert!(b.sim.commands().is_empty());
}

// =============================================================================
// Output and limits
// =============================================================================

#[tokio::test]
async fn test_output_follows_acknowledgement() {
    let b = bench();
    let mut events = b.control.subscribe();

    b.control.set_output(0, true).await.unwrap();
    assert!(b.control.snapshot(0).unwrap().output_enabled);
    assert!(matches!(
        events.try_recv(),
        Ok(CathodeEvent::OutputChanged { channel: 0, enabled: true })
    ));
    assert_eq!(b.control.output_status(0).await.unwrap(), "1");

    b.sim.set_silent(true);
    assert!(b.control.set_output(0, false).await.is_err());
    assert!(b.control.snapshot(0).unwrap().output_enabled);
}

#[tokio::test]
async fn test_protection_limits_are_pushed() {
    let b = bench();

    b.control.set_overvoltage_limit(0, 30.5).await.unwrap();
    b.control.set_overcurrent_limit(0, 4.25).await.unwrap();
    assert_eq!(b.sim.commands(), vec!["SOVP3050", "SOCP0425"]);
    assert_eq!(b.sim.protection_limits(), (30.5, 4.25));

    assert!(b.control.set_overcurrent_limit(0, 120.0).await.is_err());
    let snap = b.control.snapshot(0).unwrap();
    assert_eq!(snap.overvoltage_limit_v, 30.5);
    assert_eq!(snap.overcurrent_limit_a, 4.25);
}

// =============================================================================
// Safety poll
// =============================================================================

#[tokio::test]
async fn test_overtemp_boundary() {
    let b = bench_with(
        SafetyConfig::default(),
        MockTemperatureSensor::scripted([Some(150.0), Some(150.0 + 1e-6), Some(149.0), None]),
    );
    b.control.set_overtemp_limit(0, 150.0).unwrap();

    let poll = b.control.poll_once().await;
    assert_eq!(poll[0].status, OvertempStatus::Normal);
    assert_eq!(poll[0].transition, None);

    let poll = b.control.poll_once().await;
    assert_eq!(poll[0].status, OvertempStatus::Overtemp);
    assert_eq!(poll[0].transition.unwrap().to, OvertempStatus::Overtemp);

    let poll = b.control.poll_once().await;
    assert_eq!(poll[0].status, OvertempStatus::Normal);

    // No reading: nothing recorded, status unchanged
    let poll = b.control.poll_once().await;
    assert_eq!(poll[0].reading, None);
    let snap = b.control.snapshot(0).unwrap();
    assert_eq!(snap.status, OvertempStatus::Normal);
    assert_eq!(snap.history.len(), 3);
    assert_eq!(snap.measured_temperature_c, Some(149.0));
}

#[tokio::test]
async fn test_history_keeps_last_twenty() {
    let b = bench_with(
        SafetyConfig::default(),
        MockTemperatureSensor::scripted((0..25).map(|i| Some(i as f64))),
    );

    for _ in 0..25 {
        b.control.poll_once().await;
    }

    let history: Vec<f64> = b
        .control
        .snapshot(0)
        .unwrap()
        .history
        .iter()
        .map(|s| s.celsius)
        .collect();
    assert_eq!(history, (5..25).map(|i| i as f64).collect::<Vec<_>>());
}

#[tokio::test]
#[traced_test]
async fn test_overtemp_transition_is_logged_without_shutdown() {
    let b = bench();
    b.control.set_output(0, true).await.unwrap();
    b.sensor.set_temperature(250.0);

    b.control.poll_once().await;

    assert!(logs_contain("OVERTEMP"));
    let snap = b.control.snapshot(0).unwrap();
    assert_eq!(snap.status, OvertempStatus::Overtemp);
    // Surfaced only; the output stays on
    assert!(snap.output_enabled);
    assert!(b.sim.output_enabled());
}

#[tokio::test]
#[traced_test]
async fn test_missing_reading_is_logged_and_keeps_status() {
    let b = bench();
    b.sensor.set_temperature(250.0);
    b.control.poll_once().await;
    b.sensor.set_connected(false);

    let polls = b.control.poll_once().await;

    assert!(logs_contain("No temperature reading"));
    assert_eq!(polls[0].reading, None);
    assert_eq!(polls[0].transition, None);
    let snap = b.control.snapshot(0).unwrap();
    assert_eq!(snap.status, OvertempStatus::Overtemp);
    assert_eq!(snap.history.len(), 1);
}

#[tokio::test]
async fn test_overtemp_auto_shutdown() {
    let safety = SafetyConfig {
        auto_shutdown_on_overtemp: true,
        ..SafetyConfig::default()
    };
    let b = bench_with(safety, MockTemperatureSensor::fixed(25.0));
    b.control.set_output(0, true).await.unwrap();
    b.sensor.set_temperature(250.0);

    b.control.poll_once().await;

    assert!(!b.control.snapshot(0).unwrap().output_enabled);
    assert!(!b.sim.output_enabled());
    assert_eq!(b.sim.commands_with_prefix("SOUT"), vec!["SOUT1", "SOUT0"]);
}

#[tokio::test(start_paused = true)]
async fn test_background_poll_samples_on_interval() {
    let b = bench();
    let control = Arc::new(b.control);
    let mut events = control.subscribe();

    let poll = control.start_safety_poll();
    tokio::time::sleep(Duration::from_millis(1250)).await;
    poll.stop().await;

    // Ticks at 0, 500 and 1000 ms
    let snap = control.snapshot(0).unwrap();
    assert_eq!(snap.history.len(), 3);
    let mut samples = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, CathodeEvent::TemperatureSampled { .. }) {
            samples += 1;
        }
    }
    assert_eq!(samples, 3);
}

// =============================================================================
// Temperature controller units
// =============================================================================

#[tokio::test]
async fn test_unit_operations() {
    let b = bench();

    assert_eq!(b.control.read_and_log_temperature(1).await.unwrap(), 25.0);
    assert!(b.control.perform_echoback_test(1).await.is_ok());

    assert!(matches!(
        b.control.read_and_log_temperature(2).await,
        Err(CathodeError::SensorNotConnected(2))
    ));
    assert!(matches!(
        b.control.perform_echoback_test(0).await,
        Err(CathodeError::SensorNotConnected(0))
    ));

    b.sensor.set_connected(false);
    assert!(matches!(
        b.control.read_and_log_temperature(1).await,
        Err(CathodeError::Sensor(_))
    ));
    assert!(b.control.perform_echoback_test(1).await.is_err());
}
