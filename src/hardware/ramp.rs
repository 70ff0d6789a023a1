//! Background voltage ramping.
//!
//! A ramp walks the preset-1 voltage setpoint from its starting point to a target in fixed
//! steps (0.1 V by default), sleeping `step / rate` seconds between steps. Each step must be
//! acknowledged before the ramp advances; the first failed step ends the ramp with
//! [`RampOutcome::Failure`]. Nothing is retried.
//!
//! At most one ramp runs per [`RampController`]. Starting a new ramp cancels the active one
//! and waits for it to stop before the first new command is sent. Cancellation is checked
//! between steps, so a command already on the wire always completes.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RampConfig;
use crate::error::DriverError;
use crate::hardware::power_supply_9014::{encode_hundredths, PowerSupply9014};

/// Preset the ramp drives.
pub const RAMP_PRESET: u8 = 1;

// Tolerance for "reached the target" after float stepping
const TARGET_EPSILON: f64 = 1e-9;

/// How a ramp ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RampOutcome {
    /// Target reached and acknowledged.
    Success {
        /// Final commanded voltage (equals the target)
        voltage_v: f64,
    },
    /// A step was refused or went unanswered.
    Failure {
        /// Last acknowledged voltage
        voltage_v: f64,
        /// Why the step failed
        reason: String,
    },
    /// Superseded by a newer ramp or cancelled explicitly.
    Cancelled {
        /// Last acknowledged voltage
        voltage_v: f64,
    },
}

impl RampOutcome {
    /// True only for [`RampOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, RampOutcome::Success { .. })
    }

    /// Last voltage the device acknowledged during the ramp.
    pub fn voltage_v(&self) -> f64 {
        match self {
            RampOutcome::Success { voltage_v }
            | RampOutcome::Failure { voltage_v, .. }
            | RampOutcome::Cancelled { voltage_v } => *voltage_v,
        }
    }
}

/// Completion callback, invoked exactly once from the ramp task.
pub type RampCallback = Box<dyn FnOnce(&RampOutcome) + Send + 'static>;

/// Handle to a running ramp.
pub struct RampHandle {
    cancel_tx: Arc<watch::Sender<bool>>,
    progress_rx: watch::Receiver<f64>,
    task: JoinHandle<RampOutcome>,
}

impl RampHandle {
    /// Ask the ramp to stop after the in-flight step.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Last acknowledged voltage, updated after every step.
    pub fn progress(&self) -> watch::Receiver<f64> {
        self.progress_rx.clone()
    }

    /// Whether the ramp task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the ramp to end.
    pub async fn wait(self) -> RampOutcome {
        let last = *self.progress_rx.borrow();
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => RampOutcome::Failure {
                voltage_v: last,
                reason: format!("ramp task aborted: {e}"),
            },
        }
    }
}

struct ActiveRamp {
    cancel_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
}

/// Runs at most one voltage ramp at a time against one supply.
pub struct RampController {
    driver: Arc<PowerSupply9014>,
    settings: RampConfig,
    active: Mutex<Option<ActiveRamp>>,
}

impl RampController {
    /// Create a controller for `driver`.
    pub fn new(driver: Arc<PowerSupply9014>, settings: RampConfig) -> Self {
        Self {
            driver,
            settings,
            active: Mutex::new(None),
        }
    }

    /// Ramp settings in use.
    pub fn settings(&self) -> &RampConfig {
        &self.settings
    }

    /// Start ramping toward `target_v` at `rate_v_per_s`.
    ///
    /// Any ramp already running is cancelled and awaited first. The starting point is
    /// the last acknowledged preset-1 voltage (0.0 if none), or the `GETD` readout when
    /// `read_back_start` is configured and the readout succeeds.
    pub async fn ramp_voltage(
        &self,
        target_v: f64,
        rate_v_per_s: f64,
        on_complete: Option<RampCallback>,
    ) -> Result<RampHandle, DriverError> {
        encode_hundredths("ramp target", target_v)?;
        if !rate_v_per_s.is_finite() || rate_v_per_s <= 0.0 {
            return Err(DriverError::Encode {
                what: "ramp rate",
                value: rate_v_per_s,
            });
        }

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            stop(previous).await;
        }

        let start_v = self.starting_voltage().await;
        let step_v = self.settings.step_v;
        let delay = Duration::from_secs_f64(step_v / rate_v_per_s);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (progress_tx, progress_rx) = watch::channel(start_v);
        let (done_tx, done_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);

        info!(
            port = self.driver.channel().port_name(),
            start_v, target_v, rate_v_per_s, "Starting voltage ramp"
        );

        let driver = Arc::clone(&self.driver);
        let task = tokio::spawn(async move {
            let outcome = run_ramp(
                &driver,
                RampPlan {
                    start_v,
                    target_v,
                    step_v,
                    delay,
                },
                cancel_rx,
                progress_tx,
            )
            .await;
            if let Some(callback) = on_complete {
                callback(&outcome);
            }
            // Signalled after the callback so a superseding ramp never races it
            let _ = done_tx.send(true);
            outcome
        });

        *active = Some(ActiveRamp {
            cancel_tx: Arc::clone(&cancel_tx),
            done_rx,
        });

        Ok(RampHandle {
            cancel_tx,
            progress_rx,
            task,
        })
    }

    /// Cancel the active ramp, if any, and wait until it has stopped issuing commands.
    ///
    /// Returns `true` when a ramp was running.
    pub async fn cancel(&self) -> bool {
        let previous = self.active.lock().await.take();
        match previous {
            Some(previous) => {
                let was_running = !*previous.done_rx.borrow();
                stop(previous).await;
                was_running
            }
            None => false,
        }
    }

    async fn starting_voltage(&self) -> f64 {
        let last = self.driver.last_commanded_voltage(RAMP_PRESET).unwrap_or(0.0);
        if !self.settings.read_back_start {
            return last;
        }
        let reading = self.driver.get_voltage_current_mode().await;
        if reading.is_error() {
            warn!(
                port = self.driver.channel().port_name(),
                fallback_v = last,
                "Display read-back failed, ramping from last commanded voltage"
            );
            last
        } else {
            reading.voltage_v
        }
    }
}

async fn stop(mut ramp: ActiveRamp) {
    let _ = ramp.cancel_tx.send(true);
    // Err means the task is gone already
    let _ = ramp.done_rx.wait_for(|done| *done).await;
}

struct RampPlan {
    start_v: f64,
    target_v: f64,
    step_v: f64,
    delay: Duration,
}

/// Voltage for step `k` (1-based), clamped to the target.
fn step_voltage(plan: &RampPlan, k: u32) -> f64 {
    let offset = plan.step_v * f64::from(k);
    let next = if plan.target_v >= plan.start_v {
        (plan.start_v + offset).min(plan.target_v)
    } else {
        (plan.start_v - offset).max(plan.target_v)
    };
    if (plan.target_v - next).abs() < TARGET_EPSILON {
        plan.target_v
    } else {
        next
    }
}

async fn run_ramp(
    driver: &PowerSupply9014,
    plan: RampPlan,
    mut cancel_rx: watch::Receiver<bool>,
    progress_tx: watch::Sender<f64>,
) -> RampOutcome {
    let port = driver.channel().port_name().to_string();
    let mut current = plan.start_v;
    let mut k = 0u32;

    while (plan.target_v - current).abs() > TARGET_EPSILON {
        if *cancel_rx.borrow() {
            info!(port = %port, voltage_v = current, "Voltage ramp cancelled");
            return RampOutcome::Cancelled { voltage_v: current };
        }

        k += 1;
        let next = step_voltage(&plan, k);
        if let Err(e) = driver.set_voltage(RAMP_PRESET, next).await {
            error!(port = %port, voltage_v = next, error = %e, "Failed to set ramp voltage");
            return RampOutcome::Failure {
                voltage_v: current,
                reason: e.to_string(),
            };
        }
        current = next;
        let _ = progress_tx.send(current);
        debug!(port = %port, voltage_v = current, "Ramp step acknowledged");

        if (plan.target_v - current).abs() > TARGET_EPSILON {
            tokio::select! {
                _ = tokio::time::sleep(plan.delay) => {}
                _ = cancel_rx.changed() => {}
            }
        }
    }

    info!(port = %port, voltage_v = current, "Target voltage reached");
    RampOutcome::Success { voltage_v: current }
}
