//! Overtemperature safety poll.
//!
//! Every tick the poll reads all temperature sensors concurrently, records each reading in
//! its channel's history, and recomputes the channel status by direct comparison with the
//! overtemperature limit. A channel without a sensor, or whose sensor returns nothing
//! within one poll interval, keeps its previous reading and status; a missing reading is
//! logged at WARN every cycle.
//!
//! A `Normal → Overtemp` transition is logged at WARN. With
//! `safety.auto_shutdown_on_overtemp` set, the poll also cancels the channel's ramp and
//! switches its heater output off.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{CathodeControlLoop, CathodeEvent, ChannelSlot, OvertempStatus, StatusTransition};

/// Result of polling one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPoll {
    /// Channel index
    pub channel: usize,
    /// Reading taken this cycle, if any
    pub reading: Option<f64>,
    /// Status after the cycle
    pub status: OvertempStatus,
    /// Status change caused by this reading
    pub transition: Option<StatusTransition>,
}

/// Handle to the background safety poll.
pub struct SafetyPollHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SafetyPollHandle {
    /// Stop polling and wait for the task to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Safety poll task failed");
        }
    }

    /// Whether the poll task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl CathodeControlLoop {
    /// Run one safety cycle over every channel.
    pub async fn poll_once(&self) -> Vec<ChannelPoll> {
        let timeout = self.safety.poll_interval();
        let readings = join_all(self.slots.iter().map(|slot| async move {
            let sensor = slot.sensor.as_ref()?;
            match tokio::time::timeout(timeout, sensor.read_temperature()).await {
                Ok(Some(celsius)) => Some(celsius),
                Ok(None) => {
                    warn!(cathode = %slot.label, "No temperature reading; status left unchanged");
                    None
                }
                Err(_) => {
                    warn!(cathode = %slot.label, "Temperature read timed out");
                    None
                }
            }
        }))
        .await;

        let mut polls = Vec::with_capacity(self.slots.len());
        for (channel, (slot, reading)) in self.slots.iter().zip(readings).enumerate() {
            let (status, transition) = {
                let mut ch = slot.state.lock();
                let transition = reading.and_then(|c| ch.record_temperature(c, Utc::now()));
                (ch.status, transition)
            };

            if let Some(celsius) = reading {
                debug!(cathode = %slot.label, celsius, "Temperature sampled");
                self.emit(CathodeEvent::TemperatureSampled {
                    channel,
                    celsius,
                    status,
                });
            }

            if let Some(t) = transition {
                self.on_transition(channel, slot, t, reading).await;
            }

            polls.push(ChannelPoll {
                channel,
                reading,
                status,
                transition,
            });
        }
        polls
    }

    async fn on_transition(
        &self,
        channel: usize,
        slot: &ChannelSlot,
        transition: StatusTransition,
        reading: Option<f64>,
    ) {
        self.emit(CathodeEvent::StatusChanged {
            channel,
            from: transition.from,
            to: transition.to,
        });

        match transition.to {
            OvertempStatus::Overtemp => {
                warn!(cathode = %slot.label, celsius = ?reading, "Cathode {} OVERTEMP!", slot.label);
                if self.safety.auto_shutdown_on_overtemp {
                    self.shutdown_output(channel, slot).await;
                }
            }
            OvertempStatus::Normal => {
                info!(cathode = %slot.label, celsius = ?reading, "Cathode temperature back within limit");
            }
        }
    }

    async fn shutdown_output(&self, channel: usize, slot: &ChannelSlot) {
        slot.cancel_ramp().await;
        let Some(supply) = &slot.supply else {
            return;
        };
        match supply.set_output(false).await {
            Ok(()) => {
                slot.state.lock().output_enabled = false;
                warn!(cathode = %slot.label, "Heater output switched off after overtemperature");
                self.emit(CathodeEvent::OutputChanged {
                    channel,
                    enabled: false,
                });
            }
            Err(e) => {
                error!(cathode = %slot.label, error = %e, "Failed to switch heater output off after overtemperature");
            }
        }
    }

    /// Start the periodic safety poll.
    pub fn start_safety_poll(self: &Arc<Self>) -> SafetyPollHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let control = Arc::clone(self);
        let period = self.safety.poll_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval = ?period, "Safety poll started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        control.poll_once().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("Safety poll stopped");
        });

        SafetyPollHandle { shutdown_tx, task }
    }
}
