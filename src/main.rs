//! CLI Entry Point for cathode-ctl
//!
//! Bench front-end for the cathode heating subsystem:
//! - Monitor clamp temperatures and overtemperature status
//! - Request a target emission current or a manual heater voltage
//! - Ramp the heater voltage
//! - Read back supply and channel state
//!
//! # Usage
//!
//! Against the simulated supplies:
//! ```bash
//! cathode-ctl --simulate set-target A 72
//! cathode-ctl --simulate monitor --seconds 10
//! ```
//!
//! Against real hardware (ports from `config/cathode.toml`):
//! ```bash
//! cathode-ctl --config config/cathode.toml ramp B 4.5 --rate 0.05
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use cathode_heating::cathode::{CathodeControlLoop, CathodeEvent, ChannelHardware};
use cathode_heating::config::{CathodeConfig, ChannelConfig};
use cathode_heating::hardware::capabilities::TemperatureSensor;
use cathode_heating::hardware::mock::{MockPowerSupply, MockTemperatureSensor};
use cathode_heating::hardware::{CommandChannel, PowerSupply9014};
use cathode_heating::logging;
use cathode_heating::model::CathodeModels;

#[derive(Parser)]
#[command(name = "cathode-ctl")]
#[command(about = "Cathode heater supply control and overtemperature monitoring", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "config/cathode.toml")]
    config: PathBuf,

    /// Use simulated supplies and temperature controllers instead of serial ports
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the safety poll and print temperatures and status changes
    Monitor {
        /// Stop after this many seconds (default: until Ctrl+C)
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Request a target emission current
    SetTarget {
        /// Cathode label (A, B, C)
        channel: String,
        /// Target current in mA
        current_ma: f64,
    },

    /// Set the heater voltage directly
    SetVoltage {
        /// Cathode label
        channel: String,
        /// Heater voltage in V
        volts: f64,
    },

    /// Ramp the heater voltage and wait for the ramp to finish
    Ramp {
        /// Cathode label
        channel: String,
        /// Target voltage in V
        target_v: f64,
        /// Ramp rate in V/s (default from configuration)
        #[arg(long)]
        rate: Option<f64>,
    },

    /// Switch a heater output on or off
    Output {
        /// Cathode label
        channel: String,
        /// true = on, false = off
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },

    /// Print supply readouts and channel state
    Readings {
        /// Cathode label (default: all)
        channel: Option<String>,
    },
}

/// Devices that must outlive the control loop in simulation mode.
struct Bench {
    control: Arc<CathodeControlLoop>,
    _simulated: Vec<MockPowerSupply>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = CathodeConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate().map_err(|e| anyhow!(e))?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    println!("⚡ {} - cathode heating control", config.application.name);
    if cli.simulate {
        println!("   Mode: simulated hardware");
    }
    println!();

    let bench = build_bench(&config, cli.simulate).await?;
    let control = Arc::clone(&bench.control);

    let result = match cli.command {
        Commands::Monitor { seconds } => monitor(&control, seconds).await,
        Commands::SetTarget {
            channel,
            current_ma,
        } => set_target(&control, &channel, current_ma).await,
        Commands::SetVoltage { channel, volts } => set_voltage(&control, &channel, volts).await,
        Commands::Ramp {
            channel,
            target_v,
            rate,
        } => ramp(&control, &channel, target_v, rate).await,
        Commands::Output { channel, enabled } => set_output(&control, &channel, enabled).await,
        Commands::Readings { channel } => readings(&control, channel.as_deref()).await,
    };

    control.shutdown().await;
    drop(bench);
    result
}

async fn build_bench(config: &CathodeConfig, simulate: bool) -> Result<Bench> {
    let models = CathodeModels::from_config(&config.models).context("Invalid cathode model tables")?;
    let mut control =
        CathodeControlLoop::new(models, config.safety.clone(), config.ramp.clone());
    let mut simulated = Vec::new();

    for channel in &config.channels {
        let (supply, sensor) = if simulate {
            let (port, sim) = MockPowerSupply::spawn(&channel.port, config.power_supply.timeout());
            simulated.push(sim);
            let sensor: Arc<dyn TemperatureSensor> = Arc::new(MockTemperatureSensor::new());
            (Some(port), Some(sensor))
        } else {
            (open_port(config, channel).await, None)
        };

        control.add_channel(
            channel,
            ChannelHardware {
                supply: supply.map(|port| Arc::new(PowerSupply9014::new(port))),
                sensor,
            },
        )?;
    }

    if !simulate {
        println!("ℹ️  Temperature controllers are not attached in hardware mode");
    }

    Ok(Bench {
        control: Arc::new(control),
        _simulated: simulated,
    })
}

async fn open_port(config: &CathodeConfig, channel: &ChannelConfig) -> Option<CommandChannel> {
    if config.power_supply.mock {
        return Some(CommandChannel::mock(&channel.port));
    }

    #[cfg(feature = "tokio_serial")]
    let opened = CommandChannel::open(
        &channel.port,
        config.power_supply.baud_rate,
        config.power_supply.timeout(),
    )
    .await
    .map_err(|e| e.to_string());

    #[cfg(not(feature = "tokio_serial"))]
    let opened: Result<CommandChannel, String> =
        Err("serial support not compiled in".to_string());

    match opened {
        Ok(port) => {
            println!("🔌 Initialized power supply on port {}", channel.port);
            Some(port)
        }
        Err(e) => {
            eprintln!(
                "❌ Failed to initialize power supply on port {}: {}",
                channel.port, e
            );
            None
        }
    }
}

fn channel_index(control: &CathodeControlLoop, label: &str) -> Result<usize> {
    control
        .snapshots()
        .iter()
        .position(|s| s.label.eq_ignore_ascii_case(label))
        .ok_or_else(|| anyhow!("No cathode labelled '{}'", label))
}

async fn monitor(control: &Arc<CathodeControlLoop>, seconds: Option<u64>) -> Result<()> {
    let mut events = control.subscribe();
    let poll = control.start_safety_poll();
    println!("📡 Monitoring - press Ctrl+C to stop");

    let deadline = async {
        match seconds {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    eprintln!("Failed to listen for Ctrl+C: {}", e);
                }
            }
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(CathodeEvent::TemperatureSampled { channel, celsius, status }) => {
                    println!("   [{}] {:>8.2} °C  {}", channel, celsius, status);
                }
                Ok(CathodeEvent::StatusChanged { channel, from, to }) => {
                    println!("⚠️  [{}] {} -> {}", channel, from, to);
                }
                Ok(CathodeEvent::OutputChanged { channel, enabled }) => {
                    println!("🔌 [{}] output {}", channel, if enabled { "ON" } else { "OFF" });
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => eprintln!("   ({} events dropped)", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    poll.stop().await;
    println!("\n👋 Monitor stopped");
    Ok(())
}

async fn set_target(control: &CathodeControlLoop, label: &str, current_ma: f64) -> Result<()> {
    let index = channel_index(control, label)?;
    let state = control.set_target_current(index, current_ma).await?;
    let snapshot = control.snapshot(index)?;
    let p = snapshot.predictions;

    println!("Cathode {} -> {:?}", snapshot.label, state);
    println!("   Emission current: {} mA", p.emission_current_ma.display(2));
    println!("   Heater current:   {} A", p.heater_current_a.display(2));
    println!("   Heater voltage:   {} V", p.heater_voltage_v.display(2));
    println!("   Grid current:     {} mA", p.grid_current_ma.display(2));
    println!("   Temperature:      {} °C", p.temperature_c.display(0));
    Ok(())
}

async fn set_voltage(control: &CathodeControlLoop, label: &str, volts: f64) -> Result<()> {
    let index = channel_index(control, label)?;
    let p = control.set_manual_voltage(index, volts).await?;

    println!("Cathode {} manual voltage {:.2} V", label, volts);
    println!("   Heater current:   {} A", p.heater_current_a.display(2));
    println!("   Emission current: {} mA", p.emission_current_ma.display(2));
    println!("   Grid current:     {} mA", p.grid_current_ma.display(2));
    println!("   Temperature:      {} °C", p.temperature_c.display(0));
    Ok(())
}

async fn set_output(control: &CathodeControlLoop, label: &str, enabled: bool) -> Result<()> {
    let index = channel_index(control, label)?;
    control.set_output(index, enabled).await?;
    println!("✅ Heater {} output {}", label, if enabled { "ON" } else { "OFF" });
    Ok(())
}

async fn ramp(
    control: &CathodeControlLoop,
    label: &str,
    target_v: f64,
    rate: Option<f64>,
) -> Result<()> {
    let index = channel_index(control, label)?;
    let handle = control.ramp_heater_voltage(index, target_v, rate).await?;
    let mut progress = handle.progress();
    println!("▶️  Ramping cathode {} to {:.2} V", label, target_v);

    let watcher = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let v = *progress.borrow();
            println!("   {:.2} V", v);
        }
    });

    let outcome = handle.wait().await;
    watcher.abort();

    if outcome.is_success() {
        println!("✅ Target voltage reached: {:.2} V", outcome.voltage_v());
        Ok(())
    } else {
        bail!("Ramp ended early: {:?}", outcome)
    }
}

async fn readings(control: &CathodeControlLoop, label: Option<&str>) -> Result<()> {
    let indices: Vec<usize> = match label {
        Some(label) => vec![channel_index(control, label)?],
        None => (0..control.channel_count()).collect(),
    };

    for index in indices {
        let snapshot = control.snapshot(index)?;
        match control.read_display(index).await {
            Ok(r) => println!(
                "Cathode {}: {:.3} V  {:.3} A  {}",
                snapshot.label, r.voltage_v, r.current_a, r.mode
            ),
            Err(e) => println!("Cathode {}: {}", snapshot.label, e),
        }
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(())
}
