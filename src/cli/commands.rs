use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::analysis::build_scorer;
use crate::config::Config;
use crate::devices::motor::{Command, MotorModel};
use crate::devices::registers::POLL_SET;
use crate::modbus::client::{ClientSettings, RegisterClient};
use crate::modbus::simulator::SimulatedDrive;
use crate::modbus::transport::{list_serial_ports, SerialTransport, Transport};
use crate::output::{formatter_for, spawn_writer, ConsoleFormatter, ConsoleSender, FileSender, LogSink, RecordFormatter};
use crate::services::maintenance::{AlertEvent, EvaluatorSettings, MaintenanceEvaluator, MaintenanceService};
use crate::services::monitor::{ContinuousMonitor, MonitorSettings};
#[cfg(feature = "sqlite")]
use crate::storage::SampleStore;

/// Runs the selected subcommand with the effective configuration.
pub async fn handle_subcommands(matches: &ArgMatches, config: Config) -> Result<()> {
    match matches.subcommand() {
        Some(("ports", _)) => list_ports(),
        Some(("config", sub)) => write_default_config(sub),
        #[cfg(feature = "sqlite")]
        Some(("history", sub)) => show_history(&config, sub).await,
        Some((name, sub)) => {
            if matches.get_flag("simulate") {
                let drive = SimulatedDrive::new(config.slave_id, config.motor.control_words);
                run_with_transport(name, sub, drive, &config).await
            } else {
                let port = SerialTransport::open(&config.serial())
                    .with_context(|| format!("opening serial port {}", config.port))?;
                run_with_transport(name, sub, port, &config).await
            }
        }
        None => bail!("no subcommand given"),
    }
}

async fn run_with_transport<T: Transport + 'static>(
    name: &str,
    matches: &ArgMatches,
    transport: T,
    config: &Config,
) -> Result<()> {
    info!("🔌 Using {}", transport.describe());
    let client = RegisterClient::new(transport, ClientSettings::from_config(config));
    match name {
        "monitor" => run_monitor(client, config).await,
        "read" => read_once(client, config).await,
        "command" => send_command(client, config, matches).await,
        other => bail!("unknown subcommand '{}'", other),
    }
}

fn list_ports() -> Result<()> {
    let ports = list_serial_ports()?;
    println!("📡 Available Serial Ports:");
    if ports.is_empty() {
        println!("   ⚠️  No serial ports found");
    }
    for (index, port) in ports.iter().enumerate() {
        println!("   {}. {}", index + 1, port);
    }
    Ok(())
}

fn write_default_config(matches: &ArgMatches) -> Result<()> {
    let Some(path) = matches.get_one::<String>("path") else {
        bail!("missing configuration path");
    };
    Config::default().save_to_file(path)?;
    println!("✅ Default configuration written to {}", path);
    Ok(())
}

async fn read_once<T: Transport>(mut client: RegisterClient<T>, config: &Config) -> Result<()> {
    let model = MotorModel::from_settings(&config.motor);
    let sample = client.read_registers(POLL_SET).await?;
    let state = model.apply(&sample);
    print!("{}", ConsoleFormatter.format_state(&state, &sample));
    Ok(())
}

fn parse_command(matches: &ArgMatches) -> Result<Command> {
    let command = match matches.subcommand() {
        Some(("start", _)) => Command::Start,
        Some(("stop", _)) => Command::Stop,
        Some(("reset-fault", _)) => Command::ResetFault,
        Some(("set-speed", sub)) => match sub.get_one::<f64>("percent") {
            Some(percent) => Command::SetSpeed(*percent),
            None => bail!("set-speed needs a percentage"),
        },
        _ => bail!("expected one of start, stop, reset-fault, set-speed"),
    };
    Ok(command)
}

/// One-shot command: read the current state, validate against it, write, read back.
async fn send_command<T: Transport>(
    mut client: RegisterClient<T>,
    config: &Config,
    matches: &ArgMatches,
) -> Result<()> {
    let command = parse_command(matches)?;
    let model = MotorModel::from_settings(&config.motor);

    let current = model.apply(&client.read_registers(POLL_SET).await?);
    model.validate(&command, &current)?;
    for write in model.encode(&command) {
        client.write_register(write).await?;
    }
    println!("✅ {} sent to slave {}", command, config.slave_id);

    let after = model.apply(&client.read_registers(POLL_SET).await?);
    println!("🔹 Motor state: {} → {}", current.mode, after.mode);
    Ok(())
}

async fn run_monitor<T: Transport + 'static>(client: RegisterClient<T>, config: &Config) -> Result<()> {
    let capacity = config.output.channel_capacity;
    let model = MotorModel::from_settings(&config.motor);
    let scorer = build_scorer(&config.scoring)?;
    info!("🧮 Anomaly scorer: {}", scorer.name());

    let mut monitor = ContinuousMonitor::new(MonitorSettings::from_config(config), client, model, scorer);
    let maintenance = MaintenanceService::spawn(
        MaintenanceEvaluator::new(EvaluatorSettings::from_config(config)),
        config.maintenance.channel_capacity,
    );
    monitor.add_sink(maintenance.sink())?;
    monitor.add_sink(Arc::new(LogSink))?;

    let mut writers = Vec::new();
    if config.output.console {
        let (sink, task) = spawn_writer(
            "console",
            formatter_for(config.output.console_format),
            Box::new(ConsoleSender),
            true,
            capacity,
        );
        monitor.add_sink(Arc::new(sink))?;
        writers.push(task);
    }
    if config.output.file.enabled {
        let sender = FileSender::open(&config.output.file.path).await?;
        let write_header = sender.is_empty().await;
        let (sink, task) = spawn_writer(
            "file",
            formatter_for(config.output.file.format),
            Box::new(sender),
            write_header,
            capacity,
        );
        monitor.add_sink(Arc::new(sink))?;
        writers.push(task);
    }

    #[cfg(feature = "sqlite")]
    let store = if config.output.database.enabled {
        let store = SampleStore::open(&config.output.database).await?;
        let (sink, task) = store.spawn_writer(capacity);
        monitor.add_sink(sink)?;
        writers.push(task);
        Some(store)
    } else {
        None
    };

    let alerts = spawn_alert_forwarder(
        maintenance.subscribe(),
        AlertOutputs {
            console: config.output.console.then(|| formatter_for(config.output.console_format)),
            #[cfg(feature = "sqlite")]
            store: store.clone(),
        },
    );

    monitor.start(config.poll_interval())?;
    println!("🛑 Press Ctrl+C to stop");

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Ctrl-C received, stopping monitor");
            monitor.stop().await
        }
        result = monitor.wait() => result,
    };

    let status = monitor.status();
    drop(monitor);

    let evaluator = maintenance.shutdown().await?;
    for writer in writers {
        if let Err(e) = writer.await {
            warn!("⚠️  Output task failed: {}", e);
        }
    }
    if let Err(e) = alerts.await {
        warn!("⚠️  Alert forwarder failed: {}", e);
    }
    #[cfg(feature = "sqlite")]
    if let Some(store) = store {
        store.close().await;
    }

    println!("📊 Final Statistics:");
    println!("   ✅ Completed ticks: {}", status.stats.ticks_completed);
    println!("   ❌ Failed ticks: {}", status.stats.ticks_failed);
    println!("   ⏱️  Cadence misses: {} ({} ticks skipped)", status.stats.cadence_misses, status.stats.ticks_skipped);
    println!("   🚨 Alerts raised: {}", evaluator.alert_count());

    outcome.context("monitor terminated")
}

struct AlertOutputs {
    console: Option<Box<dyn RecordFormatter>>,
    #[cfg(feature = "sqlite")]
    store: Option<SampleStore>,
}

/// Prints alert events and appends them to the store until the maintenance service shuts down.
fn spawn_alert_forwarder(mut alerts: broadcast::Receiver<AlertEvent>, outputs: AlertOutputs) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match alerts.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    warn!("⚠️  Alert forwarder lagged, {} events missed", missed);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if let Some(formatter) = &outputs.console {
                println!("{}", formatter.format_alert(&event));
            }
            #[cfg(feature = "sqlite")]
            if let Some(store) = &outputs.store {
                if let Err(e) = store.record_alert(&event).await {
                    warn!("⚠️  Alert {} not stored: {}", event.alert().id, e);
                }
            }
        }
    })
}

#[cfg(feature = "sqlite")]
async fn show_history(config: &Config, matches: &ArgMatches) -> Result<()> {
    let limit = matches.get_one::<i64>("limit").copied().unwrap_or(20);
    let store = SampleStore::open(&config.output.database).await?;

    let samples = store.recent_samples(limit).await?;
    if samples.is_empty() {
        println!("📭 No stored samples in {}", config.output.database.path);
    } else {
        println!("📜 Last {} samples:", samples.len());
    }
    for sample in samples.iter().rev() {
        let when = chrono::DateTime::from_timestamp_millis(sample.captured_at)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "   #{:<6} {} {:<8} speed {:>6} RPM  set {:>6} %  {}",
            sample.sequence,
            when,
            sample.mode,
            sample.actual_speed.map(|s| format!("{:.0}", s)).unwrap_or_else(|| "-".into()),
            sample.commanded_speed.map(|s| format!("{:.1}", s)).unwrap_or_else(|| "-".into()),
            match (sample.is_anomalous, &sample.reason) {
                (Some(true), Some(reason)) => format!("⚠️  {}", reason),
                (Some(false), Some(reason)) => reason.clone(),
                _ => "unscored".to_string(),
            }
        );
    }

    for event in store.recent_alert_events(limit).await?.iter().rev() {
        let when = chrono::DateTime::from_timestamp_millis(event.occurred_at)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!("   🚨 {} {} {} (motor {})", when, event.alert_id, event.event, event.mode);
    }

    store.close().await;
    Ok(())
}
