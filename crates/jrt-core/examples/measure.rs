//! JRT Sensor Measurement Tool
//!
//! Connects to a JRT laser distance sensor and prints measurements.
//!
//! Usage:
//!   cargo run --example measure -- [OPTIONS] [PORT]
//!
//! Options:
//!   --port PORT       Serial port (default: first USB serial adapter)
//!   --config FILE     JSON sensor configuration
//!   --count N         Number of measurements to print (default: 1)
//!   --continuous      Use continuous mode instead of single shots
//!   --status          Read the status register before measuring
//!   --laser           Switch the laser pointer on while measuring
//!
//! Set RUST_LOG=jrt_core=debug to see the frames on the wire.

use std::time::Duration;

use anyhow::{bail, Context};
use jrt_core::prelude::*;
use tracing_subscriber::EnvFilter;

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut port_name: Option<String> = None;
    let mut config_path: Option<String> = None;
    let mut count = 1usize;
    let mut continuous = false;
    let mut read_status = false;
    let mut laser = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                if i < args.len() {
                    port_name = Some(args[i].clone());
                }
            }
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = Some(args[i].clone());
                }
            }
            "--count" | "-n" => {
                i += 1;
                if i < args.len() {
                    count = args[i].parse().unwrap_or(1);
                }
            }
            "--continuous" => continuous = true,
            "--status" => read_status = true,
            "--laser" => laser = true,
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            arg if !arg.starts_with('-') => port_name = Some(arg.to_string()),
            other => eprintln!("Unknown option: {}", other),
        }
        i += 1;
    }

    let config = match &config_path {
        Some(path) => SensorConfig::load(path).with_context(|| format!("loading {}", path))?,
        None => SensorConfig::default(),
    };

    let provider = match port_name {
        Some(name) => SystemDevices::with_port(name),
        None => SystemDevices::new(),
    };
    let mut conn = SensorConnection::new(provider, config)?;

    println!("Connecting...");
    let mut state = conn.connect().await?;
    if state == ConnectionState::PermissionRequired {
        if !conn.request_permission().await? {
            bail!("no access to {:?}", conn.device());
        }
        state = conn.connect().await?;
    }
    match state {
        ConnectionState::Connected => {}
        ConnectionState::NoDeviceFound => bail!("no sensor found"),
        other => bail!("could not connect: {:?}", other),
    }
    println!("✓ Connected to {:?}", conn.device().map(|d| &d.name));

    let Some(engine) = conn.engine().cloned() else {
        bail!("connection has no engine");
    };
    let session = conn.session().clone();

    if read_status {
        send_command(&engine, &session, Command::ReadStatus).await?;
        println!("Status: {}", session.status_message());
    }
    if laser {
        send_command(&engine, &session, Command::PowerLaserOn).await?;
    }

    let mut measurements = session.subscribe_measurement();

    if continuous {
        engine.start_continuous().await?;
    }

    for n in 1..=count {
        if !continuous {
            engine.request_single_shot().await?;
        }
        tokio::time::timeout(REPLY_TIMEOUT, measurements.changed())
            .await
            .context("no measurement reply")??;
        if let Some(m) = *measurements.borrow_and_update() {
            println!(
                "[{:>3}] {} mm (signal quality {}) at {}",
                n,
                m.distance,
                m.signal_quality,
                m.received_at.format("%H:%M:%S%.3f")
            );
        }
    }

    if continuous {
        send_command(&engine, &session, Command::StopContinuous).await?;
    }
    if laser {
        send_command(&engine, &session, Command::PowerLaserOff).await?;
    }

    let stats = session.stats();
    println!(
        "Sent {} commands ({} bytes), received {} frames ({} bytes), {} malformed",
        stats.commands_sent,
        stats.bytes_sent,
        stats.frames_received,
        stats.bytes_received,
        stats.frames_malformed
    );

    conn.disconnect().await;
    println!("✓ Disconnected");
    Ok(())
}

/// Send `command` and, if the sensor answers it, wait for the reply frame
async fn send_command(
    engine: &ProtocolEngine,
    session: &Session,
    command: Command,
) -> anyhow::Result<()> {
    let mut raw = session.subscribe_raw_frame();
    engine.send(command).await?;
    if command.expects_response() {
        tokio::time::timeout(REPLY_TIMEOUT, raw.changed())
            .await
            .with_context(|| format!("no reply to {}", command.name()))??;
        println!("  {} -> {}", command.name(), session.raw_frame());
    }
    Ok(())
}

fn print_help() {
    println!("JRT Sensor Measurement Tool");
    println!();
    println!("Usage: measure [OPTIONS] [PORT]");
    println!();
    println!("Options:");
    println!("  --port, -p PORT     Serial port (default: first USB serial adapter)");
    println!("  --config, -c FILE   JSON sensor configuration");
    println!("  --count, -n N       Number of measurements (default: 1)");
    println!("  --continuous        Use continuous mode instead of single shots");
    println!("  --status            Read the status register before measuring");
    println!("  --laser             Switch the laser pointer on while measuring");
    println!("  --help, -h          Show this help");
}
