//! Console front end for the pressure link.
//!
//! ```bash
//! pressure_link ports
//! pressure_link monitor --port /dev/ttyUSB0 --baud 9600 --identify 20231234
//! RUST_LOG=pressure_link=debug pressure_link monitor --duration 30 --json
//! ```
//!
//! `monitor` prints every event and forwards each line typed on stdin to the
//! device as a command, until stdin closes or `--duration` elapses.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use pressure_link::adapters::NativeBackend;
use pressure_link::{LinkManager, Settings, TelemetryEvent};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pressure_link", version, about = "Pressure sensor serial link")]
struct Cli {
    /// Configuration file (defaults to ./pressure_link.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available serial ports
    Ports,
    /// Connect and print telemetry
    Monitor {
        /// Serial port; falls back to the configured port, then the first one found
        #[arg(long)]
        port: Option<String>,
        /// Baud rate; falls back to the configured rate
        #[arg(long)]
        baud: Option<i64>,
        /// Identification line sent right after connecting
        #[arg(long)]
        identify: Option<String>,
        /// Stop after this many seconds instead of waiting for stdin to close
        #[arg(long)]
        duration: Option<u64>,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_event(event: &TelemetryEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Failed to serialize event: {}", e),
        }
    } else {
        println!("{}", event);
    }
}

fn monitor(
    settings: &Settings,
    port: Option<String>,
    baud: Option<i64>,
    identify: Option<String>,
    duration: Option<u64>,
    json: bool,
) -> Result<()> {
    let link = LinkManager::with_timings(Arc::new(NativeBackend::new()), settings.link.timings())
        .context("Invalid link timings")?;

    let port = port
        .or_else(|| settings.link.port.clone())
        .or_else(|| link.list_ports().into_iter().next())
        .ok_or_else(|| anyhow!("No serial port given and none detected"))?;
    let baud = baud.unwrap_or_else(|| i64::from(settings.link.baud_rate));

    let subscription = link
        .subscribe(move |event| print_event(&event, json))
        .context("Failed to start event delivery")?;

    link.connect(&port, baud)
        .with_context(|| format!("Could not connect to {}", port))?;

    if let Some(id) = identify {
        link.send(&id).context("Failed to send identification")?;
    }

    match duration {
        Some(secs) => std::thread::sleep(Duration::from_secs(secs)),
        None => {
            for line in std::io::stdin().lock().lines() {
                let line = line.context("Failed to read stdin")?;
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = link.send(&line) {
                    eprintln!("Send failed: {}", e);
                }
            }
        }
    }

    link.disconnect();
    subscription.cancel();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    init_logging(&settings);

    match cli.command {
        Command::Ports => {
            let link = LinkManager::new(Arc::new(NativeBackend::new()));
            let ports = link.list_ports();
            if ports.is_empty() {
                eprintln!("No serial ports found");
            }
            for port in ports {
                println!("{}", port);
            }
            Ok(())
        }
        Command::Monitor {
            port,
            baud,
            identify,
            duration,
            json,
        } => monitor(&settings, port, baud, identify, duration, json),
    }
}
