//! ramses - command line client for RAMSES-II gateways
//!
//! - `monitor` streams decoded traffic from a gateway
//! - `parse` decodes a recorded log without transmitting
//! - `execute` sends commands and prints what answered them
//! - `get-schedule`, `set-schedule` and `get-faults` run the multi-packet
//!   procedures against a controller

mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ramses_rf::GatewayConfig;

#[derive(Parser)]
#[command(name = "ramses")]
#[command(about = "Monitor and control RAMSES-II heating systems")]
struct Args {
    /// Enable verbose logging (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Gateway configuration file (JSON)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Stream decoded messages from a gateway
    Monitor {
        /// Serial port of the gateway
        port: PathBuf,
        /// Also print each line as received
        #[arg(long)]
        raw: bool,
        /// Probe for missing schema periodically
        #[arg(long)]
        discover: bool,
        /// Seed the topology from a schema file
        #[arg(long, value_name = "FILE")]
        schema: Option<PathBuf>,
        /// Write the learned topology on exit
        #[arg(long, value_name = "FILE")]
        save_schema: Option<PathBuf>,
    },
    /// Decode a recorded log
    Parse {
        /// Log file, one line per packet
        file: PathBuf,
        /// Seed the topology from a schema file
        #[arg(long, value_name = "FILE")]
        schema: Option<PathBuf>,
        /// Write the learned topology when done
        #[arg(long, value_name = "FILE")]
        save_schema: Option<PathBuf>,
        /// Print messages as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send commands, e.g. `"RQ 01:145038 0004 0100"`
    Execute {
        /// Serial port of the gateway
        port: PathBuf,
        /// Commands to send, in order
        #[arg(required = true)]
        frames: Vec<String>,
    },
    /// Read a zone schedule
    GetSchedule {
        /// Serial port of the gateway
        port: PathBuf,
        /// Controller address
        ctl: String,
        /// Zone index in hex, or HW for hot water
        zone: String,
    },
    /// Write a zone schedule from a JSON file
    SetSchedule {
        /// Serial port of the gateway
        port: PathBuf,
        /// Controller address
        ctl: String,
        /// Zone index in hex, or HW for hot water
        zone: String,
        /// Schedule file (JSON)
        file: PathBuf,
    },
    /// Read the controller's fault log
    GetFaults {
        /// Serial port of the gateway
        port: PathBuf,
        /// Controller address
        ctl: String,
        /// Most entries to read
        #[arg(long, default_value_t = ramses_rf::MAX_FAULT_LOG_ENTRIES)]
        limit: u8,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout carries the output
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => GatewayConfig::default(),
    };

    match args.command {
        Cmd::Monitor {
            port,
            raw,
            discover,
            schema,
            save_schema,
        } => {
            commands::monitor(
                config,
                &port,
                commands::MonitorOptions {
                    raw,
                    discover,
                    schema,
                    save_schema,
                },
            )
            .await
        }
        Cmd::Parse {
            file,
            schema,
            save_schema,
            json,
        } => commands::parse(&config, &file, schema.as_deref(), save_schema.as_deref(), json).await,
        Cmd::Execute { port, frames } => commands::execute(config, &port, &frames).await,
        Cmd::GetSchedule { port, ctl, zone } => {
            commands::get_schedule(config, &port, &ctl, &zone).await
        }
        Cmd::SetSchedule {
            port,
            ctl,
            zone,
            file,
        } => commands::set_schedule(config, &port, &ctl, &zone, &file).await,
        Cmd::GetFaults { port, ctl, limit } => commands::get_faults(config, &port, &ctl, limit).await,
    }
}
