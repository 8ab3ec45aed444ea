//! opendiag - command-line tool for OBD/UDS vehicle diagnostics
//!
//! Talks to ECUs through an ELM327 dongle, an Autel VCI or the built-in mock vehicle.

mod commands;
mod connection;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use opendiag_core::config::{parse_hex_u16, parse_hex_u32};
use opendiag_core::OpenDiagConfig;

use crate::connection::{parse_address, Connection};
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "opendiag")]
#[command(author, version, about = "OBD/UDS vehicle diagnostics")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "OPENDIAG_CONFIG")]
    config: Option<PathBuf>,

    /// Adapter to connect to (defaults to the first one found)
    #[arg(short, long, env = "OPENDIAG_DEVICE")]
    device: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List reachable adapters
    Devices {
        /// Scan timeout in seconds
        #[arg(long, default_value = "3")]
        timeout: u64,
    },

    /// Discover ECUs and count their DTCs
    Modules,

    /// Read DTCs from one module
    Dtcs {
        /// Module request address (hex, e.g. 7E0)
        #[arg(value_parser = parse_address)]
        address: u32,
    },

    /// Clear all DTCs on one module
    ClearDtcs {
        #[arg(value_parser = parse_address)]
        address: u32,
    },

    /// Security access (unlock ECU)
    Unlock {
        #[arg(value_parser = parse_address)]
        address: u32,

        /// Security level (odd requestSeed sub-function, hex)
        #[arg(long, default_value = "01", value_parser = parse_u8)]
        level: u8,

        /// Key to send instead of computing one (hex)
        #[arg(long, conflicts_with = "algorithm")]
        key: Option<String>,

        /// Registered key algorithm id
        #[arg(long)]
        algorithm: Option<String>,
    },

    /// Read a data identifier
    Read {
        #[arg(value_parser = parse_address)]
        address: u32,

        /// Data identifier (hex, e.g. F190)
        #[arg(value_parser = parse_u16)]
        did: u16,
    },

    /// Write a data identifier
    Write {
        #[arg(value_parser = parse_address)]
        address: u32,

        #[arg(value_parser = parse_u16)]
        did: u16,

        /// Value as hex bytes
        value: String,
    },

    /// Drive an actuator through InputOutputControlByIdentifier
    Actuate {
        #[arg(value_parser = parse_address)]
        address: u32,

        /// Configured actuator id, or a hex DID
        actuator: String,

        /// Control parameter: 00 return, 01 reset, 02 freeze, 03 short-term adjust
        #[arg(value_parser = parse_u8)]
        param: u8,

        /// Control state as hex bytes
        state: Option<String>,
    },

    /// Run a routine through RoutineControl
    Routine {
        #[arg(value_parser = parse_address)]
        address: u32,

        /// Configured routine id, or a hex RID
        routine: String,

        /// Control type: 01 start, 02 stop, 03 request results
        #[arg(long, default_value = "01", value_parser = parse_u8)]
        control_type: u8,

        /// Option record as hex bytes
        data: Option<String>,
    },

    /// Send a raw adapter command (ELM327 only)
    At {
        /// Command text, e.g. ATRV
        command: String,
    },
}

fn parse_u8(value: &str) -> Result<u8> {
    let parsed = parse_hex_u32("value", value)?;
    u8::try_from(parsed).with_context(|| format!("'{}' does not fit in one byte", value))
}

fn parse_u16(value: &str) -> Result<u16> {
    Ok(parse_hex_u16("identifier", value)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("opendiag=debug,opendiag_core=debug")
        } else {
            EnvFilter::new("opendiag=info,opendiag_core=info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = match &cli.config {
        Some(path) => OpenDiagConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => OpenDiagConfig::default(),
    };

    let ctx = OutputContext::new(cli.output, cli.no_color, cli.quiet);

    if let Commands::Devices { timeout } = &cli.command {
        return commands::devices(&config, Duration::from_secs(*timeout), &ctx).await;
    }

    let conn = Connection::open(config, cli.device.as_deref()).await?;
    let result = run(&conn, &cli.command, &ctx).await;
    let closed = conn.close().await;
    result?;
    closed
}

async fn run(conn: &Connection, command: &Commands, ctx: &OutputContext) -> Result<()> {
    match command {
        Commands::Devices { .. } => Ok(()),
        Commands::Modules => commands::modules(conn, ctx).await,
        Commands::Dtcs { address } => commands::dtcs(conn, *address, ctx).await,
        Commands::ClearDtcs { address } => commands::clear_dtcs(conn, *address, ctx).await,
        Commands::Unlock {
            address,
            level,
            key,
            algorithm,
        } => {
            commands::unlock(conn, *address, *level, key.as_deref(), algorithm.as_deref(), ctx)
                .await
        }
        Commands::Read { address, did } => commands::read(conn, *address, *did, ctx).await,
        Commands::Write {
            address,
            did,
            value,
        } => commands::write(conn, *address, *did, value, ctx).await,
        Commands::Actuate {
            address,
            actuator,
            param,
            state,
        } => commands::actuate(conn, *address, actuator, *param, state.as_deref(), ctx).await,
        Commands::Routine {
            address,
            routine,
            control_type,
            data,
        } => {
            commands::routine(conn, *address, routine, *control_type, data.as_deref(), ctx).await
        }
        Commands::At { command } => commands::at(conn, command, ctx).await,
    }
}
