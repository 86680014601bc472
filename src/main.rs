use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serial_gateway::config::GatewayConfig;
use serial_gateway::gateway::Gateway;
use serial_gateway::hardware::SystemDriver;
use serial_gateway::logging::init_tracing;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Serial Gateway - expose serial devices to network clients
///
/// Clients speak newline-delimited JSON over TCP; each request is routed to one
/// configured device and executed in an exclusive session on that device.
#[derive(Parser)]
#[command(name = "serial-gateway")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Serial-to-network gateway", long_about = None)]
struct Cli {
    /// Configuration file (TOML); `SERIAL_GATEWAY_*` variables override it
    #[arg(short, long, default_value = "config/gateway.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default)
    Serve {
        /// Override `server.listen`
        #[arg(short, long)]
        listen: Option<String>,

        /// Override `logging.level`
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Validate the configuration and print the device table
    Check {
        /// Also print the effective configuration (file + environment) as TOML
        #[arg(long)]
        effective: bool,
    },
    /// List serial ports visible to this host
    Ports,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve {
        listen: None,
        log_level: None,
    }) {
        Commands::Serve { listen, log_level } => serve(cli.config, listen, log_level).await,
        Commands::Check { effective } => check(cli.config, effective),
        Commands::Ports => ports(),
    }
}

async fn serve(
    config_path: PathBuf,
    listen: Option<String>,
    log_level: Option<String>,
) -> Result<()> {
    let mut config = GatewayConfig::load_from(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    if let Some(listen) = listen {
        config.server.listen = listen;
    }
    if let Some(level) = log_level {
        config.logging.level = level;
    }

    init_tracing(&config.logging).context("Failed to initialize logging")?;
    info!(config = %config_path.display(), "Starting serial gateway");

    let gateway = Gateway::start(config, Arc::new(SystemDriver::new()))
        .await
        .context("Failed to start gateway")?;
    gateway
        .run_until(shutdown_signal())
        .await
        .context("Gateway terminated abnormally")
}

fn check(config_path: PathBuf, effective: bool) -> Result<()> {
    let config = GatewayConfig::load_from(&config_path)
        .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;
    let (usable, rejected) = config.partition_devices();

    if effective {
        let rendered =
            toml::to_string_pretty(&config).context("Failed to render configuration")?;
        println!("{}", rendered);
    }

    println!("listen: {}", config.server.listen);
    println!("{:<12} {:<24} {:<9} {:>8}  framing", "device", "path", "kind", "baud");
    for device in &usable {
        println!(
            "{:<12} {:<24} {:<9} {:>8}  {:?}",
            device.id,
            device.path,
            format!("{:?}", device.kind).to_lowercase(),
            device.baud_rate,
            device.framing
        );
    }
    for (id, err) in &rejected {
        println!("{:<12} REJECTED: {}", id, err);
    }

    if rejected.is_empty() {
        println!("configuration OK ({} devices)", usable.len());
        Ok(())
    } else {
        anyhow::bail!("{} device(s) rejected", rejected.len())
    }
}

#[cfg(feature = "instrument_serial")]
fn ports() -> Result<()> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        let kind = match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => format!(
                "usb {:04x}:{:04x} {}",
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            serialport::SerialPortType::PciPort => "pci".to_string(),
            serialport::SerialPortType::BluetoothPort => "bluetooth".to_string(),
            serialport::SerialPortType::Unknown => "unknown".to_string(),
        };
        println!("{:<24} {}", port.port_name, kind);
    }
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
fn ports() -> Result<()> {
    anyhow::bail!("Serial support not enabled. Rebuild with --features instrument_serial")
}

/// Completes on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
