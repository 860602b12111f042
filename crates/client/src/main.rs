//! usbip-client
//!
//! Imports USB devices exported by a remote USB/IP host and keeps them
//! attached until interrupted.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use client::config::ClientConfig;
use client::network::{ConnectOptions, DeviceLocation, connect, list_devices, resolve};
use client::virtual_usb::{DeviceSession, NullHost, VirtualUsbManager};
use common::setup_logging;
use protocol::BusId;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usbip-client")]
#[command(author, version, about = "USB/IP client - use USB devices exported by a remote host")]
#[command(long_about = "
Imports USB devices exported by a USB/IP host (usbipd) over TCP and forwards
USB transfers to them.

EXAMPLES:
    # List devices exported by a host
    usbip-client list 192.168.1.20

    # Import bus-id 1-1 and keep it until Ctrl+C
    usbip-client attach 192.168.1.20 1-1

    # Import and remember for auto-import on the next start
    usbip-client attach pi.local 1-1.4 --remember

    # Import every remembered device marked auto_import
    usbip-client auto

CONFIGURATION:
    The client looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbip-client/client.toml
    3. /etc/usbip-client/client.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// TCP port of the remote host (defaults to network.tcp_port)
    #[arg(short, long, value_name = "PORT", global = true)]
    service: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices exported by a remote host
    List {
        /// Host name or address
        host: String,
    },
    /// Import one device and keep it attached until Ctrl+C
    Attach {
        /// Host name or address
        host: String,
        /// Bus-id of the device on the remote host
        busid: String,
        /// Remember this device and import it on `auto`
        #[arg(long)]
        remember: bool,
    },
    /// Import every remembered device marked for auto-import
    Auto,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ClientConfig::default();
        let path = ClientConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ClientConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ClientConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.client.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbip-client v{}", env!("CARGO_PKG_VERSION"));

    let service = args
        .service
        .clone()
        .unwrap_or_else(|| config.network.tcp_port.clone());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
        }
        signal_token.cancel();
    });

    match args.command {
        Some(Command::List { host }) => list(&config, &host, &service, &shutdown).await,
        Some(Command::Attach {
            host,
            busid,
            remember,
        }) => {
            let busid = BusId::new(busid).context("Invalid bus-id")?;
            let location = DeviceLocation::new(host, service, busid);
            attach(config, args.config, location, remember, &shutdown).await
        }
        Some(Command::Auto) => auto(&config, &shutdown).await,
        None => bail!("No command given, see --help"),
    }
}

/// Print the devices a host exports
async fn list(
    config: &ClientConfig,
    host: &str,
    service: &str,
    shutdown: &CancellationToken,
) -> Result<()> {
    let candidates = resolve(host, service).await?;
    let options = ConnectOptions::from(&config.network);
    let mut stream = connect(candidates, &options, shutdown)
        .await
        .with_context(|| format!("Failed to connect to {}:{}", host, service))?;
    let devices = list_devices(&mut stream, shutdown)
        .await
        .context("Device list query failed")?;

    if devices.is_empty() {
        println!("{} exports no devices", host);
        return Ok(());
    }

    println!("Exportable USB devices on {}:", host);
    for exported in &devices {
        let device = &exported.device;
        println!(
            "  {:<12} {:04x}:{:04x}  class {:02x}/{:02x}/{:02x}  {}",
            device.busid,
            device.vendor_id,
            device.product_id,
            device.class,
            device.subclass,
            device.protocol,
            device.speed
        );
        println!("  {:<12} {}", "", device.path);
        for (i, interface) in exported.interfaces.iter().enumerate() {
            println!(
                "  {:<12}   interface {}: {:02x}/{:02x}/{:02x}",
                "", i, interface.class, interface.subclass, interface.protocol
            );
        }
    }
    Ok(())
}

/// Import one device and hold it until Ctrl+C or the remote drops it
async fn attach(
    mut config: ClientConfig,
    config_path: Option<PathBuf>,
    location: DeviceLocation,
    remember: bool,
    shutdown: &CancellationToken,
) -> Result<()> {
    let manager = VirtualUsbManager::new(&config, Arc::new(NullHost));
    let session = manager
        .attach(location.clone(), shutdown)
        .await
        .with_context(|| format!("Failed to import {}", location))?;

    print_attached(&session);

    if remember {
        config.remember(&location, true);
        let path = config_path.unwrap_or_else(ClientConfig::default_path);
        match config.save(&path) {
            Ok(()) => info!("Remembered {} in {}", location, path.display()),
            Err(e) => warn!("Failed to save configuration: {:#}", e),
        }
    }

    hold(&manager, shutdown).await
}

/// Import everything marked for auto-import
async fn auto(config: &ClientConfig, shutdown: &CancellationToken) -> Result<()> {
    let manager = VirtualUsbManager::new(config, Arc::new(NullHost));
    let results = manager.auto_import(config, shutdown).await;
    if results.is_empty() {
        bail!("No devices are marked for auto-import");
    }

    let mut attached = 0;
    for (location, result) in results {
        match result {
            Ok(session) => {
                print_attached(&session);
                attached += 1;
            }
            Err(e) => error!("{}: {}", location, e),
        }
    }
    if attached == 0 {
        bail!("No device could be imported");
    }

    hold(&manager, shutdown).await
}

fn print_attached(session: &DeviceSession) {
    match session.device() {
        Some(device) => println!(
            "Port {}: {} ({:04x}:{:04x}, {})",
            session.port(),
            session.location(),
            device.vendor_id,
            device.product_id,
            device.speed
        ),
        None => println!("Port {}: {}", session.port(), session.location()),
    }
}

/// Wait for shutdown or for every session to end, then detach the rest
async fn hold(manager: &VirtualUsbManager, shutdown: &CancellationToken) -> Result<()> {
    let sessions: Vec<_> = manager
        .imported_devices()
        .iter()
        .filter_map(|d| manager.session(d.port))
        .collect();

    let all_ended = async {
        for session in &sessions {
            // The wait itself is never cancelled here
            let _ = session.wait_detached(&CancellationToken::new()).await;
        }
    };

    info!("Holding {} device(s). Press Ctrl+C to detach.", sessions.len());
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = all_ended => {
            warn!("All remote devices were disconnected");
            return Ok(());
        }
    }

    info!("Detaching virtual USB devices...");
    let detached = manager
        .detach_all(&CancellationToken::new())
        .await
        .context("Failed to detach devices")?;
    info!("Detached {} device(s)", detached);
    Ok(())
}
