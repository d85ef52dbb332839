use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use bridge_engine::{Bridge, BridgeObserver, EventChannel};
use device_link::{
    ChannelOpener, DeviceInfo, DeviceRegistry, DeviceState, LinkConfig, MockOpener, NullListener,
    SerialOpener,
};
use sim_link::SimLink;

mod profile;
use profile::{load_profile_file, save_profile_file};

#[derive(Parser, Debug)]
#[command(
    name = "xpbridge",
    version,
    about = "Bridge a flight simulator to cockpit hardware",
    disable_help_subcommand = true
)]
struct Cli {
    /// Use the in-process mock boards instead of serial ports
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports boards can be attached to
    Ports,
    /// Load and validate a profile, then print a summary
    Check {
        #[arg(long)]
        profile: PathBuf,
    },
    /// Run the bridge until Ctrl-C
    Run {
        #[arg(long)]
        profile: PathBuf,
        /// Override the simulator host from the profile
        #[arg(long)]
        sim_host: Option<String>,
        /// Override the simulator's receive port from the profile
        #[arg(long)]
        sim_port: Option<u16>,
        /// Follow the simulator announced by discovery beacons
        #[arg(long, action = ArgAction::SetTrue)]
        discover: bool,
        /// Write the final tables to this file on exit (YAML or JSON by extension)
        #[arg(long)]
        save_to: Option<PathBuf>,
    },
    /// Open one board, complete the handshake and send a raw line
    Send {
        #[arg(long)]
        port: String,
        #[arg(long)]
        line: String,
        #[arg(long, default_value_t = 115_200u32)]
        baud: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ports => list_ports(cli.mock),
        Commands::Check { profile } => check_profile(&profile),
        Commands::Run {
            profile,
            sim_host,
            sim_port,
            discover,
            save_to,
        } => {
            run_bridge(
                cli.mock,
                &profile,
                sim_host,
                sim_port,
                discover,
                save_to.as_deref(),
            )
            .await
        }
        Commands::Send { port, line, baud } => send_line(cli.mock, &port, &line, baud).await,
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

fn opener(mock: bool) -> Arc<dyn ChannelOpener> {
    if mock {
        Arc::new(MockOpener::new())
    } else {
        Arc::new(SerialOpener)
    }
}

fn list_ports(mock: bool) -> Result<()> {
    for port in opener(mock).list()? {
        println!("{}\t{}", port.name, port.driver);
    }
    Ok(())
}

fn check_profile(path: &std::path::Path) -> Result<()> {
    let profile = load_profile_file(path)?;
    println!(
        "profile: {}",
        profile.name.as_deref().unwrap_or("(unnamed)")
    );
    println!(
        "simulator: {}:{} (local {}){}",
        profile.sim.host,
        profile.sim.send_port,
        profile.sim.local_port,
        if profile.sim.discovery { ", discovery on" } else { "" }
    );
    println!("devices: {}", profile.devices.len());
    for device in &profile.devices {
        println!(
            "  {}\tbaud={}\tsubscriptions={}",
            device.port,
            device.baud_rate.unwrap_or(profile.link.baud_rate),
            device.subscriptions.len()
        );
    }
    println!("key mappings: {}", profile.mappings.len());
    println!("monitored: {}", profile.monitored.len());
    println!("input mappings: {}", profile.inputs.len());
    println!("logic blocks: {}", profile.logic.len());
    println!("variables: {}", profile.variables.len());
    println!("dataref entries: {}", profile.datarefs.len());
    Ok(())
}

/// Logs what a headless run would otherwise show in a UI.
struct ConsoleObserver;

impl BridgeObserver for ConsoleObserver {
    fn devices_changed(&self, devices: &[DeviceInfo]) {
        for d in devices {
            info!(
                port = %d.port,
                state = %d.state,
                board = d.board_type.as_deref().unwrap_or("-"),
                name = d.device_name.as_deref().unwrap_or("-"),
                "device"
            );
        }
    }

    fn line_received(&self, port: &str, line: &str) {
        tracing::debug!(port, line, "device line");
    }
}

async fn run_bridge(
    mock: bool,
    path: &std::path::Path,
    sim_host: Option<String>,
    sim_port: Option<u16>,
    discover: bool,
    save_to: Option<&std::path::Path>,
) -> Result<()> {
    let mut profile = load_profile_file(path)?;
    if let Some(host) = sim_host {
        profile.sim.host = host;
    }
    if let Some(port) = sim_port {
        profile.sim.send_port = port;
    }
    profile.sim.discovery |= discover;

    let events = EventChannel::new();
    let forwarder = events.forwarder();
    let sim = Arc::new(
        SimLink::new(profile.sim.clone(), forwarder.clone()).context("creating simulator link")?,
    );
    let registry = Arc::new(DeviceRegistry::new(
        opener(mock),
        forwarder,
        profile.link.clone(),
    ));
    let bridge = Bridge::new(
        profile.engine.clone(),
        sim.clone(),
        registry.clone(),
        events,
    )?;
    bridge.add_observer(Arc::new(ConsoleObserver));
    bridge.load_profile(&profile)?;

    sim.connect().context("connecting to the simulator")?;
    let started = bridge.connect_profile_devices();
    info!(
        devices = started,
        sim = %sim.endpoint(),
        "bridge started; press Ctrl-C to stop"
    );

    bridge
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "ctrl-c handler failed");
            }
        })
        .await?;

    info!("shutting down");
    bridge.shutdown();
    sim.disconnect();
    if let Some(out) = save_to {
        save_profile_file(out, &bridge.export_profile())?;
        info!(path = %out.display(), "profile saved");
    }
    print!("{}", bridge.metrics().encode_text());
    Ok(())
}

async fn send_line(mock: bool, port: &str, line: &str, baud: u32) -> Result<()> {
    let config = LinkConfig {
        baud_rate: baud,
        ..LinkConfig::default()
    };
    let wait = Duration::from_millis(config.settle_delay_ms + config.handshake_timeout_ms + 1_000);
    let registry = DeviceRegistry::new(opener(mock), Arc::new(NullListener), config);
    registry.connect(port, Some(baud))?;

    let deadline = Instant::now() + wait;
    loop {
        match registry.state(port) {
            Some(state) if state.is_ready() => break,
            Some(DeviceState::Error) | None => {
                let reason = registry
                    .info(port)
                    .and_then(|i| i.error_message)
                    .unwrap_or_else(|| "unknown error".to_string());
                registry.disconnect(port);
                anyhow::bail!("{port}: {reason}");
            }
            _ if Instant::now() >= deadline => {
                registry.disconnect(port);
                anyhow::bail!("{port}: no handshake within {} ms", wait.as_millis());
            }
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }

    if let Some(info) = registry.info(port) {
        println!(
            "{}\tboard={}\tfw={}\tname={}",
            info.port,
            info.board_type.as_deref().unwrap_or("-"),
            info.firmware_version.as_deref().unwrap_or("-"),
            info.device_name.as_deref().unwrap_or("-")
        );
    }
    registry.send_command(port, line)?;
    // Let the worker flush before the port closes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    registry.disconnect(port);
    Ok(())
}
