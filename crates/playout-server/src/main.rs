mod aggregator;
mod clients;
mod config;
mod ember;
mod state;
mod timer;
mod tsl_sender;
mod websocket;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use playout_protocol::device::DeviceType;
use playout_protocol::{DEFAULT_OSC_STALE_TIMEOUT_MS, DEFAULT_TSL_REFRESH_INTERVAL_MS, DEFAULT_VMIX_POLL_INTERVAL_MS};

use crate::clients::casparcg::{self, CasparCgSettings};
use crate::clients::osc_listener::SharedOscListener;
use crate::clients::{hyperdeck, vmix};
use crate::ember::EmberProvider;
use crate::state::AppState;
use crate::tsl_sender::UmdSender;

#[derive(Parser, Debug)]
#[command(name = "playout-server", about = "Playout device aggregator and fan-out")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config/playout.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match config::load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e:#}");
            std::process::exit(2);
        }
    };
    let devices = config.resolve_devices()?;

    info!(
        devices = devices.len(),
        ws_port = config.settings.web_socket_port,
        "playout aggregator starting"
    );

    let state = AppState::new(config.clone(), devices.clone());

    let ember = EmberProvider::new(
        config.settings.ember_plus_port,
        config.settings.bind_address.clone(),
    );
    let tsl = UmdSender::new(
        config.settings.tsl_umd_screen,
        &config.settings.tsl_umd_destinations,
        Duration::from_millis(DEFAULT_TSL_REFRESH_INTERVAL_MS),
    );

    // Outputs first, so the very first device events reach them. A bind
    // failure disables that output; the rest of the system continues.
    if let Err(e) = ember.start(&devices).await {
        error!("Ember+ provider disabled: {e}");
    }
    ember.update_device_count(devices.len()).await;
    if let Err(e) = tsl.start(&devices).await {
        error!("TSL UMD sender disabled: {e}");
    }
    {
        let mut protocols = state.inner.protocols.write().await;
        protocols.ember_plus.running = ember.is_running().await;
        protocols.tsl_umd.running = tsl.is_running().await;
    }

    // One channel into the aggregation domain; protocol clients only
    // ever post events.
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let aggregator_handle = tokio::spawn(aggregator::run(
        state.clone(),
        events_rx,
        ember.clone(),
        tsl.clone(),
    ));

    let osc_listener = SharedOscListener::new(config.settings.default_ports.casparcg);
    let clients_cancel = CancellationToken::new();
    let mut client_handles = Vec::new();

    for device in &devices {
        let events = events_tx.clone();
        let cancel = clients_cancel.clone();
        let handle = match device.device_type {
            DeviceType::Hyperdeck => {
                tokio::spawn(hyperdeck::run(device.clone(), events, cancel))
            }
            DeviceType::Vmix => tokio::spawn(vmix::run(
                device.clone(),
                Duration::from_millis(DEFAULT_VMIX_POLL_INTERVAL_MS),
                events,
                cancel,
            )),
            DeviceType::Casparcg => {
                let entry = config.servers.iter().find(|s| s.id == device.id);
                let settings = CasparCgSettings {
                    channel: entry
                        .and_then(|s| s.channel)
                        .unwrap_or(casparcg::DEFAULT_CHANNEL),
                    layer: entry.and_then(|s| s.layer).unwrap_or(casparcg::DEFAULT_LAYER),
                    stale_timeout: Duration::from_millis(DEFAULT_OSC_STALE_TIMEOUT_MS),
                };
                tokio::spawn(casparcg::run(
                    device.clone(),
                    settings,
                    osc_listener.clone(),
                    events,
                    cancel,
                ))
            }
        };
        client_handles.push(handle);
    }
    drop(events_tx);

    let server_cancel = CancellationToken::new();
    let broadcast_handle = tokio::spawn(websocket::broadcast_loop(
        state.clone(),
        server_cancel.clone(),
    ));
    let server_handle = {
        let state = state.clone();
        let cancel = server_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = websocket::serve(state, cancel).await {
                error!("WebSocket server error: {e}");
            }
        })
    };

    info!("aggregator running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    // Protocol clients first so nothing mutates state mid-teardown,
    // then the protocol outputs, then the dashboard surface.
    clients_cancel.cancel();
    for handle in client_handles {
        if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
            warn!("device client did not stop in time");
        }
    }
    let _ = tokio::time::timeout(Duration::from_secs(2), aggregator_handle).await;

    ember.stop().await;
    tsl.stop().await;

    server_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), server_handle).await;
    broadcast_handle.abort();

    info!("shutdown complete");
    Ok(())
}
