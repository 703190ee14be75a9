/// TSL UMD v5.0 sender. Sends a packet to every configured destination
/// the moment a device's name or state changes, and walks the device set
/// round-robin in the background so a lost datagram is repaired within
/// one cycle. Broadcast-addressed destinations are allowed.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use playout_protocol::device::{DeviceConfig, TransportState};
use playout_protocol::tsl::{UmdPacket, DISPLAY_BROADCAST};

use crate::config::TslDestination;
use crate::timer::DriftFreeTimer;

#[derive(Clone)]
pub struct UmdSender {
    inner: Arc<SenderInner>,
}

struct SenderInner {
    screen: u16,
    destinations: Vec<SocketAddr>,
    refresh_interval: Duration,
    /// Last sent (name, state) per device, keyed by display index.
    displays: Mutex<BTreeMap<u16, Display>>,
    running: Mutex<Option<Running>>,
}

#[derive(Clone)]
struct Display {
    name: String,
    state: TransportState,
}

struct Running {
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
}

impl UmdSender {
    pub fn new(screen: u16, destinations: &[TslDestination], refresh_interval: Duration) -> Self {
        let resolved = destinations
            .iter()
            .filter_map(|d| match format!("{}:{}", d.host, d.port).parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!(host = %d.host, port = d.port, "invalid TSL destination: {e}");
                    None
                }
            })
            .collect();
        Self {
            inner: Arc::new(SenderInner {
                screen,
                destinations: resolved,
                refresh_interval,
                displays: Mutex::new(BTreeMap::new()),
                running: Mutex::new(None),
            }),
        }
    }

    /// Open the socket and start the refresh loop. A no-op without
    /// destinations; idempotent while running. The running flag is only
    /// set once the socket is open with broadcast enabled.
    pub async fn start(&self, devices: &[DeviceConfig]) -> anyhow::Result<()> {
        if self.inner.destinations.is_empty() {
            info!("no TSL UMD destinations configured, sender disabled");
            return Ok(());
        }
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let socket = create_send_socket()?;
        let socket = Arc::new(socket);
        let cancel = CancellationToken::new();

        {
            let mut displays = self.inner.displays.lock().await;
            for cfg in devices {
                displays.entry(cfg.id).or_insert_with(|| Display {
                    name: cfg.name.clone(),
                    state: TransportState::Offline,
                });
            }
        }

        *running = Some(Running {
            socket: Arc::clone(&socket),
            cancel: cancel.clone(),
        });
        info!(
            screen = self.inner.screen,
            destinations = self.inner.destinations.len(),
            "TSL UMD sender started"
        );
        tokio::spawn(refresh_loop(self.clone(), socket, cancel));
        Ok(())
    }

    /// Close the socket and stop the refresh loop. Idempotent.
    pub async fn stop(&self) {
        if let Some(running) = self.inner.running.lock().await.take() {
            running.cancel.cancel();
            info!("TSL UMD sender stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    /// Record the device's display state and, when name or state
    /// changed, send immediately to every destination.
    pub async fn update_device(&self, id: u16, name: &str, state: TransportState) {
        if id == DISPLAY_BROADCAST {
            warn!(id, "refusing to drive the reserved broadcast display");
            return;
        }
        {
            let mut displays = self.inner.displays.lock().await;
            match displays.get_mut(&id) {
                Some(display) if display.name == name && display.state == state => return,
                Some(display) => {
                    display.name = name.to_string();
                    display.state = state;
                }
                None => {
                    displays.insert(
                        id,
                        Display {
                            name: name.to_string(),
                            state,
                        },
                    );
                }
            }
        }
        let socket = {
            let running = self.inner.running.lock().await;
            match running.as_ref() {
                Some(running) => Arc::clone(&running.socket),
                None => return,
            }
        };
        self.send_display(&socket, id, name, state).await;
    }

    async fn send_display(&self, socket: &UdpSocket, id: u16, name: &str, state: TransportState) {
        let packet = UmdPacket::for_device(self.inner.screen, id, name, state);
        let mut buf = Vec::with_capacity(UmdPacket::HEADER_SIZE + name.len());
        packet.serialize(&mut buf);
        for dest in &self.inner.destinations {
            // One refused destination must not starve the others.
            if let Err(e) = socket.send_to(&buf, dest).await {
                warn!(%dest, "TSL send failed: {e}");
            } else {
                debug!(%dest, id, state = state.as_str(), "TSL packet sent");
            }
        }
    }
}

/// UDP socket with the broadcast flag set before anything else sees it.
fn create_send_socket() -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Walk the device set one display per tick so every display is
/// refreshed once per cycle even if its change packet was lost.
async fn refresh_loop(sender: UmdSender, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let timer = DriftFreeTimer::new(sender.inner.refresh_interval);
    let mut cursor = 0usize;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {}
        }
        let next = {
            let displays = sender.inner.displays.lock().await;
            if displays.is_empty() {
                continue;
            }
            let keys: Vec<u16> = displays.keys().copied().collect();
            let id = keys[cursor % keys.len()];
            cursor = cursor.wrapping_add(1);
            let display = displays[&id].clone();
            (id, display)
        };
        let (id, display) = next;
        sender
            .send_display(&socket, id, &display.name, display.state)
            .await;
    }
    debug!("TSL refresh loop ended");
}
