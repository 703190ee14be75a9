/// Process-wide UDP listener for CasparCG OSC traffic. Several servers
/// push to the same local port, so one socket is shared and datagrams
/// are demultiplexed by source address. The registry is keyed by
/// (ip, channel, layer): two channels of one host coexist, and every
/// client registered for a source address receives its packets.
///
/// Registry mutations happen only in register/unregister, never on the
/// packet path.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use rosc::OscPacket;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Events routed to one registered client.
#[derive(Debug)]
pub enum OscEvent {
    /// The shared socket is bound and receiving.
    ListenerReady,
    /// A packet from this client's source address.
    Packet(OscPacket),
}

pub type ClientKey = (IpAddr, u16, u16);

#[derive(Clone)]
pub struct SharedOscListener {
    port: u16,
    inner: Arc<RwLock<ListenerInner>>,
}

#[derive(Default)]
struct ListenerInner {
    is_running: bool,
    is_starting: bool,
    clients: HashMap<ClientKey, mpsc::UnboundedSender<OscEvent>>,
    cancel: Option<CancellationToken>,
}

impl SharedOscListener {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            inner: Arc::new(RwLock::new(ListenerInner::default())),
        }
    }

    /// Register a client. The first registration opens the socket; while
    /// it is still opening, further registrations just wait for the
    /// ready notification.
    pub async fn register(&self, key: ClientKey, tx: mpsc::UnboundedSender<OscEvent>) {
        let mut inner = self.inner.write().await;
        inner.clients.insert(key, tx.clone());
        if inner.is_running {
            let _ = tx.send(OscEvent::ListenerReady);
            return;
        }
        if inner.is_starting {
            return;
        }
        inner.is_starting = true;
        let cancel = CancellationToken::new();
        inner.cancel = Some(cancel.clone());
        drop(inner);
        tokio::spawn(socket_task(self.clone(), cancel));
    }

    /// Remove a client; the socket closes when the registry empties.
    pub async fn unregister(&self, key: &ClientKey) {
        let mut inner = self.inner.write().await;
        inner.clients.remove(key);
        if inner.clients.is_empty() {
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
            inner.is_running = false;
            inner.is_starting = false;
            info!(port = self.port, "shared OSC listener closed (no clients)");
        }
    }
}

async fn socket_task(listener: SharedOscListener, cancel: CancellationToken) {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, listener.port);
    let socket = match UdpSocket::bind(addr).await {
        Ok(socket) => socket,
        Err(e) => {
            error!(port = listener.port, "failed to bind shared OSC socket: {e}");
            let mut inner = listener.inner.write().await;
            inner.is_starting = false;
            inner.cancel = None;
            return;
        }
    };
    info!(port = listener.port, "shared OSC listener bound");

    {
        let mut inner = listener.inner.write().await;
        inner.is_running = true;
        inner.is_starting = false;
        for tx in inner.clients.values() {
            let _ = tx.send(OscEvent::ListenerReady);
        }
    }

    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, source)) => match rosc::decoder::decode_udp(&buf[..len]) {
                    Ok((_, packet)) => route(&listener, source.ip(), packet).await,
                    Err(e) => debug!(from = %source, "invalid OSC packet: {e:?}"),
                },
                Err(e) => {
                    error!("OSC receive error: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!(port = listener.port, "shared OSC socket task ended");
}

/// Hand the packet to every client registered for this source address.
/// Unknown sources are dropped without a log line.
async fn route(listener: &SharedOscListener, source: IpAddr, packet: OscPacket) {
    let inner = listener.inner.read().await;
    for ((ip, _, _), tx) in &inner.clients {
        if *ip == source {
            let _ = tx.send(OscEvent::Packet(packet.clone()));
        }
    }
}
