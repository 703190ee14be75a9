/// Ember+ provider. Serves the static tree over S101-framed Glow on a
/// TCP port, answers keep-alives and per-level directory requests, and
/// pushes value updates to every connected consumer. The tree is
/// monitoring-only: write attempts are rejected by re-asserting the
/// current value.

mod tree;

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use playout_protocol::device::{DeviceConfig, DeviceState};
use playout_protocol::glow::{self, Request};
use playout_protocol::s101::{self, FrameDecoder, S101Message};

use tree::Tree;

#[derive(Clone)]
pub struct EmberProvider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    port: u16,
    bind_address: String,
    running: Mutex<Option<Running>>,
}

struct Running {
    tree: Tree,
    consumers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    cancel: CancellationToken,
}

impl EmberProvider {
    pub fn new(port: u16, bind_address: Option<String>) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                port,
                bind_address: bind_address.unwrap_or_else(|| "0.0.0.0".to_string()),
                running: Mutex::new(None),
            }),
        }
    }

    /// Build the tree and open the listener. A second call while running
    /// is a no-op.
    pub async fn start(&self, devices: &[DeviceConfig]) -> anyhow::Result<()> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        let listener =
            TcpListener::bind((self.inner.bind_address.as_str(), self.inner.port)).await?;
        let cancel = CancellationToken::new();
        *running = Some(Running {
            tree: Tree::new(devices),
            consumers: Vec::new(),
            cancel: cancel.clone(),
        });
        info!(
            addr = %self.inner.bind_address,
            port = self.inner.port,
            devices = devices.len(),
            "Ember+ provider listening"
        );
        tokio::spawn(accept_loop(self.clone(), listener, cancel));
        Ok(())
    }

    /// Close the listener and every consumer. Idempotent.
    pub async fn stop(&self) {
        if let Some(running) = self.inner.running.lock().await.take() {
            running.cancel.cancel();
            info!("Ember+ provider stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    /// Push per-parameter updates for whichever fields changed. Unknown
    /// ids are ignored; they can arrive before the tree is built.
    pub async fn update_device(&self, device: &DeviceState) {
        let mut running = self.inner.running.lock().await;
        let Some(running) = running.as_mut() else {
            return;
        };
        let updates = running.tree.update_device(device);
        if updates.is_empty() {
            return;
        }
        let frame = s101::ember_frame(&glow::root(&updates));
        broadcast(&mut running.consumers, frame);
    }

    pub async fn update_device_count(&self, count: usize) {
        let mut running = self.inner.running.lock().await;
        let Some(running) = running.as_mut() else {
            return;
        };
        if let Some(update) = running.tree.set_device_count(count as i64) {
            let frame = s101::ember_frame(&glow::root(&[update]));
            broadcast(&mut running.consumers, frame);
        }
    }
}

/// Send one frame to every consumer, dropping the ones that went away.
fn broadcast(consumers: &mut Vec<mpsc::UnboundedSender<Vec<u8>>>, frame: Vec<u8>) {
    consumers.retain(|tx| tx.send(frame.clone()).is_ok());
}

async fn accept_loop(provider: EmberProvider, listener: TcpListener, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    info!(%peer, "Ember+ consumer connected");
                    let (tx, rx) = mpsc::unbounded_channel();
                    {
                        let mut running = provider.inner.running.lock().await;
                        if let Some(running) = running.as_mut() {
                            running.consumers.push(tx);
                        }
                    }
                    tokio::spawn(handle_consumer(
                        provider.clone(),
                        stream,
                        rx,
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    warn!("Ember+ accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("Ember+ accept loop ended");
}

async fn handle_consumer(
    provider: EmberProvider,
    stream: TcpStream,
    mut updates: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 2048];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            update = updates.recv() => {
                match update {
                    Some(frame) => {
                        if writer.write_all(&frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            result = reader.read(&mut buf) => {
                let n = match result {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        warn!(peer = %peer, "Ember+ consumer read error: {e}");
                        break;
                    }
                };
                let mut failed = false;
                for message in decoder.push(&buf[..n]) {
                    for reply in handle_message(&provider, &peer, message).await {
                        if writer.write_all(&reply).await.is_err() {
                            failed = true;
                            break;
                        }
                    }
                    if failed {
                        break;
                    }
                }
                if failed {
                    break;
                }
            }
        }
    }
    info!(peer = %peer, "Ember+ consumer disconnected");
}

/// Frames to write back for one incoming S101 message.
async fn handle_message(
    provider: &EmberProvider,
    peer: &str,
    message: S101Message,
) -> Vec<Vec<u8>> {
    match message {
        S101Message::KeepaliveRequest => vec![s101::keepalive_response()],
        S101Message::KeepaliveResponse => Vec::new(),
        S101Message::Other(command) => {
            debug!(peer, command, "unhandled S101 command");
            Vec::new()
        }
        S101Message::Ember(glow_bytes) => {
            let mut replies = Vec::new();
            let running = provider.inner.running.lock().await;
            let Some(running) = running.as_ref() else {
                return replies;
            };
            for request in glow::parse_requests(&glow_bytes) {
                match request {
                    Request::GetDirectory(path) => match running.tree.list(&path) {
                        Some(elements) => {
                            replies.push(s101::ember_frame(&glow::root(&elements)));
                        }
                        None => debug!(peer, ?path, "directory request for unknown path"),
                    },
                    Request::SetValue(path) => {
                        // Monitoring-only tree: refuse and re-assert the
                        // current value.
                        warn!(peer, ?path, "rejected Ember+ write attempt");
                        if let Some(elements) = running.tree.list(&path) {
                            replies.push(s101::ember_frame(&glow::root(&elements)));
                        }
                    }
                    Request::Subscribe(path) | Request::Unsubscribe(path) => {
                        // Every parameter is pushed unconditionally.
                        debug!(peer, ?path, "subscription request ignored");
                    }
                }
            }
            replies
        }
    }
}
