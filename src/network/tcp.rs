use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::cipher::FrameCipher;
use super::codec::{MessageCodec, NetworkMessage};
use super::dns::DnsCache;
use super::transport::{InboundMessage, Transport};
use crate::config::{Config, PollerType};
use crate::raft::rpc::RaftMessage;
use crate::raft::types::NodeId;
use crate::util::errors::{RaftError, Result};

/// Socket-level knobs taken from `Config`
#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub connection_timeout: Duration,
    pub connection_retry_time: Duration,
    pub bind_retry_time: Duration,
    pub send_buffer_size: u32,
    pub recv_buffer_size: u32,
    pub dns_cache_time: Duration,
    pub dns_fail_cache_time: Duration,
    pub password: Option<String>,
    pub poller_type: PollerType,
}

impl TcpSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connection_timeout: config.connection_timeout(),
            connection_retry_time: config.connection_retry_time(),
            bind_retry_time: config.bind_retry_time(),
            send_buffer_size: config.send_buffer_size,
            recv_buffer_size: config.recv_buffer_size,
            dns_cache_time: config.dns_cache_time(),
            dns_fail_cache_time: config.dns_fail_cache_time(),
            password: config.password.clone(),
            poller_type: config.poller_type,
        }
    }

    /// Idle outbound connections send a heartbeat this often
    fn keepalive_period(&self) -> Duration {
        (self.connection_timeout / 4).max(Duration::from_millis(10))
    }

    fn codec(&self) -> MessageCodec {
        MessageCodec::new(self.password.as_deref().map(FrameCipher::new))
    }
}

struct PeerLink {
    tx: mpsc::UnboundedSender<NetworkMessage>,
    connected: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

/// TCP transport with one outbound connection per peer.
///
/// Sockets are driven by a tokio runtime on a dedicated reactor thread; the
/// runtime flavor follows `poller_type`. Inbound messages are handed to the
/// tick through a channel.
pub struct TcpTransport {
    self_id: NodeId,
    settings: Arc<TcpSettings>,
    handle: Handle,
    dns: Arc<Mutex<DnsCache>>,
    peers: HashMap<NodeId, PeerLink>,
    inbound_tx: Sender<InboundMessage>,
    inbound_rx: Receiver<InboundMessage>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    reactor: Option<JoinHandle<()>>,
}

fn build_runtime(poller_type: PollerType) -> io::Result<Runtime> {
    match poller_type.resolve() {
        PollerType::Multi => Builder::new_multi_thread()
            .thread_name("syncraft-io")
            .enable_all()
            .build(),
        _ => Builder::new_current_thread().enable_all().build(),
    }
}

impl TcpTransport {
    /// Start listening on `self_id` (a `host:port` address)
    pub fn start(self_id: NodeId, settings: TcpSettings) -> Result<Self> {
        let runtime = build_runtime(settings.poller_type)?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let reactor = std::thread::Builder::new()
            .name("syncraft-reactor".to_string())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                runtime.shutdown_timeout(Duration::from_millis(200));
            })
            .map_err(|e| RaftError::NetworkError(format!("Failed to start reactor: {}", e)))?;

        let settings = Arc::new(settings);
        let dns = Arc::new(Mutex::new(DnsCache::new(
            settings.dns_cache_time,
            settings.dns_fail_cache_time,
        )));
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();

        handle.spawn(run_listener(
            self_id.clone(),
            settings.clone(),
            dns.clone(),
            inbound_tx.clone(),
        ));

        tracing::info!(
            "TCP transport for {} started ({:?} poller)",
            self_id,
            settings.poller_type.resolve()
        );

        Ok(Self {
            self_id,
            settings,
            handle,
            dns,
            peers: HashMap::new(),
            inbound_tx,
            inbound_rx,
            shutdown_tx: Some(shutdown_tx),
            reactor: Some(reactor),
        })
    }

    fn link(&mut self, peer: &NodeId) -> &PeerLink {
        if !self.peers.contains_key(peer) {
            let (tx, rx) = mpsc::unbounded_channel();
            let connected = Arc::new(AtomicBool::new(false));
            let task = self.handle.spawn(run_outbound(
                self.self_id.clone(),
                peer.clone(),
                self.settings.clone(),
                self.dns.clone(),
                rx,
                connected.clone(),
            ));
            self.peers.insert(
                peer.clone(),
                PeerLink {
                    tx,
                    connected,
                    task,
                },
            );
        }
        &self.peers[peer]
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, to: &NodeId, message: RaftMessage) {
        if *to == self.self_id {
            let _ = self.inbound_tx.send(InboundMessage {
                from: self.self_id.clone(),
                message,
            });
            return;
        }
        let link = self.link(to);
        let _ = link.tx.send(NetworkMessage::Raft(message));
    }

    fn remove_peer(&mut self, peer: &NodeId) {
        if let Some(link) = self.peers.remove(peer) {
            link.task.abort();
            tracing::info!("Dropped connection to {}", peer);
        }
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        self.inbound_rx.try_iter().collect()
    }

    fn wait(&mut self, timeout: Duration) -> Vec<InboundMessage> {
        match self.inbound_rx.recv_timeout(timeout) {
            Ok(first) => {
                let mut messages = vec![first];
                messages.extend(self.inbound_rx.try_iter());
                messages
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Vec::new(),
        }
    }

    fn is_connected(&self, peer: &NodeId) -> bool {
        self.peers
            .get(peer)
            .map(|link| link.connected.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn shutdown(&mut self) {
        for (_, link) in self.peers.drain() {
            link.task.abort();
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(reactor) = self.reactor.take() {
            if reactor.join().is_err() {
                tracing::error!("Reactor thread panicked");
            }
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn resolve(dns: &Arc<Mutex<DnsCache>>, address: &str) -> Option<SocketAddr> {
    let dns = dns.clone();
    let address = address.to_string();
    tokio::task::spawn_blocking(move || dns.lock().resolve(&address, Instant::now()))
        .await
        .ok()
        .flatten()
}

fn new_socket(addr: &SocketAddr, settings: &TcpSettings) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_send_buffer_size(settings.send_buffer_size)?;
    socket.set_recv_buffer_size(settings.recv_buffer_size)?;
    Ok(socket)
}

fn bind(addr: SocketAddr, settings: &TcpSettings) -> io::Result<TcpListener> {
    let socket = new_socket(&addr, settings)?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

async fn connect(addr: SocketAddr, settings: &TcpSettings) -> io::Result<TcpStream> {
    let socket = new_socket(&addr, settings)?;
    let stream = tokio::time::timeout(settings.connection_timeout, socket.connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn run_listener(
    self_id: NodeId,
    settings: Arc<TcpSettings>,
    dns: Arc<Mutex<DnsCache>>,
    inbound: Sender<InboundMessage>,
) {
    let listener = loop {
        let bound = match resolve(&dns, &self_id).await {
            Some(addr) => bind(addr, &settings),
            None => Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "cannot resolve own address",
            )),
        };
        match bound {
            Ok(listener) => break listener,
            Err(e) => {
                tracing::warn!(
                    "Failed to bind {}: {}, retrying in {:?}",
                    self_id,
                    e,
                    settings.bind_retry_time
                );
                tokio::time::sleep(settings.bind_retry_time).await;
            }
        }
    };

    tracing::info!("Listening on {}", self_id);

    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                tracing::debug!("Accepted connection from {}", remote);
                tokio::spawn(run_inbound(stream, settings.clone(), inbound.clone()));
            }
            Err(e) => {
                tracing::warn!("Accept failed on {}: {}", self_id, e);
                tokio::time::sleep(settings.bind_retry_time).await;
            }
        }
    }
}

/// Read side of a connection some peer opened to us
async fn run_inbound(stream: TcpStream, settings: Arc<TcpSettings>, inbound: Sender<InboundMessage>) {
    let mut framed = FramedRead::new(stream, settings.codec());

    let peer = match tokio::time::timeout(settings.connection_timeout, framed.next()).await {
        Ok(Some(Ok(NetworkMessage::Hello(peer)))) => peer,
        Ok(Some(Err(e))) => {
            tracing::warn!("Rejected inbound connection: {}", e);
            return;
        }
        _ => return,
    };

    tracing::debug!("Inbound connection from {} established", peer);

    loop {
        match tokio::time::timeout(settings.connection_timeout, framed.next()).await {
            Ok(Some(Ok(NetworkMessage::Raft(message)))) => {
                let delivered = inbound.send(InboundMessage {
                    from: peer.clone(),
                    message,
                });
                if delivered.is_err() {
                    return;
                }
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                tracing::warn!("Dropping connection from {}: {}", peer, e);
                return;
            }
            Ok(None) => {
                tracing::debug!("Connection from {} closed", peer);
                return;
            }
            Err(_) => {
                tracing::debug!("Connection from {} timed out", peer);
                return;
            }
        }
    }
}

/// Write side of our connection to `peer`, reconnecting forever
async fn run_outbound(
    self_id: NodeId,
    peer: NodeId,
    settings: Arc<TcpSettings>,
    dns: Arc<Mutex<DnsCache>>,
    mut outgoing: mpsc::UnboundedReceiver<NetworkMessage>,
    connected: Arc<AtomicBool>,
) {
    loop {
        let stream = match resolve(&dns, &peer).await {
            Some(addr) => connect(addr, &settings).await,
            None => Err(io::Error::new(io::ErrorKind::NotFound, "unresolved")),
        };

        match stream {
            Ok(stream) => {
                let mut framed = FramedWrite::new(stream, settings.codec());
                if framed.send(NetworkMessage::Hello(self_id.clone())).await.is_ok() {
                    connected.store(true, Ordering::Relaxed);
                    tracing::info!("Connected to {}", peer);

                    loop {
                        let next = tokio::time::timeout(settings.keepalive_period(), outgoing.recv()).await;
                        let frame = match next {
                            Ok(Some(message)) => message,
                            // Transport dropped
                            Ok(None) => return,
                            Err(_) => NetworkMessage::Heartbeat,
                        };
                        if let Err(e) = framed.send(frame).await {
                            tracing::warn!("Connection to {} lost: {}", peer, e);
                            break;
                        }
                    }

                    connected.store(false, Ordering::Relaxed);
                }
            }
            Err(e) => {
                tracing::debug!("Cannot connect to {}: {}", peer, e);
            }
        }

        tokio::time::sleep(settings.connection_retry_time).await;

        // Whatever queued up while offline is stale; the protocol resends
        while outgoing.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::rpc::RequestVoteResponse;
    use std::net::TcpListener as StdListener;

    fn free_port() -> u16 {
        StdListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn settings(password: Option<&str>) -> TcpSettings {
        let mut config = Config::default();
        config.connection_retry_time_ms = 50;
        config.bind_retry_time_ms = 50;
        config.password = password.map(|p| p.to_string());
        config.poller_type = PollerType::Single;
        TcpSettings::from_config(&config)
    }

    /// The first sends may race the listener; keep sending until one lands
    fn exchange(
        from: &mut TcpTransport,
        to_id: &NodeId,
        to: &mut TcpTransport,
        message: &RaftMessage,
    ) -> Option<InboundMessage> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            from.send(to_id, message.clone());
            if let Some(received) = to.wait(Duration::from_millis(100)).into_iter().next() {
                return Some(received);
            }
        }
        None
    }

    #[test]
    fn test_messages_cross_encrypted_link() {
        let a_id = format!("127.0.0.1:{}", free_port());
        let b_id = format!("127.0.0.1:{}", free_port());
        let mut a = TcpTransport::start(a_id.clone(), settings(Some("pw"))).unwrap();
        let mut b = TcpTransport::start(b_id.clone(), settings(Some("pw"))).unwrap();

        let message = RaftMessage::RequestVoteResponse(RequestVoteResponse {
            term: 7,
            vote_granted: true,
        });

        let received = exchange(&mut a, &b_id, &mut b, &message).expect("message never arrived");
        assert_eq!(received.from, a_id);
        assert_eq!(received.message, message);
        assert!(a.is_connected(&b_id));

        let reply = exchange(&mut b, &a_id, &mut a, &message).expect("reply never arrived");
        assert_eq!(reply.from, b_id);
    }
}
