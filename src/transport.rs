//! Peer-to-peer delivery, ported from `network.go`.
//!
//! Each [`crate::group::InstanceGroup`] owns its own `Transport` instance (see
//! SPEC_FULL.md's routing note: the wire frame carries no group id, so groups stay
//! isolated by each running their own listener and connection pool rather than by
//! multiplexing a shared one).

use crate::error::PaxosError;
use crate::message::{Kind, Message};
use crate::NodeId;
use bytes::BytesMut;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const SEND_TIMEOUT: Duration = Duration::from_secs(1);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const SEND_QUEUE_CAPACITY: usize = 1;

/// Delivers framed messages between peers. Implementations own whatever I/O is
/// needed to realize the two logical channels per peer (request/response) plus a
/// single inbound queue feeding the owning group's event loop.
pub trait Transport: Send {
    fn node_id(&self) -> NodeId;
    fn peer_ids(&self) -> Vec<NodeId>;

    /// Delivers `msg` to this node's own receive queue without touching the network
    /// ("self-addressed broadcasts short-circuit through the local queue", §6.1).
    fn loopback(&self, msg: Message);

    /// Sends a message this node initiated (Prepare/Propose/PushLearn/PullLearnRequest).
    fn send_request(&self, to: NodeId, msg: Message) -> BoxFuture<'_, ()>;

    /// Sends a reply to a message this node received (Promised/Accepted/PullLearnResponse).
    fn send_response(&self, to: NodeId, msg: Message) -> BoxFuture<'_, ()>;

    /// Waits up to `timeout` for the next inbound message.
    fn recv(&mut self, timeout: Duration) -> BoxFuture<'_, Option<Message>>;
}

struct ActiveConn {
    send_tx: mpsc::Sender<Message>,
    connected: Arc<AtomicBool>,
}

/// A concrete TCP transport: one listener plus an active (dialing) and passive
/// (accepting) connection per peer, as `network.go`'s `NodeNetwork`/`NodeConn` pair.
pub struct TcpTransport {
    node_id: NodeId,
    recv_rx: mpsc::Receiver<Message>,
    recv_tx: mpsc::Sender<Message>,
    active: HashMap<NodeId, ActiveConn>,
    passive_senders: Arc<Mutex<HashMap<NodeId, mpsc::Sender<Message>>>>,
}

impl TcpTransport {
    /// Binds `listen_addr`, dials every address in `peers`, and spawns the
    /// per-connection tasks. Returns once the listener is bound; individual peer
    /// connections come up asynchronously (the active side retries on failure).
    pub async fn bind(node_id: NodeId, listen_addr: SocketAddr, peers: HashMap<NodeId, SocketAddr>) -> Result<TcpTransport, PaxosError> {
        let (recv_tx, recv_rx) = mpsc::channel(64);
        let listener = TcpListener::bind(listen_addr).await?;

        let mut active = HashMap::new();
        let mut passive_flags = HashMap::new();
        for (&peer_id, &addr) in &peers {
            let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
            let connected = Arc::new(AtomicBool::new(false));
            active.insert(peer_id, ActiveConn { send_tx: send_tx.clone(), connected: connected.clone() });
            tokio::spawn(dial_loop(node_id, peer_id, addr, send_tx, send_rx, recv_tx.clone(), connected));
            passive_flags.insert(peer_id, Arc::new(AtomicBool::new(false)));
        }

        let passive_senders: Arc<Mutex<HashMap<NodeId, mpsc::Sender<Message>>>> = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(accept_loop(node_id, listener, passive_flags, passive_senders.clone(), recv_tx.clone()));

        Ok(TcpTransport { node_id, recv_rx, recv_tx, active, passive_senders })
    }
}

async fn dial_loop(
    node_id: NodeId,
    peer_id: NodeId,
    addr: SocketAddr,
    send_tx: mpsc::Sender<Message>,
    mut send_rx: mpsc::Receiver<Message>,
    recv_tx: mpsc::Sender<Message>,
    connected: Arc<AtomicBool>,
) {
    loop {
        let stream = match TcpStream::connect(addr).await {
            Ok(s) => s,
            Err(e) => {
                debug!("transport: dial {} failed: {}", addr, e);
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let mut stream = stream;
        if stream.write_all(&node_id.to_le_bytes()).await.is_err() {
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }
        info!("transport: connected to {}", peer_id);
        connected.store(true, Ordering::SeqCst);

        let (read_half, write_half) = stream.into_split();
        let mut reader = tokio::spawn(reader_loop(peer_id, read_half, recv_tx.clone(), node_id, send_tx.clone()));
        tokio::select! {
            _ = writer_loop(write_half, &mut send_rx) => {},
            _ = &mut reader => {},
        }
        reader.abort();
        connected.store(false, Ordering::SeqCst);
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn accept_loop(
    node_id: NodeId,
    listener: TcpListener,
    connect_flags: HashMap<NodeId, Arc<AtomicBool>>,
    passive_senders: Arc<Mutex<HashMap<NodeId, mpsc::Sender<Message>>>>,
    recv_tx: mpsc::Sender<Message>,
) {
    loop {
        let (mut socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("transport: accept error: {}", e);
                continue;
            }
        };

        let mut handshake = [0u8; 4];
        if let Err(e) = socket.read_exact(&mut handshake).await {
            warn!("transport: handshake read failed from {}: {}", peer_addr, e);
            continue;
        }
        let peer_id = u32::from_le_bytes(handshake);

        let flag = match connect_flags.get(&peer_id) {
            Some(f) => f.clone(),
            None => {
                warn!("transport: accept from unregistered peer id {}", peer_id);
                continue;
            }
        };
        if flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            warn!("transport: rejecting duplicate connection from peer {}", peer_id);
            continue;
        }
        info!("transport: accepted connection from {}", peer_id);

        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        passive_senders.lock().unwrap().insert(peer_id, send_tx.clone());

        let (read_half, write_half) = socket.into_split();
        let recv_tx = recv_tx.clone();
        tokio::spawn(async move {
            let mut send_rx = send_rx;
            let mut reader = tokio::spawn(reader_loop(peer_id, read_half, recv_tx, node_id, send_tx));
            tokio::select! {
                _ = writer_loop(write_half, &mut send_rx) => {},
                _ = &mut reader => {},
            }
            reader.abort();
            flag.store(false, Ordering::SeqCst);
        });
    }
}

async fn writer_loop(mut write_half: OwnedWriteHalf, rx: &mut mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if msg.kind == Kind::Closed {
            break;
        }
        match msg.encode() {
            Ok(frame) => {
                if let Err(e) = write_half.write_all(&frame).await {
                    warn!("transport: write failed: {}", e);
                    break;
                }
            }
            Err(e) => warn!("transport: dropping oversized outbound frame: {}", e),
        }
    }
}

/// Reads frames until EOF or a protocol violation, then injects a `Closed`
/// sentinel into this connection's own send queue so `writer_loop` tears down the
/// other half of the pair too (spec.md §6.1: "on any read error, the receive task
/// injects a Closed into its own send buffer and both sides of the pair tear
/// down"). Oversized or malformed frames are a fatal protocol error for the
/// connection that sent them — `network.go` panics on this; here it becomes a
/// logged `PaxosError::Protocol` and a connection close instead of a process panic.
async fn reader_loop(peer_id: NodeId, mut read_half: OwnedReadHalf, recv_tx: mpsc::Sender<Message>, own_node_id: NodeId, send_tx: mpsc::Sender<Message>) {
    let mut body = BytesMut::new();
    loop {
        let mut len_buf = [0u8; 4];
        if read_half.read_exact(&mut len_buf).await.is_err() {
            debug!("transport: connection to {} closed", peer_id);
            break;
        }
        let total = u32::from_le_bytes(len_buf) as usize;
        if total < 4 || total > crate::message::MAX_FRAME_LEN {
            let err = PaxosError::Protocol(format!("frame from {} of {} bytes exceeds MAX_FRAME_LEN", peer_id, total));
            warn!("transport: {}", err);
            break;
        }

        body.resize(total - 4, 0);
        if read_half.read_exact(&mut body).await.is_err() {
            break;
        }
        match Message::decode(body.split().freeze()) {
            Ok(msg) => {
                if recv_tx.send(msg).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let err = PaxosError::Protocol(format!("malformed frame from {}: {}", peer_id, e));
                warn!("transport: {}", err);
                break;
            }
        }
    }
    let _ = send_tx.try_send(Message::closed(own_node_id));
}

impl Transport for TcpTransport {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn peer_ids(&self) -> Vec<NodeId> {
        self.active.keys().copied().collect()
    }

    fn loopback(&self, msg: Message) {
        // a local hop never touches the network; a bounded try_send drop is the
        // right failure mode if the group's own queue is saturated.
        if self.recv_tx.try_send(msg).is_err() {
            warn!("transport {}: loopback queue full, dropping self-addressed message", self.node_id);
        }
    }

    fn send_request(&self, to: NodeId, msg: Message) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(conn) = self.active.get(&to) {
                if !conn.connected.load(Ordering::SeqCst) {
                    return;
                }
                if tokio::time::timeout(SEND_TIMEOUT, conn.send_tx.send(msg)).await.is_err() {
                    warn!("transport: send timeout to {}", to);
                }
            }
        })
    }

    fn send_response(&self, to: NodeId, msg: Message) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let tx = self.passive_senders.lock().unwrap().get(&to).cloned();
            if let Some(tx) = tx {
                if tokio::time::timeout(SEND_TIMEOUT, tx.send(msg)).await.is_err() {
                    warn!("transport: response timeout to {}", to);
                }
            }
        })
    }

    fn recv(&mut self, timeout: Duration) -> BoxFuture<'_, Option<Message>> {
        Box::pin(async move { tokio::time::timeout(timeout, self.recv_rx.recv()).await.ok().flatten() })
    }
}

/// In-memory transport for tests: a registry of per-`(node_id, group_id)` queues
/// lets several `InstanceGroup`s exchange messages without a socket. Mirrors
/// `TcpTransport`'s request/response split and self-loopback (both map to the same
/// queue here since there is no real connection direction to distinguish).
pub struct LocalTransport {
    node_id: NodeId,
    group_id: usize,
    registry: Arc<LocalRegistry>,
    recv_rx: mpsc::Receiver<Message>,
}

pub struct LocalRegistry {
    node_ids: Vec<NodeId>,
    senders: Mutex<HashMap<(NodeId, usize), mpsc::Sender<Message>>>,
}

impl LocalRegistry {
    pub fn new(node_ids: Vec<NodeId>) -> Arc<LocalRegistry> {
        Arc::new(LocalRegistry { node_ids, senders: Mutex::new(HashMap::new()) })
    }

    pub fn transport(self: &Arc<Self>, node_id: NodeId, group_id: usize) -> LocalTransport {
        let (tx, rx) = mpsc::channel(256);
        self.senders.lock().unwrap().insert((node_id, group_id), tx);
        LocalTransport { node_id, group_id, registry: self.clone(), recv_rx: rx }
    }
}

impl Transport for LocalTransport {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn peer_ids(&self) -> Vec<NodeId> {
        self.registry.node_ids.iter().copied().filter(|&id| id != self.node_id).collect()
    }

    fn loopback(&self, msg: Message) {
        let senders = self.registry.senders.lock().unwrap();
        if let Some(tx) = senders.get(&(self.node_id, self.group_id)) {
            let _ = tx.try_send(msg);
        }
    }

    fn send_request(&self, to: NodeId, msg: Message) -> BoxFuture<'_, ()> {
        self.deliver(to, msg)
    }

    fn send_response(&self, to: NodeId, msg: Message) -> BoxFuture<'_, ()> {
        self.deliver(to, msg)
    }

    fn recv(&mut self, timeout: Duration) -> BoxFuture<'_, Option<Message>> {
        Box::pin(async move { tokio::time::timeout(timeout, self.recv_rx.recv()).await.ok().flatten() })
    }
}

impl LocalTransport {
    fn deliver(&self, to: NodeId, msg: Message) -> BoxFuture<'_, ()> {
        let group_id = self.group_id;
        let registry = self.registry.clone();
        Box::pin(async move {
            let tx = registry.senders.lock().unwrap().get(&(to, group_id)).cloned();
            if let Some(tx) = tx {
                let _ = tokio::time::timeout(SEND_TIMEOUT, tx.send(msg)).await;
            }
        })
    }
}
