//! Full-mesh transport: one reliable, ordered channel per peer.
//!
//! Every concrete connection (an outbound WebSocket, an inbound warp
//! WebSocket, or an in-memory pair) is adapted into a [`Link`]: a pair of
//! bounded frame queues. The transport keeps an arena of open channels keyed
//! by peer id, runs one reader task per channel, and reports inbound messages,
//! new peers and terminal channel closure through registered callbacks.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::models::{valid_peer_id, PeerAddress, PeerId, WorkerCapabilities};
use crate::protocol::MeshMessage;

pub const DEFAULT_FRAME_CAPACITY: usize = 256;

/// A bidirectional frame pipe to one remote endpoint.
pub struct Link {
  pub tx: mpsc::Sender<String>,
  pub rx: mpsc::Receiver<String>,
}

impl Link {
  /// Two connected in-memory endpoints.
  pub fn pair(capacity: usize) -> (Link, Link) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (Link { tx: a_tx, rx: a_rx }, Link { tx: b_tx, rx: b_rx })
  }

  /// Adapts a tokio-tungstenite stream, spawning a writer and a reader pump.
  pub fn from_websocket<S>(ws: S, capacity: usize) -> Link
  where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
      + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
      + Send
      + Unpin
      + 'static,
  {
    let (out_tx, mut out_rx) = mpsc::channel::<String>(capacity);
    let (in_tx, in_rx) = mpsc::channel::<String>(capacity);
    let (mut sink, mut stream) = ws.split();

    tokio::spawn(async move {
      while let Some(frame) = out_rx.recv().await {
        if sink.send(Message::text(frame)).await.is_err() {
          break;
        }
      }
      let _ = sink.close().await;
    });

    tokio::spawn(async move {
      while let Some(msg) = stream.next().await {
        match msg {
          Ok(Message::Text(text)) => {
            if in_tx.send(text.as_str().to_owned()).await.is_err() {
              break;
            }
          }
          Ok(Message::Close(_)) | Err(_) => break,
          Ok(_) => {}
        }
      }
    });

    Link { tx: out_tx, rx: in_rx }
  }
}

/// Establishes raw links to peers. Handshaking happens in [`MeshTransport`].
#[async_trait]
pub trait Connector: Send + Sync {
  async fn dial(&self, peer: &PeerAddress) -> Result<Link, TransportError>;
}

/// Dials `ws://{addr}/mesh`.
pub struct WsConnector {
  pub frame_capacity: usize,
}

impl Default for WsConnector {
  fn default() -> Self {
    Self { frame_capacity: DEFAULT_FRAME_CAPACITY }
  }
}

#[async_trait]
impl Connector for WsConnector {
  async fn dial(&self, peer: &PeerAddress) -> Result<Link, TransportError> {
    let url = format!("ws://{}/mesh", peer.addr);
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
      .await
      .map_err(|e| TransportError::Connect { peer: peer.peer_id.clone(), reason: e.to_string() })?;
    Ok(Link::from_websocket(ws, self.frame_capacity))
  }
}

/// In-process network for running several members in one process. Each
/// listener address receives the accepting half of every dialed pair.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
  listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Link>>>>,
}

impl MemoryNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn listen(&self, addr: &str) -> mpsc::UnboundedReceiver<Link> {
    let (tx, rx) = mpsc::unbounded_channel();
    lock(&self.listeners).insert(addr.to_string(), tx);
    rx
  }

  /// Drops the listener so that further dials to `addr` fail.
  pub fn unlisten(&self, addr: &str) {
    lock(&self.listeners).remove(addr);
  }
}

#[async_trait]
impl Connector for MemoryNetwork {
  async fn dial(&self, peer: &PeerAddress) -> Result<Link, TransportError> {
    let listener = lock(&self.listeners).get(&peer.addr).cloned();
    let Some(listener) = listener else {
      return Err(TransportError::Connect { peer: peer.peer_id.clone(), reason: "connection refused".into() });
    };
    let (ours, theirs) = Link::pair(DEFAULT_FRAME_CAPACITY);
    listener
      .send(theirs)
      .map_err(|_| TransportError::Connect { peer: peer.peer_id.clone(), reason: "listener closed".into() })?;
    Ok(ours)
  }
}

/// The outbound half of the transport, as seen by the coordinator.
pub trait MeshSender {
  fn send(&self, peer_id: &str, message: &MeshMessage) -> Result<(), TransportError>;
  fn broadcast(&self, message: &MeshMessage) -> Vec<(PeerId, TransportError)>;
  fn is_open(&self, peer_id: &str) -> bool;
}

pub type MessageCallback = Box<dyn Fn(&PeerId, MeshMessage) + Send + Sync>;
pub type ConnectedCallback = Box<dyn Fn(&PeerId, &WorkerCapabilities) + Send + Sync>;
pub type DepartedCallback = Box<dyn Fn(&PeerId) + Send + Sync>;

struct ChannelHandle {
  id: u64,
  dialer: PeerId,
  tx: mpsc::Sender<String>,
  reader: JoinHandle<()>,
}

#[derive(Default)]
struct Listeners {
  message: Vec<MessageCallback>,
  connected: Vec<ConnectedCallback>,
  departed: Vec<DepartedCallback>,
}

struct Inner {
  local_id: PeerId,
  capabilities: WorkerCapabilities,
  connector: Arc<dyn Connector>,
  connect_timeout: Duration,
  channels: Mutex<HashMap<PeerId, ChannelHandle>>,
  listeners: RwLock<Listeners>,
  next_channel: AtomicU64,
}

#[derive(Clone)]
pub struct MeshTransport {
  inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MeshTransport {
  pub fn new(
    local_id: impl Into<PeerId>,
    capabilities: WorkerCapabilities,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        local_id: local_id.into(),
        capabilities,
        connector,
        connect_timeout,
        channels: Mutex::new(HashMap::new()),
        listeners: RwLock::new(Listeners::default()),
        next_channel: AtomicU64::new(1),
      }),
    }
  }

  pub fn local_id(&self) -> &PeerId {
    &self.inner.local_id
  }

  pub fn on_message(&self, callback: impl Fn(&PeerId, MeshMessage) + Send + Sync + 'static) {
    self.listeners_mut().message.push(Box::new(callback));
  }

  pub fn on_peer_connected(&self, callback: impl Fn(&PeerId, &WorkerCapabilities) + Send + Sync + 'static) {
    self.listeners_mut().connected.push(Box::new(callback));
  }

  pub fn on_peer_departed(&self, callback: impl Fn(&PeerId) + Send + Sync + 'static) {
    self.listeners_mut().departed.push(Box::new(callback));
  }

  fn listeners_mut(&self) -> std::sync::RwLockWriteGuard<'_, Listeners> {
    self.inner.listeners.write().unwrap_or_else(PoisonError::into_inner)
  }

  fn listeners(&self) -> std::sync::RwLockReadGuard<'_, Listeners> {
    self.inner.listeners.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn hello(&self) -> MeshMessage {
    MeshMessage::Hello {
      from_peer_id: self.inner.local_id.clone(),
      capabilities: self.inner.capabilities.clone(),
    }
  }

  /// Dials `peer` and completes the hello exchange within the connect
  /// timeout. Returns the remote capabilities. Retrying is up to the caller.
  pub async fn connect(&self, peer: &PeerAddress) -> Result<WorkerCapabilities, TransportError> {
    if peer.peer_id == self.inner.local_id {
      return Err(TransportError::Handshake { peer: peer.peer_id.clone(), reason: "refusing to dial self".into() });
    }
    let attempt = async {
      let mut link = self.inner.connector.dial(peer).await?;
      let frame = self.hello().encode()?;
      link.tx
        .send(frame)
        .await
        .map_err(|_| TransportError::ChannelClosed(peer.peer_id.clone()))?;
      let (remote, capabilities) = read_hello(&mut link, &peer.peer_id).await?;
      if remote != peer.peer_id {
        return Err(TransportError::Handshake {
          peer: peer.peer_id.clone(),
          reason: format!("endpoint identified itself as {remote}"),
        });
      }
      let local = self.inner.local_id.clone();
      self.attach(remote, capabilities.clone(), link, local);
      Ok::<_, TransportError>(capabilities)
    };
    match tokio::time::timeout(self.inner.connect_timeout, attempt).await {
      Ok(result) => result,
      Err(_) => Err(TransportError::ConnectTimeout { peer: peer.peer_id.clone() }),
    }
  }

  /// Completes the handshake on an inbound link.
  pub async fn accept(&self, mut link: Link) -> Result<PeerId, TransportError> {
    let handshake = async {
      let (remote, capabilities) = read_hello(&mut link, "inbound").await?;
      if remote == self.inner.local_id {
        return Err(TransportError::Handshake { peer: remote, reason: "peer id collides with local id".into() });
      }
      let frame = self.hello().encode()?;
      link.tx
        .send(frame)
        .await
        .map_err(|_| TransportError::ChannelClosed(remote.clone()))?;
      self.attach(remote.clone(), capabilities, link, remote.clone());
      Ok::<_, TransportError>(remote)
    };
    match tokio::time::timeout(self.inner.connect_timeout, handshake).await {
      Ok(result) => result,
      Err(_) => Err(TransportError::ConnectTimeout { peer: "inbound".into() }),
    }
  }

  fn attach(&self, peer_id: PeerId, capabilities: WorkerCapabilities, link: Link, dialer: PeerId) {
    let id = self.inner.next_channel.fetch_add(1, Ordering::Relaxed);
    let Link { tx, mut rx } = link;

    let mut channels = lock(&self.inner.channels);
    if let Some(existing) = channels.get(&peer_id) {
      // Simultaneous dials: both ends keep the channel opened by the smaller id.
      let preferred = self.inner.local_id.clone().min(peer_id.clone());
      if existing.dialer != dialer && existing.dialer == preferred {
        debug!(peer = %peer_id, "Dropping duplicate channel");
        return;
      }
    }

    // Frames may already be queued behind the hello. The reader holds them
    // until the connected callbacks have run, so listeners always see a peer
    // connect before any of its messages.
    let (ready_tx, ready_rx) = oneshot::channel::<()>();
    let transport = self.clone();
    let reader_peer = peer_id.clone();
    let reader = tokio::spawn(async move {
      let _ = ready_rx.await;
      while let Some(frame) = rx.recv().await {
        match MeshMessage::decode(&frame) {
          Ok(message) => transport.dispatch(&reader_peer, message),
          Err(e) => warn!(peer = %reader_peer, error = %e, "Discarding malformed frame"),
        }
      }
      transport.channel_closed(&reader_peer, id);
    });

    if let Some(old) = channels.insert(peer_id.clone(), ChannelHandle { id, dialer, tx, reader }) {
      old.reader.abort();
    }
    let open = channels.len();
    drop(channels);

    info!(peer = %peer_id, open_channels = open, "Mesh channel established");
    for cb in &self.listeners().connected {
      cb(&peer_id, &capabilities);
    }
    let _ = ready_tx.send(());
  }

  fn dispatch(&self, peer_id: &PeerId, message: MeshMessage) {
    debug!(peer = %peer_id, kind = message.kind(), "Inbound message");
    for cb in &self.listeners().message {
      cb(peer_id, message.clone());
    }
  }

  fn channel_closed(&self, peer_id: &PeerId, channel: u64) {
    let removed = {
      let mut channels = lock(&self.inner.channels);
      match channels.get(peer_id) {
        Some(handle) if handle.id == channel => channels.remove(peer_id).is_some(),
        _ => false,
      }
    };
    if removed {
      info!(peer = %peer_id, "Mesh channel closed");
      for cb in &self.listeners().departed {
        cb(peer_id);
      }
    }
  }

  /// Runs the handshake for every link arriving on `incoming`.
  pub fn spawn_acceptor(&self, mut incoming: mpsc::UnboundedReceiver<Link>) -> JoinHandle<()> {
    let transport = self.clone();
    tokio::spawn(async move {
      while let Some(link) = incoming.recv().await {
        let transport = transport.clone();
        tokio::spawn(async move {
          if let Err(e) = transport.accept(link).await {
            warn!(error = %e, "Inbound mesh handshake failed");
          }
        });
      }
    })
  }

  /// Closes the channel to `peer_id` without firing departure callbacks.
  pub fn disconnect(&self, peer_id: &str) {
    if let Some(handle) = lock(&self.inner.channels).remove(peer_id) {
      handle.reader.abort();
      debug!(peer = %peer_id, "Mesh channel dropped locally");
    }
  }

  pub fn close_all(&self) {
    let drained: Vec<_> = lock(&self.inner.channels).drain().collect();
    for (_, handle) in drained {
      handle.reader.abort();
    }
  }

  pub fn open_peers(&self) -> Vec<PeerId> {
    let mut peers: Vec<_> = lock(&self.inner.channels).keys().cloned().collect();
    peers.sort();
    peers
  }

  pub fn connection_count(&self) -> usize {
    lock(&self.inner.channels).len()
  }
}

impl MeshSender for MeshTransport {
  fn send(&self, peer_id: &str, message: &MeshMessage) -> Result<(), TransportError> {
    let frame = message.encode()?;
    let channels = lock(&self.inner.channels);
    let handle = channels
      .get(peer_id)
      .ok_or_else(|| TransportError::ChannelNotOpen(peer_id.to_string()))?;
    handle.tx.try_send(frame).map_err(|e| match e {
      mpsc::error::TrySendError::Full(_) => TransportError::ChannelFull(peer_id.to_string()),
      mpsc::error::TrySendError::Closed(_) => TransportError::ChannelClosed(peer_id.to_string()),
    })
  }

  fn broadcast(&self, message: &MeshMessage) -> Vec<(PeerId, TransportError)> {
    let frame = match message.encode() {
      Ok(frame) => frame,
      Err(e) => return vec![(self.inner.local_id.clone(), TransportError::Encode(e))],
    };
    let channels = lock(&self.inner.channels);
    let mut failures = Vec::new();
    for (peer_id, handle) in channels.iter() {
      let result = handle.tx.try_send(frame.clone()).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => TransportError::ChannelFull(peer_id.clone()),
        mpsc::error::TrySendError::Closed(_) => TransportError::ChannelClosed(peer_id.clone()),
      });
      if let Err(e) = result {
        warn!(peer = %peer_id, kind = message.kind(), error = %e, "Broadcast to peer failed");
        failures.push((peer_id.clone(), e));
      }
    }
    failures
  }

  fn is_open(&self, peer_id: &str) -> bool {
    lock(&self.inner.channels).contains_key(peer_id)
  }
}

async fn read_hello(link: &mut Link, expected: &str) -> Result<(PeerId, WorkerCapabilities), TransportError> {
  let frame = link.rx.recv().await.ok_or_else(|| TransportError::Handshake {
    peer: expected.to_string(),
    reason: "link closed before hello".into(),
  })?;
  match MeshMessage::decode(&frame) {
    Ok(MeshMessage::Hello { from_peer_id, capabilities }) if valid_peer_id(&from_peer_id) => {
      Ok((from_peer_id, capabilities))
    }
    Ok(MeshMessage::Hello { from_peer_id, .. }) => Err(TransportError::Handshake {
      peer: expected.to_string(),
      reason: format!("invalid peer id '{from_peer_id}'"),
    }),
    Ok(other) => Err(TransportError::Handshake {
      peer: expected.to_string(),
      reason: format!("expected hello, got {}", other.kind()),
    }),
    Err(e) => Err(TransportError::Handshake { peer: expected.to_string(), reason: e.to_string() }),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  fn caps(mem: u64) -> WorkerCapabilities {
    WorkerCapabilities { gpu_model: "T4".into(), gpu_memory_mb: mem, tags: vec![] }
  }

  fn node(net: &MemoryNetwork, id: &str) -> MeshTransport {
    let transport = MeshTransport::new(id, caps(16000), Arc::new(net.clone()), Duration::from_secs(2));
    transport.spawn_acceptor(net.listen(id));
    transport
  }

  fn addr(id: &str) -> PeerAddress {
    PeerAddress { peer_id: id.into(), addr: id.into() }
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
  }

  #[tokio::test]
  async fn connect_exchanges_hello_and_delivers_messages() {
    let net = MemoryNetwork::new();
    let a = node(&net, "worker-a");
    let b = node(&net, "worker-b");

    let (tx, mut rx) = mpsc::unbounded_channel();
    b.on_message(move |from, msg| {
      let _ = tx.send((from.clone(), msg));
    });

    let remote = a.connect(&addr("worker-b")).await.unwrap();
    assert_eq!(remote, caps(16000));
    settle().await;
    assert!(a.is_open("worker-b"));
    assert!(b.is_open("worker-a"));

    a.send("worker-b", &MeshMessage::SnapshotRequest { from_peer_id: "worker-a".into() }).unwrap();
    let (from, msg) = rx.recv().await.unwrap();
    assert_eq!(from, "worker-a");
    assert_eq!(msg.kind(), "snapshot_request");
  }

  #[tokio::test]
  async fn connected_fires_before_queued_frames_are_dispatched() {
    let net = MemoryNetwork::new();
    let b = node(&net, "worker-b");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let connected_tx = tx.clone();
    b.on_peer_connected(move |peer, _| {
      let _ = connected_tx.send(format!("connected {peer}"));
    });
    b.on_message(move |peer, msg| {
      let _ = tx.send(format!("{} {peer}", msg.kind()));
    });

    // Dial by hand and queue a status update right behind the hello, before
    // the acceptor has even answered.
    let mut link = net.dial(&addr("worker-b")).await.unwrap();
    let hello = MeshMessage::Hello { from_peer_id: "worker-a".into(), capabilities: caps(8000) };
    link.tx.send(hello.encode().unwrap()).await.unwrap();
    let update = MeshMessage::status_update("worker-a", crate::models::WorkerStatus::Busy, None, &Default::default());
    link.tx.send(update.encode().unwrap()).await.unwrap();

    assert_eq!(rx.recv().await.unwrap(), "connected worker-a");
    assert_eq!(rx.recv().await.unwrap(), "status_update worker-a");
  }

  #[tokio::test]
  async fn send_to_unknown_peer_is_reported() {
    let net = MemoryNetwork::new();
    let a = node(&net, "worker-a");
    let err = a.send("worker-z", &MeshMessage::Leave { from_peer_id: "worker-a".into() });
    assert!(matches!(err, Err(TransportError::ChannelNotOpen(_))));
  }

  #[tokio::test]
  async fn connect_to_missing_listener_fails() {
    let net = MemoryNetwork::new();
    let a = node(&net, "worker-a");
    let err = a.connect(&addr("worker-q")).await;
    assert!(matches!(err, Err(TransportError::Connect { .. })));
    assert_eq!(a.connection_count(), 0);
  }

  #[tokio::test]
  async fn closing_a_channel_fires_departure_on_the_other_side() {
    let net = MemoryNetwork::new();
    let a = node(&net, "worker-a");
    let b = node(&net, "worker-b");
    let departed = Arc::new(AtomicUsize::new(0));
    let counter = departed.clone();
    b.on_peer_departed(move |peer| {
      assert_eq!(peer, "worker-a");
      counter.fetch_add(1, Ordering::SeqCst);
    });

    a.connect(&addr("worker-b")).await.unwrap();
    settle().await;
    a.close_all();
    settle().await;
    assert_eq!(departed.load(Ordering::SeqCst), 1);
    assert!(!b.is_open("worker-a"));
  }

  #[tokio::test]
  async fn broadcast_reaches_every_open_channel() {
    let net = MemoryNetwork::new();
    let hub = node(&net, "worker-0");
    let received = Arc::new(AtomicUsize::new(0));
    let mut spokes = Vec::new();
    for i in 1..4 {
      let id = format!("worker-{i}");
      let spoke = node(&net, &id);
      let counter = received.clone();
      spoke.on_message(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
      });
      hub.connect(&addr(&id)).await.unwrap();
      spokes.push(spoke);
    }
    settle().await;
    let failures = hub.broadcast(&MeshMessage::heartbeat("worker-0", Default::default(), 0));
    assert!(failures.is_empty());
    settle().await;
    assert_eq!(received.load(Ordering::SeqCst), 3);
  }
}
