//! The worker process's coordination loop.
//!
//! `RoomMember` owns every piece of mutable coordination state (replicated
//! state, role, heartbeat table, pending queries) and mutates it only from its
//! own `select!` loop. Transport callbacks, the job layer and the HTTP routes
//! talk to it through channels.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordinator::{AdminCoordinator, Outcome, Role};
use crate::error::{MemberError, QueryError};
use crate::liveness::HeartbeatTable;
use crate::models::{CurrentJob, PeerAddress, PeerId, QueryFilters, WorkerCapabilities, WorkerList, WorkerRecord, WorkerStatus};
use crate::protocol::MeshMessage;
use crate::signaling::{join_with_retry, Bootstrap};
use crate::transport::{Connector, MeshSender, MeshTransport};

static DIAL_RETRIES: usize = 3;
static DIAL_DELAY: u64 = 200;
const COMMAND_CAPACITY: usize = 64;
/// Heartbeat timeouts a tombstone is kept before it is dropped.
const TOMBSTONE_RETENTION: u32 = 12;

#[derive(Debug, Clone)]
pub struct MemberSettings {
  pub room_id: String,
  pub peer_id: PeerId,
  /// Address other workers dial to reach this one.
  pub public_addr: String,
  pub capabilities: WorkerCapabilities,
  pub heartbeat_interval: Duration,
  pub missed_heartbeats: u32,
  pub query_timeout: Duration,
  pub connect_timeout: Duration,
}

impl MemberSettings {
  pub fn new(room_id: impl Into<String>, peer_id: impl Into<PeerId>, public_addr: impl Into<String>, capabilities: WorkerCapabilities) -> Self {
    Self {
      room_id: room_id.into(),
      peer_id: peer_id.into(),
      public_addr: public_addr.into(),
      capabilities,
      heartbeat_interval: Duration::from_secs(5),
      missed_heartbeats: 3,
      query_timeout: Duration::from_secs(10),
      connect_timeout: Duration::from_secs(10),
    }
  }
}

impl From<&Config> for MemberSettings {
  fn from(config: &Config) -> Self {
    Self {
      room_id: config.room_id.clone(),
      peer_id: config.peer_id.clone(),
      public_addr: config.public_addr.clone(),
      capabilities: config.capabilities(),
      heartbeat_interval: config.heartbeat_interval,
      missed_heartbeats: config.missed_heartbeats,
      query_timeout: config.query_timeout,
      connect_timeout: config.connect_timeout,
    }
  }
}

/// What the rest of the process can see of the member, republished whenever
/// it changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberView {
  pub peer_id: PeerId,
  pub role: Role,
  pub admin_peer_id: Option<PeerId>,
  pub version: u64,
  pub read_only: bool,
  pub connections: usize,
  pub workers: Vec<WorkerRecord>,
}

enum MeshEvent {
  Connected { peer_id: PeerId, capabilities: WorkerCapabilities },
  Message { peer_id: PeerId, message: MeshMessage },
  Departed { peer_id: PeerId },
  DialFinished { peer_id: PeerId },
}

enum Command {
  SetStatus { status: WorkerStatus, current_job: Option<CurrentJob> },
  Query { filters: QueryFilters, reply: oneshot::Sender<Result<WorkerList, QueryError>> },
  Shutdown,
}

/// Cheap, cloneable access to a running member.
#[derive(Clone)]
pub struct MemberHandle {
  peer_id: PeerId,
  commands: mpsc::Sender<Command>,
  view: watch::Receiver<MemberView>,
  query_timeout: Duration,
}

impl MemberHandle {
  pub fn peer_id(&self) -> &PeerId {
    &self.peer_id
  }

  /// Reports a local status change from the job layer. Never waits on the
  /// member loop.
  pub fn set_status(&self, status: WorkerStatus, current_job: Option<CurrentJob>) -> Result<(), MemberError> {
    self.commands
      .try_send(Command::SetStatus { status, current_job })
      .map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => MemberError::Busy,
        mpsc::error::TrySendError::Closed(_) => MemberError::Stopped,
      })
  }

  /// Runs a worker query through the room's admin. Gives up with
  /// `NoCoordinator` once the query timeout elapses.
  pub async fn query(&self, filters: QueryFilters) -> Result<WorkerList, QueryError> {
    let exchange = async {
      let (reply, rx) = oneshot::channel();
      self.commands
        .send(Command::Query { filters, reply })
        .await
        .map_err(|_| QueryError::MemberGone)?;
      rx.await.map_err(|_| QueryError::MemberGone)?
    };
    match tokio::time::timeout(self.query_timeout, exchange).await {
      Ok(result) => result,
      Err(_) => Err(QueryError::NoCoordinator),
    }
  }

  pub fn view(&self) -> MemberView {
    self.view.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<MemberView> {
    self.view.clone()
  }

  pub async fn shutdown(&self) {
    let _ = self.commands.send(Command::Shutdown).await;
  }
}

pub struct RoomMember {
  settings: MemberSettings,
  transport: MeshTransport,
  bootstrap: Arc<dyn Bootstrap>,
  coordinator: AdminCoordinator,
  heartbeats: HeartbeatTable,
  /// Capabilities from each peer's hello, used to revive a peer that was
  /// removed but turns out to be alive.
  peer_caps: HashMap<PeerId, WorkerCapabilities>,
  /// Dialable addresses learned from the bootstrap grant.
  addresses: HashMap<PeerId, PeerAddress>,
  dialing: HashSet<PeerId>,
  /// When each tombstone was first seen locally.
  tombstones: HashMap<PeerId, Instant>,
  pending_queries: HashMap<String, oneshot::Sender<Result<WorkerList, QueryError>>>,
  events: mpsc::UnboundedReceiver<MeshEvent>,
  events_tx: mpsc::UnboundedSender<MeshEvent>,
  commands: mpsc::Receiver<Command>,
  view: watch::Sender<MemberView>,
}

impl RoomMember {
  pub fn new(settings: MemberSettings, connector: Arc<dyn Connector>, bootstrap: Arc<dyn Bootstrap>) -> (Self, MemberHandle) {
    let transport = MeshTransport::new(
      settings.peer_id.clone(),
      settings.capabilities.clone(),
      connector,
      settings.connect_timeout,
    );
    let (events_tx, events) = mpsc::unbounded_channel();
    {
      let tx = events_tx.clone();
      transport.on_peer_connected(move |peer_id, capabilities| {
        let _ = tx.send(MeshEvent::Connected { peer_id: peer_id.clone(), capabilities: capabilities.clone() });
      });
      let tx = events_tx.clone();
      transport.on_message(move |peer_id, message| {
        let _ = tx.send(MeshEvent::Message { peer_id: peer_id.clone(), message });
      });
      let tx = events_tx.clone();
      transport.on_peer_departed(move |peer_id| {
        let _ = tx.send(MeshEvent::Departed { peer_id: peer_id.clone() });
      });
    }

    let coordinator = AdminCoordinator::new(&settings.peer_id, settings.capabilities.clone());
    let heartbeats = HeartbeatTable::new(settings.heartbeat_interval, settings.missed_heartbeats);
    let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
    let (view, view_rx) = watch::channel(Self::view_of(&coordinator, &transport));

    let handle = MemberHandle {
      peer_id: settings.peer_id.clone(),
      commands: commands_tx,
      view: view_rx,
      query_timeout: settings.query_timeout,
    };
    let member = Self {
      settings,
      transport,
      bootstrap,
      coordinator,
      heartbeats,
      peer_caps: HashMap::new(),
      addresses: HashMap::new(),
      dialing: HashSet::new(),
      tombstones: HashMap::new(),
      pending_queries: HashMap::new(),
      events,
      events_tx,
      commands,
      view,
    };
    (member, handle)
  }

  /// The mesh transport, for wiring inbound links (WebSocket route or an
  /// in-memory listener) before `run` is called.
  pub fn transport(&self) -> &MeshTransport {
    &self.transport
  }

  /// Joins the room and runs until `shutdown` is requested or every handle
  /// is dropped.
  pub async fn run(mut self) -> anyhow::Result<()> {
    anyhow::ensure!(!self.settings.heartbeat_interval.is_zero(), "heartbeat interval must be non-zero");
    let local = PeerAddress {
      peer_id: self.settings.peer_id.clone(),
      addr: self.settings.public_addr.clone(),
    };
    let grant = join_with_retry(self.bootstrap.as_ref(), &self.settings.room_id, &local, &self.settings.capabilities).await?;
    if let Some(hint) = &grant.admin_peer_id {
      debug!(admin_hint = %hint, "Bootstrap reported current admin");
    }
    for peer in grant.peers {
      if peer.peer_id == self.settings.peer_id {
        continue;
      }
      self.addresses.insert(peer.peer_id.clone(), peer.clone());
      self.spawn_dial(peer);
    }
    self.publish();

    let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut liveness = tokio::time::interval_at(
      Instant::now() + self.settings.heartbeat_interval,
      self.settings.heartbeat_interval,
    );
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        Some(event) = self.events.recv() => self.handle_event(event),
        command = self.commands.recv() => match command {
          Some(Command::Shutdown) | None => break,
          Some(command) => self.handle_command(command),
        },
        _ = heartbeat.tick() => self.send_heartbeat(),
        _ = liveness.tick() => self.check_liveness(),
      }
      self.publish();
    }

    self.leave().await;
    Ok(())
  }

  fn view_of(coordinator: &AdminCoordinator, transport: &MeshTransport) -> MemberView {
    MemberView {
      peer_id: coordinator.local_peer().clone(),
      role: coordinator.role(),
      admin_peer_id: coordinator.admin_peer().cloned(),
      version: coordinator.version(),
      read_only: coordinator.read_only(),
      connections: transport.connection_count(),
      workers: coordinator.snapshot().workers,
    }
  }

  fn publish(&self) {
    let next = Self::view_of(&self.coordinator, &self.transport);
    self.view.send_if_modified(|current| {
      if *current == next {
        return false;
      }
      *current = next;
      true
    });
  }

  fn spawn_dial(&mut self, peer: PeerAddress) {
    if !self.dialing.insert(peer.peer_id.clone()) {
      return;
    }
    let transport = self.transport.clone();
    let events = self.events_tx.clone();
    tokio::spawn(async move {
      let strategy = ExponentialBackoff::from_millis(DIAL_DELAY)
        .max_delay(Duration::from_secs(2))
        .take(DIAL_RETRIES);
      match Retry::spawn(strategy, || transport.connect(&peer)).await {
        Ok(capabilities) => debug!(peer = %peer.peer_id, gpu_memory_mb = capabilities.gpu_memory_mb, "Dial succeeded"),
        Err(e) => warn!(peer = %peer.peer_id, error = %e, "Giving up on mesh connection"),
      }
      let _ = events.send(MeshEvent::DialFinished { peer_id: peer.peer_id });
    });
  }

  fn handle_event(&mut self, event: MeshEvent) {
    let now = Instant::now();
    match event {
      MeshEvent::Connected { peer_id, capabilities } => {
        self.heartbeats.heard(&peer_id, now);
        self.peer_caps.insert(peer_id.clone(), capabilities.clone());
        self.coordinator.peer_joined(&peer_id, capabilities, &self.transport);
        self.check_admin(now);
      }
      MeshEvent::Message { peer_id, message } => self.handle_message(peer_id, message, now),
      MeshEvent::Departed { peer_id } => {
        self.heartbeats.channel_lost(&peer_id);
        if self.heartbeats.is_alive(&peer_id, now) {
          info!(peer = %peer_id, "Channel closed but peer is still heard by others");
          self.check_admin(now);
        } else {
          self.depart(&peer_id, "channel closed");
        }
      }
      MeshEvent::DialFinished { peer_id } => {
        self.dialing.remove(&peer_id);
      }
    }
  }

  fn handle_message(&mut self, peer_id: PeerId, message: MeshMessage, now: Instant) {
    self.heartbeats.heard(&peer_id, now);
    match message {
      MeshMessage::Heartbeat { observed, clock, .. } => {
        self.heartbeats.apply_observed(&peer_id, &observed, &self.settings.peer_id, now);
        self.coordinator.observe_clock(clock);
        if !self.coordinator.state().contains(&peer_id) {
          if let Some(capabilities) = self.peer_caps.get(&peer_id).cloned() {
            info!(peer = %peer_id, "Heard from a removed worker, restoring it");
            self.coordinator.peer_joined(&peer_id, capabilities, &self.transport);
          }
        }
      }
      MeshMessage::Leave { from_peer_id } if from_peer_id == peer_id => {
        info!(peer = %peer_id, "Worker left the room");
        self.transport.disconnect(&peer_id);
        self.depart(&peer_id, "leave");
      }
      message => match self.coordinator.handle_message(&peer_id, message, &self.transport) {
        Some(Outcome::QueryAnswered { request_id, list }) => match self.pending_queries.remove(&request_id) {
          Some(reply) => {
            let _ = reply.send(Ok(list));
          }
          None => debug!(request_id = %request_id, "Late or unknown query answer dropped"),
        },
        Some(Outcome::WorkersChanged) => self.track_known_workers(now),
        None => {}
      },
    }
  }

  fn handle_command(&mut self, command: Command) {
    match command {
      Command::SetStatus { status, current_job } => {
        debug!(%status, "Local status change");
        self.coordinator.local_status(status, current_job, &self.transport);
      }
      Command::Query { filters, reply } => {
        if let Some(request_id) = self.route_query(filters, reply) {
          debug!(request_id = %request_id, "Query forwarded to admin");
        }
      }
      Command::Shutdown => {}
    }
  }

  /// Answers locally when this worker is admin or cut off from it, otherwise
  /// forwards to the admin. Returns the request id of a forwarded query.
  fn route_query(&mut self, filters: QueryFilters, reply: oneshot::Sender<Result<WorkerList, QueryError>>) -> Option<String> {
    if self.coordinator.is_admin() || self.coordinator.read_only() {
      let _ = reply.send(Ok(self.coordinator.answer_query(&filters)));
      return None;
    }
    let Some(admin) = self.coordinator.admin_peer().cloned() else {
      let _ = reply.send(Err(QueryError::NoCoordinator));
      return None;
    };
    let request_id = uuid::Uuid::new_v4().to_string();
    let request = MeshMessage::QueryWorkers {
      request_id: request_id.clone(),
      origin: self.settings.peer_id.clone(),
      filters,
    };
    if let Err(e) = self.transport.send(&admin, &request) {
      warn!(admin = %admin, error = %e, "Could not forward query to admin");
      let _ = reply.send(Err(QueryError::NoCoordinator));
      return None;
    }
    self.pending_queries.insert(request_id.clone(), reply);
    Some(request_id)
  }

  fn send_heartbeat(&mut self) {
    let now = Instant::now();
    let message = MeshMessage::heartbeat(&self.settings.peer_id, self.heartbeats.observed(now), self.coordinator.clock());
    for (peer, e) in self.transport.broadcast(&message) {
      debug!(peer = %peer, error = %e, "Heartbeat not delivered");
    }
    self.coordinator.flush_pending(&self.transport);
    self.pending_queries.retain(|_, reply| !reply.is_closed());
  }

  fn check_liveness(&mut self) {
    let now = Instant::now();
    for peer_id in self.heartbeats.expired(now) {
      self.transport.disconnect(&peer_id);
      self.depart(&peer_id, "heartbeat timeout");
    }
    self.check_admin(now);

    let open: HashSet<PeerId> = self.transport.open_peers().into_iter().collect();
    let redial: Vec<PeerAddress> = self.heartbeats
      .tracked()
      .into_iter()
      .filter(|p| !open.contains(p) && !self.dialing.contains(p))
      .filter_map(|p| self.addresses.get(&p).cloned())
      .collect();
    for peer in redial {
      debug!(peer = %peer.peer_id, "Redialing peer without a channel");
      self.spawn_dial(peer);
    }
    self.collect_tombstones(now);
  }

  /// Drops tombstones that have outlived the retention window, together with
  /// what this member remembered about those peers.
  fn collect_tombstones(&mut self, now: Instant) {
    let current: HashSet<PeerId> = self.coordinator.tombstoned_peers().into_iter().collect();
    self.tombstones.retain(|peer_id, _| current.contains(peer_id));
    for peer_id in current {
      self.tombstones.entry(peer_id).or_insert(now);
    }
    let retention = self.heartbeats.timeout() * TOMBSTONE_RETENTION;
    let expired: Vec<PeerId> = self.tombstones
      .iter()
      .filter(|(_, seen)| now.duration_since(**seen) >= retention)
      .map(|(peer_id, _)| peer_id.clone())
      .collect();
    for peer_id in expired {
      self.tombstones.remove(&peer_id);
      if self.transport.is_open(&peer_id) {
        continue;
      }
      if self.coordinator.forget_worker(&peer_id) {
        self.peer_caps.remove(&peer_id);
        self.addresses.remove(&peer_id);
        debug!(peer = %peer_id, "Forgot departed worker");
      }
    }
  }

  /// Read-only mode follows the admin's direct reachability; a worker that
  /// can only hear about the admin through others must not re-elect.
  fn check_admin(&mut self, now: Instant) {
    if self.coordinator.is_admin() {
      return;
    }
    let Some(admin) = self.coordinator.admin_peer().cloned() else {
      return;
    };
    if self.transport.is_open(&admin) && self.heartbeats.is_directly_reachable(&admin, now) {
      self.coordinator.leave_read_only(&self.transport);
    } else if self.heartbeats.is_alive(&admin, now) {
      self.coordinator.enter_read_only();
    }
  }

  fn track_known_workers(&mut self, now: Instant) {
    for peer_id in self.coordinator.known_peers() {
      if peer_id != self.settings.peer_id && !self.heartbeats.is_tracked(&peer_id) {
        self.heartbeats.track(&peer_id, now);
      }
    }
  }

  fn depart(&mut self, peer_id: &str, reason: &str) {
    self.heartbeats.forget(peer_id);
    if self.coordinator.peer_departed(peer_id, &self.transport) {
      info!(peer = %peer_id, reason, admin = ?self.coordinator.admin_peer(), "Worker departed");
    }
  }

  async fn leave(&mut self) {
    info!(peer = %self.settings.peer_id, "Leaving room");
    let message = MeshMessage::Leave { from_peer_id: self.settings.peer_id.clone() };
    for (peer, e) in self.transport.broadcast(&message) {
      debug!(peer = %peer, error = %e, "Leave notice not delivered");
    }
    if let Err(e) = self.bootstrap.leave(&self.settings.room_id, &self.settings.peer_id).await {
      warn!(error = %e, "Failed to deregister from signaling");
    }
    for (_, reply) in self.pending_queries.drain() {
      let _ = reply.send(Err(QueryError::MemberGone));
    }
    self.transport.close_all();
    self.publish();
  }
}
