//! Admin / follower behaviour for one worker.
//!
//! The role is a strategy object picked by `elect()` over the locally known
//! worker set and re-picked whenever that set changes. Nothing here awaits:
//! all sends go through [`MeshSender`], which queues without blocking, so the
//! member loop can call into the coordinator from any event.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::election::elect;
use crate::models::{CurrentJob, PeerId, QueryFilters, WorkerActivity, WorkerCapabilities, WorkerList, WorkerStatus};
use crate::protocol::MeshMessage;
use crate::state::{ReplicatedState, RoomDocument, RoomSnapshot, Stamp};
use crate::transport::MeshSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
  Admin,
  Follower,
}

/// Something the member loop has to act on after a message was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  /// The admin answered a query this worker forwarded.
  QueryAnswered { request_id: String, list: WorkerList },
  /// The worker set changed through a merge; liveness tracking should follow.
  WorkersChanged,
}

/// Role-specific reactions. Implementations are stateless; everything they
/// touch lives in [`Shared`].
trait RoleStrategy: Send + Sync {
  fn role(&self) -> Role;
  fn on_local_status(&self, shared: &mut Shared, mesh: &dyn MeshSender);
  fn on_status_update(&self, shared: &mut Shared, from: &str, activity: WorkerActivity, stamp: Stamp, mesh: &dyn MeshSender);
  fn on_snapshot_request(&self, shared: &mut Shared, from: &str, mesh: &dyn MeshSender);
  fn on_membership_change(&self, shared: &mut Shared, mesh: &dyn MeshSender);
}

struct Shared {
  state: ReplicatedState,
  /// Result of the last local election. The replicated admin register may
  /// briefly carry another replica's view while merges are in flight; the
  /// role always follows this value.
  elected: Option<PeerId>,
  version: u64,
  highest_seen_version: u64,
  read_only: bool,
  /// Set from a local status change until an admin document shows it.
  pending_status: bool,
}

impl Shared {
  fn state_message(&self) -> MeshMessage {
    MeshMessage::StateBroadcast {
      from_peer_id: self.state.local_peer().clone(),
      snapshot: self.state.document().clone(),
      version: self.version,
    }
  }

  fn broadcast_state(&mut self, mesh: &dyn MeshSender) {
    self.version += 1;
    let failures = mesh.broadcast(&self.state_message());
    debug!(version = self.version, failed = failures.len(), "State broadcast sent");
  }

  fn send_state_to(&self, peer_id: &str, mesh: &dyn MeshSender) {
    if let Err(e) = mesh.send(peer_id, &self.state_message()) {
      warn!(peer = %peer_id, error = %e, "Failed to send snapshot");
    }
  }

  fn local_status_message(&self) -> Option<MeshMessage> {
    let (activity, stamp) = self.state.local_activity()?;
    Some(MeshMessage::status_update(self.state.local_peer(), activity.status, activity.current_job, &stamp))
  }
}

struct AdminRole;
struct FollowerRole;

impl RoleStrategy for AdminRole {
  fn role(&self) -> Role {
    Role::Admin
  }

  fn on_local_status(&self, shared: &mut Shared, mesh: &dyn MeshSender) {
    shared.pending_status = false;
    shared.broadcast_state(mesh);
  }

  fn on_status_update(&self, shared: &mut Shared, from: &str, activity: WorkerActivity, stamp: Stamp, mesh: &dyn MeshSender) {
    if shared.state.apply_status(from, activity, stamp) {
      shared.broadcast_state(mesh);
    } else {
      // Nothing new here, but the sender keeps retrying until it sees a
      // document carrying its update, so answer it directly.
      shared.send_state_to(from, mesh);
    }
  }

  fn on_snapshot_request(&self, shared: &mut Shared, from: &str, mesh: &dyn MeshSender) {
    shared.send_state_to(from, mesh);
  }

  fn on_membership_change(&self, shared: &mut Shared, mesh: &dyn MeshSender) {
    shared.broadcast_state(mesh);
  }
}

impl RoleStrategy for FollowerRole {
  fn role(&self) -> Role {
    Role::Follower
  }

  fn on_local_status(&self, shared: &mut Shared, mesh: &dyn MeshSender) {
    let Some(admin) = shared.elected.clone() else {
      shared.pending_status = true;
      return;
    };
    if shared.read_only {
      shared.pending_status = true;
      debug!("Read-only mode, status update queued");
      return;
    }
    let Some(message) = shared.local_status_message() else {
      return;
    };
    shared.pending_status = true;
    if let Err(e) = mesh.send(&admin, &message) {
      warn!(admin = %admin, error = %e, "Status update to admin failed, will retry");
    }
  }

  fn on_status_update(&self, shared: &mut Shared, from: &str, activity: WorkerActivity, stamp: Stamp, _mesh: &dyn MeshSender) {
    // The sender still believes we are admin. The register is the owner's,
    // so merging it is harmless; the real admin will broadcast it.
    debug!(peer = %from, "Status update received while not admin");
    shared.state.apply_status(from, activity, stamp);
  }

  fn on_snapshot_request(&self, _shared: &mut Shared, from: &str, _mesh: &dyn MeshSender) {
    debug!(peer = %from, "Ignoring snapshot request, not admin");
  }

  fn on_membership_change(&self, _shared: &mut Shared, _mesh: &dyn MeshSender) {}
}

pub struct AdminCoordinator {
  shared: Shared,
  strategy: Box<dyn RoleStrategy>,
}

impl AdminCoordinator {
  pub fn new(local_peer: &str, capabilities: WorkerCapabilities) -> Self {
    let mut state = ReplicatedState::new(local_peer);
    state.put_worker(local_peer, capabilities);
    let mut coordinator = Self {
      shared: Shared {
        state,
        elected: None,
        version: 0,
        highest_seen_version: 0,
        read_only: false,
        pending_status: false,
      },
      strategy: Box::new(FollowerRole),
    };
    coordinator.select_strategy();
    coordinator
  }

  pub fn local_peer(&self) -> &PeerId {
    self.shared.state.local_peer()
  }

  pub fn role(&self) -> Role {
    self.strategy.role()
  }

  pub fn is_admin(&self) -> bool {
    self.role() == Role::Admin
  }

  pub fn admin_peer(&self) -> Option<&PeerId> {
    self.shared.elected.as_ref()
  }

  pub fn version(&self) -> u64 {
    self.shared.version
  }

  pub fn read_only(&self) -> bool {
    self.shared.read_only
  }

  pub fn has_pending_status(&self) -> bool {
    self.shared.pending_status
  }

  pub fn state(&self) -> &ReplicatedState {
    &self.shared.state
  }

  pub fn snapshot(&self) -> RoomSnapshot {
    self.shared.state.snapshot()
  }

  pub fn known_peers(&self) -> Vec<PeerId> {
    self.shared.state.live_peers()
  }

  pub fn tombstoned_peers(&self) -> Vec<PeerId> {
    self.shared.state.tombstoned_peers()
  }

  pub fn clock(&self) -> u64 {
    self.shared.state.clock()
  }

  /// Advances the local clock past one carried by a peer's heartbeat.
  pub fn observe_clock(&mut self, clock: u64) {
    self.shared.state.observe(clock);
  }

  /// Drops a departed worker's tombstone.
  pub fn forget_worker(&mut self, peer_id: &str) -> bool {
    self.shared.state.forget_worker(peer_id)
  }

  /// Re-runs the election over the current worker set and swaps the role
  /// strategy if the outcome for this worker changed. Returns true if the
  /// admin identity changed.
  fn select_strategy(&mut self) -> bool {
    let winner = elect(&self.shared.state.snapshot().capabilities());
    let Some(winner) = winner else {
      return false;
    };
    let changed = self.shared.elected.as_ref() != Some(&winner);
    self.shared.state.set_admin(&winner);
    self.shared.elected = Some(winner.clone());
    let should_lead = &winner == self.shared.state.local_peer();
    if should_lead != self.is_admin() {
      if should_lead {
        info!(peer = %winner, "Adopting admin role");
        self.strategy = Box::new(AdminRole);
        self.shared.read_only = false;
      } else {
        info!(admin = %winner, "Stepping back to follower");
        self.strategy = Box::new(FollowerRole);
      }
    } else if changed {
      info!(admin = %winner, "Admin re-elected");
    }
    changed
  }

  fn membership_changed(&mut self, mesh: &dyn MeshSender) {
    let admin_changed = self.select_strategy();
    self.strategy.on_membership_change(&mut self.shared, mesh);
    if admin_changed && !self.is_admin() {
      self.shared.read_only = false;
      self.resync(mesh);
    }
  }

  /// A peer completed the mesh handshake or was otherwise confirmed present.
  pub fn peer_joined(&mut self, peer_id: &str, capabilities: WorkerCapabilities, mesh: &dyn MeshSender) {
    if self.shared.state.put_worker(peer_id, capabilities) {
      info!(peer = %peer_id, "Worker joined room");
    }
    self.membership_changed(mesh);
  }

  /// A peer is confirmed departed (heartbeat timeout, leave, or closed channel).
  pub fn peer_departed(&mut self, peer_id: &str, mesh: &dyn MeshSender) -> bool {
    if !self.shared.state.remove_worker(peer_id) {
      return false;
    }
    let was_admin = self.admin_peer().is_some_and(|a| a == peer_id);
    self.membership_changed(mesh);
    if was_admin {
      info!(departed = %peer_id, admin = ?self.admin_peer(), "Admin departed, re-elected locally");
    }
    true
  }

  /// The job layer changed this worker's status.
  pub fn local_status(&mut self, status: WorkerStatus, current_job: Option<CurrentJob>, mesh: &dyn MeshSender) {
    let local = self.local_peer().clone();
    if self.shared.state.update_status(&local, status, current_job) {
      self.strategy.on_local_status(&mut self.shared, mesh);
    }
  }

  pub fn handle_message(&mut self, from: &str, message: MeshMessage, mesh: &dyn MeshSender) -> Option<Outcome> {
    match message {
      MeshMessage::StatusUpdate { from_peer_id, status, current_job, clock, .. } => {
        if from_peer_id != from {
          warn!(peer = %from, claimed = %from_peer_id, "Status update for another worker dropped");
          return None;
        }
        let activity = WorkerActivity::new(status, current_job);
        let stamp = Stamp::new(clock, from_peer_id.clone());
        self.strategy.on_status_update(&mut self.shared, &from_peer_id, activity, stamp, mesh);
        None
      }
      MeshMessage::StateBroadcast { from_peer_id, snapshot, version } => {
        self.apply_broadcast(&from_peer_id, &snapshot, version, mesh)
      }
      MeshMessage::SnapshotRequest { from_peer_id } => {
        self.strategy.on_snapshot_request(&mut self.shared, &from_peer_id, mesh);
        None
      }
      MeshMessage::QueryWorkers { request_id, origin, filters } => {
        let list = self.answer_query(&filters);
        let reply = MeshMessage::WorkerList { request_id, list };
        if let Err(e) = mesh.send(&origin, &reply) {
          warn!(peer = %origin, error = %e, "Failed to return worker list");
        }
        None
      }
      MeshMessage::WorkerList { request_id, list } => Some(Outcome::QueryAnswered { request_id, list }),
      other => {
        debug!(peer = %from, kind = other.kind(), "Message not handled by coordinator");
        None
      }
    }
  }

  fn apply_broadcast(&mut self, from: &str, snapshot: &RoomDocument, version: u64, mesh: &dyn MeshSender) -> Option<Outcome> {
    if Some(from) == self.admin_peer().map(String::as_str) && version < self.shared.highest_seen_version {
      debug!(peer = %from, version, "Out-of-order broadcast, merging anyway");
    }
    self.shared.highest_seen_version = self.shared.highest_seen_version.max(version);

    let local = self.local_peer().clone();
    let ours = self.shared.state.local_activity().map(|(_, stamp)| stamp);
    if self.shared.pending_status {
      let delivered = snapshot.workers
        .get(&local)
        .zip(ours.as_ref())
        .is_some_and(|(entry, ours)| entry.activity.stamp >= *ours);
      if delivered {
        debug!(peer = %from, "Status update acknowledged");
        self.shared.pending_status = false;
      }
    }

    let before: HashSet<PeerId> = self.known_peers().into_iter().collect();
    if !self.shared.state.merge(snapshot) {
      return None;
    }
    let reasserted = self.shared
      .state
      .local_activity()
      .is_some_and(|(_, stamp)| stamp.peer_id == local && Some(&stamp) != ours.as_ref());
    if reasserted {
      self.strategy.on_local_status(&mut self.shared, mesh);
    }
    let after: HashSet<PeerId> = self.known_peers().into_iter().collect();
    if before == after {
      return None;
    }
    self.membership_changed(mesh);
    Some(Outcome::WorkersChanged)
  }

  /// Filters the local snapshot. Followers mark the answer stale.
  pub fn answer_query(&self, filters: &QueryFilters) -> WorkerList {
    let snapshot = self.snapshot();
    WorkerList {
      workers: snapshot.filter(filters),
      admin_peer_id: self.shared.elected.clone(),
      stale: !self.is_admin(),
    }
  }

  /// The admin stopped answering on its direct channel but other peers still
  /// hear it. Keep working from the cached snapshot and do not re-elect.
  pub fn enter_read_only(&mut self) {
    if !self.shared.read_only && !self.is_admin() {
      warn!(admin = ?self.admin_peer(), "Admin unreachable directly, entering read-only mode");
      self.shared.read_only = true;
    }
  }

  pub fn leave_read_only(&mut self, mesh: &dyn MeshSender) {
    if self.shared.read_only {
      info!(admin = ?self.admin_peer(), "Admin reachable again, leaving read-only mode");
      self.shared.read_only = false;
      self.resync(mesh);
    }
  }

  /// Asks the admin for a fresh snapshot and flushes any queued status.
  pub fn resync(&mut self, mesh: &dyn MeshSender) {
    if self.is_admin() {
      return;
    }
    let Some(admin) = self.admin_peer().cloned() else {
      return;
    };
    let request = MeshMessage::SnapshotRequest { from_peer_id: self.local_peer().clone() };
    if let Err(e) = mesh.send(&admin, &request) {
      debug!(admin = %admin, error = %e, "Snapshot request not sent");
    }
    if self.shared.pending_status || self.has_unacknowledged_status() {
      self.strategy.on_local_status(&mut self.shared, mesh);
    }
  }

  /// Retries a status update that could not reach the admin earlier.
  pub fn flush_pending(&mut self, mesh: &dyn MeshSender) {
    if self.shared.pending_status && !self.shared.read_only {
      self.strategy.on_local_status(&mut self.shared, mesh);
    }
  }

  fn has_unacknowledged_status(&self) -> bool {
    self.shared
      .state
      .local_activity()
      .is_some_and(|(activity, _)| activity != WorkerActivity::available())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::TransportError;
  use std::sync::Mutex;

  #[derive(Default)]
  struct RecordingMesh {
    open: Vec<PeerId>,
    sent: Mutex<Vec<(Option<PeerId>, MeshMessage)>>,
  }

  impl RecordingMesh {
    fn with_peers(peers: &[&str]) -> Self {
      Self { open: peers.iter().map(|p| p.to_string()).collect(), ..Default::default() }
    }

    fn take(&self) -> Vec<(Option<PeerId>, MeshMessage)> {
      std::mem::take(&mut *self.sent.lock().unwrap())
    }
  }

  impl MeshSender for RecordingMesh {
    fn send(&self, peer_id: &str, message: &MeshMessage) -> Result<(), TransportError> {
      if !self.is_open(peer_id) {
        return Err(TransportError::ChannelNotOpen(peer_id.to_string()));
      }
      self.sent.lock().unwrap().push((Some(peer_id.to_string()), message.clone()));
      Ok(())
    }

    fn broadcast(&self, message: &MeshMessage) -> Vec<(PeerId, TransportError)> {
      self.sent.lock().unwrap().push((None, message.clone()));
      Vec::new()
    }

    fn is_open(&self, peer_id: &str) -> bool {
      self.open.iter().any(|p| p == peer_id)
    }
  }

  fn caps(mem: u64) -> WorkerCapabilities {
    WorkerCapabilities { gpu_model: "H100".into(), gpu_memory_mb: mem, tags: vec![] }
  }

  #[test]
  fn lone_worker_is_admin() {
    let c = AdminCoordinator::new("worker-1", caps(16000));
    assert!(c.is_admin());
    assert_eq!(c.admin_peer().map(String::as_str), Some("worker-1"));
  }

  #[test]
  fn bigger_peer_joining_takes_admin_role() {
    let mesh = RecordingMesh::with_peers(&["worker-2"]);
    let mut c = AdminCoordinator::new("worker-1", caps(16000));
    c.peer_joined("worker-2", caps(24000), &mesh);
    assert!(!c.is_admin());
    assert_eq!(c.admin_peer().map(String::as_str), Some("worker-2"));
    let sent = mesh.take();
    assert!(sent.iter().any(|(to, m)| to.as_deref() == Some("worker-2") && m.kind() == "snapshot_request"));
  }

  #[test]
  fn admin_merges_status_update_and_broadcasts_versioned_state() {
    let mesh = RecordingMesh::with_peers(&["worker-1"]);
    let mut admin = AdminCoordinator::new("worker-2", caps(24000));
    admin.peer_joined("worker-1", caps(16000), &mesh);
    mesh.take();
    let v0 = admin.version();

    let update = MeshMessage::StatusUpdate {
      from_peer_id: "worker-1".into(),
      status: WorkerStatus::Busy,
      current_job: Some(CurrentJob { job_id: "j1".into(), client_id: "c1".into() }),
      timestamp: chrono::Utc::now(),
      clock: 10,
    };
    assert_eq!(admin.handle_message("worker-1", update, &mesh), None);

    assert_eq!(admin.snapshot().get("worker-1").unwrap().status, WorkerStatus::Busy);
    assert_eq!(admin.version(), v0 + 1);
    let sent = mesh.take();
    assert!(matches!(&sent[..], [(None, MeshMessage::StateBroadcast { version, .. })] if *version == v0 + 1));
  }

  #[test]
  fn follower_sends_status_to_admin_only() {
    let mesh = RecordingMesh::with_peers(&["worker-2", "worker-3"]);
    let mut c = AdminCoordinator::new("worker-1", caps(16000));
    c.peer_joined("worker-2", caps(24000), &mesh);
    c.peer_joined("worker-3", caps(8000), &mesh);
    mesh.take();

    c.local_status(WorkerStatus::Reserved, None, &mesh);
    let sent = mesh.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.as_deref(), Some("worker-2"));
    assert_eq!(sent[0].1.kind(), "status_update");
    assert!(c.has_pending_status());
  }

  #[test]
  fn follower_retries_status_until_admin_document_shows_it() {
    let mesh = RecordingMesh::with_peers(&["worker-2", "worker-1"]);
    let mut admin = AdminCoordinator::new("worker-2", caps(24000));
    let mut follower = AdminCoordinator::new("worker-1", caps(16000));
    admin.peer_joined("worker-1", caps(16000), &mesh);
    follower.peer_joined("worker-2", caps(24000), &mesh);
    mesh.take();

    follower.local_status(WorkerStatus::Busy, None, &mesh);
    let update = match &mesh.take()[..] {
      [(Some(to), update)] if to == "worker-2" => update.clone(),
      other => panic!("unexpected {other:?}"),
    };

    // A document from before the update does not count as delivery.
    let stale = MeshMessage::StateBroadcast { from_peer_id: "worker-2".into(), snapshot: admin.state().document().clone(), version: 1 };
    follower.handle_message("worker-2", stale, &mesh);
    assert!(follower.has_pending_status());
    follower.flush_pending(&mesh);
    assert_eq!(mesh.take().len(), 1);

    // The admin applies the first copy and answers a repeat directly.
    admin.handle_message("worker-1", update.clone(), &mesh);
    mesh.take();
    admin.handle_message("worker-1", update, &mesh);
    let reply = match mesh.take().pop() {
      Some((Some(to), reply @ MeshMessage::StateBroadcast { .. })) if to == "worker-1" => reply,
      other => panic!("unexpected {other:?}"),
    };
    follower.handle_message("worker-2", reply, &mesh);
    assert!(!follower.has_pending_status());
    follower.flush_pending(&mesh);
    assert!(mesh.take().is_empty());
  }

  #[test]
  fn restarted_follower_rewrites_status_left_by_previous_run() {
    let mesh = RecordingMesh::with_peers(&["worker-2", "worker-1"]);
    let mut admin = AdminCoordinator::new("worker-2", caps(24000));
    admin.peer_joined("worker-1", caps(16000), &mesh);
    let old_run = MeshMessage::StatusUpdate {
      from_peer_id: "worker-1".into(),
      status: WorkerStatus::Busy,
      current_job: Some(CurrentJob { job_id: "j".into(), client_id: "c".into() }),
      timestamp: chrono::Utc::now(),
      clock: 50,
    };
    admin.handle_message("worker-1", old_run, &mesh);
    mesh.take();

    let mut restarted = AdminCoordinator::new("worker-1", caps(16000));
    restarted.peer_joined("worker-2", caps(24000), &mesh);
    mesh.take();
    let broadcast = MeshMessage::StateBroadcast { from_peer_id: "worker-2".into(), snapshot: admin.state().document().clone(), version: 3 };
    restarted.handle_message("worker-2", broadcast, &mesh);

    assert_eq!(restarted.snapshot().get("worker-1").unwrap().status, WorkerStatus::Available);
    let update = match &mesh.take()[..] {
      [(Some(to), update @ MeshMessage::StatusUpdate { clock, .. })] if to == "worker-2" && *clock > 50 => update.clone(),
      other => panic!("unexpected {other:?}"),
    };
    admin.handle_message("worker-1", update, &mesh);
    let record = admin.snapshot().get("worker-1").cloned().unwrap();
    assert_eq!(record.status, WorkerStatus::Available);
    assert_eq!(record.current_job, None);
  }

  #[test]
  fn follower_merges_broadcast_instead_of_overwriting() {
    let mesh = RecordingMesh::with_peers(&["worker-2"]);
    let mut admin = AdminCoordinator::new("worker-2", caps(24000));
    let mut follower = AdminCoordinator::new("worker-1", caps(16000));
    admin.peer_joined("worker-1", caps(16000), &mesh);
    follower.peer_joined("worker-2", caps(24000), &mesh);

    follower.local_status(WorkerStatus::Busy, None, &mesh);
    // The admin has not seen the update yet; its broadcast must not undo it.
    let stale = MeshMessage::StateBroadcast {
      from_peer_id: "worker-2".into(),
      snapshot: admin.state().document().clone(),
      version: 7,
    };
    follower.handle_message("worker-2", stale.clone(), &mesh);
    follower.handle_message("worker-2", stale, &mesh);
    assert_eq!(follower.snapshot().get("worker-1").unwrap().status, WorkerStatus::Busy);
  }

  #[test]
  fn admin_departure_promotes_next_candidate() {
    let mesh = RecordingMesh::with_peers(&["worker-2", "worker-3"]);
    let mut c = AdminCoordinator::new("worker-1", caps(16000));
    c.peer_joined("worker-2", caps(24000), &mesh);
    c.peer_joined("worker-3", caps(16000), &mesh);
    assert!(!c.is_admin());

    assert!(c.peer_departed("worker-2", &mesh));
    assert!(c.is_admin());
    assert_eq!(c.admin_peer().map(String::as_str), Some("worker-1"));
    assert!(c.snapshot().get("worker-2").is_none());
    assert!(!c.peer_departed("worker-2", &mesh));
  }

  #[test]
  fn query_is_filtered_and_answered_to_origin() {
    let mesh = RecordingMesh::with_peers(&["worker-1", "worker-3", "worker-9"]);
    let mut admin = AdminCoordinator::new("worker-2", caps(24000));
    admin.peer_joined("worker-1", caps(16000), &mesh);
    admin.peer_joined("worker-3", caps(24000), &mesh);
    mesh.take();

    let query = MeshMessage::QueryWorkers {
      request_id: "q1".into(),
      origin: "worker-9".into(),
      filters: QueryFilters { min_gpu_memory_mb: Some(20000), ..Default::default() },
    };
    admin.handle_message("worker-1", query, &mesh);
    let sent = mesh.take();
    match &sent[..] {
      [(Some(to), MeshMessage::WorkerList { request_id, list })] => {
        assert_eq!(to, "worker-9");
        assert_eq!(request_id, "q1");
        let ids: Vec<_> = list.workers.iter().map(|w| w.peer_id.as_str()).collect();
        assert_eq!(ids, vec!["worker-2", "worker-3"]);
        assert_eq!(list.admin_peer_id.as_deref(), Some("worker-2"));
        assert!(!list.stale);
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn read_only_queues_status_and_resyncs_on_recovery() {
    let mesh = RecordingMesh::with_peers(&["worker-2"]);
    let mut c = AdminCoordinator::new("worker-1", caps(16000));
    c.peer_joined("worker-2", caps(24000), &mesh);
    mesh.take();

    c.enter_read_only();
    assert!(c.read_only());
    c.local_status(WorkerStatus::Busy, None, &mesh);
    assert!(mesh.take().is_empty());
    assert!(c.has_pending_status());
    assert!(c.answer_query(&QueryFilters::default()).stale);

    c.leave_read_only(&mesh);
    let kinds: Vec<_> = mesh.take().into_iter().map(|(_, m)| m.kind()).collect();
    assert_eq!(kinds, vec!["snapshot_request", "status_update"]);
    assert!(c.has_pending_status());
  }

  #[test]
  fn admin_answers_snapshot_request() {
    let mesh = RecordingMesh::with_peers(&["worker-1"]);
    let mut admin = AdminCoordinator::new("worker-2", caps(24000));
    admin.peer_joined("worker-1", caps(16000), &mesh);
    mesh.take();
    admin.handle_message("worker-1", MeshMessage::SnapshotRequest { from_peer_id: "worker-1".into() }, &mesh);
    let sent = mesh.take();
    assert!(matches!(&sent[..], [(Some(to), MeshMessage::StateBroadcast { .. })] if to == "worker-1"));
  }

  #[test]
  fn spoofed_status_update_is_dropped() {
    let mesh = RecordingMesh::with_peers(&["worker-1", "worker-3"]);
    let mut admin = AdminCoordinator::new("worker-2", caps(24000));
    admin.peer_joined("worker-1", caps(16000), &mesh);
    admin.peer_joined("worker-3", caps(16000), &mesh);
    let update = MeshMessage::StatusUpdate {
      from_peer_id: "worker-3".into(),
      status: WorkerStatus::Busy,
      current_job: None,
      timestamp: chrono::Utc::now(),
      clock: 99,
    };
    admin.handle_message("worker-1", update, &mesh);
    assert_eq!(admin.snapshot().get("worker-3").unwrap().status, WorkerStatus::Available);
  }
}
