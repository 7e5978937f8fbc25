//! Replicated room state.
//!
//! Every mutable field is a last-writer-wins register stamped with
//! `(lamport clock, peer id)`. Merging two documents takes the greater stamp
//! per register, so merge is commutative, associative and idempotent, and
//! writes to different registers never interfere. Removal writes a tombstone
//! into the profile register and resets the activity register with the same
//! stamp instead of deleting the map entry, so a stale replica cannot
//! resurrect a departed worker or its last job. Tombstones are dropped with
//! [`ReplicatedState::forget_worker`] once every replica has had time to see
//! them.

use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::error::StateError;
use crate::models::{CurrentJob, PeerId, QueryFilters, WorkerActivity, WorkerCapabilities, WorkerRecord, WorkerStatus};

/// Total order used to resolve concurrent writes: clock first, then peer id.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
  pub clock: u64,
  pub peer_id: PeerId,
}

impl Stamp {
  pub fn new(clock: u64, peer_id: impl Into<PeerId>) -> Self {
    Self { clock, peer_id: peer_id.into() }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register<T> {
  pub value: T,
  pub stamp: Stamp,
}

impl<T: Clone + Ord> Register<T> {
  pub fn new(value: T, stamp: Stamp) -> Self {
    Self { value, stamp }
  }

  /// Keeps whichever side has the greater stamp. Equal stamps fall back to
  /// comparing values so that even a malformed peer cannot make two replicas
  /// pick different winners.
  pub fn merge(&mut self, other: &Register<T>) -> bool {
    if (&other.stamp, &other.value) > (&self.stamp, &self.value) {
      *self = other.clone();
      true
    } else {
      false
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEntry {
  /// `None` marks a removed worker.
  pub profile: Register<Option<WorkerCapabilities>>,
  pub activity: Register<WorkerActivity>,
}

impl WorkerEntry {
  fn merge(&mut self, other: &WorkerEntry) -> bool {
    let a = self.profile.merge(&other.profile);
    let b = self.activity.merge(&other.activity);
    a || b
  }

  fn is_live(&self) -> bool {
    self.profile.value.is_some()
  }

  fn max_clock(&self) -> u64 {
    self.profile.stamp.clock.max(self.activity.stamp.clock)
  }

  fn record(&self, peer_id: &PeerId) -> Option<WorkerRecord> {
    let caps = self.profile.value.as_ref()?;
    Some(WorkerRecord {
      peer_id: peer_id.clone(),
      gpu_model: caps.gpu_model.clone(),
      gpu_memory_mb: caps.gpu_memory_mb,
      tags: caps.tags.clone(),
      status: self.activity.value.status,
      current_job: self.activity.value.current_job.clone(),
    })
  }
}

/// The mergeable document exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDocument {
  pub workers: BTreeMap<PeerId, WorkerEntry>,
  pub admin: Register<Option<PeerId>>,
}

impl Default for RoomDocument {
  fn default() -> Self {
    Self {
      workers: BTreeMap::new(),
      admin: Register::new(None, Stamp::default()),
    }
  }
}

impl RoomDocument {
  pub fn merge(&mut self, other: &RoomDocument) -> bool {
    let mut changed = false;
    for (peer_id, theirs) in &other.workers {
      match self.workers.get_mut(peer_id) {
        Some(ours) => changed |= ours.merge(theirs),
        None => {
          self.workers.insert(peer_id.clone(), theirs.clone());
          changed = true;
        }
      }
    }
    changed |= self.admin.merge(&other.admin);
    changed
  }

  pub fn max_clock(&self) -> u64 {
    self.workers
      .values()
      .map(WorkerEntry::max_clock)
      .fold(self.admin.stamp.clock, u64::max)
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>, StateError> {
    Ok(serde_json::to_vec(self)?)
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
    Ok(serde_json::from_slice(bytes)?)
  }
}

/// Read-only view of the live workers, sorted by peer id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
  pub workers: Vec<WorkerRecord>,
  pub admin_peer_id: Option<PeerId>,
}

impl RoomSnapshot {
  pub fn capabilities(&self) -> BTreeMap<PeerId, WorkerCapabilities> {
    self.workers
      .iter()
      .map(|w| (w.peer_id.clone(), w.capabilities()))
      .collect()
  }

  pub fn filter(&self, filters: &QueryFilters) -> Vec<WorkerRecord> {
    self.workers
      .iter()
      .filter(|w| filters.matches(w))
      .cloned()
      .collect()
  }

  pub fn get(&self, peer_id: &str) -> Option<&WorkerRecord> {
    self.workers.iter().find(|w| w.peer_id == peer_id)
  }
}

/// One worker's replica of the room state.
#[derive(Debug, Clone)]
pub struct ReplicatedState {
  local_peer: PeerId,
  clock: u64,
  doc: RoomDocument,
  local_profile: Option<WorkerCapabilities>,
  /// Last status the job layer reported. Only the owner decides it, so a
  /// merge that leaves a different value behind gets overwritten.
  local_activity: WorkerActivity,
}

impl ReplicatedState {
  pub fn new(local_peer: impl Into<PeerId>) -> Self {
    Self {
      local_peer: local_peer.into(),
      clock: 0,
      doc: RoomDocument::default(),
      local_profile: None,
      local_activity: WorkerActivity::available(),
    }
  }

  pub fn local_peer(&self) -> &PeerId {
    &self.local_peer
  }

  pub fn clock(&self) -> u64 {
    self.clock
  }

  pub fn document(&self) -> &RoomDocument {
    &self.doc
  }

  fn tick(&mut self) -> Stamp {
    self.clock += 1;
    Stamp::new(self.clock, self.local_peer.clone())
  }

  /// Advances the Lamport clock past a clock seen on the wire.
  pub fn observe(&mut self, clock: u64) {
    self.clock = self.clock.max(clock);
  }

  /// Inserts or overwrites a worker's static capabilities. Writing the value
  /// already present is a no-op.
  pub fn put_worker(&mut self, peer_id: &str, capabilities: WorkerCapabilities) -> bool {
    if peer_id == self.local_peer {
      self.local_profile = Some(capabilities.clone());
    }
    if let Some(entry) = self.doc.workers.get(peer_id) {
      if entry.profile.value.as_ref() == Some(&capabilities) {
        return false;
      }
    }
    let stamp = self.tick();
    let profile = Register::new(Some(capabilities), stamp.clone());
    match self.doc.workers.get_mut(peer_id) {
      Some(entry) => {
        entry.profile.merge(&profile);
      }
      None => {
        self.doc.workers.insert(peer_id.to_string(), WorkerEntry {
          profile,
          activity: Register::new(WorkerActivity::available(), stamp),
        });
      }
    }
    debug!(peer = %peer_id, clock = self.clock, "Worker profile written");
    true
  }

  /// Updates this worker's own status. Unknown peers and attempts to write
  /// another worker's record are logged and ignored.
  pub fn update_status(&mut self, peer_id: &str, status: WorkerStatus, current_job: Option<CurrentJob>) -> bool {
    if peer_id != self.local_peer {
      warn!(peer = %peer_id, local = %self.local_peer, "Refusing to update another worker's status");
      return false;
    }
    if !self.contains(peer_id) {
      warn!(peer = %peer_id, "Status update for unknown worker ignored");
      return false;
    }
    let activity = WorkerActivity::new(status, current_job);
    self.local_activity = activity.clone();
    let stamp = self.tick();
    let Some(entry) = self.doc.workers.get_mut(peer_id) else {
      return false;
    };
    entry.activity.merge(&Register::new(activity, stamp))
  }

  /// Merges a status register received from its owner (admin side of
  /// `status_update`).
  pub fn apply_status(&mut self, peer_id: &str, activity: WorkerActivity, stamp: Stamp) -> bool {
    let Some(entry) = self.doc.workers.get_mut(peer_id).filter(|e| e.is_live()) else {
      warn!(peer = %peer_id, "Status update for unknown worker ignored");
      return false;
    };
    let changed = entry.activity.merge(&Register::new(activity, stamp.clone()));
    self.observe(stamp.clock);
    changed
  }

  pub fn remove_worker(&mut self, peer_id: &str) -> bool {
    if !self.contains(peer_id) {
      return false;
    }
    let stamp = self.tick();
    if let Some(entry) = self.doc.workers.get_mut(peer_id) {
      entry.profile.merge(&Register::new(None, stamp.clone()));
      entry.activity.merge(&Register::new(WorkerActivity::available(), stamp));
    }
    info!(peer = %peer_id, "Worker removed from room state");
    true
  }

  /// Drops a tombstoned entry entirely. Live entries are left alone.
  pub fn forget_worker(&mut self, peer_id: &str) -> bool {
    if self.doc.workers.get(peer_id).is_some_and(|e| !e.is_live()) {
      self.doc.workers.remove(peer_id);
      debug!(peer = %peer_id, "Tombstone dropped");
      return true;
    }
    false
  }

  pub fn tombstoned_peers(&self) -> Vec<PeerId> {
    self.doc.workers
      .iter()
      .filter(|(_, e)| !e.is_live())
      .map(|(id, _)| id.clone())
      .collect()
  }

  pub fn set_admin(&mut self, peer_id: &str) -> bool {
    if self.doc.admin.value.as_deref() == Some(peer_id) {
      return false;
    }
    let stamp = self.tick();
    self.doc.admin.merge(&Register::new(Some(peer_id.to_string()), stamp))
  }

  pub fn admin(&self) -> Option<&PeerId> {
    self.doc.admin.value.as_ref()
  }

  pub fn contains(&self, peer_id: &str) -> bool {
    self.doc.workers.get(peer_id).is_some_and(WorkerEntry::is_live)
  }

  pub fn live_peers(&self) -> Vec<PeerId> {
    self.doc.workers
      .iter()
      .filter(|(_, e)| e.is_live())
      .map(|(id, _)| id.clone())
      .collect()
  }

  pub fn local_activity(&self) -> Option<(WorkerActivity, Stamp)> {
    let entry = self.doc.workers.get(&self.local_peer)?;
    Some((entry.activity.value.clone(), entry.activity.stamp.clone()))
  }

  pub fn snapshot(&self) -> RoomSnapshot {
    RoomSnapshot {
      workers: self.doc.workers
        .iter()
        .filter_map(|(id, e)| e.record(id))
        .collect(),
      admin_peer_id: self.doc.admin.value.clone(),
    }
  }

  /// Merges a peer's document. A replica that finds its own record
  /// tombstoned by others rewrites it, since it is evidently still alive.
  /// Likewise, if its own status register now holds something other than
  /// what the job layer last reported (an older incarnation's job, or a
  /// removal reset), it is rewritten with a stamp above everything merged.
  pub fn merge(&mut self, other: &RoomDocument) -> bool {
    let mut changed = self.doc.merge(other);
    self.observe(other.max_clock());
    let local = self.local_peer.clone();
    if let Some(profile) = self.local_profile.clone() {
      if !self.contains(&local) {
        info!(peer = %local, "Own record was tombstoned by a peer, reasserting");
        changed |= self.put_worker(&local, profile);
      }
    }
    let overwritten = self.doc.workers
      .get(&local)
      .is_some_and(|e| e.is_live() && e.activity.value != self.local_activity);
    if overwritten {
      info!(peer = %local, "Own status was overwritten by a peer, reasserting");
      let stamp = self.tick();
      let activity = Register::new(self.local_activity.clone(), stamp);
      if let Some(entry) = self.doc.workers.get_mut(&local) {
        changed |= entry.activity.merge(&activity);
      }
    }
    changed
  }

  pub fn serialize(&self) -> Result<Vec<u8>, StateError> {
    self.doc.to_bytes()
  }

  pub fn deserialize(bytes: &[u8]) -> Result<RoomDocument, StateError> {
    RoomDocument::from_bytes(bytes)
  }
}
