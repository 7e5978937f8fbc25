//! Heartbeat bookkeeping. `last_heartbeat` is local knowledge and never merged
//! into the replicated state.
//!
//! Each peer has a direct time (the last frame we received from it) and an
//! indirect time (the latest moment another peer reported hearing it). A peer
//! is alive while the later of the two is inside the silence window; it is
//! directly reachable while the direct time alone is. The gap between those
//! two is what lets a worker tell "the admin crashed" apart from "my own
//! channel to the admin is broken".

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use crate::models::PeerId;

#[derive(Debug, Clone, Copy, Default)]
struct PeerLiveness {
  direct: Option<Instant>,
  indirect: Option<Instant>,
}

impl PeerLiveness {
  fn latest(&self) -> Option<Instant> {
    match (self.direct, self.indirect) {
      (Some(a), Some(b)) => Some(a.max(b)),
      (a, b) => a.or(b),
    }
  }
}

#[derive(Debug)]
pub struct HeartbeatTable {
  interval: Duration,
  missed: u32,
  peers: HashMap<PeerId, PeerLiveness>,
}

impl HeartbeatTable {
  pub fn new(interval: Duration, missed: u32) -> Self {
    Self { interval, missed: missed.max(1), peers: HashMap::new() }
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  /// Silence after which a peer counts as departed.
  pub fn timeout(&self) -> Duration {
    self.interval * self.missed
  }

  fn within(&self, at: Option<Instant>, now: Instant) -> bool {
    at.is_some_and(|t| now.saturating_duration_since(t) < self.timeout())
  }

  /// Starts tracking a peer, treating `now` as its first sign of life.
  pub fn track(&mut self, peer_id: &str, now: Instant) {
    self.peers
      .entry(peer_id.to_string())
      .or_insert(PeerLiveness { direct: Some(now), indirect: None });
  }

  pub fn is_tracked(&self, peer_id: &str) -> bool {
    self.peers.contains_key(peer_id)
  }

  pub fn heard(&mut self, peer_id: &str, now: Instant) {
    self.peers.entry(peer_id.to_string()).or_default().direct = Some(now);
  }

  /// Records the `observed` map carried by a heartbeat from `reporter`.
  /// Only peers already tracked are updated.
  pub fn apply_observed(&mut self, reporter: &str, observed: &BTreeMap<PeerId, u64>, local: &str, now: Instant) {
    for (peer_id, ms_ago) in observed {
      if peer_id == local || peer_id == reporter {
        continue;
      }
      let Some(entry) = self.peers.get_mut(peer_id) else {
        continue;
      };
      let Some(heard_at) = now.checked_sub(Duration::from_millis(*ms_ago)) else {
        continue;
      };
      if entry.indirect.is_none_or(|t| heard_at > t) {
        entry.indirect = Some(heard_at);
      }
    }
  }

  /// Forgets the direct channel, e.g. after it closed. Indirect evidence stays.
  pub fn channel_lost(&mut self, peer_id: &str) {
    if let Some(entry) = self.peers.get_mut(peer_id) {
      entry.direct = None;
    }
  }

  pub fn forget(&mut self, peer_id: &str) {
    self.peers.remove(peer_id);
  }

  pub fn is_alive(&self, peer_id: &str, now: Instant) -> bool {
    self.peers
      .get(peer_id)
      .is_some_and(|p| self.within(p.latest(), now))
  }

  pub fn is_directly_reachable(&self, peer_id: &str, now: Instant) -> bool {
    self.peers
      .get(peer_id)
      .is_some_and(|p| self.within(p.direct, now))
  }

  /// Peers silent for the whole window, directly and indirectly.
  pub fn expired(&self, now: Instant) -> Vec<PeerId> {
    let mut out: Vec<_> = self.peers
      .iter()
      .filter(|(_, p)| !self.within(p.latest(), now))
      .map(|(id, _)| id.clone())
      .collect();
    out.sort();
    out
  }

  /// What this worker reports in its own heartbeats: milliseconds since each
  /// directly reachable peer was last heard.
  pub fn observed(&self, now: Instant) -> BTreeMap<PeerId, u64> {
    self.peers
      .iter()
      .filter(|(_, p)| self.within(p.direct, now))
      .filter_map(|(id, p)| {
        let at = p.direct?;
        Some((id.clone(), now.saturating_duration_since(at).as_millis() as u64))
      })
      .collect()
  }

  pub fn tracked(&self) -> Vec<PeerId> {
    let mut out: Vec<_> = self.peers.keys().cloned().collect();
    out.sort();
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn table() -> HeartbeatTable {
    HeartbeatTable::new(Duration::from_secs(5), 3)
  }

  #[test]
  fn silent_peer_expires_after_three_intervals() {
    let mut t = table();
    let start = Instant::now();
    t.track("worker-2", start);
    assert!(t.expired(start + Duration::from_secs(14)).is_empty());
    assert_eq!(t.expired(start + Duration::from_secs(15)), vec!["worker-2".to_string()]);
  }

  #[test]
  fn heartbeat_resets_silence() {
    let mut t = table();
    let start = Instant::now();
    t.track("worker-2", start);
    t.heard("worker-2", start + Duration::from_secs(10));
    assert!(t.expired(start + Duration::from_secs(20)).is_empty());
  }

  #[test]
  fn indirect_report_keeps_peer_alive_but_not_reachable() {
    let mut t = table();
    let start = Instant::now();
    t.track("admin", start);
    t.track("worker-3", start);
    let later = start + Duration::from_secs(20);
    t.heard("worker-3", later);
    let observed = BTreeMap::from([("admin".to_string(), 1000)]);
    t.apply_observed("worker-3", &observed, "worker-1", later);

    assert!(t.is_alive("admin", later));
    assert!(!t.is_directly_reachable("admin", later));
    assert!(t.expired(later).is_empty());
  }

  #[test]
  fn crashed_peer_expires_everywhere_despite_stale_reports() {
    let mut t = table();
    let start = Instant::now();
    t.track("admin", start);
    t.track("worker-3", start);
    let crash = start + Duration::from_secs(1);
    t.heard("admin", crash);
    // worker-3 keeps reporting the last time it heard the admin.
    for s in [5u64, 10, 15] {
      let now = start + Duration::from_secs(s);
      t.heard("worker-3", now);
      let ago = (now - crash).as_millis() as u64;
      t.apply_observed("worker-3", &BTreeMap::from([("admin".to_string(), ago)]), "worker-1", now);
    }
    assert_eq!(t.expired(start + Duration::from_secs(16)), vec!["admin".to_string()]);
  }

  #[test]
  fn channel_loss_falls_back_to_indirect_evidence() {
    let mut t = table();
    let start = Instant::now();
    t.track("worker-2", start);
    t.channel_lost("worker-2");
    assert!(!t.is_alive("worker-2", start));
    assert_eq!(t.expired(start), vec!["worker-2".to_string()]);
  }

  #[test]
  fn observed_lists_only_reachable_peers() {
    let mut t = table();
    let start = Instant::now();
    t.track("worker-2", start);
    t.track("worker-3", start);
    let now = start + Duration::from_secs(16);
    t.heard("worker-3", now - Duration::from_secs(2));
    let observed = t.observed(now);
    assert_eq!(observed.get("worker-3"), Some(&2000));
    assert!(!observed.contains_key("worker-2"));
  }

  #[test]
  fn reports_about_untracked_or_self_are_ignored() {
    let mut t = table();
    let now = Instant::now();
    let observed = BTreeMap::from([("ghost".to_string(), 0), ("worker-1".to_string(), 0)]);
    t.apply_observed("worker-2", &observed, "worker-1", now);
    assert!(t.tracked().is_empty());
  }
}
