use regex::Regex;
use serde::{Serialize, Deserialize};
use std::fmt;
use std::sync::LazyLock;

pub type PeerId = String;

static PEER_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[A-Za-z0-9_.:\-]{1,64}$").expect("peer id pattern is valid")
});

pub fn valid_peer_id(peer_id: &str) -> bool {
  PEER_ID_RE.is_match(peer_id)
}

/// Where to reach a peer, as handed out by the bootstrap service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
  pub peer_id: PeerId,
  pub addr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
  Available,
  Reserved,
  Busy,
}

impl fmt::Display for WorkerStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      WorkerStatus::Available => "available",
      WorkerStatus::Reserved => "reserved",
      WorkerStatus::Busy => "busy",
    };
    f.write_str(s)
  }
}

/// Static capabilities advertised once at join.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerCapabilities {
  pub gpu_model: String,
  pub gpu_memory_mb: u64,
  #[serde(default)]
  pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CurrentJob {
  pub job_id: String,
  pub client_id: String,
}

/// The mutable half of a worker record. `current_job` is only meaningful while
/// the worker is not available.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerActivity {
  pub status: WorkerStatus,
  pub current_job: Option<CurrentJob>,
}

impl WorkerActivity {
  pub fn new(status: WorkerStatus, current_job: Option<CurrentJob>) -> Self {
    let current_job = match status {
      WorkerStatus::Available => None,
      _ => current_job,
    };
    Self { status, current_job }
  }

  pub fn available() -> Self {
    Self { status: WorkerStatus::Available, current_job: None }
  }
}

impl Default for WorkerActivity {
  fn default() -> Self {
    Self::available()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
  pub peer_id: PeerId,
  pub gpu_model: String,
  pub gpu_memory_mb: u64,
  pub tags: Vec<String>,
  pub status: WorkerStatus,
  pub current_job: Option<CurrentJob>,
}

impl WorkerRecord {
  pub fn capabilities(&self) -> WorkerCapabilities {
    WorkerCapabilities {
      gpu_model: self.gpu_model.clone(),
      gpu_memory_mb: self.gpu_memory_mb,
      tags: self.tags.clone(),
    }
  }
}

/// Criteria carried by a `query_workers` request. Every field is optional; an
/// empty filter matches every worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilters {
  #[serde(default)]
  pub min_gpu_memory_mb: Option<u64>,
  #[serde(default)]
  pub status: Option<WorkerStatus>,
  #[serde(default)]
  pub gpu_model: Option<String>,
  #[serde(default)]
  pub tags: Vec<String>,
}

impl QueryFilters {
  pub fn matches(&self, worker: &WorkerRecord) -> bool {
    if let Some(min) = self.min_gpu_memory_mb {
      if worker.gpu_memory_mb < min {
        return false;
      }
    }
    if let Some(status) = self.status {
      if worker.status != status {
        return false;
      }
    }
    if let Some(model) = &self.gpu_model {
      if !worker.gpu_model.eq_ignore_ascii_case(model) {
        return false;
      }
    }
    self.tags.iter().all(|tag| worker.tags.contains(tag))
  }
}

/// Answer to a client query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerList {
  pub workers: Vec<WorkerRecord>,
  pub admin_peer_id: Option<PeerId>,
  /// Set when the answer came from a cached snapshot while the admin was unreachable.
  #[serde(default)]
  pub stale: bool,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(peer: &str, mem: u64, status: WorkerStatus) -> WorkerRecord {
    WorkerRecord {
      peer_id: peer.into(),
      gpu_model: "RTX 4090".into(),
      gpu_memory_mb: mem,
      tags: vec!["cuda".into()],
      status,
      current_job: None,
    }
  }

  #[test]
  fn empty_filter_matches_everything() {
    let f = QueryFilters::default();
    assert!(f.matches(&record("a", 0, WorkerStatus::Busy)));
  }

  #[test]
  fn filter_combines_criteria() {
    let f = QueryFilters {
      min_gpu_memory_mb: Some(20000),
      status: Some(WorkerStatus::Available),
      gpu_model: Some("rtx 4090".into()),
      tags: vec!["cuda".into()],
    };
    assert!(f.matches(&record("a", 24000, WorkerStatus::Available)));
    assert!(!f.matches(&record("b", 16000, WorkerStatus::Available)));
    assert!(!f.matches(&record("c", 24000, WorkerStatus::Busy)));
  }

  #[test]
  fn available_activity_drops_job() {
    let job = CurrentJob { job_id: "j".into(), client_id: "c".into() };
    let a = WorkerActivity::new(WorkerStatus::Available, Some(job.clone()));
    assert_eq!(a.current_job, None);
    let b = WorkerActivity::new(WorkerStatus::Busy, Some(job.clone()));
    assert_eq!(b.current_job, Some(job));
  }

  #[test]
  fn peer_id_validation() {
    assert!(valid_peer_id("worker-1"));
    assert!(valid_peer_id("3f2a9c1e-0b7d-4e55-9a43-1d2c3b4a5f60"));
    assert!(!valid_peer_id(""));
    assert!(!valid_peer_id("worker 1"));
    assert!(!valid_peer_id("../etc"));
  }

  #[test]
  fn status_serializes_snake_case() {
    let s = serde_json::to_string(&WorkerStatus::Reserved).unwrap();
    assert_eq!(s, "\"reserved\"");
  }
}
