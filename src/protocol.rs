//! Messages exchanged over mesh channels. Each frame is one JSON object
//! tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;

use crate::models::{CurrentJob, PeerId, QueryFilters, WorkerCapabilities, WorkerList, WorkerStatus};
use crate::state::{RoomDocument, Stamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshMessage {
  /// First frame in each direction on a new channel.
  Hello {
    from_peer_id: PeerId,
    capabilities: WorkerCapabilities,
  },
  Heartbeat {
    from_peer_id: PeerId,
    timestamp: DateTime<Utc>,
    /// Milliseconds since the sender last heard each peer directly.
    #[serde(default)]
    observed: BTreeMap<PeerId, u64>,
    /// Sender's Lamport clock, so replicas that never exchange documents
    /// still keep their clocks close.
    #[serde(default)]
    clock: u64,
  },
  StatusUpdate {
    from_peer_id: PeerId,
    status: WorkerStatus,
    current_job: Option<CurrentJob>,
    timestamp: DateTime<Utc>,
    clock: u64,
  },
  StateBroadcast {
    from_peer_id: PeerId,
    /// Embedded as a JSON object, not as encoded bytes.
    snapshot: RoomDocument,
    version: u64,
  },
  SnapshotRequest {
    from_peer_id: PeerId,
  },
  QueryWorkers {
    request_id: String,
    origin: PeerId,
    filters: QueryFilters,
  },
  WorkerList {
    request_id: String,
    list: WorkerList,
  },
  Leave {
    from_peer_id: PeerId,
  },
}

impl MeshMessage {
  pub fn heartbeat(from: &str, observed: BTreeMap<PeerId, u64>, clock: u64) -> Self {
    MeshMessage::Heartbeat {
      from_peer_id: from.to_string(),
      timestamp: Utc::now(),
      observed,
      clock,
    }
  }

  pub fn status_update(from: &str, status: WorkerStatus, current_job: Option<CurrentJob>, stamp: &Stamp) -> Self {
    MeshMessage::StatusUpdate {
      from_peer_id: from.to_string(),
      status,
      current_job,
      timestamp: Utc::now(),
      clock: stamp.clock,
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      MeshMessage::Hello { .. } => "hello",
      MeshMessage::Heartbeat { .. } => "heartbeat",
      MeshMessage::StatusUpdate { .. } => "status_update",
      MeshMessage::StateBroadcast { .. } => "state_broadcast",
      MeshMessage::SnapshotRequest { .. } => "snapshot_request",
      MeshMessage::QueryWorkers { .. } => "query_workers",
      MeshMessage::WorkerList { .. } => "worker_list",
      MeshMessage::Leave { .. } => "leave",
    }
  }

  pub fn encode(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(self)
  }

  pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(frame)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::WorkerRecord;

  #[test]
  fn frames_are_tagged_by_type() {
    let msg = MeshMessage::heartbeat("worker-1", BTreeMap::new(), 3);
    let frame = msg.encode().unwrap();
    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(value["type"], "heartbeat");
    assert_eq!(value["from_peer_id"], "worker-1");
    assert_eq!(value["clock"], 3);
  }

  #[test]
  fn state_broadcast_embeds_the_document() {
    let mut state = crate::state::ReplicatedState::new("worker-1");
    state.put_worker("worker-1", WorkerCapabilities { gpu_model: "L4".into(), gpu_memory_mb: 24000, tags: vec![] });
    let msg = MeshMessage::StateBroadcast {
      from_peer_id: "worker-1".into(),
      snapshot: state.document().clone(),
      version: 4,
    };
    let frame = msg.encode().unwrap();
    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert!(value["snapshot"]["workers"]["worker-1"].is_object());
    assert_eq!(MeshMessage::decode(&frame).unwrap(), msg);
  }

  #[test]
  fn worker_list_carries_admin_id() {
    let msg = MeshMessage::WorkerList {
      request_id: "r1".into(),
      list: WorkerList {
        workers: vec![WorkerRecord {
          peer_id: "worker-2".into(),
          gpu_model: "L4".into(),
          gpu_memory_mb: 24000,
          tags: vec![],
          status: WorkerStatus::Available,
          current_job: None,
        }],
        admin_peer_id: Some("worker-2".into()),
        stale: false,
      },
    };
    let frame = msg.encode().unwrap();
    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(value["list"]["admin_peer_id"], "worker-2");
    assert_eq!(MeshMessage::decode(&frame).unwrap(), msg);
  }

  #[test]
  fn heartbeat_without_observed_map_decodes() {
    let frame = r#"{"type":"heartbeat","from_peer_id":"w","timestamp":"2024-01-01T00:00:00Z"}"#;
    match MeshMessage::decode(frame).unwrap() {
      MeshMessage::Heartbeat { observed, clock, .. } => {
        assert!(observed.is_empty());
        assert_eq!(clock, 0);
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn unknown_type_is_rejected() {
    assert!(MeshMessage::decode(r#"{"type":"gossip"}"#).is_err());
  }
}
