//! Client side of the bootstrap/signaling collaborator. The service owns the
//! room roster and the room-size ceiling; this worker only asks to join and
//! receives the peers it must connect to.

use async_trait::async_trait;
use std::time::Duration;
use serde::{Serialize, Deserialize};
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{info, warn};

use crate::error::BootstrapError;
use crate::models::{PeerAddress, PeerId, WorkerCapabilities};

pub const MAX_ROOM_SIZE: usize = 10;

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinGrant {
  pub peers: Vec<PeerAddress>,
  pub admin_peer_id: Option<PeerId>,
}

#[derive(Debug, Serialize)]
struct JoinRequest<'a> {
  peer_id: &'a str,
  addr: &'a str,
  capabilities: &'a WorkerCapabilities,
}

#[async_trait]
pub trait Bootstrap: Send + Sync {
  async fn join(&self, room_id: &str, local: &PeerAddress, capabilities: &WorkerCapabilities) -> Result<JoinGrant, BootstrapError>;
  async fn leave(&self, room_id: &str, peer_id: &str) -> Result<(), BootstrapError>;
}

/// Talks to an HTTP signaling service:
/// `POST {base}/rooms/{room}/join` and `DELETE {base}/rooms/{room}/peers/{peer}`.
pub struct HttpBootstrap {
  base_url: String,
  http: reqwest::Client,
}

impl HttpBootstrap {
  pub fn new(base_url: impl Into<String>) -> Self {
    Self {
      base_url: base_url.into().trim_end_matches('/').to_string(),
      http: reqwest::Client::new(),
    }
  }
}

#[async_trait]
impl Bootstrap for HttpBootstrap {
  async fn join(&self, room_id: &str, local: &PeerAddress, capabilities: &WorkerCapabilities) -> Result<JoinGrant, BootstrapError> {
    let url = format!("{}/rooms/{}/join", self.base_url, room_id);
    let resp = self.http
      .post(&url)
      .json(&JoinRequest { peer_id: &local.peer_id, addr: &local.addr, capabilities })
      .send()
      .await?;
    match resp.status().as_u16() {
      409 => Err(BootstrapError::RoomFull(room_id.to_string())),
      s if !(200..300).contains(&s) => Err(BootstrapError::Status(s)),
      _ => Ok(resp.json::<JoinGrant>().await?),
    }
  }

  async fn leave(&self, room_id: &str, peer_id: &str) -> Result<(), BootstrapError> {
    let url = format!("{}/rooms/{}/peers/{}", self.base_url, room_id, peer_id);
    let resp = self.http.delete(&url).send().await?;
    if !resp.status().is_success() {
      return Err(BootstrapError::Status(resp.status().as_u16()));
    }
    Ok(())
  }
}

/// Fixed seed list, used when no signaling service is configured. Enforces the
/// same room-size ceiling the service would.
pub struct StaticBootstrap {
  peers: Vec<PeerAddress>,
  max_room_size: usize,
}

impl StaticBootstrap {
  pub fn new(peers: Vec<PeerAddress>) -> Self {
    Self { peers, max_room_size: MAX_ROOM_SIZE }
  }

  pub fn with_max_room_size(mut self, max: usize) -> Self {
    self.max_room_size = max;
    self
  }
}

#[async_trait]
impl Bootstrap for StaticBootstrap {
  async fn join(&self, room_id: &str, local: &PeerAddress, _capabilities: &WorkerCapabilities) -> Result<JoinGrant, BootstrapError> {
    let peers: Vec<_> = self.peers
      .iter()
      .filter(|p| p.peer_id != local.peer_id)
      .cloned()
      .collect();
    if peers.len() + 1 > self.max_room_size {
      return Err(BootstrapError::RoomFull(room_id.to_string()));
    }
    Ok(JoinGrant { peers, admin_peer_id: None })
  }

  async fn leave(&self, _room_id: &str, _peer_id: &str) -> Result<(), BootstrapError> {
    Ok(())
  }
}

/// Joins with exponential backoff. A full room is final and not retried.
pub async fn join_with_retry(
  bootstrap: &dyn Bootstrap,
  room_id: &str,
  local: &PeerAddress,
  capabilities: &WorkerCapabilities,
) -> Result<JoinGrant, BootstrapError> {
  let grant = RetryIf::spawn(
    ExponentialBackoff::from_millis(DELAY).max_delay(Duration::from_secs(5)).take(MAX_RETRIES),
    || async {
      let result = bootstrap.join(room_id, local, capabilities).await;
      if let Err(e) = &result {
        warn!(room = %room_id, error = %e, "Join attempt failed");
      }
      result
    },
    |e: &BootstrapError| !matches!(e, BootstrapError::RoomFull(_)),
  )
  .await?;
  info!(room = %room_id, peers = grant.peers.len(), admin_hint = ?grant.admin_peer_id, "Joined room");
  Ok(grant)
}
