//! Typed errors for the library seams. Orchestration glue and the binary wrap
//! these in `anyhow`.

use crate::models::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
  #[error("no open channel to peer {0}")]
  ChannelNotOpen(PeerId),

  #[error("channel to peer {0} is full")]
  ChannelFull(PeerId),

  #[error("channel to peer {0} is closed")]
  ChannelClosed(PeerId),

  #[error("handshake with {peer} failed: {reason}")]
  Handshake { peer: String, reason: String },

  #[error("connect to {peer} timed out")]
  ConnectTimeout { peer: PeerId },

  #[error("connect to {peer} failed: {reason}")]
  Connect { peer: PeerId, reason: String },

  #[error("failed to encode frame: {0}")]
  Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
  #[error("malformed snapshot: {0}")]
  Malformed(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
  /// Neither this worker nor any reachable admin could answer.
  #[error("no coordinator available")]
  NoCoordinator,

  #[error("member loop has shut down")]
  MemberGone,

  #[error("query relay failed: {0}")]
  Relay(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
  #[error("room {0} is full")]
  RoomFull(String),

  #[error("signaling request failed: {0}")]
  Http(#[from] reqwest::Error),

  #[error("signaling service returned HTTP {0}")]
  Status(u16),
}

#[derive(Debug, thiserror::Error)]
pub enum MemberError {
  #[error("member loop has shut down")]
  Stopped,

  #[error("member command queue is full")]
  Busy,
}
