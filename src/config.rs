use anyhow::{Context, Result, bail};
use std::env;
use std::time::Duration;

use crate::models::{valid_peer_id, PeerAddress, WorkerCapabilities};

#[derive(Debug, Clone)]
pub struct Config {
  pub room_id: String,
  pub peer_id: String,
  pub listen_addr: String,
  pub public_addr: String,
  pub signaling_url: Option<String>,
  pub seed_peers: Vec<PeerAddress>,
  pub gpu_model: String,
  pub gpu_memory_mb: u64,
  pub tags: Vec<String>,
  pub heartbeat_interval: Duration,
  pub missed_heartbeats: u32,
  pub query_timeout: Duration,
  pub connect_timeout: Duration,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  /// Builds the config from any key lookup, so tests need not touch the
  /// process environment.
  pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let room_id = get("ROOM_ID").context("ROOM_ID must be set")?;
    let peer_id = get("PEER_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if !valid_peer_id(&peer_id) {
      bail!("PEER_ID '{}' is not a valid peer id", peer_id);
    }
    let seed_peers = match get("SEED_PEERS") {
      Some(raw) => parse_seed_peers(&raw)?,
      None => Vec::new(),
    };

    let heartbeat_interval = parse_duration_ms(&get, "HEARTBEAT_INTERVAL_MS", 5000)?;
    let missed_heartbeats: u32 = parse_or(&get, "MISSED_HEARTBEATS", 3)?;
    if missed_heartbeats == 0 {
      bail!("MISSED_HEARTBEATS must be at least 1");
    }

    Ok(Self {
      room_id,
      peer_id,
      listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:7600".into()),
      public_addr: get("PUBLIC_ADDR").unwrap_or_else(|| "127.0.0.1:7600".into()),
      signaling_url: get("SIGNALING_URL").filter(|s| !s.is_empty()),
      seed_peers,
      gpu_model: get("GPU_MODEL").unwrap_or_else(|| "unknown".into()),
      gpu_memory_mb: parse_or(&get, "GPU_MEMORY_MB", 0)?,
      tags: get("WORKER_TAGS")
        .map(|raw| raw.split(',').map(str::trim).filter(|t| !t.is_empty()).map(String::from).collect())
        .unwrap_or_default(),
      heartbeat_interval,
      missed_heartbeats,
      query_timeout: parse_duration_ms(&get, "QUERY_TIMEOUT_MS", 10_000)?,
      connect_timeout: parse_duration_ms(&get, "CONNECT_TIMEOUT_MS", 10_000)?,
    })
  }

  pub fn capabilities(&self) -> WorkerCapabilities {
    WorkerCapabilities {
      gpu_model: self.gpu_model.clone(),
      gpu_memory_mb: self.gpu_memory_mb,
      tags: self.tags.clone(),
    }
  }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
  T: std::str::FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match get(key) {
    Some(raw) => raw.trim().parse().with_context(|| format!("{key} has invalid value '{raw}'")),
    None => Ok(default),
  }
}

fn parse_duration_ms(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
  let ms: u64 = parse_or(get, key, default)?;
  if ms == 0 {
    bail!("{} must be greater than zero", key);
  }
  Ok(Duration::from_millis(ms))
}

/// Parses `peer_id@host:port` entries separated by commas.
pub fn parse_seed_peers(raw: &str) -> Result<Vec<PeerAddress>> {
  raw
    .split(',')
    .map(str::trim)
    .filter(|entry| !entry.is_empty())
    .map(|entry| {
      let (peer_id, addr) = entry
        .split_once('@')
        .with_context(|| format!("seed peer '{entry}' must look like peer_id@host:port"))?;
      if !valid_peer_id(peer_id) || addr.is_empty() {
        bail!("seed peer '{}' is malformed", entry);
      }
      Ok(PeerAddress { peer_id: peer_id.to_string(), addr: addr.to_string() })
    })
    .collect()
}
