use std::time::Duration;
use tracing::debug;

use crate::error::QueryError;
use crate::models::{QueryFilters, WorkerList};

/// Asks a room member's HTTP API for workers. Any sign that the room has no
/// reachable coordinator comes back as `QueryError::NoCoordinator`, never as
/// an empty list.
#[derive(Clone)]
pub struct RoomClient {
  base_url: String,
  http: reqwest::Client,
  timeout: Duration,
}

impl RoomClient {
  pub fn new(base_url: impl Into<String>) -> Self {
    Self {
      base_url: base_url.into().trim_end_matches('/').to_string(),
      http: reqwest::Client::new(),
      timeout: Duration::from_secs(10),
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub async fn query_workers(&self, filters: &QueryFilters) -> Result<WorkerList, QueryError> {
    let url = format!("{}/query", self.base_url);
    let resp = self.http
      .post(&url)
      .json(filters)
      .timeout(self.timeout)
      .send()
      .await
      .map_err(|e| {
        debug!(url = %url, error = %e, "Room member unreachable");
        QueryError::NoCoordinator
      })?;

    match resp.status().as_u16() {
      503 => Err(QueryError::NoCoordinator),
      s if !(200..300).contains(&s) => Err(QueryError::Relay(format!("HTTP {s}"))),
      _ => resp
        .json::<WorkerList>()
        .await
        .map_err(|e| QueryError::Relay(e.to_string())),
    }
  }
}
