use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::LazyLock;
use tracing::{error, info, warn};
use warp::Filter;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::Reply;

use crate::coordinator::Role;
use crate::error::QueryError;
use crate::member::MemberHandle;
use crate::models::{PeerId, QueryFilters};

#[derive(Debug)]
struct CustomError {
  message: String,
}
impl warp::reject::Reject for CustomError {}

#[derive(Serialize)]
struct HealthResponse {
  peer_id: PeerId,
  role: Role,
  admin_peer_id: Option<PeerId>,
  read_only: bool,
  connections: usize,
  workers: usize,
}

static FILTER_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[\w\s.\-]{1,64}$").expect("filter pattern is valid")
});

fn sanitize_input(input: &str) -> bool {
  FILTER_TEXT_RE.is_match(input)
}

fn validate_filters(filters: &QueryFilters) -> Result<(), String> {
  if let Some(model) = &filters.gpu_model {
    if !sanitize_input(model) {
      return Err("Invalid or unsafe 'gpu_model'".into());
    }
  }
  if let Some(tag) = filters.tags.iter().find(|t| !sanitize_input(t)) {
    return Err(format!("Invalid or unsafe tag '{}'", tag));
  }
  Ok(())
}

fn with_member(handle: MemberHandle) -> impl Filter<Extract = (MemberHandle,), Error = Infallible> + Clone {
  warp::any().map(move || handle.clone())
}

/// Relay entry point for `query_workers`.
pub fn query_route(handle: MemberHandle) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("query")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::json())
    .and(with_member(handle))
    .and_then(handle_query)
}

pub fn health_route(handle: MemberHandle) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("health")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_member(handle))
    .map(|handle: MemberHandle| {
      let view = handle.view();
      warp::reply::json(&HealthResponse {
        peer_id: view.peer_id,
        role: view.role,
        admin_peer_id: view.admin_peer_id,
        read_only: view.read_only,
        connections: view.connections,
        workers: view.workers.len(),
      })
    })
}

fn error_reply(status: StatusCode, message: &str) -> Response {
  warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status).into_response()
}

async fn handle_query(filters: QueryFilters, handle: MemberHandle) -> Result<Response, warp::Rejection> {
  if let Err(e) = validate_filters(&filters) {
    warn!("Query validation failed: {}", e);
    return Err(warp::reject::custom(CustomError { message: e }));
  }

  match handle.query(filters).await {
    Ok(list) => {
      info!(workers = list.workers.len(), stale = list.stale, "Query answered");
      Ok(warp::reply::json(&list).into_response())
    }
    Err(e @ QueryError::NoCoordinator) => {
      warn!("Query failed: {}", e);
      Ok(error_reply(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()))
    }
    Err(e) => {
      error!("Query failed: {}", e);
      Ok(error_reply(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()))
    }
  }
}

pub async fn handle_rejection(rejection: warp::Rejection) -> Result<Response, Infallible> {
  if let Some(CustomError { message }) = rejection.find::<CustomError>() {
    return Ok(error_reply(StatusCode::BAD_REQUEST, message));
  }
  if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
    return Ok(error_reply(StatusCode::BAD_REQUEST, &e.to_string()));
  }
  if rejection.is_not_found() {
    return Ok(error_reply(StatusCode::NOT_FOUND, "not found"));
  }
  if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
    return Ok(error_reply(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
  }
  Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
}
