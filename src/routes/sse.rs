use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;
use tracing::warn;
use warp::Filter;
use warp::sse::Event;

use crate::member::MemberHandle;

fn with_member(handle: MemberHandle) -> impl Filter<Extract = (MemberHandle,), Error = Infallible> + Clone {
  warp::any().map(move || handle.clone())
}

/// Streams this worker's view of the room: once on connect, then on every change.
pub fn events_route(handle: MemberHandle) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("events")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_member(handle))
    .and_then(handle_events)
}

async fn handle_events(handle: MemberHandle) -> Result<impl warp::Reply, warp::Rejection> {
  let stream = WatchStream::new(handle.subscribe()).filter_map(|view| {
    match serde_json::to_string(&view) {
      Ok(data) => Some(Ok::<_, Infallible>(Event::default().event("room").data(data))),
      Err(e) => {
        warn!(error = %e, "Failed to encode room view");
        None
      }
    }
  });

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
