use futures::{SinkExt, StreamExt};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use warp::Filter;
use warp::ws::{Message, WebSocket, Ws};

use crate::transport::{Link, MeshTransport, DEFAULT_FRAME_CAPACITY};

fn with_transport(transport: MeshTransport) -> impl Filter<Extract = (MeshTransport,), Error = Infallible> + Clone {
  warp::any().map(move || transport.clone())
}

/// Inbound mesh channels. The dialing worker speaks first with its hello.
pub fn mesh_route(transport: MeshTransport) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("mesh")
    .and(warp::path::end())
    .and(warp::ws())
    .and(with_transport(transport))
    .map(|ws: Ws, transport: MeshTransport| {
      ws.on_upgrade(move |socket| async move {
        let link = link_from_socket(socket, DEFAULT_FRAME_CAPACITY);
        match transport.accept(link).await {
          Ok(peer) => debug!(peer = %peer, "Accepted mesh channel"),
          Err(e) => warn!(error = %e, "Rejected inbound mesh channel"),
        }
      })
    })
}

fn link_from_socket(socket: WebSocket, capacity: usize) -> Link {
  let (out_tx, mut out_rx) = mpsc::channel::<String>(capacity);
  let (in_tx, in_rx) = mpsc::channel::<String>(capacity);
  let (mut sink, mut stream) = socket.split();

  tokio::spawn(async move {
    while let Some(frame) = out_rx.recv().await {
      if sink.send(Message::text(frame)).await.is_err() {
        break;
      }
    }
    let _ = sink.close().await;
  });

  tokio::spawn(async move {
    while let Some(Ok(msg)) = stream.next().await {
      if msg.is_close() {
        break;
      }
      let Ok(text) = msg.to_str() else {
        continue;
      };
      if in_tx.send(text.to_owned()).await.is_err() {
        break;
      }
    }
  });

  Link { tx: out_tx, rx: in_rx }
}
