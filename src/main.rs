use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use meshroom::config::Config;
use meshroom::member::{MemberSettings, RoomMember};
use meshroom::routes::routes;
use meshroom::signaling::{Bootstrap, HttpBootstrap, StaticBootstrap};
use meshroom::transport::WsConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = Config::from_env().context("invalid configuration")?;
  let listen: SocketAddr = config.listen_addr
    .parse()
    .with_context(|| format!("LISTEN_ADDR '{}' is not a socket address", config.listen_addr))?;

  let bootstrap: Arc<dyn Bootstrap> = match &config.signaling_url {
    Some(url) => Arc::new(HttpBootstrap::new(url.clone())),
    None => Arc::new(StaticBootstrap::new(config.seed_peers.clone())),
  };
  let (member, handle) = RoomMember::new(MemberSettings::from(&config), Arc::new(WsConnector::default()), bootstrap);

  let api = routes(handle.clone(), member.transport().clone());
  let (bound, server) = warp::serve(api).try_bind_ephemeral(listen).context("failed to bind listener")?;
  tokio::spawn(server);
  info!(room = %config.room_id, peer = %config.peer_id, addr = %bound, gpu_memory_mb = config.gpu_memory_mb, "Worker listening");

  let mut running = tokio::spawn(member.run());
  tokio::select! {
    result = &mut running => {
      result.context("member task panicked")?.context("member loop failed")?;
      return Ok(());
    }
    _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
  }

  handle.shutdown().await;
  match running.await {
    Ok(Ok(())) => info!("Left room"),
    Ok(Err(e)) => error!(error = %e, "Member loop failed during shutdown"),
    Err(e) => error!(error = %e, "Member task panicked"),
  }
  Ok(())
}
