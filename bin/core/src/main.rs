#[macro_use]
extern crate tracing;

use std::{net::SocketAddr, str::FromStr};

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use tower_http::cors::{Any, CorsLayer};

use crate::config::core_config;

mod api;
mod backends;
mod cluster;
mod config;
mod dag;
mod ensemble;
mod manager;
mod scheduler;
mod state;

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = core_config();
  logger::init(&config.logging)?;
  if let Err(e) =
    rustls::crypto::aws_lc_rs::default_provider().install_default()
  {
    error!("Failed to install default crypto provider | {e:?}");
    std::process::exit(1);
  };

  info!("Pivot Core version: v{}", env!("CARGO_PKG_VERSION"));
  info!("{:?}", config.sanitized());

  // Crash early when the store is unreachable.
  state::init_db_client().await;

  // Prime the agent snapshot before anything schedules on it.
  if let Err(e) = state::cluster().update().await {
    warn!("Initial cluster snapshot failed | {e:#}");
  }

  // Spawn background loops
  cluster::spawn_cluster_monitor_loop();
  scheduler::global::spawn_global_scheduler_loop();
  manager::appliance::restore_appliance_schedulers().await;

  let app = api::router()
    .layer(
      CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any),
    )
    .into_make_service();

  let addr = format!("{}:{}", config.host, config.port);
  let socket_addr = SocketAddr::from_str(&addr)
    .context("failed to parse listen address")?;

  if config.ssl_enabled {
    info!("Pivot Core starting on https://{socket_addr}");
    let ssl_config = RustlsConfig::from_pem_file(
      &config.ssl_cert_file,
      &config.ssl_key_file,
    )
    .await
    .context("Invalid ssl cert / key")?;
    axum_server::bind_rustls(socket_addr, ssl_config)
      .serve(app)
      .await
      .context("failed to start https server")
  } else {
    info!("Pivot Core starting on http://{socket_addr}");
    axum_server::bind(socket_addr)
      .serve(app)
      .await
      .context("failed to start http server")
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;
  tokio::select! {
    res = tokio::spawn(app()) => res?,
    _ = term_signal.recv() => Ok(()),
  }
}
