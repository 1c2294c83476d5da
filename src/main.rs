mod avg;
mod config;
mod dashboard;
mod errors;
mod health;
mod proxy;
mod router;
mod seed;
mod server;
mod stats;
mod telemetry;
mod ttl;

use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::proxy::{Proxy, ProxyKind};
use crate::seed::Updater;
use crate::server::build_http_client;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env()?;
    telemetry::init()?;

    tracing::info!(
        listen = %cfg.listen,
        chain_id = %cfg.chain_id,
        seed_url = %cfg.seed_url,
        "starting akash-rpc-proxy"
    );
    if cfg.tls_cert.is_some() || !cfg.autocert_hosts.is_empty() {
        tracing::info!(
            cert = ?cfg.tls_cert,
            key = ?cfg.tls_key,
            autocert_email = ?cfg.autocert_email,
            autocert_hosts = ?cfg.autocert_hosts,
            "TLS material configured; termination is left to the front door"
        );
    }

    let client = build_http_client()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (rpc_tx, rpc_rx) = mpsc::channel(1);
    let (rest_tx, rest_rx) = mpsc::channel(1);

    let rpc = Arc::new(Proxy::new(ProxyKind::Rpc, cfg.clone(), client.clone()));
    let rest = Arc::new(Proxy::new(ProxyKind::Rest, cfg.clone(), client.clone()));

    tokio::spawn(rpc.clone().run(rpc_rx, shutdown_rx.clone()));
    tokio::spawn(rest.clone().run(rest_rx, shutdown_rx.clone()));

    let updater = Updater::new(cfg.clone(), client.clone(), vec![rpc_tx, rest_tx]);
    tokio::spawn(updater.run(shutdown_rx.clone()));

    tokio::spawn(health::run(
        rpc.clone(),
        client,
        cfg.check_health_interval,
        shutdown_rx.clone(),
    ));

    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    router::start_server(cfg, rpc, rest, shutdown_rx).await
}

async fn shutdown_signal() {
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            tracing::error!(error = ?err, "could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
