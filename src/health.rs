use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

use crate::proxy::Proxy;
use crate::server::Server;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_BLOCK_AGE_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct StatusResponse {
    result: StatusResult,
}

#[derive(Debug, Deserialize)]
struct StatusResult {
    sync_info: SyncInfo,
}

#[derive(Debug, Deserialize)]
struct SyncInfo {
    latest_block_time: DateTime<Utc>,
    catching_up: bool,
}

/// Periodically checks each RPC backend's `/status` endpoint and records
/// whether the node is synced. The outcome is informational (surfaced on the
/// dashboard); routing health is derived from observed request latency.
pub async fn run(
    proxy: Arc<Proxy>,
    client: Client,
    probe_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => probe_all(&proxy, &client).await,
            _ = shutdown.changed() => break,
        }
    }
}

async fn probe_all(proxy: &Arc<Proxy>, client: &Client) {
    let mut tasks = JoinSet::new();
    for server in proxy.servers() {
        let client = client.clone();
        tasks.spawn(async move {
            let ok = match check_node_status(&client, &server).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(
                        name = %server.name(),
                        error = ?err,
                        "node status probe failed"
                    );
                    false
                }
            };
            server.record_probe(ok);
        });
    }
    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result {
            tracing::warn!(error = ?err, "status probe task join error");
        }
    }
}

async fn check_node_status(client: &Client, server: &Server) -> Result<()> {
    let mut url = server.url().clone();
    url.set_path("/status");

    let response = client
        .get(url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .context("requesting node status")?;
    if response.status() != StatusCode::OK {
        bail!("unexpected status code: {}", response.status());
    }
    let status: StatusResponse = response.json().await.context("decoding node status")?;

    if status.result.sync_info.catching_up {
        bail!("node is still catching up");
    }
    let age = Utc::now() - status.result.sync_info.latest_block_time;
    if age > chrono::Duration::seconds(MAX_BLOCK_AGE_SECS) {
        bail!("latest block is {}s old", age.num_seconds());
    }
    Ok(())
}
