use anyhow::{bail, Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

use crate::config::Config;

/// Remote document listing the providers available for each API kind.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Seed {
    #[serde(default)]
    pub status: String,
    pub chain_id: String,
    #[serde(default)]
    pub apis: Apis,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Apis {
    #[serde(default)]
    pub rpc: Vec<SeedProvider>,
    #[serde(default)]
    pub rest: Vec<SeedProvider>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SeedProvider {
    pub address: String,
    pub provider: String,
}

/// Fetch and decode the seed document.
pub async fn fetch(client: &Client, url: &str) -> Result<Seed> {
    let response = client.get(url).send().await.context("get seed")?;
    if response.status() != StatusCode::OK {
        bail!("seed request failed: {}", response.status());
    }
    response.json::<Seed>().await.context("parse seed")
}

/// Periodically fetches the seed document and fans it out to subscribers.
///
/// Subscriber channels are size-1: a lagging subscriber blocks the updater
/// until the previous seed is consumed, so the updater can never get ahead
/// of its consumers.
pub struct Updater {
    cfg: Config,
    client: Client,
    subscribers: Vec<mpsc::Sender<Seed>>,
}

impl Updater {
    pub fn new(cfg: Config, client: Client, subscribers: Vec<mpsc::Sender<Seed>>) -> Self {
        Self {
            cfg,
            client,
            subscribers,
        }
    }

    /// Fetch once immediately, then on every tick, until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.cfg.seed_refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.fetch_and_publish().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn fetch_and_publish(&self) {
        let seed = match fetch(&self.client, &self.cfg.seed_url).await {
            Ok(seed) => seed,
            Err(err) => {
                tracing::error!(error = ?err, "could not fetch seed list");
                return;
            }
        };
        if seed.chain_id != self.cfg.chain_id {
            tracing::error!(
                got = %seed.chain_id,
                expected = %self.cfg.chain_id,
                "chain ID is different than expected"
            );
            return;
        }
        for subscriber in &self.subscribers {
            if subscriber.send(seed.clone()).await.is_err() {
                tracing::debug!("seed subscriber is gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::timeout;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_seed(chain_id: &str) -> Seed {
        Seed {
            status: "live".into(),
            chain_id: chain_id.into(),
            apis: Apis {
                rpc: vec![SeedProvider {
                    address: "http://rpc.local".into(),
                    provider: "rpc-provider".into(),
                }],
                rest: vec![SeedProvider {
                    address: "http://rest.local".into(),
                    provider: "rest-provider".into(),
                }],
            },
        }
    }

    async fn seed_server(seed: &Seed) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(seed))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn fetches_and_decodes_the_seed() {
        let seed = sample_seed("unittest");
        let server = seed_server(&seed).await;

        let got = fetch(&Client::new(), &server.uri()).await.unwrap();
        assert_eq!(got, seed);
    }

    #[tokio::test]
    async fn non_ok_seed_response_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let result = fetch(&Client::new(), &server.uri()).await;
        assert!(result.unwrap_err().to_string().contains("502"));
    }

    #[tokio::test]
    async fn fans_the_seed_out_to_every_subscriber() {
        let seed = sample_seed("unittest");
        let server = seed_server(&seed).await;

        let mut cfg = Config::for_tests();
        cfg.seed_url = server.uri();
        let (rpc_tx, mut rpc_rx) = mpsc::channel(1);
        let (rest_tx, mut rest_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let updater = Updater::new(cfg, Client::new(), vec![rpc_tx, rest_tx]);
        let task = tokio::spawn(updater.run(shutdown_rx));

        let got = timeout(Duration::from_secs(2), rpc_rx.recv())
            .await
            .expect("rpc subscriber update")
            .unwrap();
        assert_eq!(got, seed);
        let got = timeout(Duration::from_secs(2), rest_rx.recv())
            .await
            .expect("rest subscriber update")
            .unwrap();
        assert_eq!(got, seed);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn drops_seeds_for_the_wrong_chain() {
        let seed = sample_seed("some-other-chain");
        let server = seed_server(&seed).await;

        let mut cfg = Config::for_tests();
        cfg.seed_url = server.uri();
        let (tx, mut rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let updater = Updater::new(cfg, Client::new(), vec![tx]);
        let task = tokio::spawn(updater.run(shutdown_rx));

        let result = timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(result.is_err(), "mismatched chain seed must not fan out");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
