use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyper::{Body, Request, Response, Uri};
use rand::Rng;
use reqwest::Client;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::ProxyError;
use crate::seed::{Seed, SeedProvider};
use crate::server::Server;
use crate::stats::ServerStat;

const COMPACTION_INTERVAL: Duration = Duration::from_secs(1);

/// Which API flavor a dispatcher serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyKind {
    Rpc,
    Rest,
}

impl ProxyKind {
    pub const fn prefix(self) -> &'static str {
        match self {
            ProxyKind::Rpc => "/rpc",
            ProxyKind::Rest => "/rest",
        }
    }

    const fn label(self) -> &'static str {
        match self {
            ProxyKind::Rpc => "rpc",
            ProxyKind::Rest => "rest",
        }
    }

    fn providers(self, seed: &Seed) -> &[SeedProvider] {
        match self {
            ProxyKind::Rpc => &seed.apis.rpc,
            ProxyKind::Rest => &seed.apis.rest,
        }
    }
}

/// Per-kind dispatcher owning the backend pool and the rotation cursor.
pub struct Proxy {
    kind: ProxyKind,
    cfg: Config,
    client: Client,
    pool: Mutex<Pool>,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
}

#[derive(Default)]
struct Pool {
    cursor: usize,
    servers: Vec<Arc<Server>>,
}

impl Proxy {
    pub fn new(kind: ProxyKind, cfg: Config, client: Client) -> Self {
        Self {
            kind,
            cfg,
            client,
            pool: Mutex::new(Pool::default()),
            initialized: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn ready(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> bool {
        !self.shutting_down.load(Ordering::SeqCst) && self.ready()
    }

    pub(crate) fn servers(&self) -> Vec<Arc<Server>> {
        self.pool.lock().expect("pool lock poisoned").servers.clone()
    }

    /// Snapshot of every backend, ranked for operator display. Each server's
    /// fields are read under its own locks; the slice may mix observations
    /// from slightly different instants.
    pub fn stats(&self) -> Vec<ServerStat> {
        let mut stats: Vec<ServerStat> = self.servers().iter().map(|s| s.stat()).collect();
        stats.sort_by(|a, b| a.rank(b));
        stats
    }

    /// Drive the dispatcher: apply seed updates as they arrive and compact
    /// the per-server stat slices once per second.
    pub async fn run(
        self: Arc<Self>,
        mut seeds: mpsc::Receiver<Seed>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut compactor = interval(COMPACTION_INTERVAL);
        compactor.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                seed = seeds.recv() => match seed {
                    Some(seed) => self.reconcile(&seed),
                    None => break,
                },
                _ = compactor.tick() => {
                    for server in self.servers() {
                        server.compact_stats();
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Reconcile the pool against a seed: construct providers that are new,
    /// drop providers that left the seed. Membership is decided solely by
    /// seed presence; health never removes a backend. No I/O happens under
    /// the pool lock.
    pub(crate) fn reconcile(&self, seed: &Seed) {
        let providers = self.kind.providers(seed);
        let mut pool = self.pool.lock().expect("pool lock poisoned");

        for provider in providers {
            if pool.servers.iter().any(|s| s.name() == provider.provider) {
                continue;
            }
            match Server::new(
                &provider.provider,
                &provider.address,
                self.cfg.clone(),
                self.client.clone(),
            ) {
                Ok(server) => pool.servers.push(Arc::new(server)),
                Err(err) => tracing::error!(
                    kind = self.kind.label(),
                    provider = %provider.provider,
                    error = ?err,
                    "skipping provider"
                ),
            }
        }

        pool.servers.retain(|server| {
            let keep = providers.iter().any(|p| p.provider == server.name());
            if !keep {
                tracing::info!(
                    kind = self.kind.label(),
                    name = %server.name(),
                    "server was removed from pool"
                );
            }
            keep
        });

        tracing::info!(
            kind = self.kind.label(),
            total = pool.servers.len(),
            "updated server list"
        );
        drop(pool);
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// Pick the next eligible backend. The cursor rotates under the pool
    /// lock; degraded servers are skipped unless a chance probe fires. The
    /// sweep is bounded at one full rotation; if nothing is eligible, the
    /// first candidate seen is returned rather than refusing a non-empty
    /// pool.
    fn next(&self) -> Option<Arc<Server>> {
        let attempts = self.pool.lock().expect("pool lock poisoned").servers.len();
        if attempts == 0 {
            return None;
        }

        let mut fallback = None;
        for _ in 0..attempts {
            let server = {
                let mut pool = self.pool.lock().expect("pool lock poisoned");
                if pool.servers.is_empty() {
                    break;
                }
                let index = pool.cursor % pool.servers.len();
                pool.cursor = pool.cursor.wrapping_add(1);
                pool.servers[index].clone()
            };
            if server.healthy() && server.error_rate() <= self.cfg.healthy_error_rate_threshold {
                return Some(server);
            }
            if rand::thread_rng().gen_range(1_u32..100) < self.cfg.unhealthy_recovery_chance_pct {
                tracing::warn!(
                    name = %server.name(),
                    avg = ?server.avg(),
                    "giving slow server a chance"
                );
                return Some(server);
            }
            tracing::warn!(
                name = %server.name(),
                avg = ?server.avg(),
                "server is degraded, trying next"
            );
            fallback.get_or_insert(server);
        }
        fallback
    }

    /// Handle one client request: strip the kind prefix, select a backend,
    /// forward.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        if self.shutting_down.load(Ordering::SeqCst) {
            tracing::error!(kind = self.kind.label(), "proxy is shutting down");
            return ProxyError::ShuttingDown.into_response();
        }

        let req = strip_prefix(req, self.kind.prefix());
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("request", kind = self.kind.label(), %request_id);
        let _guard = span.enter();

        match self.next() {
            Some(server) => server.serve(req).await,
            None => {
                tracing::error!(kind = self.kind.label(), "no servers available");
                ProxyError::NoServersAvailable.into_response()
            }
        }
    }
}

fn strip_prefix(mut req: Request<Body>, prefix: &str) -> Request<Body> {
    let uri = req.uri();
    let path = match uri.path().strip_prefix(prefix) {
        Some(rest) if rest.is_empty() => "/",
        Some(rest) if rest.starts_with('/') => rest,
        _ => return req,
    };
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    match path_and_query.parse() {
        Ok(path_and_query) => parts.path_and_query = Some(path_and_query),
        Err(_) => return req,
    }
    if let Ok(uri) = Uri::from_parts(parts) {
        *req.uri_mut() = uri;
    }
    req
}
