use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::{Body, Request, Response, StatusCode};
use once_cell::sync::Lazy;
use reqwest::{Client, Url};

use crate::avg::MovingAverage;
use crate::config::Config;
use crate::stats::ServerStat;
use crate::ttl::TtlSlice;

const PING_WINDOW: usize = 50;

/// Headers that must not be relayed between client and upstream.
static HOP_BY_HOP_HEADERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
        "host",
        "content-length",
    ]
    .into_iter()
    .collect()
});

/// Shared upstream HTTP client. No global deadline: the per-request timeout
/// is the configured proxy request timeout.
pub fn build_http_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .pool_max_idle_per_host(10)
        .use_rustls_tls()
        .build()
        .context("building HTTP client")
}

#[derive(Clone, Copy, Debug)]
struct ProbeOutcome {
    checked_at: DateTime<Utc>,
    ok: bool,
}

/// One upstream node endpoint discovered from the seed.
pub struct Server {
    name: String,
    url: Url,
    cfg: Config,
    client: Client,
    pings: MovingAverage,
    successes: TtlSlice<u16>,
    failures: TtlSlice<u16>,
    request_count: AtomicU64,
    probe: Mutex<Option<ProbeOutcome>>,
}

impl Server {
    pub fn new(name: &str, addr: &str, cfg: Config, client: Client) -> Result<Self> {
        let url =
            Url::parse(addr).with_context(|| format!("could not create server `{name}`"))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!(
                "could not create server `{name}`: unsupported scheme `{}`",
                url.scheme()
            );
        }
        Ok(Self {
            name: name.to_string(),
            url,
            cfg,
            client,
            pings: MovingAverage::new(PING_WINDOW),
            successes: TtlSlice::new(),
            failures: TtlSlice::new(),
            request_count: AtomicU64::new(0),
            probe: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn url(&self) -> &Url {
        &self.url
    }

    /// A server is healthy while its rolling mean latency stays under the
    /// configured threshold. The error-rate cut is applied by the
    /// dispatcher, not here.
    pub fn healthy(&self) -> bool {
        self.pings.last() < self.cfg.healthy_threshold
    }

    /// Failure percentage over the non-expired success/failure entries.
    pub fn error_rate(&self) -> f64 {
        let ok = self.successes.list().len();
        let failed = self.failures.list().len();
        let total = ok + failed;
        if total == 0 {
            return 0.0;
        }
        failed as f64 * 100.0 / total as f64
    }

    pub(crate) fn avg(&self) -> Duration {
        self.pings.last()
    }

    pub(crate) fn compact_stats(&self) {
        self.successes.compact();
        self.failures.compact();
    }

    pub(crate) fn record_probe(&self, ok: bool) {
        *self.probe.lock().expect("probe state lock poisoned") = Some(ProbeOutcome {
            checked_at: Utc::now(),
            ok,
        });
    }

    pub fn stat(&self) -> ServerStat {
        let probe = *self.probe.lock().expect("probe state lock poisoned");
        let requests = self.request_count.load(Ordering::Relaxed);
        ServerStat {
            name: self.name.clone(),
            url: self.url.to_string(),
            avg: self.pings.last(),
            degraded: !self.healthy(),
            initialized: requests > 0,
            requests,
            error_rate: self.error_rate(),
            probe_ok: probe.map(|p| p.ok),
            last_health_check: probe.map(|p| p.checked_at),
        }
    }

    /// Forward one client request upstream and relay the outcome.
    ///
    /// The elapsed wall time lands in the moving average only after the
    /// exchange is classified, so the recovery check below reads the average
    /// as it was when this server was selected.
    pub async fn serve(&self, req: Request<Body>) -> Response<Body> {
        let started = Instant::now();
        let outcome = self.forward(req).await;

        let (response, status) = match outcome {
            Ok((status, headers, body)) => (relay_response(status, &headers, body), Some(status)),
            Err(err) => {
                tracing::error!(name = %self.name, error = ?err, "could not proxy request");
                (proxy_failure_response(), None)
            }
        };

        self.request_count.fetch_add(1, Ordering::Relaxed);
        match status {
            Some(status) if (200..=300).contains(&status.as_u16()) => self
                .successes
                .append(status.as_u16(), self.cfg.error_rate_bucket_ttl),
            Some(status) => self
                .failures
                .append(status.as_u16(), self.cfg.error_rate_bucket_ttl),
            // A transport failure has no status; bucket it as 0.
            None => self.failures.append(0, self.cfg.error_rate_bucket_ttl),
        }

        // An unhealthy server only sees traffic as a recovery probe; when
        // the probe comes back with a response, discard the slow samples so
        // the server can re-enter the rotation.
        if status.is_some() && !self.healthy() {
            tracing::info!(name = %self.name, "resetting statistics");
            self.pings.reset();
        }

        let elapsed = started.elapsed();
        let avg = self.pings.next(elapsed);
        tracing::info!(name = %self.name, avg = ?avg, last = ?elapsed, "request done");

        response
    }

    async fn forward(&self, req: Request<Body>) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let (parts, body) = req.into_parts();

        let mut target = self.url.clone();
        target.set_path(parts.uri.path());
        target.set_query(parts.uri.query());

        let body = hyper::body::to_bytes(body)
            .await
            .context("reading request body")?;

        let mut headers = HeaderMap::with_capacity(parts.headers.len());
        for (name, value) in parts.headers.iter() {
            if HOP_BY_HOP_HEADERS.contains(name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        tracing::info!(name = %self.name, url = %target, "proxying request");

        let response = self
            .client
            .request(parts.method, target)
            .headers(headers)
            .body(body)
            .timeout(self.cfg.proxy_request_timeout)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.name))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("reading response from {} failed", self.name))?;
        Ok((status, headers, body))
    }
}

fn relay_response(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Response<Body> {
    let mut response = Response::builder()
        .status(status)
        .body(Body::from(body))
        .expect("upstream response build failed");

    let headers_mut = response.headers_mut();
    for (name, value) in headers.iter() {
        if HOP_BY_HOP_HEADERS.contains(name.as_str()) {
            continue;
        }
        // Last value wins per key.
        headers_mut.insert(name.clone(), value.clone());
    }
    response
}

fn proxy_failure_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )
        .body(Body::from("could not proxy request"))
        .expect("failure response build failed")
}
