use anyhow::{Context, Result};
use hyper::{Body, Response, StatusCode};
use serde_json::json;

use crate::stats::ServerStat;

const TEMPLATE: &str = include_str!("../static/dashboard.html");
const STATS_PLACEHOLDER: &str = "__STATS__";

/// Render the operator dashboard with the current stat snapshots inlined.
pub fn render(rpc: &[ServerStat], rest: &[ServerStat]) -> Result<Response<Body>> {
    let stats = serde_json::to_string(&json!({ "rpc": rpc, "rest": rest }))
        .context("serializing stats snapshot")?;
    let html = TEMPLATE.replace(STATS_PLACEHOLDER, &stats);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/html; charset=utf-8")
        .header("cache-control", "no-store")
        .body(Body::from(html))
        .expect("dashboard response build failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stat(name: &str) -> ServerStat {
        ServerStat {
            name: name.to_string(),
            url: format!("http://{name}.local"),
            avg: Duration::from_millis(12),
            degraded: false,
            initialized: true,
            requests: 7,
            error_rate: 0.0,
            probe_ok: Some(true),
            last_health_check: None,
        }
    }

    #[tokio::test]
    async fn renders_stats_into_the_template() {
        let response = render(&[stat("rpc-node")], &[stat("rest-node")]).unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains("rpc-node"));
        assert!(html.contains("rest-node"));
        assert!(!html.contains(STATS_PLACEHOLDER));
    }
}
