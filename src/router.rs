use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server as HttpServer, StatusCode};
use tokio::sync::watch;

use crate::config::Config;
use crate::dashboard;
use crate::proxy::Proxy;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub(crate) struct AppState {
    pub(crate) rpc: Arc<Proxy>,
    pub(crate) rest: Arc<Proxy>,
}

pub async fn start_server(
    cfg: Config,
    rpc: Arc<Proxy>,
    rest: Arc<Proxy>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let state = Arc::new(AppState { rpc, rest });

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(req, state).await) }
            }))
        }
    });

    // TODO: terminate TLS here from cfg.tls_cert/tls_key or the autocert
    // settings instead of relying on the fronting listener.
    let server = HttpServer::try_bind(&cfg.listen)
        .with_context(|| format!("binding {}", cfg.listen))?
        .serve(make_svc);
    tracing::info!(addr = %cfg.listen, "proxy listening");

    let mut drain = shutdown.clone();
    let mut grace = shutdown;
    let graceful = server.with_graceful_shutdown(async move {
        let _ = drain.changed().await;
    });

    tokio::select! {
        result = graceful => result.map_err(Into::into),
        _ = async {
            let _ = grace.changed().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            tracing::warn!("grace period elapsed with requests still in flight");
            Ok(())
        }
    }
}

pub(crate) async fn route(req: Request<Body>, state: Arc<AppState>) -> Response<Body> {
    let path = req.uri().path();
    if path == "/rpc" || path.starts_with("/rpc/") {
        return state.rpc.handle(req).await;
    }
    if path == "/rest" || path.starts_with("/rest/") {
        return state.rest.handle(req).await;
    }

    match (req.method(), path) {
        (&Method::GET, "/") => {
            match dashboard::render(&state.rpc.stats(), &state.rest.stats()) {
                Ok(response) => response,
                Err(err) => {
                    tracing::error!(error = ?err, "dashboard rendering failed");
                    internal_server_error()
                }
            }
        }
        (&Method::GET, "/health/ready") => {
            health_response(state.rpc.ready() && state.rest.ready())
        }
        (&Method::GET, "/health/live") => health_response(state.rpc.live() && state.rest.live()),
        _ => not_found(),
    }
}

fn health_response(ok: bool) -> Response<Body> {
    let (status, body) = if ok {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from(body))
        .expect("health response build failed")
}

fn internal_server_error() -> Response<Body> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(Body::from("internal server error"))
        .expect("error response build failed")
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("not found"))
        .expect("not found response build failed")
}
