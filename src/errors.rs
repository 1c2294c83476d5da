use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};
use thiserror::Error;

/// Failures originated by the proxy itself rather than an upstream node.
/// All of them surface to the client as a plain-text 500.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy is shutting down")]
    ShuttingDown,
    #[error("no servers available")]
    NoServersAvailable,
}

impl ProxyError {
    pub fn into_response(self) -> Response<Body> {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            )
            .body(Body::from(self.to_string()))
            .expect("error response build failed")
    }
}
