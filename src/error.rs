//! Error taxonomy and HTTP error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed `hostname:port` binding, caught before any network call
    #[error("invalid binding '{0}': expected hostname:port")]
    InvalidBinding(String),

    /// Certificate generation or lookup failed; the registration is aborted
    #[error("failed to provision certificate for '{host}': {reason}")]
    CertProvisionFailed { host: String, reason: String },

    /// Lookup miss for a hostname at either the data or control plane
    #[error("host '{0}' not found")]
    HostNotFound(String),

    /// All upstream retries exhausted
    #[error("upstream for '{host}' unavailable at {target}")]
    UpstreamUnavailable { host: String, target: String },

    /// Could not bind a configured listen address
    #[error("failed to bind {addr}")]
    ListenerBindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Supervised command failed to start
    #[error("failed to start command")]
    ChildProcess(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Plain-text response body with the given status
pub fn text_response(
    status: StatusCode,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Branded 503 page shown when every retry against a backend has failed
pub fn unavailable_response(host: &str, target: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = format!(
        "<html>\n<body>\n<h1>503 Service Unavailable</h1>\n\
         <p>Can't connect to the upstream server for <code>{host}</code> \
         at <code>{target}</code>, please try again later.</p>\n\
         </body>\n</html>\n"
    );
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}
