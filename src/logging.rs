//! Request logging and per-vhost log distribution
//!
//! Every request through the daemon is timed and formatted into one
//! immutable log line. Lines for a registered vhost go to its bounded
//! history and live listeners; control-plane and unmatched-host lines only
//! reach the console.

use crate::vhost::{host_header, strip_port, VhostMux};
use http_body_util::combinators::BoxBody;
use hyper::body::{Body, Bytes};
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Wraps the vhost registry so every dispatched request is logged and its
/// line routed to the owning vhost.
pub struct LoggedHandler {
    mux: Arc<VhostMux>,
}

impl LoggedHandler {
    pub fn new(mux: Arc<VhostMux>) -> LoggedHandler {
        LoggedHandler { mux }
    }

    pub fn mux(&self) -> &Arc<VhostMux> {
        &self.mux
    }

    /// Serve one data-plane request, timing it and routing its log line.
    pub async fn dispatch<B>(
        &self,
        req: Request<B>,
        remote: SocketAddr,
        is_tls: bool,
    ) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display + Send,
    {
        let hostname = strip_port(&host_header(&req));
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let size = req.body().size_hint().lower();
        let start = Instant::now();

        let response = self.mux.dispatch(req, is_tls).await;

        self.record(
            remote,
            &hostname,
            method.as_str(),
            response.status().as_u16(),
            &path,
            size,
            start.elapsed(),
        );
        response
    }

    /// Format, print, and fan out the line for one completed request.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        remote: SocketAddr,
        hostname: &str,
        method: &str,
        status: u16,
        path: &str,
        size: u64,
        elapsed: Duration,
    ) {
        let line = format_line(remote, hostname, method, status, path, size, elapsed);
        info!("{line}");
        if let Some(vhost) = self.mux.lookup(hostname) {
            vhost.push_log(line);
        }
    }
}

/// One immutable access-log line:
/// `{ts} {remote} [{host}] {method} [ {status} ] {path} {size} {latency}`
#[allow(clippy::too_many_arguments)]
pub fn format_line(
    remote: SocketAddr,
    hostname: &str,
    method: &str,
    status: u16,
    path: &str,
    size: u64,
    elapsed: Duration,
) -> String {
    let ts = chrono::Local::now().format("%Y/%m/%d %H:%M:%S");
    format!("{ts} {remote} [{hostname}] {method} [ {status} ] {path} {size} {elapsed:?}")
}
