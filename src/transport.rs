//! Upstream round trips with retry and exponential backoff
//!
//! Each vhost owns one handler which rewrites requests to its loopback
//! backend. Connection failures are retried with exponential backoff so a
//! backend that is still starting up gets time to bind its port; once the
//! elapsed ceiling is reached the handler synthesizes a 503 page instead of
//! surfacing a raw connection error to the browser.

use crate::error;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::HOST;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Exponential backoff schedule bounded by total elapsed time
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            max_elapsed: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Default schedule with a custom elapsed ceiling.
    pub fn with_ceiling(max_elapsed: Duration) -> RetryPolicy {
        RetryPolicy {
            max_elapsed,
            ..RetryPolicy::default()
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_interval)
    }
}

/// Proxy entry point for a single vhost: forwards requests to the backend
/// at `127.0.0.1:<port>` through a pooled client.
pub struct UpstreamHandler {
    hostname: String,
    port: u16,
    client: Client<HttpConnector, Full<Bytes>>,
    retry: RetryPolicy,
}

impl UpstreamHandler {
    pub fn new(hostname: impl Into<String>, port: u16, retry: RetryPolicy) -> UpstreamHandler {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        UpstreamHandler {
            hostname: hostname.into(),
            port,
            client,
            retry,
        }
    }

    pub fn target_base(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Forward one request to the backend, retrying until the elapsed
    /// ceiling. The request body is buffered up front so each attempt can
    /// resend it.
    pub async fn serve<B>(&self, req: Request<B>, is_tls: bool) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display + Send,
    {
        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let target = format!("http://127.0.0.1:{}{}", self.port, path);

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(host = %self.hostname, error = %e, "failed to read request body");
                return error::text_response(StatusCode::BAD_REQUEST, "failed to read request body\n");
            }
        };

        let uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(host = %self.hostname, target = %target, error = %e, "invalid upstream target");
                return error::text_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid upstream target\n");
            }
        };

        let start = Instant::now();
        let mut interval = self.retry.initial_interval;
        loop {
            let Some(request) = self.build_request(&parts, &uri, body.clone(), is_tls) else {
                return error::text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to build upstream request\n",
                );
            };

            match self.client.request(request).await {
                Ok(response) => {
                    let (parts, body) = response.into_parts();
                    return Response::from_parts(parts, body.boxed());
                }
                Err(e) => {
                    if start.elapsed() + interval > self.retry.max_elapsed {
                        warn!(
                            host = %self.hostname,
                            target = %target,
                            error = %e,
                            elapsed_ms = start.elapsed().as_millis(),
                            "upstream unavailable, retries exhausted"
                        );
                        return error::unavailable_response(&self.hostname, &target);
                    }
                    debug!(
                        host = %self.hostname,
                        error = %e,
                        delay_ms = interval.as_millis(),
                        "upstream request failed, retrying"
                    );
                    tokio::time::sleep(interval).await;
                    interval = self.retry.next_interval(interval);
                }
            }
        }
    }

    fn build_request(
        &self,
        parts: &hyper::http::request::Parts,
        uri: &Uri,
        body: Bytes,
        is_tls: bool,
    ) -> Option<Request<Full<Bytes>>> {
        let mut builder = Request::builder().method(parts.method.clone()).uri(uri.clone());
        for (name, value) in parts.headers.iter() {
            if name == &HOST {
                continue;
            }
            builder = builder.header(name, value);
        }
        // the backend sees the virtual hostname, not the loopback target
        builder = builder.header(HOST, self.hostname.as_str());
        if let Some(original_host) = parts.headers.get(HOST) {
            builder = builder.header(X_FORWARDED_HOST, original_host);
        }
        builder = builder.header(X_FORWARDED_PROTO, if is_tls { "https" } else { "http" });
        builder.body(Full::new(body)).ok()
    }
}
