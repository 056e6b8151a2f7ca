//! Virtual host bindings and the hostname-keyed registry
//!
//! A [`Vhost`] owns one hostname binding: its upstream handler, its TLS
//! material, a bounded ring of recent log lines, and a broadcast channel
//! fanning live lines out to attached stream listeners. The [`VhostMux`]
//! maps hostnames to vhosts and dispatches data-plane requests by Host
//! header.

use crate::cert::CertStore;
use crate::error::{self, Error, Result};
use crate::transport::{RetryPolicy, UpstreamHandler};
use dashmap::DashMap;
use futures::FutureExt;
use http_body_util::combinators::BoxBody;
use hyper::body::{Body, Bytes};
use hyper::{Request, Response, StatusCode};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Most recent log lines retained per vhost
pub const LOG_HISTORY_CAPACITY: usize = 10;

/// Lines buffered per attached listener; a listener that falls further
/// behind loses its oldest pending lines, never the publisher's time
const LOG_FANOUT_CAPACITY: usize = 64;

/// A validated `hostname:port` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub hostname: String,
    pub port: u16,
}

impl Binding {
    pub fn parse(input: &str) -> Result<Binding> {
        let Some((hostname, port)) = input.rsplit_once(':') else {
            return Err(Error::InvalidBinding(input.to_string()));
        };
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidBinding(input.to_string()))?;
        if port == 0 || !valid_hostname(hostname) {
            return Err(Error::InvalidBinding(input.to_string()));
        }
        Ok(Binding {
            hostname: hostname.to_string(),
            port,
        })
    }
}

impl std::str::FromStr for Binding {
    type Err = Error;

    fn from_str(input: &str) -> Result<Binding> {
        Binding::parse(input)
    }
}

/// Hostnames are `label(.label)*`: ASCII alphanumeric labels with interior
/// hyphens, no port segment, at most 253 characters overall.
fn valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 253 {
        return false;
    }
    hostname.split('.').all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// One registered hostname binding
pub struct Vhost {
    hostname: String,
    service_host: String,
    service_port: u16,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    handler: UpstreamHandler,
    history: Mutex<VecDeque<String>>,
    log_tx: broadcast::Sender<String>,
}

impl Vhost {
    fn new(binding: Binding, tls_files: Option<(PathBuf, PathBuf)>, retry: RetryPolicy) -> Vhost {
        let (log_tx, _) = broadcast::channel(LOG_FANOUT_CAPACITY);
        let handler = UpstreamHandler::new(binding.hostname.clone(), binding.port, retry);
        let (cert, key) = match tls_files {
            Some((cert, key)) => (Some(cert), Some(key)),
            None => (None, None),
        };
        Vhost {
            hostname: binding.hostname,
            service_host: "127.0.0.1".to_string(),
            service_port: binding.port,
            cert,
            key,
            handler,
            history: Mutex::new(VecDeque::with_capacity(LOG_HISTORY_CAPACITY)),
            log_tx,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn service_host(&self) -> &str {
        &self.service_host
    }

    pub fn service_port(&self) -> u16 {
        self.service_port
    }

    /// Certificate and key paths when TLS material was provisioned.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        self.cert.as_deref().zip(self.key.as_deref())
    }

    /// Append a line to the bounded history and publish it to every
    /// attached listener. Never blocks: the broadcast channel drops the
    /// oldest buffered line of a listener that cannot keep up.
    pub fn push_log(&self, line: String) {
        let mut history = self.history.lock();
        if history.len() == LOG_HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(line.clone());
        drop(history);
        // no receivers attached is the common case
        let _ = self.log_tx.send(line);
    }

    /// Snapshot of the retained history, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.history.lock().iter().cloned().collect()
    }

    /// Attach a live listener. Dropping the receiver detaches it.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<String> {
        self.log_tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.log_tx.receiver_count()
    }

    /// Tear down log state; listeners observe the channel closing once the
    /// registry's reference is dropped.
    fn close(&self) {
        self.history.lock().clear();
    }
}

/// Hostname-keyed registry of vhosts, dispatching requests by Host header
pub struct VhostMux {
    servers: DashMap<String, Arc<Vhost>>,
    certs: Option<CertStore>,
    retry: RetryPolicy,
}

impl VhostMux {
    /// New registry. A certificate store enables TLS provisioning for
    /// every subsequent registration; `None` disables TLS material.
    pub fn new(certs: Option<CertStore>) -> VhostMux {
        VhostMux {
            servers: DashMap::new(),
            certs,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> VhostMux {
        self.retry = retry;
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.certs.is_some()
    }

    /// Register a `hostname:port` binding, replacing any existing vhost for
    /// the hostname (last write wins, after the prior instance is torn
    /// down). With TLS enabled, certificate provisioning must succeed
    /// before the registry is touched.
    pub async fn register(&self, binding: &str) -> Result<Arc<Vhost>> {
        let binding = Binding::parse(binding)?;
        let tls_files = match &self.certs {
            Some(store) => Some(store.obtain(&binding.hostname).await?),
            None => None,
        };
        let vhost = Arc::new(Vhost::new(binding, tls_files, self.retry.clone()));
        if let Some(old) = self
            .servers
            .insert(vhost.hostname().to_string(), Arc::clone(&vhost))
        {
            info!(
                host = old.hostname(),
                port = old.service_port(),
                "replacing existing vhost"
            );
            old.close();
        }
        Ok(vhost)
    }

    /// Remove one vhost, tearing down its log resources.
    pub fn remove(&self, hostname: &str) -> Option<Arc<Vhost>> {
        let (_, vhost) = self.servers.remove(hostname)?;
        vhost.close();
        Some(vhost)
    }

    /// Remove every vhost, returning them for confirmation output.
    pub fn remove_all(&self) -> Vec<Arc<Vhost>> {
        let hostnames: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        hostnames
            .iter()
            .filter_map(|hostname| self.remove(hostname))
            .collect()
    }

    /// Exact-match lookup; callers strip any port from the Host header.
    pub fn lookup(&self, hostname: &str) -> Option<Arc<Vhost>> {
        self.servers.get(hostname).map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Vhost>> {
        self.servers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Human-readable enumeration for the control plane.
    pub fn dump_servers(&self) -> String {
        let mut out = format!("{} vhosts:\n", self.servers.len());
        for entry in self.servers.iter() {
            let vhost = entry.value();
            let _ = writeln!(
                out,
                "{} -> {}:{}",
                vhost.hostname(),
                vhost.service_host(),
                vhost.service_port()
            );
        }
        out
    }

    /// Dispatch one data-plane request by Host header. Unknown hosts get a
    /// 404; a panic inside the matched handler is contained here and
    /// answered with a 503 naming both URLs, so one misbehaving backend
    /// cannot take the daemon down.
    pub async fn dispatch<B>(&self, req: Request<B>, is_tls: bool) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display + Send,
    {
        let raw_host = host_header(&req);
        let path = req.uri().path().to_string();
        let original_url = format!("{raw_host}{path}");
        let hostname = strip_port(&raw_host);

        let Some(vhost) = self.lookup(&hostname) else {
            warn!(host = %hostname, "host not found");
            return error::text_response(
                StatusCode::NOT_FOUND,
                format!("host not found: {hostname}\n"),
            );
        };

        let rewritten = format!("{}{}", vhost.handler.target_base(), path);
        match AssertUnwindSafe(vhost.handler.serve(req, is_tls))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(_) => {
                warn!(original = %original_url, target = %rewritten, "handler panicked while proxying");
                error::text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("error proxying request `{original_url}` to `{rewritten}`\n"),
                )
            }
        }
    }
}

/// Raw Host header (HTTP/1.1) or URI authority (HTTP/2), possibly with a
/// port segment.
pub fn host_header<B>(req: &Request<B>) -> String {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
        .unwrap_or_default()
}

/// Hostname with any `:port` suffix removed.
pub fn strip_port(host: &str) -> String {
    host.split(':').next().unwrap_or("").to_string()
}
