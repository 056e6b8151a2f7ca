//! Daemon service hosting the virtual reverse proxies
//!
//! proxy chain:
//! daemon -> LoggedHandler -> VhostMux -> Vhost -> UpstreamHandler -> backend
//!
//! The HTTP listener serves for the process lifetime. The TLS listener is
//! restarted with a freshly built certificate set whenever the registry
//! changes; HTTPS connections arriving inside that window are refused, and
//! clients treat the brief outage as part of registration.

use crate::error::{self, Error};
use crate::hosts;
use crate::logging::LoggedHandler;
use crate::tls::build_server_config;
use crate::vhost::{host_header, strip_port, Binding};
use futures::channel::mpsc;
use futures::SinkExt;
use http_body_util::{combinators::BoxBody, BodyExt, Full, StreamBody};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Server identifier returned by the hello probe
pub const PONG: &str = "hello from hostgate";

/// Reserved path prefix for the control-plane API
pub const CONTROL_PREFIX: &str = "/_hostgate";

/// Frames buffered per streaming connection before backpressure
const LOG_STREAM_BUFFER: usize = 32;

/// Long-lived daemon owning the HTTP and HTTPS listeners
pub struct Daemon {
    handler: Arc<LoggedHandler>,
    listen_host: String,
    http_port: u16,
    https_port: u16,
    hosts_file: bool,
    shutdown_rx: watch::Receiver<bool>,
}

struct DaemonState {
    handler: Arc<LoggedHandler>,
    /// Bumped on every TLS-relevant registry change; the TLS accept loop
    /// restarts its listener when the generation moves
    reload_tx: watch::Sender<u64>,
    tls_enabled: bool,
    hosts_file: bool,
}

impl Daemon {
    pub fn new(
        handler: Arc<LoggedHandler>,
        listen_host: impl Into<String>,
        http_port: u16,
        https_port: u16,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Daemon {
        Daemon {
            handler,
            listen_host: listen_host.into(),
            http_port,
            https_port,
            hosts_file: true,
            shutdown_rx,
        }
    }

    /// Disable the best-effort system hosts-file entries (used in tests).
    pub fn with_hosts_file(mut self, enabled: bool) -> Daemon {
        self.hosts_file = enabled;
        self
    }

    fn http_enabled(&self) -> bool {
        self.http_port > 0
    }

    fn tls_enabled(&self) -> bool {
        self.https_port > 0
    }

    /// Run until shutdown is signalled. The daemon stays up while any
    /// listener is serving, even with zero registered vhosts.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let (reload_tx, _) = watch::channel(0u64);
        let state = Arc::new(DaemonState {
            handler: Arc::clone(&self.handler),
            reload_tx,
            tls_enabled: self.tls_enabled(),
            hosts_file: self.hosts_file,
        });

        let mut tasks = Vec::new();

        if self.http_enabled() {
            let addr: SocketAddr = format!("{}:{}", self.listen_host, self.http_port)
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid HTTP bind address: {e}"))?;
            let listener = bind_or_elevate(addr).await?;
            println!("[*] starting proxy: http://{addr}");
            tasks.push(tokio::spawn(run_http(
                Arc::clone(&state),
                listener,
                self.shutdown_rx.clone(),
            )));
        }

        if self.tls_enabled() {
            let addr: SocketAddr = format!("{}:{}", self.listen_host, self.https_port)
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid HTTPS bind address: {e}"))?;
            let listener = bind_or_elevate(addr).await?;
            println!("[*] starting proxy: https://{addr}");
            print!("{}", self.handler.mux().dump_servers());
            let reload_rx = state.reload_tx.subscribe();
            tasks.push(tokio::spawn(run_https(
                Arc::clone(&state),
                addr,
                listener,
                reload_rx,
                self.shutdown_rx.clone(),
            )));
        }

        loop {
            if self.shutdown_rx.changed().await.is_err() {
                break;
            }
            if *self.shutdown_rx.borrow() {
                break;
            }
        }

        for task in &tasks {
            task.abort();
        }
        Ok(())
    }
}

/// Bind the address, re-executing under sudo when a privileged port is
/// refused in an interactive session.
async fn bind_or_elevate(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied && addr.port() < 1024 => {
            println!("[*] error: unable to bind on {addr}");
            #[cfg(unix)]
            {
                if running_headless() {
                    anyhow::bail!(
                        "unable to bind {addr}: permission denied; running headless, so not \
                         re-running with sudo. Run the daemon as root instead."
                    );
                }
                rerun_with_sudo()?;
                unreachable!("exec replaces the process image");
            }
            #[cfg(not(unix))]
            {
                Err(Error::ListenerBindFailed { addr, source: e }.into())
            }
        }
        Err(e) => Err(Error::ListenerBindFailed { addr, source: e }.into()),
    }
}

/// A supervised service or a session without a terminal must not try to
/// escalate; it would hang waiting for a password prompt.
#[cfg(unix)]
fn running_headless() -> bool {
    let service = std::env::var("XPC_SERVICE_NAME").unwrap_or_default();
    if service.contains("hostgate") {
        return true;
    }
    unsafe { libc::isatty(libc::STDIN_FILENO) == 0 }
}

#[cfg(unix)]
fn rerun_with_sudo() -> anyhow::Result<()> {
    use std::os::unix::process::CommandExt;

    if !std::path::Path::new("/usr/bin/sudo").exists() {
        anyhow::bail!("sudo not found; run the daemon as root to bind privileged ports");
    }

    let exe = std::env::current_exe()?;
    println!("[*] rerunning with sudo");

    // env hack: the elevated child must find the same certificate paths
    let mut cmd = std::process::Command::new("/usr/bin/sudo");
    cmd.arg("env");
    cmd.arg(format!("CERT_PATH={}", crate::cert::cert_path().display()));
    if let Some(caroot) = crate::cert::caroot_path() {
        cmd.arg(format!("CAROOT={caroot}"));
    }
    cmd.arg(exe);
    cmd.args(std::env::args().skip(1));

    let err = cmd.exec();
    Err(anyhow::anyhow!("failed to re-exec with sudo: {err}"))
}

async fn run_http(
    state: Arc<DaemonState>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, peer, state, false).await {
                                debug!(addr = %peer, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept connection"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("HTTP listener shutting down");
                    break;
                }
            }
        }
    }
}

/// TLS accept loop. Each pass builds an immutable server config from the
/// current registry, serves until the reload generation moves, then closes
/// the listener and rebinds with a fresh config.
async fn run_https(
    state: Arc<DaemonState>,
    addr: SocketAddr,
    listener: TcpListener,
    mut reload_rx: watch::Receiver<u64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut listener = Some(listener);
    loop {
        // observe the generation before snapshotting so a registration
        // racing the rebuild re-triggers the restart
        reload_rx.borrow_and_update();

        let config = match build_server_config(&state.handler.mux().snapshot()) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "failed to build TLS configuration");
                return;
            }
        };
        let acceptor = TlsAcceptor::from(config);

        let current = match listener.take() {
            Some(listener) => listener,
            None => match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(addr = %addr, error = %e, "failed to restart TLS listener");
                    return;
                }
            },
        };

        let restart = loop {
            tokio::select! {
                result = current.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let state = Arc::clone(&state);
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        if let Err(e) = serve_connection(tls_stream, peer, state, true).await {
                                            debug!(addr = %peer, error = %e, "TLS connection error");
                                        }
                                    }
                                    Err(e) => debug!(addr = %peer, error = %e, "TLS handshake failed"),
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "failed to accept TLS connection"),
                    }
                }
                changed = reload_rx.changed() => {
                    if changed.is_err() {
                        break false;
                    }
                    println!("[*] restarting TLS listener");
                    break true;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("TLS listener shutting down");
                        break false;
                    }
                }
            }
        };

        // release the port before rebinding with the new config
        drop(current);
        if !restart {
            return;
        }
    }
}

async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    state: Arc<DaemonState>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, peer, is_tls).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {e}"))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<DaemonState>,
    peer: SocketAddr,
    is_tls: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if req.uri().path().starts_with(CONTROL_PREFIX) {
        let hostname = strip_port(&host_header(&req));
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let size = req.body().size_hint().lower();
        let start = Instant::now();

        let response = handle_control(req, &state, peer).await;

        state.handler.record(
            peer,
            &hostname,
            method.as_str(),
            response.status().as_u16(),
            &path,
            size,
            start.elapsed(),
        );
        Ok(response)
    } else {
        Ok(state.handler.dispatch(req, peer, is_tls).await)
    }
}

async fn handle_control(
    req: Request<Incoming>,
    state: &Arc<DaemonState>,
    peer: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let path = req.uri().path().trim_start_matches(CONTROL_PREFIX).to_string();
    let method = req.method().clone();
    debug!(%method, %path, client = %peer, "control request");

    match (method, path.as_str()) {
        (Method::GET, "/hello") => error::text_response(StatusCode::OK, format!("{PONG}\n")),
        (Method::GET, "/clients") => {
            error::text_response(StatusCode::OK, state.handler.mux().dump_servers())
        }
        (Method::POST, "/clients/add") => {
            let form = read_form(req).await;
            match form.get("binding") {
                Some(binding) => add_vhost(state, binding).await,
                None => error::text_response(StatusCode::BAD_REQUEST, "error: missing binding\n"),
            }
        }
        (Method::POST, "/clients/stream") => {
            let form = read_form(req).await;
            stream_logs(state, form.get("host").map(String::as_str).unwrap_or(""))
        }
        (Method::POST, "/clients/remove") => {
            let form = read_form(req).await;
            remove_vhost(state, &form)
        }
        _ => error::text_response(StatusCode::NOT_FOUND, "not found\n"),
    }
}

async fn read_form(req: Request<Incoming>) -> HashMap<String, String> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return HashMap::new(),
    };
    url::form_urlencoded::parse(&body).into_owned().collect()
}

/// Create and start a new vhost reverse proxy for the given binding.
async fn add_vhost(
    state: &Arc<DaemonState>,
    binding: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mux = state.handler.mux();
    let mut lines = Vec::new();

    match Binding::parse(binding) {
        Ok(parsed) => {
            if let Some(old) = mux.lookup(&parsed.hostname) {
                let msg = format!(
                    "[*] removing existing vhost: {} -> {}",
                    old.hostname(),
                    old.service_port()
                );
                println!("{msg}");
                lines.push(msg);
            }
        }
        Err(e) => {
            warn!(%binding, error = %e, "failed to register vhost");
            return error::text_response(StatusCode::BAD_REQUEST, format!("error: {e}\n"));
        }
    }

    let vhost = match mux.register(binding).await {
        Ok(vhost) => vhost,
        Err(e) => {
            warn!(%binding, error = %e, "failed to register vhost");
            return error::text_response(StatusCode::BAD_REQUEST, format!("error: {e}\n"));
        }
    };

    println!(
        "[*] registering new vhost: {} -> {}",
        vhost.hostname(),
        vhost.service_port()
    );

    if state.tls_enabled {
        state.reload_tx.send_modify(|generation| *generation += 1);
    }

    if state.hosts_file {
        if let Err(e) = hosts::ensure_host_entry(vhost.hostname()) {
            let msg = format!(
                "[*] warning: failed to add {} to system hosts file: {e}",
                vhost.hostname()
            );
            println!("{msg}");
            lines.push(msg);
        }
    }

    lines.push(format!("[*] added vhost: {binding}"));
    let body = lines.join("\n") + "\n";

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("Access-Control-Allow-Origin", "*")
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}

/// Stream a vhost's logs back to the caller: the retained history first,
/// a `---` separator, then live lines until the client disconnects.
fn stream_logs(
    state: &Arc<DaemonState>,
    hostname: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(vhost) = state.handler.mux().lookup(hostname) else {
        // inline error text: the caller is already reading a stream
        return error::text_response(
            StatusCode::OK,
            format!("[*] error: host '{hostname}' not found"),
        );
    };

    // subscribe before snapshotting the history so no line falls between
    // replay and live delivery
    let mut log_rx = vhost.subscribe_logs();
    let history = vhost.history();
    drop(vhost); // the pump must not keep a removed vhost alive

    let (mut tx, rx) = mpsc::channel::<Result<Frame<Bytes>, hyper::Error>>(LOG_STREAM_BUFFER);
    tokio::spawn(async move {
        let mut opening = String::new();
        for line in &history {
            opening.push_str(line);
            opening.push('\n');
        }
        opening.push_str("---\n");
        if tx.send(Ok(Frame::data(Bytes::from(opening)))).await.is_err() {
            return;
        }

        loop {
            match log_rx.recv().await {
                Ok(mut line) => {
                    line.push('\n');
                    if tx.send(Ok(Frame::data(Bytes::from(line)))).await.is_err() {
                        // client went away; dropping log_rx detaches the listener
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break, // vhost removed
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "stream listener lagged, oldest lines dropped");
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .body(StreamBody::new(rx).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

fn remove_vhost(
    state: &Arc<DaemonState>,
    form: &HashMap<String, String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let all = form
        .get("all")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let hostname = form.get("host").map(String::as_str).unwrap_or("");
    let mux = state.handler.mux();

    let removed = if all {
        mux.remove_all()
    } else if !hostname.is_empty() {
        match mux.remove(hostname) {
            Some(vhost) => vec![vhost],
            None => {
                return error::text_response(
                    StatusCode::OK,
                    format!("error: host '{hostname}' not found"),
                );
            }
        }
    } else {
        return error::text_response(StatusCode::OK, "error: missing hostname");
    };

    let mut body = String::new();
    for vhost in &removed {
        println!(
            "[*] removing vhost: {} -> {}",
            vhost.hostname(),
            vhost.service_port()
        );
        let _ = writeln!(
            body,
            "removing vhost: {} -> {}",
            vhost.hostname(),
            vhost.service_port()
        );
    }

    if state.tls_enabled && !removed.is_empty() {
        state.reload_tx.send_modify(|generation| *generation += 1);
    }

    error::text_response(StatusCode::OK, body)
}
