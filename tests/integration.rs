//! Integration tests for Hostgate

use std::sync::Arc;
use std::time::Duration;

use hostgate::client::Client;
use hostgate::daemon::{Daemon, PONG};
use hostgate::logging::LoggedHandler;
use hostgate::transport::RetryPolicy;
use hostgate::vhost::VhostMux;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Boot a daemon with TLS disabled on the given HTTP port.
async fn start_daemon(http_port: u16, retry: RetryPolicy) -> (watch::Sender<bool>, Arc<VhostMux>) {
    let mux = Arc::new(VhostMux::new(None).with_retry(retry));
    let handler = Arc::new(LoggedHandler::new(Arc::clone(&mux)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon =
        Daemon::new(handler, "127.0.0.1", http_port, 0, shutdown_rx).with_hosts_file(false);

    tokio::spawn(async move {
        let _ = daemon.run().await;
    });

    assert!(
        wait_for_port(http_port, Duration::from_secs(2)).await,
        "daemon did not start in time"
    );
    (shutdown_tx, mux)
}

/// Backend that echoes the raw request text back as its response body.
async fn start_echo_backend(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("backend port free");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let echoed = String::from_utf8_lossy(&buf[..n]).to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    echoed.len(),
                    echoed
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    assert!(wait_for_port(port, Duration::from_secs(2)).await);
}

/// Backend that answers every request with a fixed body.
async fn start_static_backend(port: u16, body: &'static str) {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("backend port free");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    assert!(wait_for_port(port, Duration::from_secs(2)).await);
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send HTTP request with custom Host header (for proxy testing)
async fn http_get_with_host(
    port: u16,
    path: &str,
    host: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// POST a form to a control endpoint and read the full response.
async fn post_form(port: u16, path: &str, form: &str) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{form}",
        form.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

/// Register a binding through the control plane, asserting success.
async fn register(port: u16, binding: &str) {
    let form = format!("binding={}", binding.replace(':', "%3A"));
    let response = post_form(port, "/_hostgate/clients/add", &form).await;
    assert!(
        response.contains("200 OK") && response.contains("added vhost"),
        "registration failed: {response}"
    );
}

// ============================================================================
// Control-plane basics
// ============================================================================

#[tokio::test]
async fn test_hello_probe() {
    let (_shutdown, _mux) = start_daemon(31000, RetryPolicy::default()).await;

    let mut stream = TcpStream::connect("127.0.0.1:31000").await.unwrap();
    let request = "GET /_hostgate/hello HTTP/1.1\r\nHost: 127.0.0.1:31000\r\nConnection: close\r\n\r\n";
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.contains("200 OK"), "response: {response}");
    assert!(response.contains(PONG), "response: {response}");
}

#[tokio::test]
async fn test_list_clients_enumeration() {
    let (_shutdown, _mux) = start_daemon(31005, RetryPolicy::default()).await;
    register(31005, "app.local:31006").await;

    let mut stream = TcpStream::connect("127.0.0.1:31005").await.unwrap();
    let request =
        "GET /_hostgate/clients HTTP/1.1\r\nHost: 127.0.0.1:31005\r\nConnection: close\r\n\r\n";
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.contains("1 vhosts:"), "response: {response}");
    assert!(
        response.contains("app.local -> 127.0.0.1:31006"),
        "response: {response}"
    );
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_register_and_route() {
    let (_shutdown, mux) = start_daemon(31010, RetryPolicy::default()).await;
    start_echo_backend(31011).await;

    register(31010, "app.local:31011").await;
    assert_eq!(mux.len(), 1);

    let response = http_get_with_host(31010, "/hello?x=1", "app.local")
        .await
        .unwrap();
    assert!(response.contains("200 OK"), "response: {response}");

    // the echoed request shows what the backend actually received
    let lower = response.to_lowercase();
    assert!(lower.contains("get /hello?x=1 http/1.1"), "response: {response}");
    assert!(lower.contains("host: app.local"), "response: {response}");
    assert!(
        lower.contains("x-forwarded-host: app.local"),
        "response: {response}"
    );
    assert!(
        lower.contains("x-forwarded-proto: http"),
        "response: {response}"
    );
}

#[tokio::test]
async fn test_unknown_host_is_404_and_registry_unchanged() {
    let (_shutdown, mux) = start_daemon(31015, RetryPolicy::default()).await;

    let response = http_get_with_host(31015, "/", "nope.local").await.unwrap();
    assert!(response.contains("404"), "response: {response}");
    assert!(
        response.contains("host not found: nope.local"),
        "response: {response}"
    );
    assert!(mux.is_empty());
}

#[tokio::test]
async fn test_reregistration_routes_to_new_port() {
    let (_shutdown, mux) = start_daemon(31020, RetryPolicy::default()).await;
    start_static_backend(31021, "first backend").await;
    start_static_backend(31022, "second backend").await;

    register(31020, "foo:31021").await;
    register(31020, "foo:31022").await;
    assert_eq!(mux.len(), 1);

    let response = http_get_with_host(31020, "/", "foo").await.unwrap();
    assert!(response.contains("second backend"), "response: {response}");
}

#[tokio::test]
async fn test_upstream_down_returns_503_within_ceiling() {
    let retry = RetryPolicy::with_ceiling(Duration::from_millis(300));
    let (_shutdown, _mux) = start_daemon(31025, retry).await;

    // nothing listens on the target port
    register(31025, "dead.local:31999").await;

    let start = std::time::Instant::now();
    let response = http_get_with_host(31025, "/", "dead.local").await.unwrap();
    assert!(response.contains("503"), "response: {response}");
    assert!(response.contains("dead.local"), "response: {response}");
    assert!(response.contains("127.0.0.1:31999"), "response: {response}");
    assert!(start.elapsed() < Duration::from_secs(5));
}

// ============================================================================
// Registration errors
// ============================================================================

#[tokio::test]
async fn test_invalid_binding_rejected_registry_unchanged() {
    let (_shutdown, mux) = start_daemon(31030, RetryPolicy::default()).await;

    let response = post_form(31030, "/_hostgate/clients/add", "binding=bad-host").await;
    assert!(response.contains("400"), "response: {response}");
    assert!(response.contains("invalid binding"), "response: {response}");
    assert!(mux.is_empty());
}

#[tokio::test]
async fn test_missing_binding_field_rejected() {
    let (_shutdown, mux) = start_daemon(31032, RetryPolicy::default()).await;

    let response = post_form(31032, "/_hostgate/clients/add", "nothing=here").await;
    assert!(response.contains("400"), "response: {response}");
    assert!(mux.is_empty());
}

// ============================================================================
// Removal
// ============================================================================

#[tokio::test]
async fn test_remove_vhost_makes_host_404_again() {
    let (_shutdown, mux) = start_daemon(31035, RetryPolicy::default()).await;
    register(31035, "gone.local:31036").await;
    assert_eq!(mux.len(), 1);

    let response = post_form(
        31035,
        "/_hostgate/clients/remove",
        "host=gone.local&all=false",
    )
    .await;
    assert!(
        response.contains("removing vhost: gone.local -> 31036"),
        "response: {response}"
    );
    assert!(mux.is_empty());

    let response = http_get_with_host(31035, "/", "gone.local").await.unwrap();
    assert!(response.contains("404"), "response: {response}");
}

#[tokio::test]
async fn test_remove_all_empties_registry() {
    let (_shutdown, mux) = start_daemon(31040, RetryPolicy::default()).await;
    register(31040, "a.local:31041").await;
    register(31040, "b.local:31042").await;
    assert_eq!(mux.len(), 2);

    let response = post_form(31040, "/_hostgate/clients/remove", "host=&all=true").await;
    assert!(response.contains("removing vhost:"), "response: {response}");
    assert!(mux.is_empty());
}

#[tokio::test]
async fn test_remove_unknown_host_reports_inline_error() {
    let (_shutdown, _mux) = start_daemon(31045, RetryPolicy::default()).await;

    let response = post_form(
        31045,
        "/_hostgate/clients/remove",
        "host=missing.local&all=false",
    )
    .await;
    assert!(response.contains("200 OK"), "response: {response}");
    assert!(
        response.contains("error: host 'missing.local' not found"),
        "response: {response}"
    );
}

// ============================================================================
// Log streaming
// ============================================================================

/// Read from the stream until the pattern shows up (or panic on timeout).
async fn read_until(stream: &mut TcpStream, buffer: &mut String, pattern: &str) {
    let deadline = Duration::from_secs(3);
    let start = std::time::Instant::now();
    let mut chunk = vec![0u8; 4096];
    while !buffer.contains(pattern) {
        assert!(
            start.elapsed() < deadline,
            "timed out waiting for {pattern:?}; got: {buffer}"
        );
        let n = tokio::time::timeout(deadline, stream.read(&mut chunk))
            .await
            .expect("read timed out")
            .expect("read failed");
        assert!(n > 0, "stream closed while waiting for {pattern:?}; got: {buffer}");
        buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
    }
}

#[tokio::test]
async fn test_stream_replays_history_then_live_lines() {
    let (_shutdown, _mux) = start_daemon(31050, RetryPolicy::default()).await;
    start_static_backend(31051, "ok").await;
    register(31050, "tail.local:31051").await;

    // generate two requests worth of history
    http_get_with_host(31050, "/first", "tail.local").await.unwrap();
    http_get_with_host(31050, "/second", "tail.local").await.unwrap();

    // attach a streaming listener (no Connection: close; the stream stays open)
    let mut stream = TcpStream::connect("127.0.0.1:31050").await.unwrap();
    let form = "host=tail.local";
    let request = format!(
        "POST /_hostgate/clients/stream HTTP/1.1\r\nHost: 127.0.0.1:31050\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{form}",
        form.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buffer = String::new();
    read_until(&mut stream, &mut buffer, "---").await;

    let (history, _) = buffer.split_once("---").unwrap();
    assert!(history.contains("/first"), "history: {history}");
    assert!(history.contains("/second"), "history: {history}");
    assert!(history.contains("[tail.local]"), "history: {history}");
    let first_at = history.find("/first").unwrap();
    let second_at = history.find("/second").unwrap();
    assert!(first_at < second_at, "history out of order: {history}");

    // a new request shows up as a live line after the separator
    http_get_with_host(31050, "/third", "tail.local").await.unwrap();
    read_until(&mut stream, &mut buffer, "/third").await;
    let (_, live) = buffer.split_once("---").unwrap();
    assert!(live.contains("/third"), "live: {live}");
}

#[tokio::test]
async fn test_stream_unknown_host_reports_inline_error() {
    let (_shutdown, _mux) = start_daemon(31055, RetryPolicy::default()).await;

    let response = post_form(31055, "/_hostgate/clients/stream", "host=missing.local").await;
    assert!(response.contains("200 OK"), "response: {response}");
    assert!(
        response.contains("error: host 'missing.local' not found"),
        "response: {response}"
    );
}

// ============================================================================
// CLI client against a live daemon
// ============================================================================

#[tokio::test]
async fn test_client_detects_daemon_and_manages_bindings() {
    let (_shutdown, mux) = start_daemon(31060, RetryPolicy::default()).await;

    let client = Client::new("127.0.0.1:31060");
    assert!(client.is_daemon_running().await);

    client
        .add_bindings(&["cli.local:31061".to_string()], true, &[])
        .await
        .unwrap();
    assert_eq!(mux.len(), 1);
    assert!(mux.lookup("cli.local").is_some());

    let listing = client.list_clients().await.unwrap();
    assert!(listing.contains("cli.local -> 127.0.0.1:31061"), "listing: {listing}");

    client.remove_vhost("cli.local", false).await.unwrap();
    assert!(mux.is_empty());
}

#[tokio::test]
async fn test_client_rejects_malformed_binding_before_any_call() {
    let client = Client::new("127.0.0.1:1"); // nothing listening here
    let result = client
        .add_bindings(&["bad-host".to_string()], true, &[])
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_client_probe_fails_without_daemon() {
    let client = Client::new("127.0.0.1:1");
    assert!(!client.is_daemon_running().await);
}
