use hostgate::cert::CertStore;
use hostgate::client::Client;
use hostgate::config::Config;
use hostgate::daemon::Daemon;
use hostgate::logging::LoggedHandler;
use hostgate::transport::RetryPolicy;
use hostgate::vhost::VhostMux;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostgate=info".parse().expect("valid log directive")),
        )
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
        std::process::exit(2);
    }
    let command = args.remove(0);

    match command.as_str() {
        "daemon" => run_daemon(args).await,
        "connect" => run_connect(args).await,
        "list" => run_list(args).await,
        "tail" => run_tail(args).await,
        "remove" => run_remove(args).await,
        "version" | "-V" | "--version" => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "-h" | "--help" => {
            usage();
            Ok(())
        }
        other => {
            eprintln!("error: unknown command '{other}'\n");
            usage();
            std::process::exit(2);
        }
    }
}

fn usage() {
    eprintln!(
        "usage: hostgate <command> [options]\n\n\
         commands:\n  \
         daemon  [--config <path>]                 run the proxy daemon in the foreground\n  \
         connect <host:port>... [--detach] [-- <command>...]\n                                            \
         register vhost bindings with a running daemon\n  \
         list                                      list registered vhosts\n  \
         tail    <host> [--no-follow]              stream a vhost's request log\n  \
         remove  <host> | --all                    remove one or all vhosts\n  \
         version                                   print version"
    );
}

/// Remove a `--flag value` pair from the argument list, returning the value.
fn take_flag_value(args: &mut Vec<String>, flag: &str) -> Option<String> {
    let index = args.iter().position(|a| a == flag)?;
    if index + 1 >= args.len() {
        return None;
    }
    let value = args.remove(index + 1);
    args.remove(index);
    Some(value)
}

/// Remove a bare `--flag` from the argument list, returning whether it was
/// present.
fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    match args.iter().position(|a| a == flag) {
        Some(index) => {
            args.remove(index);
            true
        }
        None => false,
    }
}

async fn run_daemon(mut args: Vec<String>) -> anyhow::Result<()> {
    let config_path = take_flag_value(&mut args, "--config");
    let config = Config::load_or_default(config_path.as_deref())?;
    let server = config.server;

    let certs = if server.tls_enabled() {
        Some(CertStore::new(server.cert_dir()))
    } else {
        None
    };
    let retry = RetryPolicy::with_ceiling(Duration::from_secs(server.retry_ceiling_secs));
    let mux = Arc::new(VhostMux::new(certs).with_retry(retry));
    let handler = Arc::new(LoggedHandler::new(mux));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = Daemon::new(
        handler,
        server.listen.clone(),
        server.http,
        server.https,
        shutdown_rx,
    );

    let mut daemon_handle = tokio::spawn(daemon.run());

    tokio::select! {
        // a bind failure at startup is fatal
        result = &mut daemon_handle => {
            return result.map_err(|e| anyhow::anyhow!("daemon task failed: {e}"))?;
        }
        _ = shutdown_signal() => {}
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), daemon_handle).await;
    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down..."),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received Ctrl+C, shutting down...");
}

fn client_from_config(config: &Config) -> Client {
    Client::new(config.client.daemon_addr())
}

async fn require_daemon(client: &Client, addr: &str) -> anyhow::Result<()> {
    if !client.is_daemon_running().await {
        anyhow::bail!("cannot reach daemon at {addr} (start one with `hostgate daemon`)");
    }
    Ok(())
}

async fn run_connect(mut args: Vec<String>) -> anyhow::Result<()> {
    let config_path = take_flag_value(&mut args, "--config");
    let detach = take_flag(&mut args, "--detach");

    // everything after `--` is the backend command to supervise
    let command = match args.iter().position(|a| a == "--") {
        Some(index) => {
            let command = args.split_off(index + 1);
            args.pop(); // the `--` itself
            command
        }
        None => Vec::new(),
    };

    if args.is_empty() {
        anyhow::bail!("must bind at least one hostname (e.g. `hostgate connect app.local:7000`)");
    }

    let config = Config::load_or_default(config_path.as_deref())?;
    let addr = config.client.daemon_addr();
    let client = client_from_config(&config);
    require_daemon(&client, &addr).await?;

    client.add_bindings(&args, detach, &command).await
}

async fn run_list(mut args: Vec<String>) -> anyhow::Result<()> {
    let config_path = take_flag_value(&mut args, "--config");
    let config = Config::load_or_default(config_path.as_deref())?;
    let addr = config.client.daemon_addr();
    let client = client_from_config(&config);
    require_daemon(&client, &addr).await?;

    print!("{}", client.list_clients().await?);
    Ok(())
}

async fn run_tail(mut args: Vec<String>) -> anyhow::Result<()> {
    let config_path = take_flag_value(&mut args, "--config");
    let follow = !take_flag(&mut args, "--no-follow");
    let Some(hostname) = args.first() else {
        anyhow::bail!("usage: hostgate tail <host> [--no-follow]");
    };

    let config = Config::load_or_default(config_path.as_deref())?;
    let addr = config.client.daemon_addr();
    let client = client_from_config(&config);
    require_daemon(&client, &addr).await?;

    client.tail(hostname, follow).await
}

async fn run_remove(mut args: Vec<String>) -> anyhow::Result<()> {
    let config_path = take_flag_value(&mut args, "--config");
    let all = take_flag(&mut args, "--all");
    let hostname = args.first().cloned().unwrap_or_default();
    if hostname.is_empty() && !all {
        anyhow::bail!("usage: hostgate remove <host> | --all");
    }

    let config = Config::load_or_default(config_path.as_deref())?;
    let addr = config.client.daemon_addr();
    let client = client_from_config(&config);
    require_daemon(&client, &addr).await?;

    client.remove_vhost(&hostname, all).await
}
