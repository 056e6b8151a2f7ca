//! Thin client for a running daemon
//!
//! A CLI invocation that finds a daemon already listening turns into a
//! client: it posts registrations, optionally supervises the backend
//! command, and renders the daemon's streamed log lines.

use crate::daemon::{CONTROL_PREFIX, PONG};
use crate::process::{run_command, Supervised};
use crate::vhost::Binding;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct Client {
    addr: String,
    http: reqwest::Client,
    command: Arc<Mutex<Option<Supervised>>>,
}

impl Client {
    pub fn new(addr: impl Into<String>) -> Client {
        Client {
            addr: addr.into(),
            http: reqwest::Client::new(),
            command: Arc::new(Mutex::new(None)),
        }
    }

    fn uri(&self, path: &str) -> String {
        format!("http://{}{}{}", self.addr, CONTROL_PREFIX, path)
    }

    /// Probe for a daemon on the configured address.
    pub async fn is_daemon_running(&self) -> bool {
        match self.http.get(self.uri("/hello")).send().await {
            Ok(res) if res.status().is_success() => res
                .text()
                .await
                .map(|body| body.trim() == PONG)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Start the supervised backend command, arranging for an interrupt at
    /// the CLI to stop it before the process exits.
    pub async fn run_command(&self, args: &[String]) -> anyhow::Result<()> {
        if args.is_empty() {
            return Ok(());
        }
        let supervised = run_command(args)?;
        *self.command.lock().await = Some(supervised);

        let command = Arc::clone(&self.command);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("[*] caught interrupt");
                if let Some(mut supervised) = command.lock().await.take() {
                    supervised.stop().await;
                }
                std::process::exit(0);
            }
        });
        Ok(())
    }

    /// Stop the supervised command, if one is still running.
    pub async fn stop_command(&self) {
        if let Some(mut supervised) = self.command.lock().await.take() {
            supervised.stop().await;
        }
    }

    /// Validate and register each binding, then tail the first hostname's
    /// logs unless detached.
    pub async fn add_bindings(
        &self,
        binds: &[String],
        detach: bool,
        args: &[String],
    ) -> anyhow::Result<()> {
        if binds.is_empty() {
            anyhow::bail!("must bind at least one hostname");
        }
        // surface malformed bindings before any network call
        for bind in binds {
            Binding::parse(bind)?;
        }

        self.run_command(args).await?;

        for bind in binds {
            if let Err(e) = self.add_binding(bind, detach).await {
                self.stop_command().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Register a single binding. Blocks tailing logs when `detach` is
    /// false; returns once the stream ends.
    async fn add_binding(&self, bind: &str, detach: bool) -> anyhow::Result<()> {
        let binding = Binding::parse(bind)?;
        println!("[*] registering vhost: https://{} -> {}", binding.hostname, bind);

        let res = self
            .http
            .post(self.uri("/clients/add"))
            .form(&[("binding", bind)])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("error registering client: {e}"))?;

        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if !body.is_empty() {
            print!("{body}");
        }
        if !status.is_success() {
            anyhow::bail!("registration failed for '{bind}'");
        }

        if !detach {
            self.tail(&binding.hostname, true).await?;
        }
        Ok(())
    }

    /// Stream a vhost's logs to stdout. With `follow` false, returns at the
    /// end-of-history separator.
    pub async fn tail(&self, hostname: &str, follow: bool) -> anyhow::Result<()> {
        let res = self
            .http
            .post(self.uri("/clients/stream"))
            .form(&[("host", hostname)])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("error contacting daemon: {e}"))?;

        println!("[*] streaming logs for {hostname}");

        let mut stream = res.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| anyhow::anyhow!("error reading from daemon: {e}"))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let line = line.trim_end_matches('\n');
                if line == "---" && !follow {
                    return Ok(());
                }
                println!("{line}");
            }
        }

        // a stream that ends with pending text is the daemon's inline error
        if !buffer.is_empty() {
            println!("{buffer}");
            if buffer.contains("error") {
                anyhow::bail!("daemon reported an error");
            }
        }
        println!("[*] daemon connection closed");
        Ok(())
    }

    /// Remove one vhost, or all of them.
    pub async fn remove_vhost(&self, hostname: &str, all: bool) -> anyhow::Result<()> {
        let res = self
            .http
            .post(self.uri("/clients/remove"))
            .form(&[("host", hostname), ("all", if all { "true" } else { "false" })])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("error contacting daemon: {e}"))?;

        let body = res.text().await.unwrap_or_default();
        let trimmed = body.trim();
        if !trimmed.is_empty() {
            println!("{trimmed}");
        }
        if trimmed.starts_with("error") {
            anyhow::bail!("{trimmed}");
        }
        Ok(())
    }

    /// Fetch the daemon's vhost enumeration.
    pub async fn list_clients(&self) -> anyhow::Result<String> {
        let res = self
            .http
            .get(self.uri("/clients"))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("error contacting daemon: {e}"))?;
        Ok(res.text().await?)
    }
}
