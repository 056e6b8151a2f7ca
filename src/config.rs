use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Global configuration for the daemon and its CLI clients
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Daemon listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Settings used when acting as a client of a running daemon
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_listen_host")]
    pub listen: String,

    /// HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_http_port")]
    pub http: u16,

    /// HTTPS port (default: 443, set to 0 to disable TLS entirely)
    #[serde(default = "default_https_port")]
    pub https: u16,

    /// Directory for cached per-hostname certificates
    /// (default: `$CERT_PATH`, else `~/.hostgate`)
    pub cert_path: Option<String>,

    /// Total elapsed time allowed for upstream retries, in seconds
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Daemon host to connect to (default: 127.0.0.1)
    #[serde(default = "default_listen_host")]
    pub host: String,

    /// Daemon HTTP port to connect to (default: 80)
    #[serde(default = "default_http_port")]
    pub http: u16,
}

impl ServerConfig {
    pub fn http_enabled(&self) -> bool {
        self.http > 0
    }

    pub fn tls_enabled(&self) -> bool {
        self.https > 0
    }

    /// Certificate cache directory, falling back to the environment default.
    pub fn cert_dir(&self) -> PathBuf {
        self.cert_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(crate::cert::cert_path)
    }
}

impl ClientConfig {
    pub fn daemon_addr(&self) -> String {
        format!("{}:{}", self.host, self.http)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_host(),
            http: default_http_port(),
            https: default_https_port(),
            cert_path: None,
            retry_ceiling_secs: default_retry_ceiling(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            http: default_http_port(),
        }
    }
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_retry_ceiling() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Load the first discovered config file, or defaults when none exists.
    pub fn load_or_default(explicit: Option<&str>) -> anyhow::Result<Config> {
        match find_config(explicit) {
            Some(path) => Config::load(&path),
            None => {
                if let Some(path) = explicit {
                    anyhow::bail!("config file not found: {path}");
                }
                Ok(Config::default())
            }
        }
    }
}

/// Locate a config file: the explicit path first, then `~/.hostgate.conf`,
/// then the system-wide locations. A missing `.conf` candidate is retried
/// with a `.toml` extension.
pub fn find_config(explicit: Option<&str>) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = explicit {
        candidates.push(PathBuf::from(path));
    }
    if let Some(home) = dirs_next::home_dir() {
        candidates.push(home.join(".hostgate.conf"));
    }
    candidates.push(PathBuf::from("/usr/local/etc/hostgate.conf"));
    candidates.push(PathBuf::from("/usr/etc/hostgate.conf"));
    first_existing(&candidates)
}

fn first_existing(candidates: &[PathBuf]) -> Option<PathBuf> {
    for candidate in candidates {
        if candidate.exists() {
            return Some(candidate.clone());
        }
        if candidate.extension().is_some_and(|ext| ext == "conf") {
            let toml_sibling = candidate.with_extension("toml");
            if toml_sibling.exists() {
                return Some(toml_sibling);
            }
        }
    }
    None
}
