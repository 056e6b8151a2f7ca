//! Per-hostname certificate provisioning via the mkcert utility
//!
//! The daemon does not manage a certificate authority itself; it shells out
//! to mkcert, which keeps the CA root in `$CAROOT` and installs it into the
//! OS trust store. Generated leaf certificates are cached on disk and
//! reused across registrations and daemon restarts.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Directory where generated certificates are cached.
///
/// `$CERT_PATH` overrides the default of `~/.hostgate`; the elevation path
/// passes it through sudo so a re-executed daemon finds the same cache.
pub fn cert_path() -> PathBuf {
    if let Ok(path) = std::env::var("CERT_PATH") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs_next::home_dir()
        .map(|home| home.join(".hostgate"))
        .unwrap_or_else(|| PathBuf::from(".hostgate"))
}

/// CA root directory handed to mkcert, if configured.
pub fn caroot_path() -> Option<String> {
    std::env::var("CAROOT").ok().filter(|path| !path.is_empty())
}

fn mkcert_binary() -> String {
    std::env::var("MKCERT_BIN").unwrap_or_else(|_| "mkcert".to_string())
}

/// On-disk store of per-hostname certificates.
#[derive(Debug, Clone)]
pub struct CertStore {
    dir: PathBuf,
}

impl CertStore {
    pub fn new(dir: impl Into<PathBuf>) -> CertStore {
        CertStore { dir: dir.into() }
    }

    /// Store rooted at [`cert_path`].
    pub fn default_store() -> CertStore {
        CertStore::new(cert_path())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn cert_file(&self, host: &str) -> PathBuf {
        self.dir.join(format!("{host}.pem"))
    }

    fn key_file(&self, host: &str) -> PathBuf {
        self.dir.join(format!("{host}-key.pem"))
    }

    /// Certificate and key paths for the hostname, generating them with
    /// mkcert when not already cached.
    pub async fn obtain(&self, host: &str) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(&self.dir).map_err(|e| Error::CertProvisionFailed {
            host: host.to_string(),
            reason: format!("cannot create {}: {e}", self.dir.display()),
        })?;

        let cert = self.cert_file(host);
        let key = self.key_file(host);
        if cert.exists() && key.exists() {
            debug!(host, cert = %cert.display(), "reusing cached certificate");
            return Ok((cert, key));
        }

        let mut cmd = Command::new(mkcert_binary());
        cmd.arg("-cert-file")
            .arg(&cert)
            .arg("-key-file")
            .arg(&key)
            .arg(host);
        if let Some(caroot) = caroot_path() {
            cmd.env("CAROOT", caroot);
        }

        let output = cmd.output().await.map_err(|e| Error::CertProvisionFailed {
            host: host.to_string(),
            reason: format!("failed to run {}: {e}", mkcert_binary()),
        })?;

        if !output.status.success() {
            return Err(Error::CertProvisionFailed {
                host: host.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(host, cert = %cert.display(), "generated certificate");
        Ok((cert, key))
    }
}
