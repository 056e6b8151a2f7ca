//! Multi-certificate TLS configuration derived from the vhost registry
//!
//! The server config is immutable once built: any registry change that
//! affects the certificate set requires building a fresh config and
//! restarting the TLS listener with it. Server-name indication picks the
//! per-vhost certificate; handshakes for unknown names fall back to a
//! built-in self-signed certificate.

use crate::vhost::Vhost;
use rcgen::generate_simple_self_signed;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, ResolvesServerCertUsingSni};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Build a server config covering every vhost that has TLS material, plus
/// the default certificate for unmatched server names.
pub fn build_server_config(vhosts: &[Arc<Vhost>]) -> anyhow::Result<Arc<ServerConfig>> {
    let mut sni = ResolvesServerCertUsingSni::new();
    for vhost in vhosts {
        let Some((cert, key)) = vhost.tls_files() else {
            continue;
        };
        match load_certified_key(cert, key) {
            Ok(certified) => {
                if let Err(e) = sni.add(vhost.hostname(), certified) {
                    warn!(host = vhost.hostname(), error = %e, "skipping certificate");
                }
            }
            Err(e) => {
                warn!(host = vhost.hostname(), error = %e, "failed to load keypair");
            }
        }
    }

    let resolver = SniWithDefault {
        sni,
        default: Arc::new(default_certified_key()?),
    };
    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    Ok(Arc::new(config))
}

/// SNI resolver with a fallback certificate for unmatched names
struct SniWithDefault {
    sni: ResolvesServerCertUsingSni,
    default: Arc<CertifiedKey>,
}

impl std::fmt::Debug for SniWithDefault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SniWithDefault")
    }
}

impl ResolvesServerCert for SniWithDefault {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.sni
            .resolve(client_hello)
            .or_else(|| Some(Arc::clone(&self.default)))
    }
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> anyhow::Result<CertifiedKey> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let signing_key = any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("unsupported private key in {}: {e}", key_path.display()))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open certificate file {}: {e}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("failed to parse certificates from {}: {e}", path.display()))?;

    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }

    Ok(certs)
}

pub fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open key file {}: {e}", path.display()))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("failed to parse key from {}: {e}", path.display()))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("no private key found in {}", path.display())
}

/// Self-signed certificate answering handshakes for names with no
/// registered vhost.
fn default_certified_key() -> anyhow::Result<CertifiedKey> {
    let rcgen::CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .map_err(|e| anyhow::anyhow!("failed to generate default certificate: {e}"))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("failed to serialize default key: {e}"))?;
    let signing_key = any_supported_type(&key_der)
        .map_err(|e| anyhow::anyhow!("unsupported default key type: {e}"))?;

    Ok(CertifiedKey::new(vec![cert_der], signing_key))
}
