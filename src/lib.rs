//! Hostgate - a local reverse proxy for development
//!
//! This library provides a long-lived proxy daemon that:
//! - Routes HTTP(S) traffic based on Host header to localhost backends
//! - Registers hostname -> port bindings at runtime through a control API
//! - Provisions per-hostname TLS certificates and serves them by SNI
//! - Restarts its TLS listener whenever the set of certificates changes
//! - Keeps a bounded per-vhost request-log history and streams live logs
//!   to any number of attached CLI clients
//! - Supervises an optional backend command on the client side

pub mod cert;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod hosts;
pub mod logging;
pub mod process;
pub mod tls;
pub mod transport;
pub mod vhost;
