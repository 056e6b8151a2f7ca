//! Best-effort system hosts-file entries for registered vhosts
//!
//! Registration appends a loopback entry so browsers resolve the virtual
//! hostname without DNS. Failure here (typically a permission error when
//! the daemon is not root) is reported as a warning by the caller, never
//! as a registration failure. Entries are not removed when a vhost is.

use std::io::Write;
use std::path::Path;

const HOSTS_FILE: &str = "/etc/hosts";

/// Append `127.0.0.1 <hostname>` to the system hosts file unless an entry
/// already names the host.
pub fn ensure_host_entry(hostname: &str) -> std::io::Result<()> {
    ensure_entry_in(Path::new(HOSTS_FILE), hostname)
}

fn ensure_entry_in(path: &Path, hostname: &str) -> std::io::Result<()> {
    let contents = std::fs::read_to_string(path)?;
    if contains_host(&contents, hostname) {
        return Ok(());
    }
    let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
    writeln!(file, "127.0.0.1\t{hostname}")?;
    Ok(())
}

fn contains_host(contents: &str, hostname: &str) -> bool {
    contents
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .any(|line| line.split_whitespace().skip(1).any(|name| name == hostname))
}
