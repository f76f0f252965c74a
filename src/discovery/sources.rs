use std::{fs, io, path::Path};

use log::{debug, warn};

use crate::crypto::IdentityHash;

use super::{ReplicaList, ServerEntry, locator::split_host_port};

/// Where a candidate list came from, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    ReplicaFile,
    Cache,
    ReplicationDatabase,
    ZeroConf,
    NodeName,
    Localhost,
}

/// Zero-configuration service discovery, supplied by the host.
pub trait ServiceBrowser: Send + Sync {
    /// Password servers currently advertised on the local network.
    fn browse(&self) -> Vec<ServerEntry>;
}

/// A browser that never finds anything.
#[derive(Debug, Default)]
pub struct NoBrowser;

impl ServiceBrowser for NoBrowser {
    fn browse(&self) -> Vec<ServerEntry> {
        Vec::new()
    }
}

/// Parses the replica text format: one replica per line, `#` comments,
/// either a bare `ip[:port]` or `key=value` fields (`ip`, `dns`, `port`, `id`).
pub fn parse_replica_text(text: &str, default_port: u16) -> ReplicaList {
    let mut list = ReplicaList::default();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line, default_port) {
            Some(entry) => list.merge(entry),
            None => warn!("skipping malformed replica line {}: '{line}'", lineno + 1),
        }
    }
    list
}

fn parse_line(line: &str, default_port: u16) -> Option<ServerEntry> {
    if !line.contains('=') {
        let (host, port) = split_host_port(line, default_port).ok()?;
        return Some(ServerEntry::new(host, port));
    }

    let mut entry = ServerEntry::new("", default_port);
    for field in line.split_whitespace() {
        let (key, value) = field.split_once('=')?;
        match key {
            "ip" => entry.ip = value.to_string(),
            "dns" => entry.dns = value.to_string(),
            "port" => entry.port = value.parse().ok()?,
            "id" => entry.identity = Some(IdentityHash::new(value)),
            other => debug!("ignoring replica field '{other}'"),
        }
    }
    (!entry.ip.is_empty() || !entry.dns.is_empty()).then_some(entry)
}

/// Renders entries back into the replica text format.
pub fn render_replica_text(list: &ReplicaList) -> String {
    let mut out = String::new();
    for entry in list.entries() {
        out.push_str(&format!("port={}", entry.port));
        if !entry.ip.is_empty() {
            out.push_str(&format!(" ip={}", entry.ip));
        }
        if !entry.dns.is_empty() {
            out.push_str(&format!(" dns={}", entry.dns));
        }
        if let Some(id) = &entry.identity {
            out.push_str(&format!(" id={id}"));
        }
        out.push('\n');
    }
    out
}

/// Reads a replica file; a missing file is an empty source.
pub fn load_replica_file(path: &Path, default_port: u16) -> ReplicaList {
    match fs::read_to_string(path) {
        Ok(text) => parse_replica_text(&text, default_port),
        Err(e) if e.kind() == io::ErrorKind::NotFound => ReplicaList::default(),
        Err(e) => {
            warn!("cannot read replica file {}: {e}", path.display());
            ReplicaList::default()
        }
    }
}
