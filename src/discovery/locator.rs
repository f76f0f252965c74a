use std::fmt;

use crate::{
    crypto::IdentityHash,
    error::{Error, Result},
};

use super::ServerEntry;

const NODE_PREFIX: &str = "/PasswordServer";

/// Where a directory node says its password server lives:
/// `/PasswordServer[/only]/<host>[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLocator {
    pub host: String,
    pub port: u16,
    /// Only the node's own server may be used; configured replicas,
    /// caches and discovery are skipped.
    pub node_only: bool,
}

impl NodeLocator {
    pub fn parse(node: &str, default_port: u16) -> Result<Self> {
        let rest = node
            .trim()
            .strip_prefix(NODE_PREFIX)
            .ok_or_else(|| Error::Parameter(format!("'{node}' is not a password server node")))?;
        let rest = rest.trim_start_matches('/');
        let (node_only, target) = match rest.split_once('/') {
            Some(("only", target)) => (true, target),
            Some(_) => return Err(Error::Parameter(format!("unexpected path in '{node}'"))),
            None => (false, rest),
        };
        if target.is_empty() {
            return Err(Error::Parameter(format!("'{node}' names no server")));
        }

        let (host, port) = split_host_port(target, default_port)?;
        Ok(Self {
            host,
            port,
            node_only,
        })
    }

    pub fn entry(&self) -> ServerEntry {
        let mut entry = if self.host.parse::<std::net::IpAddr>().is_ok() {
            ServerEntry::new(&self.host, self.port)
        } else {
            ServerEntry::new("", self.port).with_dns(&self.host)
        };
        entry.from_node_name = true;
        entry
    }
}

impl fmt::Display for NodeLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let only = if self.node_only { "/only" } else { "" };
        if self.host.contains(':') {
            write!(f, "{NODE_PREFIX}{only}/[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{NODE_PREFIX}{only}/{}:{}", self.host, self.port)
        }
    }
}

/// `host`, `host:port`, `[v6]` or `[v6]:port`.
pub(crate) fn split_host_port(text: &str, default_port: u16) -> Result<(String, u16)> {
    let parse_port = |p: &str| {
        p.parse::<u16>()
            .map_err(|_| Error::Parameter(format!("bad port in '{text}'")))
    };

    if let Some(rest) = text.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::Parameter(format!("unterminated address '{text}'")))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port(p)?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match text.rsplit_once(':') {
        // a bare IPv6 address has more than one colon
        Some((host, port)) if !host.contains(':') => Ok((host.to_string(), parse_port(port)?)),
        _ => Ok((text.to_string(), default_port)),
    }
}

/// Splits `name,<qualifier>`; the qualifier names the server identity.
pub fn strip_qualifier(username: &str) -> (&str, Option<&str>) {
    match username.split_once(',') {
        Some((name, qualifier)) => (name, Some(qualifier).filter(|q| !q.is_empty())),
        None => (username, None),
    }
}

/// Identity hint carried by a qualified username.
pub fn identity_hint(username: &str) -> Option<IdentityHash> {
    strip_qualifier(username).1.map(IdentityHash::from_qualifier)
}
