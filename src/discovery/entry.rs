use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use bincode::{Decode, Encode};
use log::debug;

use crate::crypto::IdentityHash;

/// One candidate replica.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ServerEntry {
    pub ip: String,
    pub dns: String,
    pub port: u16,
    pub identity: Option<IdentityHash>,
    /// Came from the node name itself; connect directly instead of probing.
    pub from_node_name: bool,
    pub last_contacted: bool,
}

impl ServerEntry {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            dns: String::new(),
            port,
            identity: None,
            from_node_name: false,
            last_contacted: false,
        }
    }

    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    pub fn with_dns(mut self, dns: impl Into<String>) -> Self {
        self.dns = dns.into();
        self
    }

    pub fn with_identity(mut self, identity: Option<IdentityHash>) -> Self {
        self.identity = identity;
        self
    }

    /// Human readable host, preferring the address.
    pub fn host(&self) -> &str {
        if self.ip.is_empty() { &self.dns } else { &self.ip }
    }

    /// Same replica: equal address (or name, when unaddressed) and port.
    pub fn same_server(&self, other: &ServerEntry) -> bool {
        self.port == other.port
            && if !self.ip.is_empty() && !other.ip.is_empty() {
                self.ip == other.ip
            } else {
                !self.dns.is_empty() && self.dns.eq_ignore_ascii_case(&other.dns)
            }
    }

    /// Resolves the entry to socket addresses, using DNS only when no
    /// literal address is known.
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        if let Ok(ip) = self.ip.parse::<IpAddr>() {
            return vec![SocketAddr::new(ip, self.port)];
        }
        let name = if self.dns.is_empty() { &self.ip } else { &self.dns };
        if name.is_empty() {
            return Vec::new();
        }
        match (name.as_str(), self.port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                debug!("cannot resolve {name}: {e}");
                Vec::new()
            }
        }
    }

    /// An identity hint rules the entry out only when both sides are known
    /// and disagree.
    pub fn matches_identity(&self, hint: Option<&IdentityHash>) -> bool {
        match (hint, &self.identity) {
            (Some(hint), Some(id)) => hint == id,
            _ => true,
        }
    }
}

/// Ordered candidate list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct ReplicaList(Vec<ServerEntry>);

impl ReplicaList {
    pub fn new(entries: Vec<ServerEntry>) -> Self {
        Self(entries)
    }

    pub fn entries(&self) -> &[ServerEntry] {
        &self.0
    }

    pub fn into_entries(self) -> Vec<ServerEntry> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Adds or refreshes an entry; known fields are never erased.
    pub fn merge(&mut self, entry: ServerEntry) {
        match self.0.iter_mut().find(|e| e.same_server(&entry)) {
            Some(existing) => {
                if existing.dns.is_empty() {
                    existing.dns = entry.dns;
                }
                if existing.ip.is_empty() {
                    existing.ip = entry.ip;
                }
                if entry.identity.is_some() {
                    existing.identity = entry.identity;
                }
            }
            None => self.0.push(entry),
        }
    }

    /// Moves the previously successful entry to the front.
    pub fn promote_last_contacted(&mut self) {
        if let Some(pos) = self.0.iter().position(|e| e.last_contacted) {
            let entry = self.0.remove(pos);
            self.0.insert(0, entry);
        }
    }

    /// Marks `winner` as last contacted and fills in its identity.
    pub fn record_success(&mut self, winner: &ServerEntry, identity: &IdentityHash) {
        let mut found = false;
        for entry in self.0.iter_mut() {
            entry.last_contacted = entry.same_server(winner);
            if entry.last_contacted {
                found = true;
                if entry.identity.is_none() {
                    entry.identity = Some(identity.clone());
                }
            }
        }
        if !found {
            let mut entry = winner.clone();
            entry.last_contacted = true;
            entry.from_node_name = false;
            entry.identity.get_or_insert_with(|| identity.clone());
            self.0.insert(0, entry);
        }
    }

    pub fn retain_identity(&mut self, hint: Option<&IdentityHash>) {
        self.0.retain(|e| e.matches_identity(hint));
    }

    pub fn remove_identity(&mut self, identity: &IdentityHash) {
        self.0.retain(|e| e.identity.as_ref() != Some(identity));
    }
}

impl FromIterator<ServerEntry> for ReplicaList {
    fn from_iter<T: IntoIterator<Item = ServerEntry>>(iter: T) -> Self {
        let mut list = ReplicaList::default();
        for entry in iter {
            list.merge(entry);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> IdentityHash {
        IdentityHash::new(s)
    }

    #[test]
    fn merge_deduplicates_and_keeps_known_fields() {
        let mut list = ReplicaList::default();
        list.merge(ServerEntry::new("10.0.0.5", 3659).with_dns("pws.example.com"));
        list.merge(ServerEntry::new("10.0.0.5", 3659).with_identity(Some(id("aa"))));
        list.merge(ServerEntry::new("10.0.0.6", 3659));

        assert_eq!(list.len(), 2);
        assert_eq!(list.entries()[0].dns, "pws.example.com");
        assert_eq!(list.entries()[0].identity, Some(id("aa")));
    }

    #[test]
    fn promote_moves_last_contacted_first() {
        let mut second = ServerEntry::new("10.0.0.2", 1);
        second.last_contacted = true;
        let mut list = ReplicaList::new(vec![ServerEntry::new("10.0.0.1", 1), second]);

        list.promote_last_contacted();
        assert_eq!(list.entries()[0].ip, "10.0.0.2");
    }

    #[test]
    fn record_success_marks_single_winner() {
        let mut list = ReplicaList::new(vec![
            ServerEntry::new("10.0.0.1", 1),
            ServerEntry::new("10.0.0.2", 1),
        ]);
        list.record_success(&ServerEntry::new("10.0.0.2", 1), &id("bb"));

        assert!(!list.entries()[0].last_contacted);
        assert!(list.entries()[1].last_contacted);
        assert_eq!(list.entries()[1].identity, Some(id("bb")));

        list.record_success(&ServerEntry::new("10.0.0.9", 1), &id("bb"));
        assert_eq!(list.len(), 3);
        assert_eq!(list.entries()[0].ip, "10.0.0.9");
        assert_eq!(list.entries().iter().filter(|e| e.last_contacted).count(), 1);
    }

    #[test]
    fn identity_filter_keeps_unknowns() {
        let mut list = ReplicaList::new(vec![
            ServerEntry::new("10.0.0.1", 1).with_identity(Some(id("aa"))),
            ServerEntry::new("10.0.0.2", 1).with_identity(Some(id("bb"))),
            ServerEntry::new("10.0.0.3", 1),
        ]);
        list.retain_identity(Some(&id("aa")));
        let ips: Vec<&str> = list.entries().iter().map(|e| e.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.3"]);
    }

    #[test]
    fn literal_address_skips_dns() {
        let entry = ServerEntry::new("192.0.2.7", 3659).with_dns("does-not-resolve.invalid");
        assert_eq!(
            entry.socket_addrs(),
            vec!["192.0.2.7:3659".parse::<SocketAddr>().unwrap()]
        );
    }
}
