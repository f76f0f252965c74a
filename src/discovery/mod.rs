//! Replica discovery: from "which node" to "which live server".
//!
//! A directory node names one password server, but that server is usually one
//! of several replicas holding the same account database. Discovery collects
//! candidates from several sources and races them by network locality so the
//! nearest reachable replica answers first.
//!
//! # Overview
//!
//! Sources are consulted in a fixed order and the first one that produces a
//! reachable candidate wins:
//!
//! 1. the configured replica file (skipped for `/only` nodes),
//! 2. the local replica cache, last contacted replica first,
//! 3. the replication database file,
//! 4. zero-configuration discovery through a host supplied [`ServiceBrowser`],
//! 5. the server named by the node itself,
//! 6. `127.0.0.1` on the default port, unless this is a second attempt.
//!
//! Within a source, candidates are split into [`Tier`]s (this host, same
//! subnet, private ranges, anything else) and each tier is raced in turn:
//! every candidate is probed at once and the first answer wins. The tier's
//! wait shrinks as its candidate count grows, but never below the tier floor.
//!
//! An identity hint (from a `name,<qualifier>` username) removes candidates
//! whose cached identity disagrees with it.
//!
//! # Key Components
//!
//! - [`Discovery`]: the resolver, owning the probe worker pool and the cache.
//! - [`ServerEntry`] / [`ReplicaList`]: candidates.
//! - [`ReplicaCache`]: bincode file of known replicas keyed by identity.
//! - [`NodeLocator`]: parsed `/PasswordServer[/only]/host[:port]` node names.
//!
//! # See Also
//!
//! - [`handshake`](crate::handshake): what happens on the winning connection.
mod cache;
mod entry;
mod locality;
mod locator;
mod probe;
mod sources;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    sync::Mutex,
};

use log::{debug, info, warn};

use crate::{
    config::EngineConfig,
    crypto::IdentityHash,
    error::{Error, Result},
    protocol::thread::WorkerPool,
};

pub use cache::{CacheError, ReplicaCache};
pub use entry::{ReplicaList, ServerEntry};
pub use locality::{LocalNetwork, Locality, Tier};
pub use locator::{NodeLocator, identity_hint, strip_qualifier};
pub use probe::{Candidate, ProbeKind, Resolved, race, tier_budget};
pub use sources::{
    NoBrowser, ServiceBrowser, Source, load_replica_file, parse_replica_text,
    render_replica_text,
};

/// A resolved server together with where it was found.
#[derive(Debug)]
pub struct Resolution {
    pub server: Resolved,
    pub source: Source,
    /// The candidate list the winner was drawn from.
    pub candidates: ReplicaList,
}

pub struct Discovery {
    config: EngineConfig,
    locality: Locality,
    pool: WorkerPool,
    browser: Box<dyn ServiceBrowser>,
    cache: Mutex<ReplicaCache>,
}

impl Discovery {
    pub fn new(config: EngineConfig, browser: Box<dyn ServiceBrowser>) -> Self {
        let locality = if config.local_networks.is_empty() {
            Locality::detect()
        } else {
            let addrs = config
                .local_networks
                .iter()
                .map(|n| IpAddr::V4(n.addr))
                .collect();
            Locality::new(addrs, config.local_networks.clone())
        };
        let pool = WorkerPool::new(config.probe_workers);
        let cache = Mutex::new(ReplicaCache::new(config.cache_path.clone()));

        Self {
            config,
            locality,
            pool,
            browser,
            cache,
        }
    }

    pub fn locality(&self) -> &Locality {
        &self.locality
    }

    /// Finds one reachable server for `locator`.
    pub fn resolve(
        &self,
        locator: &NodeLocator,
        hint: Option<&IdentityHash>,
        second_attempt: bool,
    ) -> Result<Resolution> {
        info!("resolving {locator} (hint {hint:?}, second attempt {second_attempt})");

        if !locator.node_only {
            for source in [
                Source::ReplicaFile,
                Source::Cache,
                Source::ReplicationDatabase,
                Source::ZeroConf,
            ] {
                let mut candidates = self.candidates(source, hint)?;
                candidates.retain_identity(hint);
                if candidates.is_empty() {
                    continue;
                }
                if let Some(resolution) = self.race_tiers(source, candidates) {
                    return Ok(resolution);
                }
            }
        }

        let named = ReplicaList::new(vec![locator.entry()]);
        if let Some(resolution) = self.race_tiers(Source::NodeName, named) {
            return Ok(resolution);
        }

        if self.config.localhost_fallback && !second_attempt && !locator.node_only {
            let entry = ServerEntry::localhost(self.config.default_port);
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), entry.port);
            warn!("no replica answered; falling back to {addr}");
            return Ok(Resolution {
                server: Resolved {
                    entry: entry.clone(),
                    addr,
                    stream: None,
                },
                source: Source::Localhost,
                candidates: ReplicaList::new(vec![entry]),
            });
        }

        Err(Error::NoServerFound)
    }

    fn candidates(&self, source: Source, hint: Option<&IdentityHash>) -> Result<ReplicaList> {
        let port = self.config.default_port;
        let from_file = |path: Option<&Path>| {
            path.map(|p| load_replica_file(p, port)).unwrap_or_default()
        };

        Ok(match source {
            Source::ReplicaFile => from_file(self.config.replica_file.as_deref()),
            Source::Cache => self.cache.lock()?.load(hint),
            Source::ReplicationDatabase => from_file(self.config.replication_db.as_deref()),
            Source::ZeroConf => self.browser.browse().into_iter().collect(),
            Source::NodeName | Source::Localhost => ReplicaList::default(),
        })
    }

    fn race_tiers(&self, source: Source, candidates: ReplicaList) -> Option<Resolution> {
        let mut by_tier: Vec<(Tier, Candidate)> = Vec::new();
        for entry in candidates.entries() {
            for addr in entry.socket_addrs() {
                let tier = self.locality.classify(addr.ip());
                let kind = if tier == Tier::Local || entry.from_node_name {
                    ProbeKind::Connect
                } else {
                    ProbeKind::Datagram
                };
                by_tier.push((
                    tier,
                    Candidate {
                        entry: entry.clone(),
                        addr,
                        kind,
                    },
                ));
            }
        }
        debug!("{source:?}: {} candidate addresses", by_tier.len());

        for tier in Tier::ORDER {
            let round: Vec<Candidate> = by_tier
                .iter()
                .filter(|(t, _)| *t == tier)
                .map(|(_, c)| c.clone())
                .collect();
            if round.is_empty() {
                continue;
            }

            let budget = tier_budget(
                self.config.connect_timeout,
                self.config.tier_floor(tier),
                round.len(),
            );
            debug!("{source:?}: racing {} in tier {tier:?} for {budget:?}", round.len());
            if let Some(server) = race(&self.pool, round, budget) {
                info!("{} answered from {source:?} in tier {tier:?}", server.addr);
                return Some(Resolution {
                    server,
                    source,
                    candidates,
                });
            }
        }
        None
    }

    /// Remembers the validated winner in the cache.
    pub fn record_success(&self, winner: &ServerEntry, identity: &IdentityHash) -> Result<()> {
        Ok(self.cache.lock()?.record_success(winner, identity)?)
    }

    /// Adds replicas a validated server reported.
    pub fn merge_replicas(&self, identity: &IdentityHash, replicas: &ReplicaList) -> Result<()> {
        Ok(self.cache.lock()?.merge(identity, replicas)?)
    }

    /// Drops cached replicas for `identity` (or everything).
    pub fn flush(&self, identity: Option<&IdentityHash>) -> Result<()> {
        info!("flushing replica cache for {identity:?}");
        Ok(self.cache.lock()?.flush(identity)?)
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("locality", &self.locality)
            .field("workers", &self.pool.size())
            .finish()
    }
}
