//! Engine-wide settings.
//!
//! [`EngineConfig`] is a plain struct with a usable [`Default`]; hosts
//! override individual fields. The `pwsc` binary fills it from its command
//! line.
use std::{collections::HashSet, env, path::PathBuf, time::Duration};

use crate::{
    discovery::{LocalNetwork, Tier},
    protocol::DEFAULT_PORT,
    sasl::AuthMethod,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Port used for replicas and node names that name none.
    pub default_port: u16,
    /// Replica cache file, rewritten after every successful resolution.
    pub cache_path: PathBuf,
    /// Manually provisioned replica list.
    pub replica_file: Option<PathBuf>,
    /// Replica list maintained by the local replication service.
    pub replication_db: Option<PathBuf>,
    /// Try `127.0.0.1` when every other source is exhausted.
    pub localhost_fallback: bool,

    /// Connect budget for one tier before it is split across candidates.
    pub connect_timeout: Duration,
    /// Smallest per-tier budget, indexed in [`Tier::ORDER`].
    pub tier_floors: [Duration; 4],
    pub receive_timeout: Duration,
    pub quit_timeout: Duration,
    /// Receive timeout while reading the greeting of a probed server.
    pub probe_timeout: Duration,
    pub probe_workers: usize,

    pub max_negotiation_steps: usize,
    /// Challenge each new server to prove it holds its private key.
    pub validate_identity: bool,
    /// Ask each validated server for its replica list.
    pub refresh_replicas: bool,
    /// Administrative methods allowed to reuse an earlier authentication
    /// for the same user instead of negotiating again.
    pub reuse_allow_list: HashSet<AuthMethod>,

    /// Where `SYNC PULL` stages its compressed payload.
    pub sync_dir: PathBuf,
    /// Networks counted as "same subnet"; detected when empty.
    pub local_networks: Vec<LocalNetwork>,
}

impl EngineConfig {
    pub fn tier_floor(&self, tier: Tier) -> Duration {
        let idx = Tier::ORDER.iter().position(|t| *t == tier).unwrap_or(0);
        self.tier_floors[idx]
    }

    pub fn allows_reuse(&self, method: AuthMethod) -> bool {
        self.reuse_allow_list.contains(&method)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let tmp = env::temp_dir();

        Self {
            default_port: DEFAULT_PORT,
            cache_path: tmp.join("pwsclient").join("replicas.cache"),
            replica_file: None,
            replication_db: None,
            localhost_fallback: true,
            connect_timeout: Duration::from_millis(750),
            tier_floors: [
                Duration::from_millis(100),
                Duration::from_millis(150),
                Duration::from_millis(250),
                Duration::from_millis(400),
            ],
            receive_timeout: Duration::from_secs(10),
            quit_timeout: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
            probe_workers: 16,
            max_negotiation_steps: 16,
            validate_identity: true,
            refresh_replicas: true,
            reuse_allow_list: AuthMethod::default_reuse_allow_list()
                .into_iter()
                .collect(),
            sync_dir: tmp,
            local_networks: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_port, 3659);
        assert_eq!(config.max_negotiation_steps, 16);
        assert!(config.tier_floor(Tier::Local) < config.tier_floor(Tier::Any));
        assert!(config.allows_reuse(AuthMethod::SetPassword));
        assert!(!config.allows_reuse(AuthMethod::ChangePassword));
    }
}
