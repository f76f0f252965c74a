//! On-disk replica cache.
//!
//! The cache remembers every replica the engine has learned about, tagged
//! with the identity hash of the server key it presented, and which replica
//! answered last. Lookups are keyed by identity hash so that nodes pointing
//! at different server clusters never borrow each other's replicas.
//!
//! # Format
//!
//! A single bincode record ([`CacheFile`]) with a version byte, encoded with
//! big-endian fixed-width integers. Writes go to a sibling temporary file
//! that is then renamed over the cache, so readers never see a torn file.
use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_std_read, encode_into_std_write,
};
use log::{debug, info, warn};
use thiserror::Error;

use crate::crypto::IdentityHash;

use super::{ReplicaList, ServerEntry};

const CACHE_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to encode replica cache: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode replica cache: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("unsupported replica cache version {0}")]
    Version(u8),
    #[error("Cache IO Error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Default, Encode, Decode, PartialEq, Eq)]
struct CacheFile {
    version: u8,
    replicas: ReplicaList,
}

/// Replica cache at a fixed path.
#[derive(Clone)]
pub struct ReplicaCache {
    path: PathBuf,
    config: Configuration<BigEndian, Fixint>,
}

impl ReplicaCache {
    pub fn new(path: PathBuf) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        Self { path, config }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Everything in the cache; a missing file is an empty cache.
    pub fn load_all(&self) -> Result<ReplicaList, CacheError> {
        let f = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReplicaList::default()),
            Err(e) => return Err(e.into()),
        };
        let file: CacheFile = decode_from_std_read(&mut BufReader::new(f), self.config)?;
        if file.version != CACHE_VERSION {
            return Err(CacheError::Version(file.version));
        }
        Ok(file.replicas)
    }

    /// Entries usable for `hint`, the last contacted one first. A corrupt
    /// cache reads as empty.
    pub fn load(&self, hint: Option<&IdentityHash>) -> ReplicaList {
        let mut list = match self.load_all() {
            Ok(list) => list,
            Err(e) => {
                warn!("ignoring replica cache {}: {e}", self.path.display());
                return ReplicaList::default();
            }
        };
        list.retain_identity(hint);
        list.promote_last_contacted();
        debug!("{} cached replicas for {hint:?}", list.len());
        list
    }

    pub fn store(&self, replicas: &ReplicaList) -> Result<(), CacheError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            let file = CacheFile {
                version: CACHE_VERSION,
                replicas: replicas.clone(),
            };
            encode_into_std_write(file, &mut writer, self.config)?;
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Marks the winner as last contacted, learning its identity.
    pub fn record_success(
        &self,
        winner: &ServerEntry,
        identity: &IdentityHash,
    ) -> Result<(), CacheError> {
        let all = self.load_all().unwrap_or_default();
        // last-contacted is tracked per identity
        let (same, other): (Vec<_>, Vec<_>) = all
            .into_entries()
            .into_iter()
            .partition(|e| e.identity.as_ref().is_none_or(|id| id == identity));
        let mut same = ReplicaList::new(same);
        same.record_success(winner, identity);

        let mut entries = same.into_entries();
        entries.extend(other);
        let all = ReplicaList::new(entries);
        self.store(&all)?;
        info!("recorded {} as last contacted replica", winner.host());
        Ok(())
    }

    /// Adds replicas the server reported for `identity`.
    pub fn merge(&self, identity: &IdentityHash, entries: &ReplicaList) -> Result<(), CacheError> {
        let mut all = self.load_all().unwrap_or_default();
        let before = all.len();
        for entry in entries.entries() {
            let mut entry = entry.clone();
            entry.identity.get_or_insert_with(|| identity.clone());
            entry.from_node_name = false;
            entry.last_contacted = false;
            all.merge(entry);
        }
        if all.len() != before {
            debug!("learned {} new replicas", all.len() - before);
        }
        self.store(&all)
    }

    /// Forgets everything known about `identity`, or the whole cache.
    pub fn flush(&self, identity: Option<&IdentityHash>) -> Result<(), CacheError> {
        match identity {
            Some(identity) => {
                let mut all = self.load_all().unwrap_or_default();
                all.remove_identity(identity);
                self.store(&all)
            }
            None => match fs::remove_file(&self.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
        }
    }
}

impl std::fmt::Debug for ReplicaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaCache")
            .field("path", &self.path)
            .finish()
    }
}
