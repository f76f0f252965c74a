//! Suspended multi-step work.
//!
//! Two kinds of operation outlive a single `perform` call: an interactive
//! negotiation waiting for the caller's next answer, and a result too large
//! for the caller's output buffer, handed out in chunks. Both park their
//! state in the engine's [`ContinuationRegistry`] under an opaque
//! [`ContinuationToken`] that the caller passes back.
use std::{collections::HashMap, fmt, sync::Mutex};

use log::{debug, trace};
use zeroize::Zeroizing;

use crate::{
    error::{Error, Result},
    sasl::AuthMethod,
};

/// Opaque handle returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContinuationToken(u64);

impl ContinuationToken {
    fn fresh() -> Self {
        Self(u64::from_be_bytes(crate::crypto::random_bytes::<8>()))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinuationKind {
    /// Remaining output of a finished operation.
    Payload,
    /// A negotiation on the owner's connection waiting for the caller.
    Interactive { method: AuthMethod, username: String },
}

pub struct Continuation {
    pub pass: u32,
    pub kind: ContinuationKind,
    /// Session that created it; nobody else may resume it.
    pub owner: u64,
    data: Zeroizing<Vec<u8>>,
    cursor: usize,
    secret: Zeroizing<Vec<u8>>,
}

impl Continuation {
    pub fn payload(owner: u64, data: Vec<u8>) -> Self {
        Self {
            pass: 0,
            kind: ContinuationKind::Payload,
            owner,
            data: Zeroizing::new(data),
            cursor: 0,
            secret: Zeroizing::new(Vec::new()),
        }
    }

    pub fn interactive(owner: u64, method: AuthMethod, username: &str, secret: &[u8]) -> Self {
        Self {
            pass: 0,
            kind: ContinuationKind::Interactive {
                method,
                username: username.to_string(),
            },
            owner,
            data: Zeroizing::new(Vec::new()),
            cursor: 0,
            secret: Zeroizing::new(secret.to_vec()),
        }
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    pub fn is_drained(&self) -> bool {
        self.remaining() == 0
    }

    /// Hands out at most `max` bytes and advances the cursor.
    pub fn next_chunk(&mut self, max: usize) -> Vec<u8> {
        let end = self.cursor.saturating_add(max).min(self.data.len());
        let chunk = self.data[self.cursor..end].to_vec();
        self.cursor = end;
        self.pass += 1;
        chunk
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("pass", &self.pass)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Process-wide table of parked continuations.
#[derive(Debug, Default)]
pub struct ContinuationRegistry {
    entries: Mutex<HashMap<ContinuationToken, Continuation>>,
}

impl ContinuationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, continuation: Continuation) -> Result<ContinuationToken> {
        let mut entries = self.entries.lock()?;
        let mut token = ContinuationToken::fresh();
        while entries.contains_key(&token) {
            token = ContinuationToken::fresh();
        }
        debug!("parking continuation {token} for session {}", continuation.owner);
        entries.insert(token, continuation);
        Ok(token)
    }

    /// Removes and returns the continuation if `owner` created it.
    pub fn take(&self, token: ContinuationToken, owner: u64) -> Result<Continuation> {
        let mut entries = self.entries.lock()?;
        match entries.get(&token) {
            Some(c) if c.owner == owner => entries.remove(&token).ok_or(Error::InvalidContinuation),
            _ => Err(Error::InvalidContinuation),
        }
    }

    /// Parks an advanced continuation again under its old token.
    pub fn put(&self, token: ContinuationToken, continuation: Continuation) -> Result<()> {
        trace!("re-parking continuation {token} (pass {})", continuation.pass);
        self.entries.lock()?.insert(token, continuation);
        Ok(())
    }

    /// Explicit cancellation; unknown tokens are not an error.
    pub fn remove(&self, token: ContinuationToken) -> Result<bool> {
        Ok(self.entries.lock()?.remove(&token).is_some())
    }

    /// Drops everything a closing session left behind.
    pub fn remove_owned(&self, owner: u64) -> Result<usize> {
        let mut entries = self.entries.lock()?;
        let before = entries.len();
        entries.retain(|_, c| c.owner != owner);
        Ok(before - entries.len())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.lock()?.len())
    }
}
