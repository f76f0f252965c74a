//! Per-node session context.
//!
//! A [`Session`] is created when a host opens a directory node and torn down
//! exactly once when it closes it. It owns the connection to the chosen
//! replica, the server's key, both framing keys, the cached credentials and
//! any continuation left pending. Every command/reply exchange and the
//! teardown itself run under the session's state lock, so two threads never
//! interleave lines on one socket and a close racing another close is a
//! no-op.
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use log::{debug, info, warn};
use tempfile::TempPath;
use zeroize::Zeroize;

use crate::{
    continuation::{ContinuationRegistry, ContinuationToken},
    crypto::{IdentityHash, ServerKey, SessionCipher},
    discovery::{NodeLocator, ReplicaList, ServerEntry, strip_qualifier},
    error::{Error, Result},
    protocol::Connection,
    sasl::Credentials,
};

/// A username and secret remembered after a successful negotiation.
///
/// The username is stored without its `,<qualifier>`. The secret is wiped in
/// place before its buffer is released.
#[derive(Default)]
pub struct CredentialCache {
    username: String,
    secret: Box<[u8]>,
    success: bool,
    can_set_password: bool,
}

impl CredentialCache {
    pub fn store(&mut self, username: &str, secret: &[u8], can_set_password: bool) {
        self.wipe();
        self.username = strip_qualifier(username).0.to_string();
        self.secret = secret.into();
        self.success = true;
        self.can_set_password = can_set_password;
    }

    /// True when it holds a successful login for `username` (qualifier ignored).
    pub fn matches(&self, username: &str) -> bool {
        self.success && self.username == strip_qualifier(username).0
    }

    pub fn is_set(&self) -> bool {
        self.success
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn can_set_password(&self) -> bool {
        self.can_set_password
    }

    /// Zeroes the secret without releasing it.
    pub fn wipe(&mut self) {
        self.secret.as_mut().zeroize();
        self.username.zeroize();
        self.success = false;
        self.can_set_password = false;
    }
}

impl Credentials for CredentialCache {
    fn username(&self) -> &str {
        &self.username
    }

    fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl Drop for CredentialCache {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("username", &self.username)
            .field("success", &self.success)
            .finish()
    }
}

/// Everything guarded by the session lock.
#[derive(Default)]
pub struct SessionState {
    /// `None` exactly when there is no live connection.
    pub connection: Option<Connection>,
    pub server: Option<ServerEntry>,
    pub server_key: Option<ServerKey>,
    pub mechanisms: Vec<String>,
    /// Key for the bulk sync channel, separate from command framing.
    pub sync_cipher: Option<SessionCipher>,
    pub primary: CredentialCache,
    pub acting_as: CredentialCache,
    /// User the live connection is authenticated as.
    pub authenticated: Option<String>,
    pub replicas: ReplicaList,
    pub continuation: Option<ContinuationToken>,
    pub bytes_pushed: u64,
    pub sync_file: Option<TempPath>,
    pub(crate) closed: bool,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// The command framing key is set once validation succeeded.
    pub fn is_encrypted(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_encrypted)
    }

    pub fn identity(&self) -> Option<&IdentityHash> {
        self.server_key.as_ref().map(ServerKey::identity)
    }

    pub fn connection(&mut self) -> Result<&mut Connection> {
        self.connection
            .as_mut()
            .ok_or_else(|| Error::server("no connection to a password server"))
    }

    /// Drops the connection and everything tied to it; the server key stays
    /// so a reconnect can notice a different server.
    pub fn drop_connection(&mut self, send_quit: bool, quit_timeout: Duration) {
        if let Some(conn) = self.connection.take() {
            conn.disconnect(send_quit, quit_timeout);
        }
        self.authenticated = None;
        self.mechanisms.clear();
        self.sync_cipher = None;
    }

    fn teardown(&mut self, registry: &ContinuationRegistry, owner: u64, quit_timeout: Duration) {
        self.drop_connection(true, quit_timeout);

        if let Some(token) = self.continuation.take() {
            let _ = registry.remove(token);
        }
        match registry.remove_owned(owner) {
            Ok(0) => {}
            Ok(n) => debug!("dropped {n} continuations of session {owner}"),
            Err(e) => warn!("cannot release continuations of session {owner}: {e}"),
        }

        self.primary.wipe();
        self.acting_as.wipe();
        self.server_key = None;
        self.server = None;
        self.replicas.clear();
        if let Some(path) = self.sync_file.take() {
            if let Err(e) = path.close() {
                warn!("cannot remove sync file: {e}");
            }
        }
        self.closed = true;
    }
}

/// One open directory node.
pub struct Session {
    id: u64,
    locator: NodeLocator,
    state: Mutex<SessionState>,
    registry: Arc<ContinuationRegistry>,
    quit_timeout: Duration,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        locator: NodeLocator,
        registry: Arc<ContinuationRegistry>,
        quit_timeout: Duration,
    ) -> Self {
        Self {
            id,
            locator,
            state: Mutex::new(SessionState::default()),
            registry,
            quit_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn locator(&self) -> &NodeLocator {
        &self.locator
    }

    /// Locks the state of a session that is still open.
    pub fn lock(&self) -> Result<MutexGuard<'_, SessionState>> {
        let state = self.state.lock()?;
        if state.closed {
            return Err(Error::ContextClosed);
        }
        Ok(state)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Tears the session down. Returns false when it was already closed.
    pub fn close(&self) -> Result<bool> {
        let mut state = self.state.lock()?;
        if state.closed {
            return Ok(false);
        }
        state.teardown(&self.registry, self.id, self.quit_timeout);
        info!("closed session {} for {}", self.id, self.locator);
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn state_unchecked(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("session {} teardown failed: {e}", self.id);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("locator", &self.locator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{continuation::Continuation, protocol::Connection, testing::MockServer};

    use super::*;

    fn session(registry: &Arc<ContinuationRegistry>) -> Session {
        let locator = NodeLocator::parse("/PasswordServer/127.0.0.1", 3659).unwrap();
        Session::new(7, locator, Arc::clone(registry), Duration::from_millis(200))
    }

    #[test]
    fn cache_strips_qualifier_and_wipes() {
        let mut cache = CredentialCache::default();
        cache.store("bob,0123abcd", b"secret", true);

        assert_eq!(cache.username(), "bob");
        assert!(cache.matches("bob"));
        assert!(cache.matches("bob,ffff"));
        assert!(!cache.matches("alice"));

        cache.wipe();
        assert!(!cache.is_set());
        assert_eq!(cache.secret(), &[0_u8; 6]);
    }

    #[test]
    fn teardown_zeroes_secrets_and_disconnects() {
        let server = MockServer::spawn(|session| {
            session.expect("QUIT");
            session.reply("+OK");
        });
        let registry = Arc::new(ContinuationRegistry::new());
        let session = session(&registry);
        {
            let mut state = session.lock().unwrap();
            state.connection = Some(
                Connection::connect(server.addr(), Duration::from_secs(2), Duration::from_secs(2))
                    .unwrap(),
            );
            state.primary.store("bob", b"primary-secret", true);
            state.acting_as.store("admin,abc", b"acting-secret", true);
            let token = registry
                .create(Continuation::payload(session.id(), vec![1, 2, 3]))
                .unwrap();
            state.continuation = Some(token);
        }

        session.close().unwrap();
        server.join();

        let state = session.state_unchecked();
        assert!(!state.is_connected());
        assert!(state.primary.secret().iter().all(|b| *b == 0));
        assert!(state.acting_as.secret().iter().all(|b| *b == 0));
        assert_eq!(state.primary.secret().len(), b"primary-secret".len());
        assert_eq!(registry.len().unwrap(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let registry = Arc::new(ContinuationRegistry::new());
        let session = session(&registry);
        assert!(session.close().unwrap());
        assert!(!session.close().unwrap());
        assert!(session.is_closed());
        assert!(matches!(session.lock(), Err(Error::ContextClosed)));
    }
}
