//! The engine: one explicitly constructed object owning everything that is
//! shared between sessions.
//!
//! # Overview
//!
//! A host installs one [`Engine`] at start-up and routes every node request
//! through it:
//!
//! - [`Engine::open`] parses the node name and creates a [`Session`].
//! - [`Engine::perform`] runs one [`AuthRequest`] on a session. The first
//!   call on a session resolves a replica, connects, fetches and validates
//!   the server key and lists mechanisms; later calls reuse the live
//!   connection after a liveness check.
//! - [`Engine::release_continuation`] abandons a multi-part operation.
//! - [`Engine::close`] tears a session down.
//!
//! # Failure handling
//!
//! A transport failure (closed socket, timeout) earns exactly one reconnect
//! and retry. A server whose key differs from the one expected earns one
//! cache flush and a fresh discovery. Everything else reaches the caller as
//! a typed [`Error`].
//!
//! # Key Components
//!
//! - [`Engine`]: discovery, the negotiation lock and the continuation
//!   registry.
//! - [`AuthRequest`] / [`AuthResponse`]: the typed host boundary.
//!
//! # See Also
//!
//! - [`session`](crate::session): what a session owns and how it is torn down.
//! - [`sasl`](crate::sasl): mechanisms and the negotiation loop.
mod ops;
mod request;

use std::sync::{
    Arc, Mutex, OnceLock,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use log::{debug, info, warn};

use crate::{
    config::EngineConfig,
    continuation::{Continuation, ContinuationKind, ContinuationRegistry, ContinuationToken},
    crypto::{IdentityHash, keys_equal},
    discovery::{Discovery, NoBrowser, NodeLocator, ServiceBrowser, identity_hint},
    error::{Error, Result, sasl_code},
    handshake,
    protocol::Connection,
    session::{Session, SessionState},
};

use ops::Outcome;
pub use request::{AuthRequest, AuthResponse, AuthStatus, DEFAULT_MAX_OUTPUT};

static ENGINE: OnceLock<Engine> = OnceLock::new();

pub struct Engine {
    config: EngineConfig,
    discovery: Discovery,
    /// Serializes calls into mechanism code.
    negotiation: Mutex<()>,
    continuations: Arc<ContinuationRegistry>,
    open_nodes: AtomicUsize,
    next_session: AtomicU64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_browser(config, Box::new(NoBrowser))
    }

    pub fn with_browser(config: EngineConfig, browser: Box<dyn ServiceBrowser>) -> Self {
        let discovery = Discovery::new(config.clone(), browser);
        Self {
            config,
            discovery,
            negotiation: Mutex::new(()),
            continuations: Arc::new(ContinuationRegistry::new()),
            open_nodes: AtomicUsize::new(0),
            next_session: AtomicU64::new(1),
        }
    }

    /// Process-wide engine, created on first call. Later calls return the
    /// same engine and ignore their configuration.
    pub fn install(config: EngineConfig) -> &'static Engine {
        if let Some(engine) = ENGINE.get() {
            warn!("engine already installed; ignoring new configuration");
            return engine;
        }
        ENGINE.get_or_init(|| Engine::new(config))
    }

    pub fn global() -> Option<&'static Engine> {
        ENGINE.get()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn open_nodes(&self) -> usize {
        self.open_nodes.load(Ordering::Acquire)
    }

    pub fn open(&self, node: &str) -> Result<Session> {
        let locator = NodeLocator::parse(node, self.config.default_port)?;
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let open = self.open_nodes.fetch_add(1, Ordering::AcqRel) + 1;
        info!("opened session {id} for {locator} ({open} open)");

        Ok(Session::new(
            id,
            locator,
            Arc::clone(&self.continuations),
            self.config.quit_timeout,
        ))
    }

    pub fn close(&self, session: &Session) -> Result<()> {
        if session.close()? {
            self.open_nodes.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Runs one request, resuming a continuation when it carries one.
    pub fn perform(&self, session: &Session, req: AuthRequest) -> Result<AuthResponse> {
        req.check()?;
        let mut state = session.lock()?;
        debug!("session {}: {req:?}", session.id());

        if let Some(token) = req.continuation {
            return self.resume(session, &mut state, token, &req);
        }

        let hint = identity_hint(&req.username);
        let mut reconnected = false;
        let mut rediscovered = false;

        loop {
            let attempt = self
                .ensure_connected(session, &mut state, hint.as_ref(), reconnected || rediscovered)
                .and_then(|_| self.dispatch(session, &mut state, &req));

            match attempt {
                Ok(outcome) => return self.deliver(session, &mut state, outcome, req.max_output),
                Err(e) if e.is_transport() && !reconnected => {
                    warn!("session {}: {e}; reconnecting once", session.id());
                    state.drop_connection(false, self.config.quit_timeout);
                    reconnected = true;
                }
                Err(e) if e.is_identity_mismatch() && !rediscovered => {
                    warn!("session {}: {e}; flushing cache and rediscovering", session.id());
                    let expected = hint.clone().or_else(|| state.identity().cloned());
                    if let Err(flush) = self.discovery.flush(expected.as_ref()) {
                        warn!("cannot flush replica cache: {flush}");
                    }
                    state.drop_connection(false, self.config.quit_timeout);
                    state.server_key = None;
                    state.server = None;
                    rediscovered = true;
                }
                Err(e) => {
                    if matches!(e, Error::Negotiation { code: sasl_code::BADPROT, .. }) {
                        // the server and client disagree on where the exchange is
                        state.drop_connection(false, self.config.quit_timeout);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Abandons a continuation. An interactive negotiation left half done
    /// also costs the connection.
    pub fn release_continuation(&self, session: &Session, token: ContinuationToken) -> Result<()> {
        let parked = self.continuations.take(token, session.id())?;
        let mut state = session.lock()?;
        if state.continuation == Some(token) {
            state.continuation = None;
        }
        if matches!(parked.kind, ContinuationKind::Interactive { .. }) {
            state.drop_connection(false, self.config.quit_timeout);
        }
        debug!("released continuation {token}");
        Ok(())
    }

    fn resume(
        &self,
        session: &Session,
        state: &mut SessionState,
        token: ContinuationToken,
        req: &AuthRequest,
    ) -> Result<AuthResponse> {
        let mut parked = self.continuations.take(token, session.id())?;
        state.continuation = None;

        match parked.kind {
            ContinuationKind::Payload => {
                let chunk = parked.next_chunk(req.max_output);
                if parked.is_drained() {
                    return Ok(AuthResponse::complete(chunk));
                }
                self.continuations.put(token, parked)?;
                state.continuation = Some(token);
                Ok(AuthResponse {
                    status: AuthStatus::Complete,
                    data: chunk,
                    continuation: Some(token),
                })
            }
            ContinuationKind::Interactive { .. } => {
                match self.interactive_resume(state, parked, req) {
                    Ok(outcome) => self.deliver(session, state, outcome, req.max_output),
                    Err(e) => {
                        state.drop_connection(false, self.config.quit_timeout);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Fits an outcome to the caller's buffer, parking whatever is left.
    fn deliver(
        &self,
        session: &Session,
        state: &mut SessionState,
        outcome: Outcome,
        max_output: usize,
    ) -> Result<AuthResponse> {
        let Outcome {
            status,
            mut data,
            parked,
        } = outcome;

        if let Some(parked) = parked {
            if data.len() > max_output {
                state.drop_connection(false, self.config.quit_timeout);
                return Err(Error::BufferTooSmall {
                    need: data.len(),
                    have: max_output,
                });
            }
            let token = self.continuations.create(parked)?;
            state.continuation = Some(token);
            return Ok(AuthResponse {
                status,
                data,
                continuation: Some(token),
            });
        }

        if data.len() <= max_output {
            return Ok(AuthResponse {
                status,
                data,
                continuation: None,
            });
        }

        let rest = data.split_off(max_output);
        debug!("{} bytes left for later parts", rest.len());
        let token = self
            .continuations
            .create(Continuation::payload(session.id(), rest))?;
        state.continuation = Some(token);
        Ok(AuthResponse {
            status,
            data,
            continuation: Some(token),
        })
    }

    /// Makes sure the session has a live, validated connection.
    fn ensure_connected(
        &self,
        session: &Session,
        state: &mut SessionState,
        hint: Option<&IdentityHash>,
        second_attempt: bool,
    ) -> Result<()> {
        if let Some(conn) = state.connection.as_ref() {
            if conn.is_alive() {
                return Ok(());
            }
            info!("session {}: connection to {} lost", session.id(), conn.peer());
            state.drop_connection(false, self.config.quit_timeout);
        }

        let found = self
            .discovery
            .resolve(session.locator(), hint, second_attempt)?;
        let mut conn = match found.server.stream {
            Some(stream) => Connection::from_stream(stream, self.config.probe_timeout)?,
            None => Connection::connect(
                found.server.addr,
                self.config.connect_timeout,
                self.config.probe_timeout,
            )?,
        };
        conn.set_receive_timeout(self.config.receive_timeout)?;

        let key = handshake::fetch_server_public_key(&mut conn)?;
        if let Some(hint) = hint.filter(|h| *h != key.identity()) {
            return Err(Error::IdentityMismatch {
                expected: hint.to_string(),
                found: key.identity().to_string(),
            });
        }
        if let Some(previous) = state.server_key.as_ref() {
            if !keys_equal(Some(previous.blob().as_bytes()), Some(key.blob().as_bytes())) {
                return Err(Error::IdentityMismatch {
                    expected: previous.identity().to_string(),
                    found: key.identity().to_string(),
                });
            }
        }

        if self.config.validate_identity {
            handshake::validate_server(&mut conn, &key)?;
        }
        let mechanisms = handshake::list_mechanisms(&mut conn)?;

        if let Err(e) = self.discovery.record_success(&found.server.entry, key.identity()) {
            warn!("cannot update replica cache: {e}");
        }

        state.connection = Some(conn);
        state.server = Some(found.server.entry);
        state.server_key = Some(key);
        state.mechanisms = mechanisms;
        state.replicas = found.candidates;

        if self.config.refresh_replicas {
            match self.refresh_replicas(state) {
                Ok(_) => {}
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => debug!("replica refresh skipped: {e}"),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("discovery", &self.discovery)
            .field("open_nodes", &self.open_nodes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempdir::TempDir;

    use crate::{
        crypto::to_hex,
        sasl::AuthMethod,
        testing::{MockServer, MockSession},
    };

    use super::*;

    fn config(temp: &TempDir) -> EngineConfig {
        EngineConfig {
            cache_path: temp.path().join("replicas.cache"),
            sync_dir: temp.path().to_path_buf(),
            localhost_fallback: false,
            refresh_replicas: false,
            connect_timeout: Duration::from_millis(500),
            receive_timeout: Duration::from_secs(5),
            quit_timeout: Duration::from_millis(500),
            probe_workers: 2,
            max_negotiation_steps: 3,
            ..EngineConfig::default()
        }
    }

    fn finish(session: &mut MockSession) {
        session.expect("QUIT");
        session.reply("+OK");
    }

    #[test]
    fn allow_listed_method_reuses_authentication() {
        let server = MockServer::spawn(|session| {
            session.serve_handshake();
            session.serve_digest("admin", b"pw");
            // no second handshake or negotiation before the command
            session.expect("GETPOLICY bob");
            session.reply("+OK isDisabled=0 minChars=8");
            finish(session);
        });

        let temp = TempDir::new("engine").unwrap();
        let engine = Engine::new(config(&temp));
        let session = engine.open(&server.node()).unwrap();

        let first = engine
            .perform(
                &session,
                AuthRequest::new(AuthMethod::ClearText, "admin").secret(b"pw"),
            )
            .unwrap();
        assert_eq!(first.status, AuthStatus::Complete);

        let second = engine
            .perform(
                &session,
                AuthRequest::new(AuthMethod::GetPolicy, "admin").target("bob"),
            )
            .unwrap();
        assert_eq!(second.data, b"isDisabled=0 minChars=8");

        engine.close(&session).unwrap();
        assert_eq!(engine.open_nodes(), 0);
        server.join();
    }

    #[test]
    fn other_methods_negotiate_again() {
        let server = MockServer::spawn(|session| {
            session.serve_handshake();
            session.serve_digest("bob", b"old");
            session.serve_digest("bob", b"old");
            session.expect("CHANGEPASS bob ");
            session.reply("+OK");
            finish(session);
        });

        let temp = TempDir::new("engine").unwrap();
        let engine = Engine::new(config(&temp));
        let session = engine.open(&server.node()).unwrap();

        engine
            .perform(&session, AuthRequest::new(AuthMethod::ClearText, "bob").secret(b"old"))
            .unwrap();
        engine
            .perform(
                &session,
                AuthRequest::new(AuthMethod::ChangePassword, "bob").new_secret(b"new"),
            )
            .unwrap();

        {
            let state = session.lock().unwrap();
            assert_eq!(state.primary.secret(), b"new");
            assert_eq!(state.acting_as.secret(), b"new");
        }
        engine.close(&session).unwrap();
        server.join();
    }

    #[test]
    fn auth_only_leaves_acting_as_empty() {
        let server = MockServer::spawn(|session| {
            session.serve_handshake();
            session.serve_digest("carol", b"pw");
            finish(session);
        });

        let temp = TempDir::new("engine").unwrap();
        let engine = Engine::new(config(&temp));
        let session = engine.open(&server.node()).unwrap();
        engine
            .perform(
                &session,
                AuthRequest::new(AuthMethod::ClearText, "carol")
                    .secret(b"pw")
                    .auth_only(true),
            )
            .unwrap();

        {
            let state = session.lock().unwrap();
            assert!(state.primary.matches("carol"));
            assert!(!state.acting_as.is_set());
        }
        engine.close(&session).unwrap();
        server.join();
    }

    #[test]
    fn policy_reset_is_a_success_variant() {
        let server = MockServer::spawn(|session| {
            session.serve_handshake();
            session.expect("USER dave AUTH PLAIN ");
            session.reply("-ERR 1 POLICY 15");
            finish(session);
        });

        let temp = TempDir::new("engine").unwrap();
        let engine = Engine::new(config(&temp));
        let session = engine.open(&server.node()).unwrap();
        let resp = engine
            .perform(
                &session,
                AuthRequest::new(AuthMethod::NativeClearTextOk, "dave").secret(b"pw"),
            )
            .unwrap();
        assert_eq!(resp.status, AuthStatus::PasswordChangeRequired);
        engine.close(&session).unwrap();
        server.join();
    }

    #[test]
    fn interactive_method_continues_through_caller() {
        let server = MockServer::spawn(|session| {
            session.serve_handshake();
            session.expect("USER erin AUTH TWOWAYRANDOM");
            session.reply(&format!("+AUTHOK {}", to_hex(b"server-challenge")));
            let line = session.expect("AUTH2 ");
            assert_eq!(&line["AUTH2 ".len()..], to_hex(b"client-answer"));
            session.reply("+OK");
            finish(session);
        });

        let temp = TempDir::new("engine").unwrap();
        let engine = Engine::new(config(&temp));
        let session = engine.open(&server.node()).unwrap();

        let first = engine
            .perform(
                &session,
                AuthRequest::new(AuthMethod::TwoWayRandom, "erin").secret(b"k"),
            )
            .unwrap();
        assert_eq!(first.data, b"server-challenge");
        let token = first.continuation.unwrap();

        let second = engine
            .perform(
                &session,
                AuthRequest::new(AuthMethod::TwoWayRandom, "erin")
                    .response(b"client-answer")
                    .resume(token),
            )
            .unwrap();
        assert!(second.is_complete());
        assert!(session.lock().unwrap().acting_as.matches("erin"));

        // spent tokens are gone
        let again = engine.perform(
            &session,
            AuthRequest::new(AuthMethod::TwoWayRandom, "erin").resume(token),
        );
        assert!(matches!(again, Err(Error::InvalidContinuation)));

        engine.close(&session).unwrap();
        server.join();
    }

    #[test]
    fn interactive_rounds_are_bounded() {
        let server = MockServer::spawn(|session| {
            session.serve_handshake();
            while session.try_read().is_some() {
                session.reply("+AUTHOK 00");
            }
        });

        let temp = TempDir::new("engine").unwrap();
        let engine = Engine::new(config(&temp));
        let session = engine.open(&server.node()).unwrap();

        let mut resp = engine
            .perform(&session, AuthRequest::new(AuthMethod::TwoWayRandom, "erin"))
            .unwrap();
        let err = loop {
            let token = resp.continuation.unwrap();
            match engine.perform(
                &session,
                AuthRequest::new(AuthMethod::TwoWayRandom, "erin")
                    .response(b"x")
                    .resume(token),
            ) {
                Ok(next) => resp = next,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::Negotiation { code: sasl_code::BADPROT, .. }));
        assert!(!session.lock().unwrap().is_connected());

        engine.close(&session).unwrap();
        server.join();
    }

    #[test]
    fn large_output_is_chunked() {
        let server = MockServer::spawn(|session| {
            session.serve_handshake();
            session.expect("GETGLOBALPOLICY");
            session.reply("+OK abcdefghij");
            finish(session);
        });

        let temp = TempDir::new("engine").unwrap();
        let engine = Engine::new(config(&temp));
        let session = engine.open(&server.node()).unwrap();

        let mut resp = engine
            .perform(
                &session,
                AuthRequest::new(AuthMethod::GetGlobalPolicy, "").max_output(4),
            )
            .unwrap();
        let mut parts = vec![resp.data.clone()];
        while let Some(token) = resp.continuation {
            resp = engine
                .perform(
                    &session,
                    AuthRequest::new(AuthMethod::GetGlobalPolicy, "")
                        .max_output(4)
                        .resume(token),
                )
                .unwrap();
            parts.push(resp.data.clone());
        }
        assert_eq!(parts, vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]);

        engine.close(&session).unwrap();
        server.join();
    }

    #[test]
    fn unlimited_resume_drains_the_payload() {
        let server = MockServer::spawn(|session| {
            session.serve_handshake();
            session.expect("GETGLOBALPOLICY");
            session.reply("+OK abcdefghij");
            finish(session);
        });

        let temp = TempDir::new("engine").unwrap();
        let engine = Engine::new(config(&temp));
        let session = engine.open(&server.node()).unwrap();

        let first = engine
            .perform(
                &session,
                AuthRequest::new(AuthMethod::GetGlobalPolicy, "").max_output(2),
            )
            .unwrap();
        let second = engine
            .perform(
                &session,
                AuthRequest::new(AuthMethod::GetGlobalPolicy, "")
                    .max_output(2)
                    .resume(first.continuation.unwrap()),
            )
            .unwrap();
        let rest = engine
            .perform(
                &session,
                AuthRequest::new(AuthMethod::GetGlobalPolicy, "")
                    .max_output(usize::MAX)
                    .resume(second.continuation.unwrap()),
            )
            .unwrap();
        assert_eq!(first.data, b"ab");
        assert_eq!(second.data, b"cd");
        assert_eq!(rest.data, b"efghij");
        assert!(rest.continuation.is_none());

        engine.close(&session).unwrap();
        assert!(session.is_closed());
        server.join();
    }

    #[test]
    fn transport_failure_reconnects_once() {
        let server = MockServer::spawn_many(2, |idx, session| {
            session.serve_handshake();
            session.expect("GETGLOBALPOLICY");
            if idx == 0 {
                return;
            }
            session.reply("+OK minChars=8");
            finish(session);
        });

        let temp = TempDir::new("engine").unwrap();
        let engine = Engine::new(config(&temp));
        let session = engine.open(&server.node()).unwrap();

        let resp = engine
            .perform(&session, AuthRequest::new(AuthMethod::GetGlobalPolicy, ""))
            .unwrap();
        assert_eq!(resp.data, b"minChars=8");

        engine.close(&session).unwrap();
        server.join();
    }

    #[test]
    fn identity_mismatch_retries_once_then_fails() {
        let server = MockServer::spawn_many(2, |_, session| {
            session.serve_rsa_public();
            assert!(session.try_read().is_none());
        });

        let temp = TempDir::new("engine").unwrap();
        let engine = Engine::new(config(&temp));
        let session = engine.open(&server.node()).unwrap();

        let err = engine
            .perform(
                &session,
                AuthRequest::new(AuthMethod::ClearText, "bob,00112233445566778899aabbccddeeff")
                    .secret(b"pw"),
            )
            .unwrap_err();
        assert!(err.is_identity_mismatch());

        engine.close(&session).unwrap();
        server.join();
    }

    #[test]
    fn closed_session_rejects_work() {
        let temp = TempDir::new("engine").unwrap();
        let engine = Engine::new(config(&temp));
        let session = engine.open("/PasswordServer/127.0.0.1").unwrap();
        assert_eq!(engine.open_nodes(), 1);

        engine.close(&session).unwrap();
        engine.close(&session).unwrap();
        assert_eq!(engine.open_nodes(), 0);

        let err = engine
            .perform(&session, AuthRequest::new(AuthMethod::GetGlobalPolicy, ""))
            .unwrap_err();
        assert!(matches!(err, Error::ContextClosed));
    }

    #[test]
    fn concurrent_close_counts_once() {
        let temp = TempDir::new("engine").unwrap();
        let engine = Engine::new(config(&temp));
        let session = Arc::new(engine.open("/PasswordServer/127.0.0.1").unwrap());
        let barrier = std::sync::Barrier::new(4);

        std::thread::scope(|s| {
            for _ in 0..4 {
                let session = Arc::clone(&session);
                let (engine, barrier) = (&engine, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    engine.close(&session).unwrap();
                });
            }
        });

        assert_eq!(engine.open_nodes(), 0);
        assert!(session.is_closed());
    }

    #[test]
    fn bad_node_names_are_parameter_errors() {
        let temp = TempDir::new("engine").unwrap();
        let engine = Engine::new(config(&temp));
        assert!(matches!(engine.open("/LDAPv3/x"), Err(Error::Parameter(_))));
    }

    #[test]
    fn install_is_once() {
        let first = Engine::install(EngineConfig::default());
        let second = Engine::install(EngineConfig {
            default_port: 1,
            ..EngineConfig::default()
        });
        assert!(std::ptr::eq(first, second));
        assert_eq!(second.config().default_port, 3659);
        assert!(Engine::global().is_some());
    }
}
