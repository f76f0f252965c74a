use log::{debug, info, warn};
use zeroize::Zeroizing;

use crate::{
    continuation::{Continuation, ContinuationKind},
    crypto::{decode_blob, is_blob},
    discovery::{parse_replica_text, strip_qualifier},
    error::{Error, Result, sasl_code},
    protocol::{Reply, Request},
    sasl::{
        AuthMethod, Credentials, Exchange, Mechanism, MethodKind, Negotiated, interpret,
        mechanism_for, negotiate,
    },
    session::{Session, SessionState},
    sync,
};

use super::{AuthRequest, AuthStatus, Engine};

/// What a method produced before it is fitted to the caller's buffer.
pub(super) struct Outcome {
    pub status: AuthStatus,
    pub data: Vec<u8>,
    /// An interactive negotiation waiting for the caller.
    pub parked: Option<Continuation>,
}

impl Outcome {
    fn done(data: Vec<u8>) -> Self {
        Self {
            status: AuthStatus::Complete,
            data,
            parked: None,
        }
    }

    fn negotiated(done: Negotiated) -> Self {
        Self {
            status: if done.change_required {
                AuthStatus::PasswordChangeRequired
            } else {
                AuthStatus::Complete
            },
            data: done.data,
            parked: None,
        }
    }
}

struct Login<'a> {
    username: &'a str,
    secret: &'a [u8],
}

impl Credentials for Login<'_> {
    fn username(&self) -> &str {
        self.username
    }

    fn secret(&self) -> &[u8] {
        self.secret
    }
}

/// `+OK` payloads are either a length-prefixed blob or plain text.
fn payload_bytes(payload: &str) -> Result<Vec<u8>> {
    let payload = payload.trim();
    if is_blob(payload) {
        Ok(decode_blob(payload)?)
    } else {
        Ok(payload.as_bytes().to_vec())
    }
}

/// A single protocol argument taken from caller bytes.
fn text_arg(value: &[u8], what: &str) -> Result<String> {
    let text = String::from_utf8(value.to_vec())
        .map_err(|_| Error::Parameter(format!("{what} is not UTF-8")))?;
    if text.is_empty() || text.contains(['\r', '\n']) {
        return Err(Error::Parameter(format!("{what} must be a single non-empty line")));
    }
    Ok(text)
}

impl Engine {
    pub(super) fn dispatch(
        &self,
        session: &Session,
        state: &mut SessionState,
        req: &AuthRequest,
    ) -> Result<Outcome> {
        match req.method.info().kind {
            MethodKind::Credential => self.credential(state, req),
            MethodKind::Relay => self.relay(state, req),
            MethodKind::Interactive => self.interactive_start(session, state, req),
            MethodKind::Administrative => self.administrative(state, req),
            MethodKind::Bypass => self.bypass(state, req),
        }
    }

    fn mechanism(&self, state: &SessionState, method: AuthMethod) -> Result<&'static str> {
        let name = method
            .info()
            .mechanism
            .ok_or_else(|| Error::Parameter(format!("{method} does not negotiate")))?;
        let offered = state.mechanisms.is_empty()
            || state.mechanisms.iter().any(|m| m.eq_ignore_ascii_case(name));
        if !offered {
            return Err(Error::negotiation(
                sasl_code::NOMECH,
                format!("server does not offer {name}"),
            ));
        }
        Ok(name)
    }

    fn run_negotiation(
        &self,
        state: &mut SessionState,
        mech: &mut dyn Mechanism,
        login: &Login<'_>,
    ) -> Result<Negotiated> {
        state.authenticated = None;
        let done = negotiate(
            state.connection()?,
            &self.negotiation,
            mech,
            login,
            self.config.max_negotiation_steps,
        )?;
        state.authenticated = Some(login.username.to_string());
        Ok(done)
    }

    fn login(
        &self,
        state: &mut SessionState,
        method: AuthMethod,
        username: &str,
        secret: &[u8],
    ) -> Result<Negotiated> {
        let name = self.mechanism(state, method)?;
        let host = state.connection()?.peer().ip().to_string();
        let mut mech = mechanism_for(name, &host, None)
            .ok_or_else(|| Error::negotiation(sasl_code::NOMECH, name))?;
        let login = Login {
            username: strip_qualifier(username).0,
            secret,
        };
        self.run_negotiation(state, mech.as_mut(), &login)
    }

    /// Caches a successful login: always as the primary credential, and as
    /// the acting-as credential unless the caller only wanted to check it.
    fn remember(
        &self,
        state: &mut SessionState,
        method: AuthMethod,
        username: &str,
        secret: &[u8],
        auth_only: bool,
    ) {
        let info = method.info();
        if !info.establishes_session {
            return;
        }
        state.primary.store(username, secret, info.can_set_password);
        if !auth_only {
            state.acting_as.store(username, secret, info.can_set_password);
        }
    }

    fn credential(&self, state: &mut SessionState, req: &AuthRequest) -> Result<Outcome> {
        let done = self.login(state, req.method, &req.username, &req.secret)?;
        self.remember(state, req.method, &req.username, &req.secret, req.auth_only);
        info!("{} authenticated {}", req.method, strip_qualifier(&req.username).0);
        Ok(Outcome::negotiated(done))
    }

    fn relay(&self, state: &mut SessionState, req: &AuthRequest) -> Result<Outcome> {
        let name = self.mechanism(state, req.method)?;
        let mut mech = mechanism_for(name, "", Some((req.challenge.as_slice(), req.response.as_slice())))
            .ok_or_else(|| Error::negotiation(sasl_code::NOMECH, name))?;
        let login = Login {
            username: strip_qualifier(&req.username).0,
            secret: &[],
        };
        let done = self.run_negotiation(state, mech.as_mut(), &login)?;
        Ok(Outcome::negotiated(done))
    }

    fn interactive_start(
        &self,
        session: &Session,
        state: &mut SessionState,
        req: &AuthRequest,
    ) -> Result<Outcome> {
        let name = self.mechanism(state, req.method)?;
        let user = strip_qualifier(&req.username).0;
        let first = (!req.response.is_empty()).then_some(req.response.as_slice());

        state.authenticated = None;
        let reply = state
            .connection()?
            .send_and_receive(&Request::user_auth(user, name, first))?;
        let parked = Continuation::interactive(session.id(), req.method, &req.username, &req.secret);
        self.interactive_reply(state, reply, parked, req.auth_only)
    }

    /// Feeds the caller's answer to a parked interactive negotiation.
    pub(super) fn interactive_resume(
        &self,
        state: &mut SessionState,
        parked: Continuation,
        req: &AuthRequest,
    ) -> Result<Outcome> {
        let Some(conn) = state.connection.as_mut() else {
            return Err(Error::InvalidContinuation);
        };
        let reply = conn.send_and_receive(&Request::auth2(&req.response))?;
        self.interactive_reply(state, reply, parked, req.auth_only)
    }

    fn interactive_reply(
        &self,
        state: &mut SessionState,
        reply: Reply,
        mut parked: Continuation,
        auth_only: bool,
    ) -> Result<Outcome> {
        let ContinuationKind::Interactive { method, username } = parked.kind.clone() else {
            return Err(Error::InvalidContinuation);
        };

        let status = match interpret(reply)? {
            Exchange::Continue(challenge) => {
                if parked.pass as usize >= self.config.max_negotiation_steps {
                    return Err(Error::negotiation(
                        sasl_code::BADPROT,
                        format!("{method} still continuing after {} rounds", parked.pass),
                    ));
                }
                parked.pass += 1;
                debug!("{method} round {} waits for the caller", parked.pass);
                return Ok(Outcome {
                    status: AuthStatus::Complete,
                    data: challenge,
                    parked: Some(parked),
                });
            }
            Exchange::Success(_) => AuthStatus::Complete,
            Exchange::ChangeRequired => AuthStatus::PasswordChangeRequired,
        };

        let user = strip_qualifier(&username).0.to_string();
        info!("{method} authenticated {user}");
        state.authenticated = Some(user);
        self.remember(state, method, &username, parked.secret(), auth_only);
        Ok(Outcome {
            status,
            data: Vec::new(),
            parked: None,
        })
    }

    fn administrative(&self, state: &mut SessionState, req: &AuthRequest) -> Result<Outcome> {
        let user = strip_qualifier(&req.username).0;
        let reuse = self.config.allows_reuse(req.method)
            && state.acting_as.matches(user)
            && state.authenticated.as_deref() == Some(user);

        if reuse {
            debug!("{} reuses the authentication of {user}", req.method);
        } else {
            let secret = if !req.secret.is_empty() {
                req.secret.clone()
            } else if state.acting_as.matches(user) {
                Zeroizing::new(state.acting_as.secret().to_vec())
            } else {
                return Err(Error::Parameter(format!(
                    "{} needs the secret of {user}",
                    req.method
                )));
            };

            let done = self.login(state, req.method, user, &secret)?;
            self.remember(state, req.method, &req.username, &secret, req.auth_only);
            if done.change_required && !req.method.info().can_set_password {
                return Ok(Outcome {
                    status: AuthStatus::PasswordChangeRequired,
                    data: Vec::new(),
                    parked: None,
                });
            }
        }

        let target = req.target.as_deref().unwrap_or(user);
        let request = match req.method {
            AuthMethod::SetPassword | AuthMethod::SetPasswordAsRoot | AuthMethod::ChangePassword => {
                Request::change_pass(target, &req.new_secret)
            }
            AuthMethod::NewUser => Request::new_user(target, &req.new_secret),
            AuthMethod::DeleteUser => Request::delete_user(target),
            AuthMethod::GetPolicy => Request::get_policy(target, false),
            AuthMethod::GetEffectivePolicy => Request::get_policy(target, true),
            AuthMethod::SetPolicy => Request::set_policy(target, &text_arg(&req.value, "policy")?),
            AuthMethod::GetUserData => Request::get_user_data(target),
            AuthMethod::SetUserData => Request::set_user_data(target, &req.value),
            AuthMethod::MppeKeys => {
                let key_size: u32 = if req.value.is_empty() {
                    16
                } else {
                    text_arg(&req.value, "key size")?
                        .parse()
                        .map_err(|_| Error::Parameter("key size is not a number".to_string()))?
                };
                Request::get_mppe_keys(target, &req.response, key_size)
            }
            AuthMethod::SetGlobalPolicy => {
                Request::set_global_policy(&text_arg(&req.value, "policy")?)
            }
            other => {
                return Err(Error::Parameter(format!("{other} is not administrative")));
            }
        };

        let payload = state.connection()?.command(&request)?;
        info!("{} for {target} done", req.method);

        if matches!(
            req.method,
            AuthMethod::SetPassword | AuthMethod::SetPasswordAsRoot | AuthMethod::ChangePassword
        ) {
            for cache in [&mut state.primary, &mut state.acting_as] {
                if cache.matches(target) {
                    let can_set = cache.can_set_password();
                    cache.store(target, &req.new_secret, can_set);
                }
            }
        }
        Ok(Outcome::done(payload_bytes(&payload)?))
    }

    fn bypass(&self, state: &mut SessionState, req: &AuthRequest) -> Result<Outcome> {
        let named = || {
            req.target
                .clone()
                .or_else(|| {
                    let user = strip_qualifier(&req.username).0;
                    (!user.is_empty()).then(|| user.to_string())
                })
                .ok_or_else(|| Error::Parameter(format!("{} needs a name", req.method)))
        };

        let data = match req.method {
            AuthMethod::GetGlobalPolicy => {
                payload_bytes(&state.connection()?.command(&Request::get_global_policy())?)?
            }
            AuthMethod::GetIdByName => {
                let name = named()?;
                payload_bytes(&state.connection()?.command(&Request::get_id_by_name(&name))?)?
            }
            AuthMethod::ListReplicas => self.refresh_replicas(state)?.into_bytes(),
            AuthMethod::SyncPull => {
                let since = if req.value.is_empty() {
                    "0".to_string()
                } else {
                    text_arg(&req.value, "sync start")?
                };
                sync::pull(state, &since, &self.config.sync_dir)?
            }
            AuthMethod::SyncPush => {
                sync::push(state, &req.value)?;
                Vec::new()
            }
            AuthMethod::SyncProcess => {
                sync::process_no_reply(state)?;
                Vec::new()
            }
            AuthMethod::SyncSetupReplica => {
                let name = match req.target.clone() {
                    Some(name) => name,
                    None => text_arg(&req.value, "replica name")?,
                };
                sync::setup_replica(state, &name)?.into_bytes()
            }
            other => return Err(Error::Parameter(format!("{other} needs negotiation"))),
        };
        Ok(Outcome::done(data))
    }

    /// `LIST REPLICAS`: merges what the server reports into the session and
    /// the cache, and returns the raw list.
    pub(super) fn refresh_replicas(&self, state: &mut SessionState) -> Result<String> {
        let payload = state.connection()?.command(&Request::list_replicas())?;
        let text = String::from_utf8(payload_bytes(&payload)?)
            .map_err(|_| Error::server("replica list is not UTF-8"))?;
        let reported = parse_replica_text(&text, self.config.default_port);
        debug!("server reports {} replicas", reported.len());

        for entry in reported.entries() {
            state.replicas.merge(entry.clone());
        }
        if let Some(identity) = state.identity().cloned() {
            if let Err(e) = self.discovery.merge_replicas(&identity, &reported) {
                warn!("cannot cache reported replicas: {e}");
            }
        }
        Ok(text)
    }
}
