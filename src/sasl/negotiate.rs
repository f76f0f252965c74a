use std::sync::Mutex;

use log::{debug, trace};

use crate::{
    crypto::from_hex,
    error::{Error, Result, sasl_code},
    protocol::{Connection, Reply, Request},
};

use super::mechanism::{Credentials, Mechanism, Step};

/// Where one authentication attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Start,
    Continue(usize),
    Done,
}

/// Server's verdict on one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    /// `+AUTHOK`: the server sent another challenge.
    Continue(Vec<u8>),
    /// `+OK`, with any final server data.
    Success(Vec<u8>),
    /// Credentials accepted, but the password must be changed before use.
    ChangeRequired,
}

/// Decodes a negotiation reply; hex payloads become raw bytes.
pub fn interpret(reply: Reply) -> Result<Exchange> {
    let decode = |payload: &str| -> Result<Vec<u8>> {
        let payload = payload.trim();
        if payload.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(from_hex(payload)?)
        }
    };

    match reply {
        Reply::Ok(payload) => Ok(Exchange::Success(decode(&payload)?)),
        Reply::Continue(payload) => Ok(Exchange::Continue(decode(&payload)?)),
        Reply::Err(err) if err.policy().is_some_and(|p| p.requires_change()) => {
            Ok(Exchange::ChangeRequired)
        }
        Reply::Err(err) => Err(err.into()),
    }
}

/// Outcome of a finished negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub data: Vec<u8>,
    pub change_required: bool,
    pub steps: usize,
}

/// Drives `USER`/`AUTH`/`AUTH2` until the server finishes the exchange.
///
/// Calls into the mechanism are serialized by `library_lock`. A server that
/// keeps answering "continue" is cut off after `max_steps` rounds with a
/// [`sasl_code::BADPROT`] negotiation error; the connection is then in an
/// unknown state and the caller must drop it.
pub fn negotiate(
    conn: &mut Connection,
    library_lock: &Mutex<()>,
    mech: &mut dyn Mechanism,
    creds: &dyn Credentials,
    max_steps: usize,
) -> Result<Negotiated> {
    let mut state = NegotiationState::Start;
    let mut reply = Reply::Ok(String::new());
    let mut outcome = None;

    loop {
        state = match state {
            NegotiationState::Start => {
                let first = {
                    let _guard = library_lock.lock()?;
                    mech.start(creds)?
                };
                debug!(
                    "starting {} negotiation for {}",
                    mech.name(),
                    creds.username()
                );
                reply = conn.send_and_receive(&Request::user_auth(
                    creds.username(),
                    mech.name(),
                    first.as_deref(),
                ))?;
                NegotiationState::Continue(0)
            }
            NegotiationState::Continue(n) => match interpret(reply.clone())? {
                Exchange::Success(data) => {
                    let _guard = library_lock.lock()?;
                    mech.finish(&data)?;
                    debug!("{} negotiation finished after {n} rounds", mech.name());
                    outcome = Some(Negotiated {
                        data,
                        change_required: false,
                        steps: n,
                    });
                    NegotiationState::Done
                }
                Exchange::ChangeRequired => {
                    debug!("{} accepted, password change required", mech.name());
                    outcome = Some(Negotiated {
                        data: Vec::new(),
                        change_required: true,
                        steps: n,
                    });
                    NegotiationState::Done
                }
                Exchange::Continue(_) if n >= max_steps => {
                    return Err(Error::negotiation(
                        sasl_code::BADPROT,
                        format!("server still continuing after {max_steps} rounds"),
                    ));
                }
                Exchange::Continue(challenge) => {
                    trace!("round {n}: {} byte challenge", challenge.len());
                    let next = {
                        let _guard = library_lock.lock()?;
                        mech.step(creds, &challenge)?
                    };
                    let token = match next {
                        Step::Continue(token) => token,
                        Step::Done => Vec::new(),
                    };
                    reply = conn.send_and_receive(&Request::auth2(&token))?;
                    NegotiationState::Continue(n + 1)
                }
            },
            NegotiationState::Done => {
                return outcome.ok_or_else(|| {
                    Error::negotiation(sasl_code::FAIL, "negotiation ended without a verdict")
                });
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        crypto::{hmac_md5, to_hex},
        sasl::mechanism::{CramMd5, DigestMd5, Plain},
        testing::MockServer,
    };

    use super::*;

    const T: Duration = Duration::from_secs(2);

    struct Creds;

    impl Credentials for Creds {
        fn username(&self) -> &str {
            "bob"
        }
        fn secret(&self) -> &[u8] {
            b"pw"
        }
    }

    #[test]
    fn single_step_plain() {
        let server = MockServer::spawn(|session| {
            let line = session.expect("USER bob AUTH PLAIN ");
            assert!(line.ends_with(&to_hex(b"\0bob\0pw")));
            session.reply("+OK");
        });

        let mut conn = Connection::connect(server.addr(), T, T).unwrap();
        let done = negotiate(&mut conn, &Mutex::new(()), &mut Plain, &Creds, 16).unwrap();
        assert_eq!(done.steps, 0);
        assert!(!done.change_required);
        server.join();
    }

    #[test]
    fn cram_md5_round_trip() {
        let server = MockServer::spawn(|session| {
            session.expect("USER bob AUTH CRAM-MD5");
            session.reply(&format!("+AUTHOK {}", to_hex(b"<1.2@host>")));
            let line = session.expect("AUTH2 ");
            let token = crate::crypto::from_hex(&line[6..]).unwrap();
            let expected = format!("bob {}", to_hex(&hmac_md5(b"pw", b"<1.2@host>").unwrap()));
            assert_eq!(token, expected.into_bytes());
            session.reply("+OK");
        });

        let mut conn = Connection::connect(server.addr(), T, T).unwrap();
        let mut mech = CramMd5::default();
        let done = negotiate(&mut conn, &Mutex::new(()), &mut mech, &Creds, 16).unwrap();
        assert_eq!(done.steps, 1);
        server.join();
    }

    #[test]
    fn digest_checks_server_proof() {
        let server = MockServer::spawn(|session| session.serve_digest("bob", b"pw"));

        let mut conn = Connection::connect(server.addr(), T, T).unwrap();
        let mut mech = DigestMd5::new("127.0.0.1");
        let done = negotiate(&mut conn, &Mutex::new(()), &mut mech, &Creds, 16).unwrap();
        assert_eq!(done.steps, 1);
        server.join();
    }

    #[test]
    fn digest_without_rspauth_fails() {
        let server = MockServer::spawn(|session| {
            session.expect("USER bob AUTH DIGEST-MD5");
            let challenge = "realm=\"mock\",nonce=\"OA6MG9tEQGm2hh\",qop=\"auth\"";
            session.reply(&format!("+AUTHOK {}", to_hex(challenge.as_bytes())));
            session.expect("AUTH2 ");
            session.reply("+OK");
        });

        let mut conn = Connection::connect(server.addr(), T, T).unwrap();
        let mut mech = DigestMd5::new("127.0.0.1");
        let err = negotiate(&mut conn, &Mutex::new(()), &mut mech, &Creds, 16).unwrap_err();
        assert_eq!(err.code(), Some(sasl_code::BADAUTH));
        server.join();
    }

    #[test]
    fn endless_continue_is_bounded() {
        struct Chatty;

        impl Mechanism for Chatty {
            fn name(&self) -> &'static str {
                "CHATTY"
            }
            fn start(&mut self, _: &dyn Credentials) -> Result<Option<Vec<u8>>> {
                Ok(None)
            }
            fn step(&mut self, _: &dyn Credentials, _: &[u8]) -> Result<Step> {
                Ok(Step::Continue(b"more".to_vec()))
            }
        }

        let server = MockServer::spawn(|session| {
            while session.try_read().is_some() {
                session.reply("+AUTHOK 00");
            }
        });

        let mut conn = Connection::connect(server.addr(), T, T).unwrap();
        let err = negotiate(&mut conn, &Mutex::new(()), &mut Chatty, &Creds, 5).unwrap_err();
        assert!(matches!(err, Error::Negotiation { code: sasl_code::BADPROT, .. }));
        drop(conn);
        server.join();
    }

    #[test]
    fn policy_reset_is_change_required() {
        let server = MockServer::spawn(|session| {
            session.expect("USER bob AUTH PLAIN");
            session.reply("-ERR 1 POLICY 15");
        });

        let mut conn = Connection::connect(server.addr(), T, T).unwrap();
        let done = negotiate(&mut conn, &Mutex::new(()), &mut Plain, &Creds, 16).unwrap();
        assert!(done.change_required);
        server.join();
    }

    #[test]
    fn sasl_failure_is_terminal() {
        let server = MockServer::spawn(|session| {
            session.expect("USER bob AUTH PLAIN");
            session.reply("-ERR 5 SASL -13");
        });

        let mut conn = Connection::connect(server.addr(), T, T).unwrap();
        let err = negotiate(&mut conn, &Mutex::new(()), &mut Plain, &Creds, 16).unwrap_err();
        assert_eq!(err.code(), Some(sasl_code::BADAUTH));
        server.join();
    }
}
