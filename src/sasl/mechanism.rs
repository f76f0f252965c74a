use crate::{
    crypto::{hmac_md5, md5, md5_hex, random_bytes, to_hex},
    error::{Error, Result, sasl_code},
};

use super::methods::{CRAM_MD5, DIGEST_MD5, PLAIN};

/// Callbacks a mechanism uses to resolve who it authenticates as.
pub trait Credentials {
    fn username(&self) -> &str;
    fn secret(&self) -> &[u8];
}

/// What the client does after consuming a server challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue(Vec<u8>),
    /// Nothing more to say; an empty `AUTH2` acknowledges the server.
    Done,
}

/// Client half of one negotiable authentication algorithm.
pub trait Mechanism: Send {
    fn name(&self) -> &'static str;

    /// Initial client token, when the mechanism speaks first.
    fn start(&mut self, creds: &dyn Credentials) -> Result<Option<Vec<u8>>>;

    fn step(&mut self, creds: &dyn Credentials, challenge: &[u8]) -> Result<Step>;

    /// Additional data the server sent along with its final `+OK`.
    fn finish(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

fn unexpected_challenge(name: &str) -> Error {
    Error::negotiation(
        sasl_code::BADPROT,
        format!("{name} does not expect a server challenge"),
    )
}

/// `PLAIN`: `authzid NUL authcid NUL passwd`, authzid left empty.
#[derive(Debug, Default)]
pub struct Plain;

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        PLAIN
    }

    fn start(&mut self, creds: &dyn Credentials) -> Result<Option<Vec<u8>>> {
        let mut token = vec![0_u8];
        token.extend_from_slice(creds.username().as_bytes());
        token.push(0);
        token.extend_from_slice(creds.secret());
        Ok(Some(token))
    }

    fn step(&mut self, _creds: &dyn Credentials, _challenge: &[u8]) -> Result<Step> {
        Err(unexpected_challenge(PLAIN))
    }
}

/// `CRAM-MD5` (RFC 2195).
#[derive(Debug, Default)]
pub struct CramMd5 {
    answered: bool,
}

impl Mechanism for CramMd5 {
    fn name(&self) -> &'static str {
        CRAM_MD5
    }

    fn start(&mut self, _creds: &dyn Credentials) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn step(&mut self, creds: &dyn Credentials, challenge: &[u8]) -> Result<Step> {
        if self.answered {
            return Err(unexpected_challenge(CRAM_MD5));
        }
        self.answered = true;
        let digest = hmac_md5(creds.secret(), challenge)?;
        Ok(Step::Continue(
            format!("{} {}", creds.username(), to_hex(&digest)).into_bytes(),
        ))
    }
}

/// `DIGEST-MD5` client (RFC 2831), `qop=auth` only.
#[derive(Debug)]
pub struct DigestMd5 {
    host: String,
    cnonce: String,
    expected_rspauth: Option<String>,
}

/// The inputs of one digest computation.
#[derive(Debug, Clone)]
pub(crate) struct DigestParams<'a> {
    pub username: &'a str,
    pub realm: &'a str,
    pub secret: &'a [u8],
    pub nonce: &'a str,
    pub cnonce: &'a str,
    pub nc: &'a str,
    pub qop: &'a str,
    pub digest_uri: &'a str,
}

impl DigestParams<'_> {
    /// `response` when `a2_prefix` is `AUTHENTICATE`, `rspauth` when empty.
    pub(crate) fn compute(&self, a2_prefix: &str) -> String {
        let user_hash = md5(&[
            self.username.as_bytes(),
            b":",
            self.realm.as_bytes(),
            b":",
            self.secret,
        ]);
        let a1 = md5_hex(&[
            &user_hash,
            b":",
            self.nonce.as_bytes(),
            b":",
            self.cnonce.as_bytes(),
        ]);
        let a2 = md5_hex(&[a2_prefix.as_bytes(), b":", self.digest_uri.as_bytes()]);
        md5_hex(&[
            a1.as_bytes(),
            b":",
            self.nonce.as_bytes(),
            b":",
            self.nc.as_bytes(),
            b":",
            self.cnonce.as_bytes(),
            b":",
            self.qop.as_bytes(),
            b":",
            a2.as_bytes(),
        ])
    }
}

pub(crate) const DIGEST_SERVICE: &str = "ipass";

impl DigestMd5 {
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_cnonce(host, to_hex(&random_bytes::<16>()))
    }

    pub fn with_cnonce(host: impl Into<String>, cnonce: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            cnonce: cnonce.into(),
            expected_rspauth: None,
        }
    }

    fn respond(&mut self, creds: &dyn Credentials, challenge: &str) -> Result<Vec<u8>> {
        let directives = parse_directives(challenge);
        let get = |key: &str| {
            directives
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_str())
        };

        let nonce = get("nonce").ok_or_else(|| {
            Error::negotiation(sasl_code::BADPROT, "digest challenge without nonce")
        })?;
        let qop_offered = get("qop").unwrap_or("auth");
        if !qop_offered.split(',').any(|q| q.trim() == "auth") {
            return Err(Error::negotiation(
                sasl_code::BADPROT,
                format!("server does not offer qop=auth ({qop_offered})"),
            ));
        }
        let realm = get("realm").unwrap_or(self.host.as_str()).to_string();
        let digest_uri = format!("{DIGEST_SERVICE}/{}", self.host);

        let params = DigestParams {
            username: creds.username(),
            realm: &realm,
            secret: creds.secret(),
            nonce,
            cnonce: &self.cnonce,
            nc: "00000001",
            qop: "auth",
            digest_uri: &digest_uri,
        };
        let response = params.compute("AUTHENTICATE");
        self.expected_rspauth = Some(params.compute(""));

        let mut out = format!(
            "username=\"{}\",realm=\"{realm}\",nonce=\"{nonce}\",cnonce=\"{}\",nc=00000001,qop=auth,digest-uri=\"{digest_uri}\",response={response}",
            creds.username(),
            self.cnonce
        );
        if get("charset").is_some_and(|c| c.eq_ignore_ascii_case("utf-8")) {
            out.push_str(",charset=utf-8");
        }
        Ok(out.into_bytes())
    }

    fn verify(&mut self, data: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(data);
        let rspauth = parse_directives(&text)
            .into_iter()
            .find(|(k, _)| k == "rspauth")
            .map(|(_, v)| v);

        match (self.expected_rspauth.take(), rspauth) {
            (Some(expected), Some(got)) if expected == got => Ok(()),
            _ => Err(Error::negotiation(
                sasl_code::BADAUTH,
                "server failed to prove knowledge of the password",
            )),
        }
    }
}

impl Mechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        DIGEST_MD5
    }

    fn start(&mut self, _creds: &dyn Credentials) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn step(&mut self, creds: &dyn Credentials, challenge: &[u8]) -> Result<Step> {
        if self.expected_rspauth.is_some() {
            self.verify(challenge)?;
            return Ok(Step::Done);
        }
        let challenge = String::from_utf8_lossy(challenge).into_owned();
        Ok(Step::Continue(self.respond(creds, &challenge)?))
    }

    fn finish(&mut self, data: &[u8]) -> Result<()> {
        // rspauth may arrive folded into the success reply, but it must arrive
        if self.expected_rspauth.is_some() {
            self.verify(data)?;
        }
        Ok(())
    }
}

/// Relays a challenge/response pair the caller computed elsewhere.
#[derive(Debug)]
pub struct Relay {
    name: &'static str,
    challenge: Vec<u8>,
    response: Vec<u8>,
}

impl Relay {
    pub fn new(name: &'static str, challenge: &[u8], response: &[u8]) -> Self {
        Self {
            name,
            challenge: challenge.to_vec(),
            response: response.to_vec(),
        }
    }
}

impl Mechanism for Relay {
    fn name(&self) -> &'static str {
        self.name
    }

    fn start(&mut self, _creds: &dyn Credentials) -> Result<Option<Vec<u8>>> {
        let mut token = self.challenge.clone();
        token.push(0);
        token.extend_from_slice(&self.response);
        Ok(Some(token))
    }

    fn step(&mut self, _creds: &dyn Credentials, _challenge: &[u8]) -> Result<Step> {
        Err(unexpected_challenge(self.name))
    }
}

/// Splits `k=v,k="quoted, value"` directive lists.
pub(crate) fn parse_directives(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut chars = text.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    c => value.push(c),
                }
            }
            while chars.peek().is_some_and(|c| *c != ',') {
                chars.next();
            }
        } else {
            while let Some(c) = chars.peek().copied() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        out.push((key.trim().to_string(), value.trim().to_string()));
    }
    out
}
