//! Scripted password server for tests.
//!
//! A [`MockServer`] listens on an ephemeral loopback port, accepts a fixed
//! number of connections on a background thread, sends the greeting and
//! hands each connection to a script. Scripts assert on what the client
//! sends; a failed assertion surfaces in the test through [`MockServer::join`].
use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    sync::OnceLock,
    thread::{self, JoinHandle},
};

use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, traits::PublicKeyParts};

use crate::{
    crypto::{SessionCipher, decode_blob, encode_blob, md5, random_bytes},
    handshake::VALIDATION_MARKER,
    protocol::LineTransport,
};

pub const GREETING: &str = "+OK PasswordServer 10.1 mock";

/// 512-bit key shared by every test in the process.
pub fn test_private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::rngs::OsRng, 512).expect("generate test key")
    })
}

/// The test key as a server key blob.
pub fn test_key_blob(comment: &str) -> String {
    let key = test_private_key();
    format!("{} {} {} {comment}", key.size() * 8, key.e(), key.n())
}

/// How the mock proves it holds the private key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofStyle {
    Hash,
    Literal,
    Bogus,
}

pub struct MockServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub fn spawn<F>(script: F) -> Self
    where
        F: FnOnce(&mut MockSession) + Send + 'static,
    {
        Self::with_greeting(GREETING, script)
    }

    pub fn with_greeting<F>(greeting: &str, script: F) -> Self
    where
        F: FnOnce(&mut MockSession) + Send + 'static,
    {
        let mut script = Some(script);
        Self::serve(greeting, 1, move |_, session| {
            if let Some(script) = script.take() {
                script(session);
            }
        })
    }

    /// Accepts `connections` clients one after another; the script gets the
    /// connection's index.
    pub fn spawn_many<F>(connections: usize, script: F) -> Self
    where
        F: FnMut(usize, &mut MockSession) + Send + 'static,
    {
        Self::serve(GREETING, connections, script)
    }

    fn serve<F>(greeting: &str, connections: usize, mut script: F) -> Self
    where
        F: FnMut(usize, &mut MockSession) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("mock address");
        let greeting = greeting.to_string();

        let handle = thread::spawn(move || {
            for idx in 0..connections {
                let (stream, _) = listener.accept().expect("accept client");
                let mut session = MockSession::new(stream);
                session.reply(&greeting);
                script(idx, &mut session);
            }
        });

        Self { addr, handle }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Node name pointing at this server.
    pub fn node(&self) -> String {
        format!("/PasswordServer/127.0.0.1:{}", self.addr.port())
    }

    /// Waits for the script, re-raising its panic.
    pub fn join(self) {
        if let Err(panic) = self.handle.join() {
            std::panic::resume_unwind(panic);
        }
    }
}

pub struct MockSession {
    transport: LineTransport<TcpStream>,
}

impl MockSession {
    fn new(stream: TcpStream) -> Self {
        Self {
            transport: LineTransport::new(stream),
        }
    }

    pub fn read(&mut self) -> String {
        self.transport.read_line().expect("client line")
    }

    /// Next line, or `None` once the client has gone away.
    pub fn try_read(&mut self) -> Option<String> {
        self.transport.read_line().ok()
    }

    pub fn expect(&mut self, prefix: &str) -> String {
        let line = self.read();
        assert!(
            line.starts_with(prefix),
            "expected '{prefix}', client sent '{line}'"
        );
        line
    }

    pub fn reply(&mut self, line: &str) {
        self.transport.write_line(line).expect("reply to client");
    }

    pub fn set_cipher(&mut self, cipher: SessionCipher) {
        self.transport.set_cipher(cipher);
    }

    pub fn serve_rsa_public(&mut self) {
        self.expect("RSAPUBLIC");
        let blob = encode_blob(test_key_blob("root@mock").as_bytes());
        self.reply(&format!("+OK {blob}"));
    }

    /// Recovers the nonce from a `{N}<b64 RSA(nonce ++ marker)>` argument.
    pub fn open_nonce(&self, arg: &str) -> Vec<u8> {
        let ct = decode_blob(arg.trim()).expect("sealed nonce blob");
        let pt = test_private_key()
            .decrypt(Pkcs1v15Encrypt, &ct)
            .expect("decrypt nonce");
        assert!(pt.ends_with(VALIDATION_MARKER), "validation marker missing");
        pt[..pt.len() - VALIDATION_MARKER.len()].to_vec()
    }

    /// Answers `GETBIGRANDOM` and `RSAVALIDATE`; returns the nonce.
    pub fn serve_validation(&mut self, style: ProofStyle) -> Vec<u8> {
        self.expect("GETBIGRANDOM");
        self.reply(&format!("+OK {}", encode_blob(&random_bytes::<32>())));

        let line = self.expect("RSAVALIDATE ");
        let nonce = self.open_nonce(&line["RSAVALIDATE ".len()..]);
        let proof = match style {
            ProofStyle::Hash => md5(&[nonce.as_slice()]).to_vec(),
            ProofStyle::Literal => nonce.clone(),
            ProofStyle::Bogus => b"not the nonce".to_vec(),
        };
        self.reply(&format!("+OK {}", encode_blob(&proof)));

        if style != ProofStyle::Bogus {
            self.set_cipher(SessionCipher::from_nonce(&nonce));
        }
        nonce
    }

    /// Key, validation and mechanism list, as the engine drives them.
    pub fn serve_handshake(&mut self) {
        self.serve_rsa_public();
        self.serve_validation(ProofStyle::Hash);
        self.expect("LIST");
        self.reply("+OK (SASL \"CRAM-MD5\" \"DIGEST-MD5\" \"PLAIN\" \"TWOWAYRANDOM\")");
    }
}

impl MockSession {
    /// Plays the server side of `DIGEST-MD5` for `username`/`secret`,
    /// checking the client's response and proving knowledge of the secret.
    pub fn serve_digest(&mut self, username: &str, secret: &[u8]) {
        use crate::{
            crypto::{from_hex, to_hex},
            sasl::{DigestParams, parse_directives},
        };

        self.expect(&format!("USER {username} AUTH DIGEST-MD5"));
        let challenge = "realm=\"mock\",nonce=\"OA6MG9tEQGm2hh\",qop=\"auth\",charset=utf-8";
        self.reply(&format!("+AUTHOK {}", to_hex(challenge.as_bytes())));

        let line = self.expect("AUTH2 ");
        let token = from_hex(&line["AUTH2 ".len()..]).expect("hex digest response");
        let fields = parse_directives(&String::from_utf8_lossy(&token));
        let get = |key: &str| {
            fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };

        let (cnonce, uri) = (get("cnonce"), get("digest-uri"));
        let params = DigestParams {
            username,
            realm: "mock",
            secret,
            nonce: "OA6MG9tEQGm2hh",
            cnonce: &cnonce,
            nc: "00000001",
            qop: "auth",
            digest_uri: &uri,
        };
        assert_eq!(get("response"), params.compute("AUTHENTICATE"), "digest response");
        let rspauth = format!("rspauth={}", params.compute(""));
        self.reply(&format!("+OK {}", to_hex(rspauth.as_bytes())));
    }
}
