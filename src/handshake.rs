//! First commands on a fresh connection: learn the server's key, prove the
//! server holds the matching private key, and learn what it can negotiate.
//!
//! # Validation
//!
//! The client asks for a random value (`GETBIGRANDOM`), mixes in its own
//! random bytes to form a nonce, and sends `RSA(nonce ++ "PWSV1")` with
//! `RSAVALIDATE`. Only the holder of the private key can recover the nonce;
//! the server proves it by answering with the nonce's MD5 (older servers
//! answer with the nonce itself). The trailing marker lets a current server
//! refuse a request whose marker was stripped by a downgrade attempt.
//!
//! On success both sides derive the command framing key from the nonce and
//! every later line is encrypted. The validation reply itself is plaintext.
use log::{debug, info, warn};
use zeroize::Zeroizing;

use crate::{
    crypto::{SessionCipher, ServerKey, decode_blob, is_blob, md5, random_bytes},
    error::{Error, Result},
    protocol::{Connection, Request},
};

/// Appended to every validation nonce before encryption.
pub const VALIDATION_MARKER: &[u8] = b"PWSV1";

/// Uses the key volunteered with the greeting, otherwise asks for it.
pub fn fetch_server_public_key(conn: &mut Connection) -> Result<ServerKey> {
    let blob = match conn.take_unsolicited_key() {
        Some(blob) => {
            debug!("using key sent with the greeting");
            blob
        }
        None => {
            let payload = conn.command(&Request::rsa_public())?;
            let payload = payload.trim();
            if is_blob(payload) {
                decode_blob(payload)?
            } else {
                payload.as_bytes().to_vec()
            }
        }
    };

    let key = ServerKey::parse(&blob)
        .map_err(|e| Error::server(format!("unusable server key: {e}")))?;
    debug!("server key identity {}", key.identity());
    Ok(key)
}

/// Mechanism names from `+OK (SASL "A" "B" ...)`.
pub fn parse_mechanisms(payload: &str) -> Vec<String> {
    payload
        .split('"')
        .skip(1)
        .step_by(2)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn list_mechanisms(conn: &mut Connection) -> Result<Vec<String>> {
    let payload = conn.command(&Request::list_mechanisms())?;
    let mechanisms = parse_mechanisms(&payload);
    debug!("server offers {mechanisms:?}");
    Ok(mechanisms)
}

/// Builds a fresh nonce from the server's random value and returns it with
/// the validation ciphertext `RSA(nonce ++ marker)`.
pub(crate) fn seal_nonce(
    key: &ServerKey,
    server_random: &[u8],
) -> Result<(Zeroizing<[u8; 16]>, Vec<u8>)> {
    let client_random = Zeroizing::new(random_bytes::<16>());
    let nonce = Zeroizing::new(md5(&[server_random, client_random.as_slice()]));

    let mut plaintext = Zeroizing::new(Vec::with_capacity(nonce.len() + VALIDATION_MARKER.len()));
    plaintext.extend_from_slice(nonce.as_slice());
    plaintext.extend_from_slice(VALIDATION_MARKER);
    let ciphertext = key.encrypt(&plaintext)?;
    Ok((nonce, ciphertext))
}

/// Accepts the server's proof: the MD5 of the nonce, or the nonce itself
/// for older servers.
pub(crate) fn check_proof(nonce: &[u8], proof: &[u8]) -> Result<()> {
    if proof == md5(&[nonce]) {
        Ok(())
    } else if proof == nonce {
        warn!("server proved its key with the bare nonce");
        Ok(())
    } else {
        Err(Error::server("server failed to prove its identity"))
    }
}

pub(crate) fn big_random(conn: &mut Connection) -> Result<Vec<u8>> {
    let payload = conn.command(&Request::big_random())?;
    let random = decode_blob(payload.trim())?;
    if random.is_empty() {
        return Err(Error::server("server sent an empty random value"));
    }
    Ok(random)
}

/// Challenges the server to decrypt a nonce with the private key matching
/// `key`, then installs the command framing key.
pub fn validate_server(conn: &mut Connection, key: &ServerKey) -> Result<()> {
    let server_random = big_random(conn)?;
    let (nonce, ciphertext) = seal_nonce(key, &server_random)?;

    let payload = conn
        .command(&Request::rsa_validate(&ciphertext))
        .map_err(|e| match e {
            Error::Transport(_) => e,
            other => Error::server(format!("validation refused: {other}")),
        })?;
    let proof = decode_blob(payload.trim())
        .map_err(|e| Error::server(format!("malformed validation reply: {e}")))?;
    check_proof(nonce.as_slice(), &proof)?;

    conn.set_cipher(SessionCipher::from_nonce(nonce.as_slice()));
    info!("validated server {} ({})", conn.peer(), key.identity());
    Ok(())
}
