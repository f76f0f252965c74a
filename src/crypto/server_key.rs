use std::fmt;

use bincode::{Decode, Encode};
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPublicKey};

use super::{CodecError, md5_hex};

/// Stable digest of a server's public key, used to recognize the same
/// server (or replica set) across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct IdentityHash(String);

impl IdentityHash {
    /// Wraps an already computed hash, normalized to lowercase.
    pub fn new(hash: impl AsRef<str>) -> Self {
        Self(hash.as_ref().trim().to_ascii_lowercase())
    }

    /// A username qualifier is either a full key blob or its hash.
    pub fn from_qualifier(qualifier: &str) -> Self {
        match key_material(qualifier) {
            Some(material) => Self(md5_hex(&[material.as_bytes()])),
            None => Self::new(qualifier),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A server's RSA public key in its textual blob form:
/// `<bits> <exponent> <modulus> [comment]`, integers in decimal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKey {
    blob: String,
    key: RsaPublicKey,
    identity: IdentityHash,
}

impl ServerKey {
    pub fn parse(blob: &[u8]) -> Result<Self, CodecError> {
        let blob = std::str::from_utf8(blob)
            .map_err(|_| CodecError::Utf8)?
            .trim_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_string();
        let material =
            key_material(&blob).ok_or_else(|| CodecError::Key(format!("'{blob}'")))?;

        let mut parts = material.split(' ');
        let (Some(_bits), Some(e), Some(n)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(CodecError::Key("expected bits, exponent and modulus".to_string()));
        };
        let e = BigUint::parse_bytes(e.as_bytes(), 10)
            .ok_or_else(|| CodecError::Key("bad exponent".to_string()))?;
        let n = BigUint::parse_bytes(n.as_bytes(), 10)
            .ok_or_else(|| CodecError::Key("bad modulus".to_string()))?;
        let key = RsaPublicKey::new(n, e).map_err(|e| CodecError::Key(e.to_string()))?;
        let identity = IdentityHash(md5_hex(&[material.as_bytes()]));

        Ok(Self {
            blob,
            key,
            identity,
        })
    }

    pub fn identity(&self) -> &IdentityHash {
        &self.identity
    }

    pub fn blob(&self) -> &str {
        &self.blob
    }

    /// PKCS#1 v1.5 encryption to the server.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.key
            .encrypt(&mut rand::rngs::OsRng, Pkcs1v15Encrypt, data)
            .map_err(|e| CodecError::Key(e.to_string()))
    }
}

/// Returns `"<bits> <exponent> <modulus>"` with single spaces when the text
/// starts with three decimal integers.
fn key_material(text: &str) -> Option<String> {
    let parts: Vec<&str> = text.split_whitespace().take(3).collect();
    let numeric = |s: &&str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if parts.len() == 3 && parts.iter().all(numeric) {
        Some(parts.join(" "))
    } else {
        None
    }
}

/// Compares two key blobs ignoring any trailing comment. Two absent keys are
/// equal; an absent key never equals a present one.
pub fn keys_equal(a: Option<&[u8]>, b: Option<&[u8]>) -> bool {
    let normalize = |blob: &[u8]| {
        let text = String::from_utf8_lossy(blob);
        key_material(&text).unwrap_or_else(|| text.trim().to_string())
    };
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => normalize(a) == normalize(b),
        _ => false,
    }
}
