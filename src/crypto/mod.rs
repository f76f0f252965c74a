//! Cryptographic leaf utilities.
//!
//! Everything above the transport consumes these: the length-prefixed
//! base64 argument codec and hex helpers, MD5 digests, the AES-CBC session
//! cipher used for line framing and bulk sync payloads, and the server's
//! RSA public key with its identity hash.
//!
//! # Key Components
//!
//! - [`SessionCipher`]: symmetric framing with a running IV per direction.
//! - [`ServerKey`]: parsed server key blob plus [`IdentityHash`].
//! - [`encode_blob`] / [`decode_blob`]: the `{N}<base64>` argument form.
mod cipher;
mod codec;
mod server_key;

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};

pub use cipher::SessionCipher;
pub use codec::{CodecError, decode_blob, encode_blob, from_hex, is_blob, to_hex};
pub use server_key::{IdentityHash, ServerKey, keys_equal};

/// MD5 over the concatenation of `parts`.
pub fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub fn md5_hex(parts: &[&[u8]]) -> String {
    to_hex(&md5(parts))
}

pub fn hmac_md5(key: &[u8], data: &[u8]) -> Result<[u8; 16], CodecError> {
    let mut mac = Hmac::<Md5>::new_from_slice(key)
        .map_err(|e| CodecError::Cipher(format!("HMAC error: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Fills a fresh buffer with OS randomness.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;

    let mut out = [0_u8; N];
    rand::rngs::OsRng.fill_bytes(&mut out);
    out
}
