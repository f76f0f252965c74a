use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{
    CodecError,
    codec::{b64, unb64},
    md5,
};

type Encryptor = cbc::Encryptor<Aes128>;
type Decryptor = cbc::Decryptor<Aes128>;

const BLOCK: usize = 16;

/// AES-128-CBC with a running IV per direction.
///
/// Each message continues the chain of the previous one: the IV for the
/// next message is the last ciphertext block of the one before it. Both
/// peers derive the same starting key and IV from a shared nonce, so the
/// sending chain of one side is the receiving chain of the other.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionCipher {
    key: [u8; BLOCK],
    send_iv: [u8; BLOCK],
    recv_iv: [u8; BLOCK],
}

impl SessionCipher {
    pub fn new(key: [u8; BLOCK], iv: [u8; BLOCK]) -> Self {
        Self {
            key,
            send_iv: iv,
            recv_iv: iv,
        }
    }

    /// Derives key and IV from a nonce both peers know after a handshake.
    pub fn from_nonce(nonce: &[u8]) -> Self {
        Self::new(md5(&[b"key", nonce]), md5(&[b"iv", nonce]))
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let ct = Encryptor::new_from_slices(&self.key, &self.send_iv)
            .map_err(|e| CodecError::Cipher(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        self.send_iv.copy_from_slice(&ct[ct.len() - BLOCK..]);
        Ok(ct)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK != 0 {
            return Err(CodecError::Cipher(format!(
                "ciphertext length {} is not a positive multiple of {BLOCK}",
                ciphertext.len()
            )));
        }
        let pt = Decryptor::new_from_slices(&self.key, &self.recv_iv)
            .map_err(|e| CodecError::Cipher(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CodecError::Cipher("bad padding".to_string()))?;
        self.recv_iv
            .copy_from_slice(&ciphertext[ciphertext.len() - BLOCK..]);
        Ok(pt)
    }

    /// Encrypts one protocol line (without its CRLF) into base64 text.
    pub fn seal_line(&mut self, line: &str) -> Result<String, CodecError> {
        Ok(b64(&self.encrypt(line.as_bytes())?))
    }

    pub fn open_line(&mut self, line: &str) -> Result<String, CodecError> {
        let pt = self.decrypt(&unb64(line)?)?;
        String::from_utf8(pt).map_err(|_| CodecError::Utf8)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher { .. }")
    }
}
