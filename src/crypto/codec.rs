use base64::{Engine, engine::general_purpose::STANDARD};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid hex: {0}")]
    Hex(String),

    #[error("invalid base64: {0}")]
    Base64(String),

    #[error("argument is missing its {{N}} length prefix")]
    MissingLength,

    #[error("declared length {declared} but decoded {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("malformed key: {0}")]
    Key(String),

    #[error("cipher failure: {0}")]
    Cipher(String),

    #[error("payload is not valid UTF-8")]
    Utf8,
}

/// Encodes binary data as `{N}<base64>` where N is the raw length.
pub fn encode_blob(data: &[u8]) -> String {
    format!("{{{}}}{}", data.len(), STANDARD.encode(data))
}

pub fn is_blob(arg: &str) -> bool {
    arg.starts_with('{') && arg.contains('}')
}

/// Decodes the `{N}<base64>` form, checking the decoded length against N.
pub fn decode_blob(arg: &str) -> Result<Vec<u8>, CodecError> {
    let rest = arg.strip_prefix('{').ok_or(CodecError::MissingLength)?;
    let (len, data) = rest.split_once('}').ok_or(CodecError::MissingLength)?;
    let declared = len
        .trim()
        .parse::<usize>()
        .map_err(|_| CodecError::MissingLength)?;
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| CodecError::Base64(e.to_string()))?;

    if bytes.len() != declared {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

pub fn to_hex(data: &[u8]) -> String {
    hex::encode(data)
}

pub fn from_hex(text: &str) -> Result<Vec<u8>, CodecError> {
    hex::decode(text.trim()).map_err(|e| CodecError::Hex(e.to_string()))
}

pub(crate) fn b64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub(crate) fn unb64(text: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| CodecError::Base64(e.to_string()))
}
