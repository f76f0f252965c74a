//! Error taxonomy for the password server client.
//!
//! The server reports failures in three independent numbering spaces: a bare
//! numeric server code, the `POLICY` sub-namespace for account and password
//! policy failures, and the `SASL` sub-namespace for negotiation library
//! codes. All three fold into the single [`Error`] enum; the numeric code is
//! kept on the variant for diagnostics.
use thiserror::Error;

use crate::{
    crypto::CodecError,
    discovery::CacheError,
    protocol::{PolicyCode, TransportError},
};

/// Result type for every public engine operation.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Caller supplied input the engine cannot work with.
    #[error("invalid parameter: {0}")]
    Parameter(String),

    /// Every replica source and locality tier was exhausted.
    #[error("no password server found")]
    NoServerFound,

    /// Handshake or validation failed, or the server answered with a bare code.
    #[error("server error: {reason}")]
    Server { reason: String, code: Option<i32> },

    /// The validated server key does not match the identity we expected.
    #[error("server identity mismatch: expected {expected}, found {found}")]
    IdentityMismatch { expected: String, found: String },

    #[error("not authorized")]
    NotAuthorized,

    #[error("authentication failed")]
    AuthFailed,

    #[error("account disabled")]
    AccountDisabled,

    #[error("account expired")]
    AccountExpired,

    #[error("password policy violation: {0:?}")]
    PasswordPolicy(PolicyCode),

    /// Code from the negotiation library's numbering space.
    #[error("negotiation error {code}: {reason}")]
    Negotiation { code: i32, reason: String },

    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("memory error: {0}")]
    Memory(String),

    #[error("invalid continuation")]
    InvalidContinuation,

    /// Operation attempted on a context that was already closed.
    #[error("session context closed")]
    ContextClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Negotiation library codes seen on the wire and raised locally.
pub mod sasl_code {
    pub const FAIL: i32 = -1;
    pub const NOMECH: i32 = -4;
    pub const BADPROT: i32 = -5;
    pub const BADPARAM: i32 = -7;
    pub const BADAUTH: i32 = -13;
    pub const NOAUTHZ: i32 = -14;
    pub const EXPIRED: i32 = -18;
    pub const DISABLED: i32 = -19;
    pub const NOUSER: i32 = -20;
}

impl Error {
    pub(crate) fn server(reason: impl Into<String>) -> Self {
        Error::Server {
            reason: reason.into(),
            code: None,
        }
    }

    pub(crate) fn negotiation(code: i32, reason: impl Into<String>) -> Self {
        Error::Negotiation {
            code,
            reason: reason.into(),
        }
    }

    /// Closed sockets and timeouts; these earn one reconnect-and-retry.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub fn is_identity_mismatch(&self) -> bool {
        matches!(self, Error::IdentityMismatch { .. })
    }

    /// Numeric code carried by the variant, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Server { code, .. } => *code,
            Error::Negotiation { code, .. } => Some(*code),
            Error::PasswordPolicy(policy) => Some(*policy as i32),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Transport(value.into())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(value: std::sync::PoisonError<T>) -> Self {
        Error::Memory(format!("lock poisoned: {value}"))
    }
}
