pub mod config;
pub mod continuation;
pub mod crypto;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod sasl;
pub mod session;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EngineConfig;
pub use continuation::ContinuationToken;
pub use engine::{AuthRequest, AuthResponse, AuthStatus, Engine};
pub use error::{Error, Result};
pub use sasl::AuthMethod;
pub use session::Session;
