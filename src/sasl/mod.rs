//! SASL-style authentication for abstract auth methods.
//!
//! An [`AuthMethod`] is mapped through the mechanism map ([`AuthMethod::info`])
//! to a mechanism name, and [`negotiate`] drives the challenge/response loop
//! for it over a validated [`Connection`](crate::protocol::Connection).
//! Methods without a mechanism (directory queries, bulk sync control)
//! never reach this module.
mod mechanism;
mod methods;
mod negotiate;

pub use mechanism::{CramMd5, Credentials, DigestMd5, Mechanism, Plain, Relay, Step};
#[cfg(test)]
pub(crate) use mechanism::{DigestParams, parse_directives};
pub use methods::{
    AuthMethod, CRAM_MD5, DIGEST_MD5, MethodInfo, MethodKind, PLAIN, TWO_WAY_RANDOM,
};
pub use negotiate::{Exchange, Negotiated, NegotiationState, interpret, negotiate};

/// Builds the client mechanism for a credential or relay method.
pub fn mechanism_for(
    name: &'static str,
    host: &str,
    relay: Option<(&[u8], &[u8])>,
) -> Option<Box<dyn Mechanism>> {
    if let Some((challenge, response)) = relay {
        return Some(Box::new(Relay::new(name, challenge, response)));
    }
    match name {
        PLAIN => Some(Box::new(Plain)),
        CRAM_MD5 => Some(Box::new(CramMd5::default())),
        DIGEST_MD5 => Some(Box::new(DigestMd5::new(host))),
        _ => None,
    }
}
