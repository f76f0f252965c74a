//! Client side of the password server line protocol.
//!
//! This module defines how the engine talks to a password server: the request
//! verbs it emits, how replies and coded errors are interpreted, and the
//! transport that moves lines over a socket, optionally wrapped in the
//! session cipher once a command framing key has been established.
//!
//! # Overview
//!
//! Requests are single text lines, `VERB[ SP arg1[ SP arg2 ...]]`, terminated
//! by CRLF. Replies are one line each:
//!
//! - `+OK[ SP payload]`: the command finished.
//! - `+AUTHOK SP hex`: a negotiation step wants another client round.
//! - `-ERR SP code[ SP namespace SP code]`: failure, where the optional
//!   namespace is `SASL` (negotiation library codes) or `POLICY` (account and
//!   password policy).
//!
//! Binary arguments travel as `{N}<base64>` so the receiver can check the
//! decoded length; see [`crate::crypto::encode_blob`].
//!
//! # Framing
//!
//! Once the command framing key is set, every line in both directions is
//! encrypted as a whole (status token included) and sent as base64 text. The
//! server's reply to the validation command itself is always plaintext; the
//! key is installed only after that reply has been read.
//!
//! # Key Components
//!
//! - [`Request`]: a verb and its arguments.
//! - [`Reply`]: a parsed reply line, including [`WireError`] for `-ERR`.
//! - [`LineTransport`]: line reader/writer over any `Read + Write` stream.
//! - [`Connection`]: a connected TCP transport with timeouts and liveness.
//!
//! # See Also
//!
//! - [`handshake`](crate::handshake): first commands sent on a new connection.
//! - [`sasl`](crate::sasl): the `USER`/`AUTH`/`AUTH2` negotiation loop.
mod connection;
mod request;
mod response;
pub(crate) mod thread;
mod transport;

pub use connection::Connection;
pub use request::Request;
pub use response::{ErrorSpace, PolicyCode, Reply, WireError};
pub use transport::{LineTransport, TransportError};

/// Well-known password server port.
pub const DEFAULT_PORT: u16 = 3659;
