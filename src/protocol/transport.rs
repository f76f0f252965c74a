use std::io::{self, BufRead, BufReader, Read, Write};

use log::trace;
use thiserror::Error;

use crate::crypto::{CodecError, SessionCipher};

use super::Request;

/// Longest reply line accepted, after decryption.
const MAX_LINE: u64 = 1 << 22;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("reply line exceeds {MAX_LINE} bytes")]
    LineTooLong,

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("framing error: {0}")]
    Framing(#[from] CodecError),
}

impl TransportError {
    fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => TransportError::Closed,
            _ => TransportError::Io(err),
        }
    }
}

/// CRLF line transport over any byte stream, with optional cipher framing.
pub struct LineTransport<T: Read + Write> {
    stream: BufReader<T>,
    cipher: Option<SessionCipher>,
}

impl<T: Read + Write> LineTransport<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream: BufReader::new(stream),
            cipher: None,
        }
    }

    pub fn get_ref(&self) -> &T {
        self.stream.get_ref()
    }

    /// Installs the command framing key; every later line is encrypted.
    pub fn set_cipher(&mut self, cipher: SessionCipher) {
        self.cipher = Some(cipher);
    }

    pub fn clear_cipher(&mut self) {
        self.cipher = None;
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn write_request(&mut self, req: &Request) -> Result<(), TransportError> {
        trace!("sending {req:?}");
        self.write_line(&req.line())
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut out = match self.cipher.as_mut() {
            Some(cipher) => cipher.seal_line(line)?,
            None => line.to_string(),
        };
        out.push_str("\r\n");

        let stream = self.stream.get_mut();
        stream
            .write_all(out.as_bytes())
            .map_err(TransportError::from_io)?;
        stream.flush().map_err(TransportError::from_io)
    }

    /// Reads one line, decrypting it when framing is active.
    pub fn read_line(&mut self) -> Result<String, TransportError> {
        let line = self.read_raw_line()?;
        match self.cipher.as_mut() {
            Some(cipher) => Ok(cipher.open_line(&line)?),
            None => Ok(line),
        }
    }

    fn read_raw_line(&mut self) -> Result<String, TransportError> {
        let mut buf = Vec::new();
        let read = self
            .stream
            .by_ref()
            .take(MAX_LINE + 1)
            .read_until(b'\n', &mut buf)
            .map_err(TransportError::from_io)?;

        if read == 0 {
            return Err(TransportError::Closed);
        }
        if !buf.ends_with(b"\n") {
            return Err(if read as u64 > MAX_LINE {
                TransportError::LineTooLong
            } else {
                TransportError::Closed
            });
        }

        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        String::from_utf8(buf).map_err(|_| TransportError::Framing(CodecError::Utf8))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn rewind(transport: &mut LineTransport<Cursor<Vec<u8>>>) {
        transport.stream.get_mut().set_position(0);
    }

    #[test]
    fn read_write_request() {
        let mut transport = LineTransport::new(Cursor::new(Vec::new()));

        transport.write_request(&Request::rsa_public()).unwrap();
        assert_eq!(transport.get_ref().get_ref(), b"RSAPUBLIC\r\n");

        rewind(&mut transport);
        assert_eq!(transport.read_line().unwrap(), "RSAPUBLIC");
    }

    #[test]
    fn read_write_encrypted() {
        let mut transport = LineTransport::new(Cursor::new(Vec::new()));
        transport.set_cipher(SessionCipher::from_nonce(b"n"));

        transport.write_request(&Request::quit()).unwrap();
        let wire = transport.get_ref().get_ref().clone();
        assert!(!String::from_utf8_lossy(&wire).contains("QUIT"));

        // A second transport with a fresh chain reads what the first wrote.
        let mut peer = LineTransport::new(Cursor::new(wire));
        peer.set_cipher(SessionCipher::from_nonce(b"n"));
        assert_eq!(peer.read_line().unwrap(), "QUIT");
    }

    #[test]
    fn eof_is_closed() {
        let mut transport = LineTransport::new(Cursor::new(b"+OK partial".to_vec()));
        assert!(matches!(transport.read_line(), Err(TransportError::Closed)));

        let mut empty = LineTransport::new(Cursor::new(Vec::new()));
        assert!(matches!(empty.read_line(), Err(TransportError::Closed)));
    }

    #[test]
    fn strips_line_endings() {
        let mut transport = LineTransport::new(Cursor::new(b"+OK a\r\n+OK b\n".to_vec()));
        assert_eq!(transport.read_line().unwrap(), "+OK a");
        assert_eq!(transport.read_line().unwrap(), "+OK b");
    }
}
