use std::{
    io,
    net::{Shutdown, SocketAddr, TcpStream},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    crypto::{SessionCipher, decode_blob, is_blob},
    error::Result,
};

use super::{LineTransport, Reply, Request, TransportError};

/// A live TCP connection to one password server.
pub struct Connection {
    transport: LineTransport<TcpStream>,
    peer: SocketAddr,
    banner: String,
    unsolicited_key: Option<Vec<u8>>,
}

impl Connection {
    /// Connects with a bounded timeout and reads the server greeting.
    pub fn connect(addr: SocketAddr, timeout: Duration, recv_timeout: Duration) -> Result<Self> {
        debug!("connecting to {addr} (timeout {timeout:?})");
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(TransportError::from)?;
        Self::from_stream(stream, recv_timeout)
    }

    /// Adopts an already connected socket (e.g. one that won a probe race).
    pub fn from_stream(stream: TcpStream, recv_timeout: Duration) -> Result<Self> {
        let peer = stream.peer_addr().map_err(TransportError::from)?;
        stream
            .set_read_timeout(Some(recv_timeout))
            .map_err(TransportError::from)?;
        stream
            .set_write_timeout(Some(recv_timeout))
            .map_err(TransportError::from)?;
        stream.set_nodelay(true).map_err(TransportError::from)?;

        let mut conn = Self {
            transport: LineTransport::new(stream),
            peer,
            banner: String::new(),
            unsolicited_key: None,
        };
        conn.read_greeting()?;
        info!("connected to password server at {peer}");
        Ok(conn)
    }

    fn read_greeting(&mut self) -> Result<()> {
        let line = self.transport.read_line()?;
        let banner = Reply::parse(&line)?.into_payload()?;

        if let Some(last) = banner.split_whitespace().last().filter(|t| is_blob(t)) {
            match decode_blob(last) {
                Ok(key) => self.unsolicited_key = Some(key),
                Err(e) => warn!("ignoring malformed key in greeting: {e}"),
            }
        }
        self.banner = banner;
        Ok(())
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn banner(&self) -> &str {
        &self.banner
    }

    /// Public key the server volunteered with its greeting, if any.
    pub fn take_unsolicited_key(&mut self) -> Option<Vec<u8>> {
        self.unsolicited_key.take()
    }

    pub fn set_cipher(&mut self, cipher: SessionCipher) {
        self.transport.set_cipher(cipher);
    }

    pub fn is_encrypted(&self) -> bool {
        self.transport.is_encrypted()
    }

    pub fn send(&mut self, req: &Request) -> Result<()> {
        Ok(self.transport.write_request(req)?)
    }

    pub fn receive(&mut self) -> Result<Reply> {
        let line = self.transport.read_line()?;
        Ok(Reply::parse(&line)?)
    }

    pub fn send_and_receive(&mut self, req: &Request) -> Result<Reply> {
        self.send(req)?;
        self.receive()
    }

    /// Convenience for commands whose only successful answer is `+OK`.
    pub fn command(&mut self, req: &Request) -> Result<String> {
        self.send_and_receive(req)?.into_payload()
    }

    pub fn set_receive_timeout(&self, timeout: Duration) -> Result<()> {
        self.transport
            .get_ref()
            .set_read_timeout(Some(timeout))
            .map_err(|e| TransportError::from(e).into())
    }

    /// Non-blocking peek: a closed peer reads as zero bytes, a live idle
    /// one would block.
    pub fn is_alive(&self) -> bool {
        let stream = self.transport.get_ref();
        if stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [0_u8; 1];
        let alive = match stream.peek(&mut byte) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        };
        alive && stream.set_nonblocking(false).is_ok()
    }

    /// Optionally says `QUIT` under a short receive timeout, then always
    /// closes the socket. Framing keys go with the transport.
    pub fn disconnect(mut self, send_quit: bool, quit_timeout: Duration) {
        if send_quit {
            let quit = self
                .set_receive_timeout(quit_timeout)
                .and_then(|_| self.send_and_receive(&Request::quit()));
            if let Err(e) = quit {
                debug!("quit to {} failed: {e}", self.peer);
            }
        }
        self.transport.clear_cipher();
        let _ = self.transport.get_ref().shutdown(Shutdown::Both);
        info!("disconnected from {}", self.peer);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::testing::MockServer;

    use super::*;

    const T: Duration = Duration::from_secs(2);

    #[test]
    fn greeting_and_command() {
        let server = MockServer::spawn(|session| {
            session.expect("LIST");
            session.reply("+OK (SASL \"CRAM-MD5\")");
        });

        let mut conn = Connection::connect(server.addr(), T, T).unwrap();
        assert!(conn.banner().starts_with("PasswordServer"));
        assert!(conn.take_unsolicited_key().is_none());
        assert_eq!(
            conn.command(&Request::list_mechanisms()).unwrap(),
            "(SASL \"CRAM-MD5\")"
        );
        conn.disconnect(false, T);
    }

    #[test]
    fn liveness_detects_closed_peer() {
        let server = MockServer::spawn(|session| {
            session.expect("QUIT");
            session.reply("+OK");
        });

        let mut conn = Connection::connect(server.addr(), T, T).unwrap();
        assert!(conn.is_alive());
        conn.command(&Request::quit()).unwrap();
        server.join();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!conn.is_alive());
    }

    #[test]
    fn quit_failure_still_closes() {
        let server = MockServer::spawn(|session| {
            session.expect("QUIT");
            // no reply; the client times out and closes anyway
            std::thread::sleep(Duration::from_millis(300));
        });

        let conn = Connection::connect(server.addr(), T, T).unwrap();
        conn.disconnect(true, Duration::from_millis(50));
        server.join();
    }
}
