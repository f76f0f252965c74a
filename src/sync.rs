//! The `SYNC` sub-protocol used by replication tooling.
//!
//! Sync payloads travel under their own key, negotiated with
//! `SYNC SESSIONKEY` the same way validation negotiates the command framing
//! key but from a fresh nonce. Payloads are zlib compressed, encrypted with
//! the sync key, and then sent as a `{N}<base64>` argument on the already
//! encrypted command channel.
use std::{
    fs::File,
    io::{self, BufReader, Read, Write},
    path::Path,
};

use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use log::{debug, info};

use crate::{
    crypto::{SessionCipher, decode_blob},
    error::{Error, Result},
    handshake::{big_random, check_proof, seal_nonce},
    protocol::Request,
    session::SessionState,
};

/// Negotiates the sync key unless the session already has one.
pub fn ensure_sync_key(state: &mut SessionState) -> Result<()> {
    if state.sync_cipher.is_some() {
        return Ok(());
    }
    let key = state
        .server_key
        .clone()
        .ok_or_else(|| Error::server("sync needs a validated server"))?;
    let conn = state.connection()?;

    let server_random = big_random(conn)?;
    let (nonce, ciphertext) = seal_nonce(&key, &server_random)?;
    let payload = conn.command(&Request::sync("SESSIONKEY").blob(&ciphertext))?;
    check_proof(nonce.as_slice(), &decode_blob(payload.trim())?)?;

    state.sync_cipher = Some(SessionCipher::from_nonce(nonce.as_slice()));
    debug!("sync key established");
    Ok(())
}

fn sync_cipher(state: &mut SessionState) -> Result<&mut SessionCipher> {
    state
        .sync_cipher
        .as_mut()
        .ok_or_else(|| Error::server("no sync key"))
}

/// Fetches changes since `since`. The compressed payload is staged in a
/// temporary file under `dir` that is gone when this returns.
pub fn pull(state: &mut SessionState, since: &str, dir: &Path) -> Result<Vec<u8>> {
    ensure_sync_key(state)?;
    let payload = state
        .connection()?
        .command(&Request::sync("PULL").arg(since))?;
    let sealed = decode_blob(payload.trim())?;
    let compressed = sync_cipher(state)?.decrypt(&sealed)?;

    let mut staged = tempfile::Builder::new()
        .prefix("pwsync")
        .tempfile_in(dir)
        .map_err(|e| Error::Memory(format!("cannot stage sync payload: {e}")))?;
    staged
        .write_all(&compressed)
        .and_then(|_| staged.flush())
        .map_err(|e| Error::Memory(format!("cannot stage sync payload: {e}")))?;
    let path = staged.into_temp_path();
    state.sync_file = Some(path);

    let data = state
        .sync_file
        .as_ref()
        .map(|p| inflate_file(p))
        .unwrap_or_else(|| Ok(Vec::new()));

    if let Some(path) = state.sync_file.take() {
        path.close()
            .map_err(|e| Error::Memory(format!("cannot remove sync payload: {e}")))?;
    }
    let data = data.map_err(|e| Error::server(format!("corrupt sync payload: {e}")))?;
    info!("pulled {} bytes of sync data", data.len());
    Ok(data)
}

fn inflate_file(path: &Path) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(BufReader::new(File::open(path)?)).read_to_end(&mut out)?;
    Ok(out)
}

pub fn deflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Sends local changes; counts the uncompressed bytes pushed.
pub fn push(state: &mut SessionState, data: &[u8]) -> Result<()> {
    ensure_sync_key(state)?;
    let compressed =
        deflate(data).map_err(|e| Error::Memory(format!("cannot compress sync data: {e}")))?;
    let sealed = sync_cipher(state)?.encrypt(&compressed)?;
    state
        .connection()?
        .command(&Request::sync("PUSH").blob(&sealed))?;

    state.bytes_pushed += data.len() as u64;
    debug!("pushed {} bytes ({} total)", data.len(), state.bytes_pushed);
    Ok(())
}

/// Asks the server to apply pushed data. The server never answers.
pub fn process_no_reply(state: &mut SessionState) -> Result<()> {
    state
        .connection()?
        .send(&Request::sync("PROCESS-NO-REPLY"))
}

pub fn setup_replica(state: &mut SessionState, name: &str) -> Result<String> {
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(Error::Parameter(format!("bad replica name '{name}'")));
    }
    state
        .connection()?
        .command(&Request::sync("SETUPREPLICA").arg(name))
}
