//! The line based handshake that precedes the binary protocol.
//!
//! [`ClientNegotiator`] and [`ServerNegotiator`] are sans-io state machines:
//!
//! - `handle_input()`: feed bytes received from the peer
//! - `poll_transmit()`: get bytes to send to the peer
//! - `is_done()`: the handshake finished and binary messages may flow
//!
//! [`authenticate_client`] and [`authenticate_server`] drive them over a
//! blocking stream. They read one byte at a time, so nothing past the
//! handshake is consumed from the stream.
//!
//! Mechanisms are passed in explicitly, in order of preference.

use std::io::{Read, Write};
use std::sync::Arc;

use tracing::debug;

use crate::error::{AuthFault, ErrorKind, Result};

pub mod client;
pub mod mechanisms;
pub mod server;

pub use self::client::{ClientNegotiator, ClientState};
pub use self::mechanisms::{Anonymous, CookieSha1, External};
pub use self::server::{ServerNegotiator, ServerState};

/// Longest handshake line accepted, terminator included.
pub const MAX_LINE_LEN: usize = 16384;

/// Bytes to be written to the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Transmit {
    pub payload: Vec<u8>,
}

impl Transmit {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }
}

/// Client side of an authentication mechanism.
pub trait ClientMechanism: Send + Sync {
    fn name(&self) -> &str;
    /// A fresh session for one handshake.
    fn start(&self) -> Result<Box<dyn ClientSession>>;
}

pub trait ClientSession: Send {
    /// Sent along with `AUTH <name>`.
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>>;
    /// Answers a `DATA` challenge from the server.
    fn challenge(&mut self, data: &[u8]) -> Result<Vec<u8>>;
    /// Nothing more to send; only `OK` is expected now.
    fn is_complete(&self) -> bool;
}

/// What a server side session wants to do after a client response.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerStep {
    Complete,
    Challenge(Vec<u8>),
    Reject,
}

/// Server side of an authentication mechanism.
pub trait ServerMechanism: Send + Sync {
    fn name(&self) -> &str;
    fn start(&self) -> Box<dyn ServerSession>;
}

pub trait ServerSession: Send {
    /// `response` is `None` for an `AUTH` without an initial response.
    fn step(&mut self, response: Option<&[u8]>) -> ServerStep;
}

/// EXTERNAL then DBUS_COOKIE_SHA1.
pub fn default_client_mechanisms() -> Vec<Arc<dyn ClientMechanism>> {
    vec![Arc::new(External::new()), Arc::new(CookieSha1::new())]
}

/// EXTERNAL then ANONYMOUS.
pub fn default_server_mechanisms() -> Vec<Arc<dyn ServerMechanism>> {
    vec![Arc::new(External::new()), Arc::new(Anonymous)]
}

pub(crate) fn auth_error(fault: AuthFault) -> crate::Error {
    context!(ErrorKind::Auth(fault))
}

/// Removes one complete line from the front of `buf`.
pub(crate) fn take_line(buf: &mut Vec<u8>) -> Result<Option<String>> {
    let end = match buf.windows(2).position(|w| w == b"\r\n") {
        Some(end) => end,
        None if buf.len() >= MAX_LINE_LEN => return Err(auth_error(AuthFault::LineTooLong)),
        None => return Ok(None),
    };
    if end + 2 > MAX_LINE_LEN {
        return Err(auth_error(AuthFault::LineTooLong));
    }
    let line: Vec<u8> = buf.drain(..end + 2).take(end).collect();
    if !line.is_ascii() {
        return Err(auth_error(AuthFault::Malformed(
            String::from_utf8_lossy(&line).into_owned(),
        )));
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|e| auth_error(AuthFault::Malformed(e.to_string())))
}

/// Splits a line into its command and the (possibly empty) rest.
pub(crate) fn split_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    }
}

pub(crate) fn decode_hex(line: &str, data: &str) -> Result<Vec<u8>> {
    hex::decode(data).map_err(|_| auth_error(AuthFault::Malformed(line.to_string())))
}

fn read_line<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte).map_err(map_context!())?;
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            return Ok(line);
        }
        if line.len() >= MAX_LINE_LEN {
            return Err(auth_error(AuthFault::LineTooLong));
        }
    }
}

fn flush<W: Write + ?Sized>(
    writer: &mut W,
    mut next: impl FnMut() -> Option<Transmit>,
) -> Result<()> {
    while let Some(transmit) = next() {
        writer
            .write_all(&transmit.payload)
            .map_err(map_context!())?;
    }
    writer.flush().map_err(map_context!())
}

/// Runs the client handshake over `stream` and returns the server GUID.
pub fn authenticate_client<S: Read + Write + ?Sized>(
    stream: &mut S,
    mechanisms: &[Arc<dyn ClientMechanism>],
) -> Result<String> {
    let mut negotiator = ClientNegotiator::new(mechanisms.to_vec());
    loop {
        flush(stream, || negotiator.poll_transmit())?;
        if let Some(guid) = negotiator.guid().filter(|_| negotiator.is_done()) {
            debug!("authenticated, server guid {}", guid);
            return Ok(guid.to_string());
        }
        let line = read_line(stream)?;
        if let Err(e) = negotiator.handle_input(&line) {
            let _ = flush(stream, || negotiator.poll_transmit());
            return Err(e);
        }
    }
}

/// Runs the server handshake for one accepted client.
pub fn authenticate_server<S: Read + Write + ?Sized>(
    stream: &mut S,
    mechanisms: &[Arc<dyn ServerMechanism>],
    guid: &str,
) -> Result<()> {
    let mut negotiator = ServerNegotiator::new(mechanisms.to_vec(), guid);
    let mut nul = [0u8; 1];
    stream.read_exact(&mut nul).map_err(map_context!())?;
    negotiator.handle_input(&nul)?;
    loop {
        let line = read_line(stream)?;
        let handled = negotiator.handle_input(&line);
        flush(stream, || negotiator.poll_transmit())?;
        handled?;
        if negotiator.is_done() {
            debug!("client authenticated");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::thread;

    #[test]
    fn test_take_line() {
        let mut buf = b"OK 1234\r\nBEG".to_vec();
        assert_eq!(take_line(&mut buf).unwrap(), Some("OK 1234".to_string()));
        assert_eq!(take_line(&mut buf).unwrap(), None);
        assert_eq!(buf, b"BEG");

        let mut long = vec![b'A'; MAX_LINE_LEN];
        assert!(take_line(&mut long).is_err());
    }

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("REJECTED EXTERNAL ANONYMOUS"), ("REJECTED", "EXTERNAL ANONYMOUS"));
        assert_eq!(split_command("BEGIN"), ("BEGIN", ""));
    }

    #[test]
    fn test_blocking_handshake_external() {
        let (mut client, mut server) = UnixStream::pair().unwrap();

        let child = thread::spawn(move || {
            authenticate_server(&mut server, &default_server_mechanisms(), "0123456789abcdef")
        });

        let guid = authenticate_client(&mut client, &default_client_mechanisms()).unwrap();
        assert_eq!(guid, "0123456789abcdef");
        child.join().unwrap().unwrap();
    }

    #[test]
    fn test_blocking_handshake_falls_back_to_anonymous() {
        let (mut client, mut server) = UnixStream::pair().unwrap();

        let child = thread::spawn(move || {
            let mechs: Vec<Arc<dyn ServerMechanism>> =
                vec![Arc::new(External::with_uid(u32::MAX - 1)), Arc::new(Anonymous)];
            authenticate_server(&mut server, &mechs, "feed")
        });

        let mechs: Vec<Arc<dyn ClientMechanism>> = vec![Arc::new(External::new()), Arc::new(Anonymous)];
        assert_eq!(authenticate_client(&mut client, &mechs).unwrap(), "feed");
        child.join().unwrap().unwrap();
    }

    #[test]
    fn test_blocking_handshake_no_common_mechanism() {
        let (mut client, mut server) = UnixStream::pair().unwrap();

        let child = thread::spawn(move || {
            let mechs: Vec<Arc<dyn ServerMechanism>> = vec![Arc::new(Anonymous)];
            authenticate_server(&mut server, &mechs, "feed")
        });

        let mechs: Vec<Arc<dyn ClientMechanism>> = vec![Arc::new(External::new())];
        let e = authenticate_client(&mut client, &mechs).unwrap_err();
        assert!(matches!(
            e.kind(),
            ErrorKind::Auth(AuthFault::NoCommonMechanism(_))
        ));
        drop(client);
        // the server saw CANCEL, answered REJECTED and then lost the client
        assert!(child.join().unwrap().is_err());
    }
}
