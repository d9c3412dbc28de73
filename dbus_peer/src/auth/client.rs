//! Client state machine for the authentication handshake.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{
    auth_error, decode_hex, split_command, take_line, ClientMechanism, ClientSession, Transmit,
};
use crate::error::{AuthFault, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// `AUTH` sent, waiting for the list of mechanisms.
    WaitingForMechanisms,
    /// A mechanism is exchanging `DATA` with the server.
    NegotiateMechanism,
    /// The mechanism is done, waiting for `OK`.
    WaitingForOk,
    /// `BEGIN` sent.
    Done,
    Failed,
}

pub struct ClientNegotiator {
    state: ClientState,
    mechanisms: Vec<Arc<dyn ClientMechanism>>,
    /// Index of the next local mechanism to consider.
    next_mechanism: usize,
    offered: Vec<String>,
    session: Option<(String, Box<dyn ClientSession>)>,
    guid: Option<String>,
    send_buf: VecDeque<Transmit>,
    recv_buf: Vec<u8>,
}

impl ClientNegotiator {
    /// Starts a handshake; the NUL byte and `AUTH` are queued right away.
    pub fn new(mechanisms: Vec<Arc<dyn ClientMechanism>>) -> Self {
        let mut negotiator = ClientNegotiator {
            state: ClientState::WaitingForMechanisms,
            mechanisms,
            next_mechanism: 0,
            offered: Vec::new(),
            session: None,
            guid: None,
            send_buf: VecDeque::new(),
            recv_buf: Vec::new(),
        };
        negotiator.send_buf.push_back(Transmit::new(vec![0]));
        negotiator.send_line("AUTH".into());
        negotiator
    }

    pub fn handle_input(&mut self, data: &[u8]) -> Result<()> {
        self.recv_buf.extend_from_slice(data);
        while !matches!(self.state, ClientState::Done | ClientState::Failed) {
            let line = match take_line(&mut self.recv_buf) {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => return Err(self.fail(e)),
            };
            debug!("S: {}", line);
            if let Err(e) = self.handle_line(&line) {
                return Err(self.fail(e));
            }
        }
        if self.state == ClientState::Failed {
            return Err(auth_error(AuthFault::UnexpectedLine(
                "input after failed handshake".into(),
            )));
        }
        Ok(())
    }

    fn fail(&mut self, e: crate::Error) -> crate::Error {
        self.state = ClientState::Failed;
        self.session = None;
        e
    }

    fn handle_line(&mut self, line: &str) -> Result<()> {
        let (command, rest) = split_command(line);
        match (self.state, command) {
            (_, "REJECTED") => {
                self.offered = rest.split_whitespace().map(String::from).collect();
                self.try_next_mechanism()
            }
            (ClientState::NegotiateMechanism, "OK") | (ClientState::WaitingForOk, "OK") => {
                if rest.is_empty() {
                    return Err(auth_error(AuthFault::Malformed(line.to_string())));
                }
                self.guid = Some(rest.to_string());
                self.session = None;
                self.send_line("BEGIN".into());
                self.state = ClientState::Done;
                Ok(())
            }
            (ClientState::NegotiateMechanism, "DATA") => {
                let data = decode_hex(line, rest)?;
                let (name, session) = match self.session.as_mut() {
                    Some((name, session)) => (name.clone(), session),
                    None => return Err(auth_error(AuthFault::UnexpectedLine(line.to_string()))),
                };
                let response = match session.challenge(&data) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("mechanism {} failed: {}", name, e);
                        self.send_line("CANCEL".into());
                        return Err(e);
                    }
                };
                let complete = session.is_complete();
                self.send_line(data_line(&response));
                if complete {
                    self.state = ClientState::WaitingForOk;
                }
                Ok(())
            }
            (ClientState::NegotiateMechanism, "ERROR") | (ClientState::WaitingForOk, "ERROR") => {
                // the server answers CANCEL with the mechanism list again
                self.session = None;
                self.send_line("CANCEL".into());
                self.state = ClientState::WaitingForMechanisms;
                Ok(())
            }
            _ => Err(auth_error(AuthFault::UnexpectedLine(line.to_string()))),
        }
    }

    fn try_next_mechanism(&mut self) -> Result<()> {
        self.session = None;
        while self.next_mechanism < self.mechanisms.len() {
            let mechanism = Arc::clone(&self.mechanisms[self.next_mechanism]);
            self.next_mechanism += 1;
            if !self.offered.iter().any(|m| m == mechanism.name()) {
                continue;
            }

            let mut session = match mechanism.start() {
                Ok(session) => session,
                Err(e) => {
                    warn!("skipping mechanism {}: {}", mechanism.name(), e);
                    continue;
                }
            };
            let initial = match session.initial_response() {
                Ok(initial) => initial,
                Err(e) => {
                    warn!("skipping mechanism {}: {}", mechanism.name(), e);
                    continue;
                }
            };
            let line = match initial {
                Some(data) => format!("AUTH {} {}", mechanism.name(), hex::encode(data)),
                None => format!("AUTH {}", mechanism.name()),
            };
            self.send_line(line);
            self.session = Some((mechanism.name().to_string(), session));
            self.state = ClientState::NegotiateMechanism;
            return Ok(());
        }

        self.send_line("CANCEL".into());
        Err(auth_error(AuthFault::NoCommonMechanism(self.offered.join(" "))))
    }

    fn send_line(&mut self, line: String) {
        debug!("C: {}", line);
        let mut payload = line.into_bytes();
        payload.extend_from_slice(b"\r\n");
        self.send_buf.push_back(Transmit::new(payload));
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.send_buf.pop_front()
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ClientState::Done
    }

    /// The GUID the server sent with `OK`.
    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    /// The mechanism currently in use.
    pub fn mechanism(&self) -> Option<&str> {
        self.session.as_ref().map(|(name, _)| name.as_str())
    }

    /// Bytes received after the handshake ended; they belong to the binary protocol.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.recv_buf)
    }
}

pub(crate) fn data_line(data: &[u8]) -> String {
    if data.is_empty() {
        "DATA".into()
    } else {
        format!("DATA {}", hex::encode(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Anonymous, External};
    use crate::error::ErrorKind;

    fn drain(n: &mut ClientNegotiator) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(t) = n.poll_transmit() {
            lines.push(String::from_utf8(t.payload).unwrap());
        }
        lines
    }

    #[test]
    fn test_initial_transmit() {
        let mut n = ClientNegotiator::new(vec![Arc::new(Anonymous)]);
        assert_eq!(drain(&mut n), vec!["\0".to_string(), "AUTH\r\n".to_string()]);
        assert_eq!(n.state(), ClientState::WaitingForMechanisms);
    }

    #[test]
    fn test_external_success() {
        let mut n = ClientNegotiator::new(vec![Arc::new(External::with_uid(1000))]);
        drain(&mut n);

        n.handle_input(b"REJECTED EXTERNAL DBUS_COOKIE_SHA1\r\n").unwrap();
        assert_eq!(drain(&mut n), vec!["AUTH EXTERNAL 31303030\r\n".to_string()]);
        assert_eq!(n.state(), ClientState::NegotiateMechanism);
        assert_eq!(n.mechanism(), Some("EXTERNAL"));

        n.handle_input(b"OK 1234deadbeef\r\n").unwrap();
        assert_eq!(drain(&mut n), vec!["BEGIN\r\n".to_string()]);
        assert!(n.is_done());
        assert_eq!(n.guid(), Some("1234deadbeef"));
    }

    #[test]
    fn test_picks_first_local_mechanism_offered() {
        let mut n = ClientNegotiator::new(vec![
            Arc::new(External::with_uid(0)),
            Arc::new(Anonymous),
        ]);
        drain(&mut n);
        n.handle_input(b"REJECTED ANONYMOUS\r\n").unwrap();
        assert_eq!(drain(&mut n), vec!["AUTH ANONYMOUS\r\n".to_string()]);
    }

    #[test]
    fn test_rejected_tries_next() {
        let mut n = ClientNegotiator::new(vec![
            Arc::new(External::with_uid(0)),
            Arc::new(Anonymous),
        ]);
        drain(&mut n);
        n.handle_input(b"REJECTED EXTERNAL ANONYMOUS\r\n").unwrap();
        drain(&mut n);
        n.handle_input(b"REJECTED EXTERNAL ANONYMOUS\r\n").unwrap();
        assert_eq!(drain(&mut n), vec!["AUTH ANONYMOUS\r\n".to_string()]);
    }

    #[test]
    fn test_no_common_mechanism_sends_cancel() {
        let mut n = ClientNegotiator::new(vec![Arc::new(External::with_uid(0))]);
        drain(&mut n);
        let e = n.handle_input(b"REJECTED DBUS_COOKIE_SHA1\r\n").unwrap_err();
        assert_eq!(
            *e.kind(),
            ErrorKind::Auth(AuthFault::NoCommonMechanism("DBUS_COOKIE_SHA1".into()))
        );
        assert_eq!(drain(&mut n), vec!["CANCEL\r\n".to_string()]);
        assert_eq!(n.state(), ClientState::Failed);
    }

    #[test]
    fn test_unexpected_line_is_fatal() {
        let mut n = ClientNegotiator::new(vec![Arc::new(Anonymous)]);
        drain(&mut n);
        assert!(n.handle_input(b"DATA 00\r\n").is_err());
        assert_eq!(n.state(), ClientState::Failed);
        assert!(n.handle_input(b"REJECTED ANONYMOUS\r\n").is_err());
    }

    #[test]
    fn test_error_cancels_mechanism() {
        let mut n = ClientNegotiator::new(vec![Arc::new(External::with_uid(0))]);
        drain(&mut n);
        n.handle_input(b"REJECTED EXTERNAL\r\n").unwrap();
        drain(&mut n);
        n.handle_input(b"ERROR \"nope\"\r\n").unwrap();
        assert_eq!(drain(&mut n), vec!["CANCEL\r\n".to_string()]);
        assert_eq!(n.state(), ClientState::WaitingForMechanisms);
    }

    #[test]
    fn test_split_input() {
        let mut n = ClientNegotiator::new(vec![Arc::new(Anonymous)]);
        drain(&mut n);
        n.handle_input(b"REJECTED ANON").unwrap();
        assert!(drain(&mut n).is_empty());
        n.handle_input(b"YMOUS\r\nOK abc\r\n").unwrap();
        assert_eq!(
            drain(&mut n),
            vec!["AUTH ANONYMOUS\r\n".to_string(), "BEGIN\r\n".to_string()]
        );
    }
}
