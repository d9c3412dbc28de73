//! Server state machine for the authentication handshake.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use super::client::data_line;
use super::{
    auth_error, decode_hex, split_command, take_line, ServerMechanism, ServerSession, ServerStep,
    Transmit,
};
use crate::error::{AuthFault, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    WaitingForNul,
    WaitingForAuth,
    NegotiateMechanism,
    WaitingForBegin,
    Done,
}

pub struct ServerNegotiator {
    state: ServerState,
    mechanisms: Vec<Arc<dyn ServerMechanism>>,
    session: Option<Box<dyn ServerSession>>,
    guid: String,
    send_buf: VecDeque<Transmit>,
    recv_buf: Vec<u8>,
}

impl ServerNegotiator {
    pub fn new(mechanisms: Vec<Arc<dyn ServerMechanism>>, guid: &str) -> Self {
        ServerNegotiator {
            state: ServerState::WaitingForNul,
            mechanisms,
            session: None,
            guid: guid.to_string(),
            send_buf: VecDeque::new(),
            recv_buf: Vec::new(),
        }
    }

    pub fn handle_input(&mut self, data: &[u8]) -> Result<()> {
        self.recv_buf.extend_from_slice(data);

        if self.state == ServerState::WaitingForNul {
            match self.recv_buf.first() {
                None => return Ok(()),
                Some(0) => {
                    self.recv_buf.remove(0);
                    self.state = ServerState::WaitingForAuth;
                }
                Some(_) => return Err(auth_error(AuthFault::MissingNul)),
            }
        }

        while self.state != ServerState::Done {
            let line = match take_line(&mut self.recv_buf)? {
                Some(line) => line,
                None => break,
            };
            debug!("C: {}", line);
            self.handle_line(&line)?;
        }
        Ok(())
    }

    fn handle_line(&mut self, line: &str) -> Result<()> {
        let (command, rest) = split_command(line);
        match (self.state, command) {
            (ServerState::WaitingForAuth, "AUTH") => self.start_auth(line, rest),
            (ServerState::NegotiateMechanism, "DATA") => {
                let data = decode_hex(line, rest)?;
                self.step(Some(&data));
                Ok(())
            }
            (ServerState::WaitingForBegin, "BEGIN") => {
                self.session = None;
                self.state = ServerState::Done;
                Ok(())
            }
            (_, "CANCEL") | (_, "ERROR") => {
                self.reject();
                Ok(())
            }
            _ => {
                self.send_line("ERROR \"unexpected command\"".into());
                Ok(())
            }
        }
    }

    fn start_auth(&mut self, line: &str, rest: &str) -> Result<()> {
        let mut parts = rest.split_whitespace();
        let name = match parts.next() {
            Some(name) => name,
            None => {
                self.reject();
                return Ok(());
            }
        };
        let initial = match parts.next() {
            Some(data) => match decode_hex(line, data) {
                Ok(data) => Some(data),
                Err(_) => {
                    self.send_line("ERROR \"invalid hex\"".into());
                    return Ok(());
                }
            },
            None => None,
        };

        let mechanism = match self.mechanisms.iter().find(|m| m.name() == name) {
            Some(m) => Arc::clone(m),
            None => {
                self.reject();
                return Ok(());
            }
        };
        debug!("client chose {}", mechanism.name());
        self.session = Some(mechanism.start());
        self.step(initial.as_deref());
        Ok(())
    }

    fn step(&mut self, response: Option<&[u8]>) {
        let step = match self.session.as_mut() {
            Some(session) => session.step(response),
            None => ServerStep::Reject,
        };
        match step {
            ServerStep::Complete => {
                let line = format!("OK {}", self.guid);
                self.send_line(line);
                self.state = ServerState::WaitingForBegin;
            }
            ServerStep::Challenge(data) => {
                self.send_line(data_line(&data));
                self.state = ServerState::NegotiateMechanism;
            }
            ServerStep::Reject => self.reject(),
        }
    }

    fn reject(&mut self) {
        self.session = None;
        let names: Vec<&str> = self.mechanisms.iter().map(|m| m.name()).collect();
        let line = format!("REJECTED {}", names.join(" "));
        self.send_line(line);
        self.state = ServerState::WaitingForAuth;
    }

    fn send_line(&mut self, line: String) {
        debug!("S: {}", line);
        let mut payload = line.into_bytes();
        payload.extend_from_slice(b"\r\n");
        self.send_buf.push_back(Transmit::new(payload));
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.send_buf.pop_front()
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ServerState::Done
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Bytes received after `BEGIN`; they belong to the binary protocol.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.recv_buf)
    }
}
