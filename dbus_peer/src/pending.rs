//! Calls waiting for their reply, keyed by serial.
//!
//! Each registration owns a single-use channel: the reader resolves it once
//! with the reply, teardown resolves it with `ChannelClosed`.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::error::{ErrorKind, Result};
use crate::message::Message;

#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<u32, SyncSender<Result<Message>>>>,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, HashMap<u32, SyncSender<Result<Message>>>> {
        // a panicking holder cannot leave the map half updated
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(self: &Arc<Self>, serial: u32) -> Result<PendingReply> {
        let (tx, rx) = mpsc::sync_channel(1);
        let mut calls = self.lock();
        if calls.contains_key(&serial) {
            return Err(context!(ErrorKind::InvalidArgument(format!(
                "serial {} is already awaiting a reply",
                serial
            ))));
        }
        calls.insert(serial, tx);
        Ok(PendingReply {
            serial,
            receiver: rx,
            calls: Arc::clone(self),
        })
    }

    /// Hands `reply` to the call registered under `serial`.
    ///
    /// Gives the message back if nobody is waiting for it.
    pub fn resolve(&self, serial: u32, reply: Message) -> std::result::Result<(), Message> {
        let sender = self.lock().remove(&serial);
        match sender {
            Some(sender) => match sender.try_send(Ok(reply)) {
                Ok(()) => Ok(()),
                Err(mpsc::TrySendError::Full(Ok(reply)))
                | Err(mpsc::TrySendError::Disconnected(Ok(reply))) => Err(reply),
                Err(_) => Ok(()),
            },
            None => Err(reply),
        }
    }

    pub fn cancel(&self, serial: u32) {
        if self.lock().remove(&serial).is_some() {
            debug!("call {} cancelled", serial);
        }
    }

    /// Fails every outstanding call with `ChannelClosed`.
    pub fn fail_all(&self) {
        let calls: Vec<_> = self.lock().drain().collect();
        for (serial, sender) in calls {
            debug!("failing pending call {}", serial);
            let _ = sender.try_send(Err(context!(ErrorKind::ChannelClosed)));
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

/// A registered call. Dropping it without waiting cancels the registration.
pub struct PendingReply {
    serial: u32,
    receiver: Receiver<Result<Message>>,
    calls: Arc<PendingCalls>,
}

impl PendingReply {
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Blocks until the reply arrives or the channel closes.
    pub fn wait(self) -> Result<Message> {
        match self.receiver.recv() {
            Ok(reply) => reply,
            Err(_) => Err(context!(ErrorKind::ChannelClosed)),
        }
    }

    /// Like [`wait`](Self::wait), failing with `Timeout` after `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Message> {
        match self.receiver.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => Err(context!(ErrorKind::Timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(context!(ErrorKind::ChannelClosed)),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.calls.cancel(self.serial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use std::thread;

    fn reply(serial: u32) -> Message {
        let mut m = Message::new(MessageType::MethodReturn);
        m.set_serial(serial + 100);
        m
    }

    #[test]
    fn test_resolve() {
        let calls = Arc::new(PendingCalls::default());
        let pending = calls.register(3).unwrap();
        assert!(calls.register(3).is_err());

        let c = Arc::clone(&calls);
        let t = thread::spawn(move || c.resolve(3, reply(3)).is_ok());
        assert_eq!(pending.wait().unwrap().serial(), 103);
        assert!(t.join().unwrap());
        assert_eq!(calls.len(), 0);
    }

    #[test]
    fn test_unknown_serial_returned() {
        let calls = Arc::new(PendingCalls::default());
        let m = calls.resolve(9, reply(9)).unwrap_err();
        assert_eq!(m.serial(), 109);
    }

    #[test]
    fn test_drop_cancels() {
        let calls = Arc::new(PendingCalls::default());
        let pending = calls.register(1).unwrap();
        assert_eq!(calls.len(), 1);
        drop(pending);
        assert_eq!(calls.len(), 0);
        assert!(calls.resolve(1, reply(1)).is_err());
    }

    #[test]
    fn test_timeout_releases() {
        let calls = Arc::new(PendingCalls::default());
        let pending = calls.register(1).unwrap();
        let e = pending
            .wait_timeout(Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(*e.kind(), ErrorKind::Timeout);
        assert_eq!(calls.len(), 0);
    }

    #[test]
    fn test_fail_all() {
        let calls = Arc::new(PendingCalls::default());
        let a = calls.register(1).unwrap();
        let b = calls.register(2).unwrap();
        calls.fail_all();
        calls.fail_all();
        assert!(a.wait().unwrap_err().kind().is_closed());
        assert!(b.wait().unwrap_err().kind().is_closed());
    }
}
