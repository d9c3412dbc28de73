//! One authenticated connection and the threads serving it.
//!
//! A [`Channel`] owns the transport. A writer thread drains the outbound
//! queue in submission order, a reader thread decodes inbound frames,
//! resolves pending calls by `REPLY_SERIAL` and hands every message to the
//! [`HandlerChain`] on a small thread pool.

use std::io::{BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, Weak};
use std::thread;

use tracing::{debug, info, warn};

use crate::address::BusAddress;
use crate::auth::{self, ServerMechanism};
use crate::config::ChannelConfig;
use crate::dbus_error::DBusError;
use crate::error::{Error, ErrorKind, FrameFault, Result};
use crate::frame;
use crate::handler::{HandlerChain, MessageHandler};
use crate::message::{Message, MessageType};
use crate::pending::{PendingCalls, PendingReply};
use crate::pool::ThreadPool;
use crate::stream::{self, Stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Negotiating,
    Connected,
    Reconnecting,
}

/// The transport of one connection attempt.
struct Link {
    generation: u64,
    stream: Box<dyn Stream>,
    outbound: mpsc::Sender<Vec<u8>>,
}

type DisconnectHook = Box<dyn FnOnce() + Send>;

struct Inner {
    role: Role,
    config: ChannelConfig,
    address: Option<BusAddress>,
    state: Mutex<ChannelState>,
    serial: AtomicU32,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    closed: AtomicBool,
    pending: Arc<PendingCalls>,
    chain: HandlerChain,
    pool: Mutex<ThreadPool>,
    guid: Mutex<Option<String>>,
    on_disconnect: Mutex<Vec<DisconnectHook>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to a connection; clones share it.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    fn new(
        role: Role,
        config: ChannelConfig,
        address: Option<BusAddress>,
        chain: HandlerChain,
    ) -> Channel {
        let pool = ThreadPool::new(config.initial_worker_threads, config.max_worker_threads);
        Channel {
            inner: Arc::new(Inner {
                role,
                config,
                address,
                state: Mutex::new(ChannelState::Negotiating),
                serial: AtomicU32::new(1),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                pending: Arc::new(PendingCalls::default()),
                chain,
                pool: Mutex::new(pool),
                guid: Mutex::new(None),
                on_disconnect: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connects to `address`, authenticates and starts the channel threads.
    pub fn connect(address: &BusAddress, config: ChannelConfig) -> Result<Channel> {
        Self::connect_with(address, config, HandlerChain::new())
    }

    pub(crate) fn connect_with(
        address: &BusAddress,
        config: ChannelConfig,
        chain: HandlerChain,
    ) -> Result<Channel> {
        let channel = Channel::new(Role::Client, config, Some(address.clone()), chain);
        let (stream, guid) = channel.inner.establish(address)?;
        channel.inner.start(stream, guid)?;
        Ok(channel)
    }

    /// Runs the client handshake over an already connected stream.
    ///
    /// Such a channel has no address to reconnect to.
    pub fn client_over(mut stream: Box<dyn Stream>, config: ChannelConfig) -> Result<Channel> {
        let channel = Channel::new(Role::Client, config, None, HandlerChain::new());
        let guid = auth::authenticate_client(&mut *stream, &channel.inner.config.mechanisms)
            .map_err(|e| channel.inner.fail_negotiation(e))?;
        channel.inner.start(stream, guid)?;
        Ok(channel)
    }

    /// Runs the server handshake for an accepted stream.
    pub fn server_over(
        stream: Box<dyn Stream>,
        guid: &str,
        mechanisms: &[Arc<dyn ServerMechanism>],
        config: ChannelConfig,
    ) -> Result<Channel> {
        Self::server_with(stream, guid, mechanisms, config, HandlerChain::new())
    }

    pub(crate) fn server_with(
        mut stream: Box<dyn Stream>,
        guid: &str,
        mechanisms: &[Arc<dyn ServerMechanism>],
        config: ChannelConfig,
        chain: HandlerChain,
    ) -> Result<Channel> {
        let channel = Channel::new(Role::Server, config, None, chain);
        auth::authenticate_server(&mut *stream, mechanisms, guid)
            .map_err(|e| channel.inner.fail_negotiation(e))?;
        channel.inner.start(stream, guid.to_string())?;
        Ok(channel)
    }

    /// The next serial of this channel, starting at 1 and never 0.
    pub fn next_serial(&self) -> u32 {
        loop {
            let serial = self.inner.serial.fetch_add(1, Ordering::SeqCst);
            if serial != 0 {
                return serial;
            }
        }
    }

    /// Queues `msg` for the writer. The serial must already be set.
    pub fn send(&self, msg: Message) -> Result<()> {
        self.inner.send(msg)
    }

    /// Assigns the next serial to `msg`, queues it and returns the serial.
    pub fn emit(&self, mut msg: Message) -> Result<u32> {
        let serial = self.next_serial();
        msg.set_serial(serial);
        self.inner.send(msg)?;
        Ok(serial)
    }

    /// Queues `msg` and registers for its reply.
    pub fn send_with_reply(&self, msg: Message) -> Result<PendingReply> {
        if msg.serial() == 0 {
            return Err(context!(ErrorKind::Frame(FrameFault::ZeroSerial)));
        }
        let pending = self.inner.pending.register(msg.serial())?;
        self.inner.send(msg)?;
        Ok(pending)
    }

    /// Sends `msg` and blocks until its reply arrives.
    ///
    /// An ERROR reply is returned as [`ErrorKind::ErrorReply`].
    pub fn send_blocking(&self, msg: Message) -> Result<Message> {
        let pending = self.send_with_reply(msg)?;
        let reply = match self.inner.config.call_timeout {
            Some(timeout) => pending.wait_timeout(timeout)?,
            None => pending.wait()?,
        };
        if reply.message_type() == MessageType::Error {
            let error = DBusError::from_message(&reply)?;
            return Err(context!(ErrorKind::ErrorReply(error)));
        }
        Ok(reply)
    }

    /// [`send_blocking`](Self::send_blocking) with a freshly assigned serial.
    pub fn call(&self, mut msg: Message) -> Result<Message> {
        msg.set_serial(self.next_serial());
        self.send_blocking(msg)
    }

    pub fn add_handler<H: MessageHandler + 'static>(&self, handler: H) {
        self.inner.chain.add(Arc::new(handler));
    }

    pub fn handlers(&self) -> &HandlerChain {
        &self.inner.chain
    }

    /// Runs `hook` once the channel is closed for good.
    pub fn on_disconnect<F: FnOnce() + Send + 'static>(&self, hook: F) {
        if self.inner.closed.load(Ordering::SeqCst) {
            hook();
            return;
        }
        lock(&self.inner.on_disconnect).push(Box::new(hook));
        // closed while registering
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.run_hooks();
        }
    }

    /// Shuts the transport down and fails all pending calls.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    pub fn state(&self) -> ChannelState {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// GUID of the server side of the connection.
    pub fn server_guid(&self) -> Option<String> {
        lock(&self.inner.guid).clone()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn same_channel(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[cfg(test)]
    pub(crate) fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }
}

impl Inner {
    fn set_state(&self, state: ChannelState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("channel {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn fail_negotiation(&self, e: Error) -> Error {
        self.closed.store(true, Ordering::SeqCst);
        self.set_state(ChannelState::Disconnected);
        e
    }

    /// Opens the transport and authenticates as a client.
    fn establish(&self, address: &BusAddress) -> Result<(Box<dyn Stream>, String)> {
        self.set_state(ChannelState::Negotiating);
        let attempt = stream::connect(address).and_then(|mut stream| {
            let guid = auth::authenticate_client(&mut *stream, &self.config.mechanisms)?;
            Ok((stream, guid))
        });
        attempt.map_err(|e| self.fail_negotiation(e))
    }

    /// Installs a fresh link and spawns its reader and writer.
    fn start(self: &Arc<Self>, mut stream: Box<dyn Stream>, guid: String) -> Result<()> {
        let (reader, writer) = stream.split()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound, queue) = mpsc::channel();

        *lock(&self.guid) = Some(guid);
        *lock(&self.link) = Some(Link {
            generation,
            stream,
            outbound,
        });
        self.closed.store(false, Ordering::SeqCst);
        self.set_state(ChannelState::Connected);

        let weak = Arc::downgrade(self);
        thread::Builder::new()
            .name("dbus-writer".into())
            .spawn(move || writer_loop(weak, queue, writer, generation))
            .map_err(map_context!())?;

        let weak = Arc::downgrade(self);
        thread::Builder::new()
            .name("dbus-reader".into())
            .spawn(move || reader_loop(weak, reader, generation))
            .map_err(map_context!())?;
        Ok(())
    }

    fn send(&self, mut msg: Message) -> Result<()> {
        if msg.serial() == 0 {
            return Err(context!(ErrorKind::Frame(FrameFault::ZeroSerial)));
        }
        if let Some(endian) = self.config.endian {
            msg.set_endian(endian)?;
        }
        let bytes = frame::encode_message(&msg)?;
        debug!("queueing {}", msg);

        let link = lock(&self.link);
        match link.as_ref() {
            Some(link) => link
                .outbound
                .send(bytes)
                .map_err(|_| context!(ErrorKind::ChannelClosed)),
            None => Err(context!(ErrorKind::ChannelClosed)),
        }
    }

    fn deliver(self: &Arc<Self>, msg: Message) {
        debug!("received {}", msg);
        let mut resolved = false;
        if matches!(
            msg.message_type(),
            MessageType::MethodReturn | MessageType::Error
        ) {
            if let Some(serial) = msg.reply_serial() {
                match self.pending.resolve(serial, msg.clone()) {
                    Ok(()) => resolved = true,
                    Err(unmatched) => warn!(
                        "{}",
                        ErrorKind::ProtocolViolation(format!(
                            "reply {} to serial {} matches no pending call",
                            unmatched.serial(),
                            serial
                        ))
                    ),
                }
            }
        }

        let channel = Channel {
            inner: Arc::clone(self),
        };
        let chain = self.chain.clone();
        lock(&self.pool).execute(move || match chain.dispatch(&msg, &channel) {
            Ok(true) => {}
            Ok(false) if resolved => {}
            Ok(false) => warn!("dropping {}: no handler claimed it", msg),
            Err(e) => debug!("dispatch of serial {} failed: {}", msg.serial(), e),
        });
    }

    /// Handles the loss of the transport of `generation`.
    ///
    /// Only the first report for a generation acts; client channels
    /// try one reconnect before giving up.
    fn connection_lost(self: &Arc<Self>, generation: u64, error: &Error) {
        let link = {
            let mut link = lock(&self.link);
            match *link {
                Some(ref l) if l.generation == generation => link.take(),
                _ => return,
            }
        };
        if let Some(mut link) = link {
            let _ = link.stream.shutdown();
        }
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        warn!("connection lost: {}", error);

        // replies to calls sent over the lost transport can never arrive
        self.pending.fail_all();

        if self.role == Role::Client && self.config.reconnect {
            if let Some(ref address) = self.address {
                self.set_state(ChannelState::Reconnecting);
                let reconnected = self
                    .establish(address)
                    .and_then(|(stream, guid)| self.start(stream, guid));
                match reconnected {
                    Ok(()) => {
                        info!("reconnected to {}", address);
                        return;
                    }
                    Err(e) => warn!("reconnect to {} failed: {}", address, e),
                }
            }
        }
        self.shutdown();
    }

    /// Idempotent teardown.
    fn shutdown(&self) {
        let link = lock(&self.link).take();
        if let Some(mut link) = link {
            let _ = link.stream.shutdown();
        }
        let first = !self.closed.swap(true, Ordering::SeqCst);
        self.set_state(ChannelState::Disconnected);
        self.pending.fail_all();
        if first {
            debug!("channel closed");
        }
        self.run_hooks();
    }

    fn run_hooks(&self) {
        let hooks: Vec<DisconnectHook> = lock(&self.on_disconnect).drain(..).collect();
        for hook in hooks {
            hook();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn writer_loop(
    inner: Weak<Inner>,
    queue: mpsc::Receiver<Vec<u8>>,
    mut writer: Box<dyn Write + Send + Sync>,
    generation: u64,
) {
    // ends once the link holding the sender is gone
    for bytes in queue.iter() {
        let written: Result<()> = writer
            .write_all(&bytes)
            .and_then(|_| writer.flush())
            .map_err(map_context!());
        if let Err(e) = written {
            if let Some(inner) = inner.upgrade() {
                inner.connection_lost(generation, &e);
            }
            return;
        }
    }
}

fn reader_loop(inner: Weak<Inner>, reader: Box<dyn Read + Send + Sync>, generation: u64) {
    let mut reader = BufReader::new(reader);
    loop {
        match frame::read_message(&mut reader) {
            Ok(msg) => match inner.upgrade() {
                Some(inner) => inner.deliver(msg),
                None => return,
            },
            Err(e) if frame::is_fatal(&e) => {
                if let Some(inner) = inner.upgrade() {
                    inner.connection_lost(generation, &e);
                }
                return;
            }
            Err(e) => warn!("dropping inbound message: {}", e),
        }
    }
}
