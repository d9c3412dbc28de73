//! Accept connections and keep a channel per authenticated client.

use std::fs;
use std::io;
use std::mem;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::address::BusAddress;
use crate::channel::Channel;
use crate::config::ListenConfig;
use crate::error::*;
use crate::handler::{HandlerChain, MessageHandler};
use crate::message::Message;
use crate::stream::Stream;

#[derive(Debug)]
pub enum Listener {
    TCP(TcpListener),
    /// The listener and the socket file to remove on drop.
    UNIX(UnixListener, Option<PathBuf>),
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn get_abstract_unixlistener(addr: &str) -> Result<UnixListener> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(addr).map_err(map_context!())?;
    UnixListener::bind_addr(&addr).map_err(map_context!())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn get_abstract_unixlistener(addr: &str) -> Result<UnixListener> {
    Err(context!(ErrorKind::InvalidAddress(format!(
        "abstract sockets are not supported: {}",
        addr
    ))))
}

fn bind_unix_path(path: PathBuf) -> Result<Listener> {
    // ignore error on non-existent file
    let _ = fs::remove_file(&path);
    let listener = UnixListener::bind(&path).map_err(map_context!())?;
    Ok(Listener::UNIX(listener, Some(path)))
}

impl Listener {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(address: &BusAddress) -> Result<Self> {
        match address.transport() {
            "tcp" => {
                let host = address.get("host").unwrap_or("localhost");
                let port: u16 = match address.get("port") {
                    Some(port) => port
                        .parse()
                        .map_err(|_| context!(ErrorKind::InvalidAddress(address.to_string())))?,
                    None => 0,
                };
                Ok(Listener::TCP(
                    TcpListener::bind((host, port)).map_err(map_context!())?,
                ))
            }
            "unix" => {
                if let Some(path) = address.get("path") {
                    bind_unix_path(PathBuf::from(path))
                } else if let Some(name) = address.get("abstract") {
                    Ok(Listener::UNIX(get_abstract_unixlistener(name)?, None))
                } else if let Some(dir) = address.get("tmpdir").or_else(|| address.get("dir")) {
                    let name = format!("dbus-{}", Uuid::new_v4().simple());
                    bind_unix_path(PathBuf::from(dir).join(name))
                } else {
                    Err(context!(ErrorKind::InvalidAddress(format!(
                        "{}: need 'path', 'abstract', 'tmpdir' or 'dir'",
                        address
                    ))))
                }
            }
            _ => Err(context!(ErrorKind::InvalidAddress(address.to_string()))),
        }
    }

    /// The address clients connect to, with ephemeral ports resolved.
    pub fn local_address(&self) -> Result<BusAddress> {
        match *self {
            Listener::TCP(ref l) => {
                let addr = l.local_addr().map_err(map_context!())?;
                Ok(BusAddress::new("tcp")
                    .with_param("host", addr.ip().to_string())
                    .with_param("port", addr.port().to_string()))
            }
            Listener::UNIX(_, Some(ref path)) => {
                Ok(BusAddress::new("unix").with_param("path", path.to_string_lossy()))
            }
            Listener::UNIX(ref l, None) => {
                let addr = l.local_addr().map_err(map_context!())?;
                abstract_address(&addr)
            }
        }
    }

    /// Waits up to `timeout` milliseconds for a client, forever if 0.
    pub fn accept(&self, timeout: u64) -> Result<Box<dyn Stream>> {
        use libc::{fd_set, select, timeval, FD_ISSET, FD_SET, FD_ZERO};

        if timeout > 0 {
            let fd = self.as_raw_fd();

            let mut timeout = timeval {
                tv_sec: (timeout / 1000u64) as _,
                tv_usec: ((timeout % 1000u64) * 1000u64) as _,
            };

            unsafe {
                let mut readfs = mem::MaybeUninit::<fd_set>::uninit();
                loop {
                    FD_ZERO(readfs.as_mut_ptr());
                    let mut writefds = mem::MaybeUninit::<fd_set>::uninit();
                    FD_ZERO(writefds.as_mut_ptr());
                    let mut errorfds = mem::MaybeUninit::<fd_set>::uninit();
                    FD_ZERO(errorfds.as_mut_ptr());

                    FD_SET(fd, readfs.as_mut_ptr());
                    let ret = select(
                        fd + 1,
                        readfs.as_mut_ptr(),
                        writefds.as_mut_ptr(),
                        errorfds.as_mut_ptr(),
                        &mut timeout,
                    );
                    if ret != -1 {
                        break;
                    }
                    let e = io::Error::last_os_error();
                    if e.kind() != io::ErrorKind::Interrupted {
                        return Err(e).map_err(map_context!());
                    }
                }
                if !FD_ISSET(fd, readfs.as_mut_ptr()) {
                    return Err(context!(ErrorKind::Timeout));
                }
            }
        }
        match *self {
            Listener::TCP(ref l) => {
                let (s, addr) = l.accept().map_err(map_context!())?;
                debug!("accepted {}", addr);
                let _ = s.set_nodelay(true);
                Ok(Box::new(s))
            }
            Listener::UNIX(ref l, _) => {
                let (s, _addr) = l.accept().map_err(map_context!())?;
                debug!("accepted unix client");
                Ok(Box::new(s))
            }
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        match *self {
            Listener::TCP(ref l) => l.as_raw_fd(),
            Listener::UNIX(ref l, _) => l.as_raw_fd(),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn abstract_address(addr: &std::os::unix::net::SocketAddr) -> Result<BusAddress> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;

    match addr.as_abstract_name() {
        Some(name) => Ok(BusAddress::new("unix")
            .with_param("abstract", String::from_utf8_lossy(name).into_owned())),
        None => Err(context!(ErrorKind::InvalidAddress("unnamed socket".into()))),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn abstract_address(_addr: &std::os::unix::net::SocketAddr) -> Result<BusAddress> {
    Err(context!(ErrorKind::InvalidAddress("unnamed socket".into())))
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::UNIX(_, Some(ref path)) = *self {
            let _ = fs::remove_file(path);
        }
    }
}

type ClientSet = Mutex<Vec<(u64, Channel)>>;

fn lock_clients(clients: &ClientSet) -> MutexGuard<'_, Vec<(u64, Channel)>> {
    clients.lock().unwrap_or_else(|e| e.into_inner())
}

/// A listening endpoint holding one [`Channel`] per connected client.
///
/// All clients share the server's handler chain.
pub struct Server {
    listener: Listener,
    config: ListenConfig,
    guid: String,
    clients: Arc<ClientSet>,
    next_client: AtomicU64,
    chain: HandlerChain,
}

impl Server {
    /// Binds `address`. A `guid` parameter in the address is used as the server GUID.
    pub fn bind(address: &BusAddress, config: ListenConfig) -> Result<Server> {
        let listener = Listener::new(address)?;
        let guid = match address.guid() {
            Some(guid) => guid.to_string(),
            None => Uuid::new_v4().simple().to_string(),
        };
        info!("listening on {}", listener.local_address()?);
        Ok(Server {
            listener,
            config,
            guid,
            clients: Arc::new(Mutex::new(Vec::new())),
            next_client: AtomicU64::new(1),
            chain: HandlerChain::new(),
        })
    }

    pub fn local_address(&self) -> Result<BusAddress> {
        self.listener.local_address()
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn add_handler<H: MessageHandler + 'static>(&self, handler: H) {
        self.chain.add(Arc::new(handler));
    }

    /// Channels of the currently connected clients.
    pub fn clients(&self) -> Vec<Channel> {
        lock_clients(&self.clients)
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Sends a copy of `msg` to every client, each with its own serial.
    ///
    /// Returns the number of clients the message was queued for.
    pub fn send(&self, msg: &Message) -> usize {
        self.clients()
            .into_iter()
            .filter(|client| match client.emit(msg.clone()) {
                Ok(_) => true,
                Err(e) => {
                    warn!("broadcast failed: {}", e);
                    false
                }
            })
            .count()
    }

    /// Accepts clients until `stop_listening` is set or the server was idle
    /// for `idle_timeout` seconds without any client, which returns `Timeout`.
    ///
    /// Each handshake runs on its own thread.
    pub fn run(&self) -> Result<()> {
        let idle_ms = self.config.idle_timeout * 1000;
        let wait_time = match self.config.stop_listening {
            Some(_) => self.config.poll_interval_ms.max(1),
            None => idle_ms,
        };
        let mut to_wait = idle_ms;

        loop {
            let stream = match self.listener.accept(wait_time) {
                Ok(stream) => stream,
                Err(e) => match e.kind() {
                    ErrorKind::Timeout => {
                        if let Some(stop) = self.config.stop_listening.as_ref() {
                            if stop.load(Ordering::SeqCst) {
                                return Ok(());
                            }
                            if idle_ms == 0 {
                                continue;
                            }
                        }

                        if to_wait <= wait_time {
                            if lock_clients(&self.clients).is_empty() {
                                return Err(e);
                            }
                            to_wait = idle_ms;
                        } else {
                            to_wait -= wait_time;
                        }
                        continue;
                    }
                    ErrorKind::Io(std::io::ErrorKind::Interrupted) => continue,
                    _ => return Err(e),
                },
            };
            to_wait = idle_ms;
            self.spawn_handshake(stream);
        }
    }

    fn spawn_handshake(&self, stream: Box<dyn Stream>) {
        let id = self.next_client.fetch_add(1, Ordering::SeqCst);
        let clients = Arc::downgrade(&self.clients);
        let guid = self.guid.clone();
        let mechanisms = self.config.mechanisms.clone();
        let config = self.config.channel.clone();
        let chain = self.chain.clone();

        let spawned = thread::Builder::new()
            .name(format!("dbus-accept-{}", id))
            .spawn(move || {
                match Channel::server_with(stream, &guid, &mechanisms, config, chain) {
                    Ok(channel) => add_client(clients, id, channel),
                    Err(e) => warn!("client {} failed to authenticate: {}", id, e),
                }
            });
        if let Err(e) = spawned {
            warn!("cannot start handshake of client {}: {}", id, e);
        }
    }
}

fn add_client(clients: Weak<ClientSet>, id: u64, channel: Channel) {
    let set = match clients.upgrade() {
        Some(set) => set,
        None => {
            channel.close();
            return;
        }
    };
    debug!("client {} connected", id);
    lock_clients(&set).push((id, channel.clone()));
    channel.on_disconnect(move || {
        if let Some(set) = clients.upgrade() {
            lock_clients(&set).retain(|(client, _)| *client != id);
            debug!("client {} disconnected", id);
        }
    });
}

impl Drop for Server {
    fn drop(&mut self) {
        let clients: Vec<_> = lock_clients(&self.clients).drain(..).collect();
        for (_, channel) in clients {
            channel.close();
        }
    }
}
