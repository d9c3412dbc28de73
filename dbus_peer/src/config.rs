use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{default_client_mechanisms, default_server_mechanisms};
use crate::auth::{ClientMechanism, ServerMechanism};
use crate::codec::Endian;

/// `ChannelConfig` specifies how a [`Channel`](crate::Channel) behaves.
///
/// ```rust
/// let c = dbus_peer::ChannelConfig::default();
/// assert!(c.endian.is_none());
/// assert!(c.call_timeout.is_none());
/// assert!(c.reconnect);
/// assert_eq!(c.initial_worker_threads, 1);
/// assert_eq!(c.max_worker_threads, 16);
/// ```
#[derive(Clone)]
pub struct ChannelConfig {
    /// Byte order of outgoing messages, the native one if `None`
    pub endian: Option<Endian>,
    /// Upper bound for blocking calls, waits forever if `None`
    pub call_timeout: Option<Duration>,
    /// Whether a client channel retries the connection once after an I/O failure
    pub reconnect: bool,
    /// The amount of initial handler dispatch threads
    pub initial_worker_threads: usize,
    /// The maximum amount of handler dispatch threads
    pub max_worker_threads: usize,
    /// Client authentication mechanisms in order of preference
    pub mechanisms: Vec<Arc<dyn ClientMechanism>>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            endian: None,
            call_timeout: None,
            reconnect: true,
            initial_worker_threads: 1,
            max_worker_threads: 16,
            mechanisms: default_client_mechanisms(),
        }
    }
}

/// `ListenConfig` specifies the configuration parameters for [`Server`](crate::Server)
///
/// ```rust
/// let l = dbus_peer::ListenConfig::default();
/// assert_eq!(l.poll_interval_ms, 100);
/// assert_eq!(l.idle_timeout, 0);
/// assert!(l.stop_listening.is_none());
/// ```
#[derive(Clone)]
pub struct ListenConfig {
    /// Mechanisms offered to connecting clients
    pub mechanisms: Vec<Arc<dyn ServerMechanism>>,
    /// Time in milliseconds between checks of `stop_listening`
    pub poll_interval_ms: u64,
    /// Time in seconds for the server to quit, when it is idle
    pub idle_timeout: u64,
    /// An optional AtomicBool as a global flag, which lets the server stop accepting new connections, when set to `true`
    pub stop_listening: Option<Arc<AtomicBool>>,
    /// Applied to the channel of every accepted client
    pub channel: ChannelConfig,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            mechanisms: default_server_mechanisms(),
            poll_interval_ms: 100,
            idle_timeout: 0,
            stop_listening: None,
            channel: ChannelConfig {
                reconnect: false,
                ..ChannelConfig::default()
            },
        }
    }
}
