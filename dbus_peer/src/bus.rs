//! A client channel to a message bus daemon.

use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::address::{self, BusAddress};
use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::error::{ErrorKind, Result};
use crate::message::{Message, MessageType};
use crate::value::Value;

pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Flags of `RequestName`.
pub const NAME_FLAG_ALLOW_REPLACEMENT: u32 = 0x1;
pub const NAME_FLAG_REPLACE_EXISTING: u32 = 0x2;
pub const NAME_FLAG_DO_NOT_QUEUE: u32 = 0x4;

/// Result of `RequestName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

impl RequestNameReply {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(RequestNameReply::PrimaryOwner),
            2 => Some(RequestNameReply::InQueue),
            3 => Some(RequestNameReply::Exists),
            4 => Some(RequestNameReply::AlreadyOwner),
            _ => None,
        }
    }
}

/// A [`Channel`] that said `Hello` to the bus and knows its unique name.
///
/// The names the bus assigns to the connection are followed through the
/// `NameAcquired` and `NameLost` signals.
pub struct BusConnection {
    channel: Channel,
    unique_name: String,
    names: Arc<RwLock<BTreeSet<String>>>,
}

impl BusConnection {
    /// Tries each address in turn and says `Hello` on the first that connects.
    pub fn open(addresses: &[BusAddress], config: ChannelConfig) -> Result<BusConnection> {
        let mut last_error = None;
        for address in addresses {
            match Channel::connect(address, config.clone()) {
                Ok(channel) => return Self::hello(channel),
                Err(e) => {
                    warn!("cannot connect to {}: {}", address, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| context!(ErrorKind::InvalidAddress("no bus address".into()))))
    }

    pub fn session() -> Result<BusConnection> {
        Self::open(&address::session_bus_address()?, ChannelConfig::default())
    }

    pub fn system() -> Result<BusConnection> {
        Self::open(&address::system_bus_address()?, ChannelConfig::default())
    }

    /// Says `Hello` on an established channel.
    pub fn hello(channel: Channel) -> Result<BusConnection> {
        let names = Arc::new(RwLock::new(BTreeSet::new()));
        let tracked = Arc::clone(&names);
        channel.add_handler(move |msg: &Message, _: &Channel| track_names(&tracked, msg));

        let reply = channel.call(bus_call("Hello")?)?;
        let unique_name = reply
            .body_values()?
            .first()
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| {
                context!(ErrorKind::ProtocolViolation(
                    "Hello reply carries no unique name".into()
                ))
            })?;
        debug!("unique name {}", unique_name);
        write_names(&names).insert(unique_name.clone());
        Ok(BusConnection {
            channel,
            unique_name,
            names,
        })
    }

    /// The name returned by `Hello`.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// Same as [`unique_name`](Self::unique_name), the first name the bus assigned.
    pub fn first_name(&self) -> &str {
        &self.unique_name
    }

    /// Names the connection currently owns on the bus.
    pub fn names(&self) -> BTreeSet<String> {
        match self.names.read() {
            Ok(names) => names.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn owns_name(&self, name: &str) -> bool {
        match self.names.read() {
            Ok(names) => names.contains(name),
            Err(poisoned) => poisoned.into_inner().contains(name),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn request_name(&self, name: &str, flags: u32) -> Result<RequestNameReply> {
        let msg = bus_call("RequestName")?.with_args(vec![name.into(), flags.into()])?;
        let reply = self.channel.call(msg)?;
        reply
            .body_values()?
            .first()
            .and_then(Value::as_u32)
            .and_then(RequestNameReply::from_code)
            .ok_or_else(|| {
                context!(ErrorKind::ProtocolViolation(
                    "unexpected RequestName reply".into()
                ))
            })
    }

    pub fn release_name(&self, name: &str) -> Result<u32> {
        let msg = bus_call("ReleaseName")?.with_args(vec![name.into()])?;
        let reply = self.channel.call(msg)?;
        reply
            .body_values()?
            .first()
            .and_then(Value::as_u32)
            .ok_or_else(|| {
                context!(ErrorKind::ProtocolViolation(
                    "unexpected ReleaseName reply".into()
                ))
            })
    }

    /// Subscribes to messages matching `rule`, e.g. `type='signal',interface='a.b'`.
    pub fn add_match(&self, rule: &str) -> Result<()> {
        let msg = bus_call("AddMatch")?.with_args(vec![rule.into()])?;
        self.channel.call(msg).map(|_| ())
    }

    pub fn remove_match(&self, rule: &str) -> Result<()> {
        let msg = bus_call("RemoveMatch")?.with_args(vec![rule.into()])?;
        self.channel.call(msg).map(|_| ())
    }
}

impl Deref for BusConnection {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

fn write_names(names: &RwLock<BTreeSet<String>>) -> std::sync::RwLockWriteGuard<'_, BTreeSet<String>> {
    match names.write() {
        Ok(names) => names,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Claims the bus's `NameAcquired` and `NameLost` signals and applies them to `names`.
fn track_names(names: &RwLock<BTreeSet<String>>, msg: &Message) -> Result<bool> {
    if msg.message_type() != MessageType::Signal
        || msg.interface() != Some(BUS_INTERFACE)
        || msg.sender().map_or(false, |sender| sender != BUS_NAME)
    {
        return Ok(false);
    }
    let acquired = match msg.member() {
        Some("NameAcquired") => true,
        Some("NameLost") => false,
        _ => return Ok(false),
    };
    let name = match msg.body_values()?.first().and_then(Value::as_str) {
        Some(name) => name.to_string(),
        None => {
            warn!("{} without a name: {}", msg.member().unwrap_or_default(), msg);
            return Ok(true);
        }
    };
    debug!("{} {}", if acquired { "acquired" } else { "lost" }, name);
    if acquired {
        write_names(names).insert(name);
    } else {
        write_names(names).remove(&name);
    }
    Ok(true)
}

fn bus_call(member: &str) -> Result<Message> {
    Message::method_call(Some(BUS_NAME), BUS_PATH, Some(BUS_INTERFACE), member)
}
