//!Peer implementation of the [D-Bus](https://dbus.freedesktop.org) protocol.
//!
//!The crate covers the wire level of D-Bus: the binary [`codec`] for typed
//![`Value`]s, whole [`Message`]s and their [`frame`] layout, the line based
//![`auth`] handshake and a threaded [`Channel`] that correlates calls with
//!their replies and dispatches everything else to handlers.
//!
//!A client connects to an address, calls a method and decodes the reply:
//!
//!```rust,no_run
//!# fn main() -> dbus_peer::Result<()> {
//!use dbus_peer::{BusAddress, Channel, ChannelConfig, Message};
//!
//!let address = BusAddress::parse("unix:path=/run/user/1000/bus")?;
//!let channel = Channel::connect(&address, ChannelConfig::default())?;
//!
//!let msg = Message::method_call(
//!    Some("org.freedesktop.DBus"),
//!    "/org/freedesktop/DBus",
//!    Some("org.freedesktop.DBus"),
//!    "Hello",
//!)?;
//!let reply = channel.call(msg)?;
//!println!("{:?}", reply.body_values()?);
//!# Ok(())
//!# }
//!```
//!
//!A server binds an address and answers calls from a handler:
//!
//!```rust,no_run
//!# fn main() -> dbus_peer::Result<()> {
//!use dbus_peer::{BusAddress, Channel, ListenConfig, Message, Server};
//!
//!let server = Server::bind(&BusAddress::parse("tcp:host=127.0.0.1,port=0")?, ListenConfig::default())?;
//!server.add_handler(|msg: &Message, channel: &Channel| -> dbus_peer::Result<bool> {
//!    if msg.member() == Some("Ping") {
//!        channel.emit(Message::method_return(msg))?;
//!        return Ok(true);
//!    }
//!    Ok(false)
//!});
//!server.run()?;
//!# Ok(())
//!# }
//!```
//!
//!Supported addresses are
//!
//!- TCP `tcp:host=127.0.0.1,port=12345`
//!- UNIX socket `unix:path=/run/dbus/socket`
//!- UNIX abstract namespace socket `unix:abstract=/tmp/dbus-XXXX` (on Linux only)

#[macro_use]
mod error;

pub mod address;
pub mod auth;
pub mod bus;
mod channel;
pub mod codec;
mod config;
mod dbus_error;
pub mod frame;
mod handler;
mod message;
mod pending;
mod pool;
mod server;
mod stream;
mod value;

#[cfg(test)]
mod test;

pub use dbus_signature::{Signature, TypeCode, TypeNode};

pub use crate::address::BusAddress;
pub use crate::bus::{BusConnection, RequestNameReply};
pub use crate::channel::{Channel, ChannelState, Role};
pub use crate::codec::Endian;
pub use crate::config::{ChannelConfig, ListenConfig};
pub use crate::dbus_error::{DBusError, ErrorName};
pub use chainerror::ChainErrorFrom;

pub use crate::error::{AuthFault, CodecFault, Error, ErrorKind, FrameFault, Result};
pub use crate::handler::{HandlerChain, MessageHandler};
pub use crate::message::{HeaderField, Message, MessageFlags, MessageHeader, MessageType};
pub use crate::pending::PendingReply;
pub use crate::server::{Listener, Server};
pub use crate::stream::{connect, Stream};
pub use crate::value::{ObjectPath, Value, Variant};
