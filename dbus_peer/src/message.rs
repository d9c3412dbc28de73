use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;
use dbus_signature::{Signature, TypeNode};

use crate::codec::{self, Endian};
use crate::error::{ErrorKind, Result};
use crate::value::{ObjectPath, Value, Variant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<MessageType> {
        match code {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Header fields a message of this type cannot do without.
    pub fn required_fields(self) -> &'static [HeaderField] {
        match self {
            MessageType::MethodCall => &[HeaderField::Path, HeaderField::Member],
            MessageType::MethodReturn => &[HeaderField::ReplySerial],
            MessageType::Error => &[HeaderField::ErrorName, HeaderField::ReplySerial],
            MessageType::Signal => &[
                HeaderField::Path,
                HeaderField::Interface,
                HeaderField::Member,
            ],
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            MessageType::MethodCall => "METHOD_CALL",
            MessageType::MethodReturn => "METHOD_RETURN",
            MessageType::Error => "ERROR",
            MessageType::Signal => "SIGNAL",
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u8 {
        const NO_REPLY_EXPECTED = 0x1;
        const NO_AUTO_START = 0x2;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeaderField {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    UnixFds = 9,
}

impl HeaderField {
    pub fn from_code(code: u8) -> Option<HeaderField> {
        Some(match code {
            1 => HeaderField::Path,
            2 => HeaderField::Interface,
            3 => HeaderField::Member,
            4 => HeaderField::ErrorName,
            5 => HeaderField::ReplySerial,
            6 => HeaderField::Destination,
            7 => HeaderField::Sender,
            8 => HeaderField::Signature,
            9 => HeaderField::UnixFds,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// The type the field's variant must carry.
    pub fn value_type(self) -> TypeNode {
        match self {
            HeaderField::Path => TypeNode::OBJECT_PATH,
            HeaderField::ReplySerial | HeaderField::UnixFds => TypeNode::UINT32,
            HeaderField::Signature => TypeNode::SIGNATURE,
            _ => TypeNode::STRING,
        }
    }
}

/// The fixed part of a message plus its header field table.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    pub endian: Endian,
    pub message_type: MessageType,
    pub flags: MessageFlags,
    pub serial: u32,
    /// Keyed by field code. Codes this crate does not know are kept as received.
    pub fields: BTreeMap<u8, Variant>,
}

impl MessageHeader {
    pub fn new(message_type: MessageType) -> Self {
        MessageHeader {
            endian: Endian::native(),
            message_type,
            flags: MessageFlags::empty(),
            serial: 0,
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: HeaderField) -> Option<&Value> {
        self.fields.get(&field.code()).map(Variant::value)
    }

    fn set(&mut self, field: HeaderField, value: Value) {
        let signature = Signature::from(field.value_type());
        self.fields
            .insert(field.code(), Variant::new_unchecked(signature, value));
    }
}

/// A header and the still encoded body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    header: MessageHeader,
    body: Vec<u8>,
}

impl Message {
    pub fn new(message_type: MessageType) -> Self {
        Message {
            header: MessageHeader::new(message_type),
            body: Vec::new(),
        }
    }

    pub(crate) fn from_parts(header: MessageHeader, body: Vec<u8>) -> Self {
        Message { header, body }
    }

    pub fn method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> Result<Message> {
        let mut m = Message::new(MessageType::MethodCall);
        m.header
            .set(HeaderField::Path, Value::ObjectPath(ObjectPath::new(path)?));
        m.header.set(HeaderField::Member, Value::from(member));
        if let Some(interface) = interface {
            m.header.set(HeaderField::Interface, Value::from(interface));
        }
        if let Some(destination) = destination {
            m.header
                .set(HeaderField::Destination, Value::from(destination));
        }
        Ok(m)
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Result<Message> {
        let mut m = Message::new(MessageType::Signal);
        m.header
            .set(HeaderField::Path, Value::ObjectPath(ObjectPath::new(path)?));
        m.header.set(HeaderField::Interface, Value::from(interface));
        m.header.set(HeaderField::Member, Value::from(member));
        Ok(m)
    }

    /// An empty METHOD_RETURN answering `call`.
    pub fn method_return(call: &Message) -> Message {
        let mut m = Message::new(MessageType::MethodReturn);
        m.reply_to(call);
        m
    }

    /// An ERROR answering `call`, without a body.
    pub fn error(call: &Message, name: &str) -> Result<Message> {
        if name.is_empty() {
            return Err(context!(ErrorKind::InvalidArgument(
                "empty error name".into()
            )));
        }
        let mut m = Message::new(MessageType::Error);
        m.reply_to(call);
        m.header.set(HeaderField::ErrorName, Value::from(name));
        Ok(m)
    }

    fn reply_to(&mut self, call: &Message) {
        self.header.endian = call.header.endian;
        self.header
            .set(HeaderField::ReplySerial, Value::Uint32(call.serial()));
        if let Some(sender) = call.sender() {
            self.header
                .set(HeaderField::Destination, Value::from(sender));
        }
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn endian(&self) -> Endian {
        self.header.endian
    }

    /// Switches byte order, re-encoding the body if there is one.
    pub fn set_endian(&mut self, endian: Endian) -> Result<()> {
        if endian == self.header.endian {
            return Ok(());
        }
        if !self.body.is_empty() {
            let signature = self.signature();
            let values = codec::decode(&signature, &self.body, self.header.endian)?;
            self.body = codec::encode(&signature, &values, endian)?;
        }
        self.header.endian = endian;
        Ok(())
    }

    pub fn flags(&self) -> MessageFlags {
        self.header.flags
    }

    pub fn set_flags(&mut self, flags: MessageFlags) {
        self.header.flags = flags;
    }

    pub fn serial(&self) -> u32 {
        self.header.serial
    }

    pub fn set_serial(&mut self, serial: u32) {
        self.header.serial = serial;
    }

    pub fn expects_reply(&self) -> bool {
        self.header.message_type == MessageType::MethodCall
            && !self.header.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    }

    fn field_str(&self, field: HeaderField) -> Option<&str> {
        self.header.get(field).and_then(Value::as_str)
    }

    pub fn path(&self) -> Option<&str> {
        self.field_str(HeaderField::Path)
    }

    pub fn interface(&self) -> Option<&str> {
        self.field_str(HeaderField::Interface)
    }

    pub fn member(&self) -> Option<&str> {
        self.field_str(HeaderField::Member)
    }

    pub fn error_name(&self) -> Option<&str> {
        self.field_str(HeaderField::ErrorName)
    }

    pub fn destination(&self) -> Option<&str> {
        self.field_str(HeaderField::Destination)
    }

    pub fn sender(&self) -> Option<&str> {
        self.field_str(HeaderField::Sender)
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.header
            .get(HeaderField::ReplySerial)
            .and_then(Value::as_u32)
    }

    pub fn unix_fds(&self) -> Option<u32> {
        self.header.get(HeaderField::UnixFds).and_then(Value::as_u32)
    }

    /// Raw access to any header field, including ones with unknown codes.
    pub fn field(&self, code: u8) -> Option<&Variant> {
        self.header.fields.get(&code)
    }

    /// Sets a known header field; the value must have the field's type.
    pub fn set_field(&mut self, field: HeaderField, value: Value) -> Result<()> {
        if field == HeaderField::Signature {
            return Err(context!(ErrorKind::InvalidArgument(
                "the body signature is set together with the body".into()
            )));
        }
        if !value.conforms_to(&field.value_type()) {
            return Err(context!(ErrorKind::InvalidArgument(format!(
                "header field {:?} cannot hold a value of type '{}'",
                field,
                value.type_name()
            ))));
        }
        self.header.set(field, value);
        Ok(())
    }

    pub fn set_destination(&mut self, destination: &str) {
        self.header
            .set(HeaderField::Destination, Value::from(destination));
    }

    pub fn set_sender(&mut self, sender: &str) {
        self.header.set(HeaderField::Sender, Value::from(sender));
    }

    /// The declared body signature; empty when the field is absent.
    pub fn signature(&self) -> Signature {
        match self.header.get(HeaderField::Signature) {
            Some(Value::Signature(s)) => s.clone(),
            _ => Signature::empty(),
        }
    }

    /// Encodes `values` as the body and records `signature` in the header.
    pub fn set_body(&mut self, signature: &Signature, values: &[Value]) -> Result<()> {
        self.body = codec::encode(signature, values, self.header.endian)?;
        if signature.is_empty() {
            self.header.fields.remove(&HeaderField::Signature.code());
        } else {
            self.header
                .set(HeaderField::Signature, Value::Signature(signature.clone()));
        }
        Ok(())
    }

    /// Like [`set_body`](Self::set_body), inferring the signature from the values.
    pub fn with_args(mut self, values: Vec<Value>) -> Result<Message> {
        let types = values
            .iter()
            .map(|v| {
                v.type_node().ok_or_else(|| {
                    context!(ErrorKind::InvalidArgument(
                        "cannot infer the type of an empty array".into()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let signature = Signature::from_types(types).map_err(map_context!())?;
        self.set_body(&signature, &values)?;
        Ok(self)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decodes the body using the declared signature.
    pub fn body_values(&self) -> Result<Vec<Value>> {
        codec::decode(&self.signature(), &self.body, self.header.endian)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} serial={}", self.message_type(), self.serial())?;
        if let Some(s) = self.reply_serial() {
            write!(f, " reply_serial={}", s)?;
        }
        if let Some(s) = self.path() {
            write!(f, " path={}", s)?;
        }
        if let Some(s) = self.interface() {
            write!(f, " interface={}", s)?;
        }
        if let Some(s) = self.member() {
            write!(f, " member={}", s)?;
        }
        if let Some(s) = self.error_name() {
            write!(f, " error={}", s)?;
        }
        if let Some(s) = self.destination() {
            write!(f, " destination={}", s)?;
        }
        if !self.body.is_empty() {
            write!(f, " signature=\"{}\"", self.signature())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_call_fields() {
        let m = Message::method_call(
            Some("org.example.Service"),
            "/org/example",
            Some("org.example.Iface"),
            "Frob",
        )
        .unwrap();
        assert_eq!(m.message_type(), MessageType::MethodCall);
        assert_eq!(m.path(), Some("/org/example"));
        assert_eq!(m.interface(), Some("org.example.Iface"));
        assert_eq!(m.member(), Some("Frob"));
        assert_eq!(m.destination(), Some("org.example.Service"));
        assert!(m.expects_reply());
        assert!(m.signature().is_empty());

        assert!(Message::method_call(None, "no/slash", None, "Frob").is_err());
    }

    #[test]
    fn test_reply_fields() {
        let mut call = Message::method_call(None, "/", None, "Ping").unwrap();
        call.set_serial(12);
        call.set_sender(":1.5");
        let reply = Message::method_return(&call);
        assert_eq!(reply.reply_serial(), Some(12));
        assert_eq!(reply.destination(), Some(":1.5"));
    }

    #[test]
    fn test_body_lazy_decode() {
        let m = Message::signal("/a", "org.example.A", "Changed")
            .unwrap()
            .with_args(vec![Value::from("x"), Value::from(3u32)])
            .unwrap();
        assert_eq!(m.signature().to_string(), "su");
        assert_eq!(
            m.body_values().unwrap(),
            vec![Value::from("x"), Value::from(3u32)]
        );
    }

    #[test]
    fn test_set_endian_reencodes_body() {
        let mut m = Message::method_call(None, "/", None, "Set").unwrap();
        m.set_body(&Signature::parse("u").unwrap(), &[Value::from(1u32)])
            .unwrap();
        let before = m.body().to_vec();
        let other = match m.endian() {
            Endian::Big => Endian::Little,
            Endian::Little => Endian::Big,
        };
        m.set_endian(other).unwrap();
        assert_ne!(m.body(), &before[..]);
        assert_eq!(m.body_values().unwrap(), vec![Value::from(1u32)]);
    }

    #[test]
    fn test_set_field_checks_type() {
        let mut m = Message::method_call(None, "/", None, "X").unwrap();
        assert!(m
            .set_field(HeaderField::ReplySerial, Value::from("nope"))
            .is_err());
        assert!(m.set_field(HeaderField::UnixFds, Value::from(2u32)).is_ok());
        assert_eq!(m.unix_fds(), Some(2));
    }
}
