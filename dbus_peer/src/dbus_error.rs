//! Errors returned by a remote peer in ERROR messages.

use std::fmt;

use dbus_signature::{Signature, TypeNode};

use crate::error::{ErrorKind, FrameFault, Result};
use crate::message::{HeaderField, Message, MessageType};
use crate::value::Value;

macro_rules! error_names {
    ($($variant:ident => $name:literal,)*) => {
        /// The standard `org.freedesktop.DBus.Error.*` names.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum ErrorName {
            $($variant,)*
        }

        impl ErrorName {
            pub const ALL: &'static [ErrorName] = &[$(ErrorName::$variant,)*];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(ErrorName::$variant => $name,)*
                }
            }

            pub fn from_name(name: &str) -> Option<ErrorName> {
                match name {
                    $($name => Some(ErrorName::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

error_names! {
    Failed => "org.freedesktop.DBus.Error.Failed",
    NoMemory => "org.freedesktop.DBus.Error.NoMemory",
    ServiceUnknown => "org.freedesktop.DBus.Error.ServiceUnknown",
    NameHasNoOwner => "org.freedesktop.DBus.Error.NameHasNoOwner",
    NoReply => "org.freedesktop.DBus.Error.NoReply",
    IoError => "org.freedesktop.DBus.Error.IOError",
    BadAddress => "org.freedesktop.DBus.Error.BadAddress",
    NotSupported => "org.freedesktop.DBus.Error.NotSupported",
    LimitsExceeded => "org.freedesktop.DBus.Error.LimitsExceeded",
    AccessDenied => "org.freedesktop.DBus.Error.AccessDenied",
    AuthFailed => "org.freedesktop.DBus.Error.AuthFailed",
    NoServer => "org.freedesktop.DBus.Error.NoServer",
    Timeout => "org.freedesktop.DBus.Error.Timeout",
    NoNetwork => "org.freedesktop.DBus.Error.NoNetwork",
    AddressInUse => "org.freedesktop.DBus.Error.AddressInUse",
    Disconnected => "org.freedesktop.DBus.Error.Disconnected",
    InvalidArgs => "org.freedesktop.DBus.Error.InvalidArgs",
    FileNotFound => "org.freedesktop.DBus.Error.FileNotFound",
    FileExists => "org.freedesktop.DBus.Error.FileExists",
    UnknownMethod => "org.freedesktop.DBus.Error.UnknownMethod",
    UnknownObject => "org.freedesktop.DBus.Error.UnknownObject",
    UnknownInterface => "org.freedesktop.DBus.Error.UnknownInterface",
    UnknownProperty => "org.freedesktop.DBus.Error.UnknownProperty",
    PropertyReadOnly => "org.freedesktop.DBus.Error.PropertyReadOnly",
    TimedOut => "org.freedesktop.DBus.Error.TimedOut",
    MatchRuleNotFound => "org.freedesktop.DBus.Error.MatchRuleNotFound",
    MatchRuleInvalid => "org.freedesktop.DBus.Error.MatchRuleInvalid",
    InconsistentMessage => "org.freedesktop.DBus.Error.InconsistentMessage",
    InvalidSignature => "org.freedesktop.DBus.Error.InvalidSignature",
}

impl ErrorName {
    /// Body signature of the standard errors: one human readable string.
    pub fn signature(self) -> Signature {
        Signature::from(TypeNode::STRING)
    }
}

impl fmt::Display for ErrorName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed error reply.
#[derive(Clone, Debug, PartialEq)]
pub enum DBusError {
    Standard {
        name: ErrorName,
        message: Option<String>,
    },
    Custom {
        name: String,
        signature: Signature,
        body: Vec<Value>,
    },
}

impl DBusError {
    pub fn new<S: Into<String>>(name: ErrorName, message: S) -> Self {
        DBusError::Standard {
            name,
            message: Some(message.into()),
        }
    }

    pub fn custom<S: Into<String>>(name: S, signature: Signature, body: Vec<Value>) -> Self {
        DBusError::Custom {
            name: name.into(),
            signature,
            body,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DBusError::Standard { name, .. } => name.as_str(),
            DBusError::Custom { name, .. } => name,
        }
    }

    /// The human readable text, by convention the first string argument.
    pub fn message(&self) -> Option<&str> {
        match self {
            DBusError::Standard { message, .. } => message.as_deref(),
            DBusError::Custom { body, .. } => body.first().and_then(Value::as_str),
        }
    }

    /// Decodes the error carried by an ERROR message.
    pub fn from_message(msg: &Message) -> Result<DBusError> {
        if msg.message_type() != MessageType::Error {
            return Err(context!(ErrorKind::InvalidArgument(format!(
                "{} is not an error message",
                msg.message_type()
            ))));
        }
        let name = msg.error_name().ok_or_else(|| {
            context!(ErrorKind::Frame(FrameFault::MissingField(
                HeaderField::ErrorName
            )))
        })?;
        let body = msg.body_values()?;

        Ok(match ErrorName::from_name(name) {
            Some(name) => DBusError::Standard {
                name,
                message: body.first().and_then(Value::as_str).map(String::from),
            },
            None => DBusError::Custom {
                name: name.to_string(),
                signature: msg.signature(),
                body,
            },
        })
    }

    /// Builds the ERROR reply to `call`.
    pub fn to_message(&self, call: &Message) -> Result<Message> {
        let mut reply = Message::error(call, self.name())?;
        match self {
            DBusError::Standard {
                message: Some(text),
                name,
            } => reply.set_body(&name.signature(), &[Value::from(text.as_str())])?,
            DBusError::Standard { message: None, .. } => {}
            DBusError::Custom {
                signature, body, ..
            } => reply.set_body(signature, body)?,
        }
        Ok(reply)
    }
}

impl fmt::Display for DBusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.message() {
            Some(text) => write!(f, "{}: {}", self.name(), text),
            None => f.write_str(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name() {
        for name in ErrorName::ALL {
            assert_eq!(ErrorName::from_name(name.as_str()), Some(*name));
        }
        assert_eq!(ErrorName::from_name("org.example.Error.Nope"), None);
    }

    #[test]
    fn test_standard_round_trip() {
        let mut call = Message::method_call(None, "/org/example", None, "Frob").unwrap();
        call.set_serial(7);

        let err = DBusError::new(ErrorName::UnknownMethod, "no Frob here");
        let mut reply = err.to_message(&call).unwrap();
        reply.set_serial(1);
        assert_eq!(reply.reply_serial(), Some(7));
        assert_eq!(
            reply.error_name(),
            Some("org.freedesktop.DBus.Error.UnknownMethod")
        );
        assert_eq!(reply.signature().to_string(), "s");

        assert_eq!(DBusError::from_message(&reply).unwrap(), err);
        assert_eq!(
            err.to_string(),
            "org.freedesktop.DBus.Error.UnknownMethod: no Frob here"
        );
    }

    #[test]
    fn test_custom() {
        let mut call = Message::method_call(None, "/", None, "Frob").unwrap();
        call.set_serial(3);

        let sig = Signature::parse("su").unwrap();
        let err = DBusError::custom(
            "org.example.Error.Quota",
            sig,
            vec![Value::from("over quota"), Value::from(42u32)],
        );
        let reply = err.to_message(&call).unwrap();
        let back = DBusError::from_message(&reply).unwrap();
        assert_eq!(back, err);
        assert_eq!(back.message(), Some("over quota"));
    }
}
