use std::io;

use chainerror::{ChainError, ChainErrorFrom, ChainResult};

use crate::dbus_error::DBusError;
use crate::message::HeaderField;

/// What went wrong while (de)serializing a value.
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum CodecFault {
    #[error("non-zero padding byte")]
    NonZeroPadding,
    #[error("unexpected end of data")]
    Truncated,
    #[error("array body of {0} bytes exceeds the 64 MiB limit")]
    ArrayTooLong(usize),
    #[error("array elements end at offset {actual}, declared end is {expected}")]
    ArrayBoundary { expected: usize, actual: usize },
    #[error("variant signature holds {0} types instead of exactly one")]
    VariantArity(usize),
    #[error("containers nested too deeply")]
    TooDeep,
    #[error("array elements occupy no bytes")]
    ZeroSizedElement,
    #[error("invalid boolean value {0}")]
    InvalidBoolean(u32),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("string is not NUL terminated")]
    MissingNul,
    #[error("string contains a NUL byte")]
    InteriorNul,
    #[error("invalid object path '{0}'")]
    InvalidObjectPath(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(dbus_signature::Error),
    #[error("value of type '{found}' does not match")]
    TypeMismatch { found: String },
    #[error("{found} values given for {expected} types")]
    ValueCount { expected: usize, found: usize },
    #[error("{0} trailing bytes after the last value")]
    TrailingBytes(usize),
}

/// Fatal and non-fatal problems with the message envelope.
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum FrameFault {
    #[error("invalid endianness marker {0:#04x}")]
    BadEndian(u8),
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("serial must not be zero")]
    ZeroSerial,
    #[error("declared body length {declared} but {actual} bytes follow the header")]
    BodyLength { declared: usize, actual: usize },
    #[error("message of {0} bytes exceeds the maximum message size")]
    TooLarge(usize),
    #[error("required header field {0:?} is missing")]
    MissingField(HeaderField),
    #[error("header field {0} carries a value of the wrong type")]
    BadField(u8),
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum AuthFault {
    #[error("no common mechanism, server offered [{0}]")]
    NoCommonMechanism(String),
    #[error("stream did not start with a NUL byte")]
    MissingNul,
    #[error("unexpected line '{0}'")]
    UnexpectedLine(String),
    #[error("malformed line '{0}'")]
    Malformed(String),
    #[error("line exceeds the maximum length")]
    LineTooLong,
    #[error("mechanism {mechanism} failed: {reason}")]
    Mechanism { mechanism: String, reason: String },
    #[error("cookie {id} not found in context '{context}'")]
    MissingCookie { context: String, id: String },
    #[error("invalid cookie context '{0}'")]
    InvalidContext(String),
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("IO error")]
    Io(io::ErrorKind),
    #[error("Signature error: {0}")]
    Signature(dbus_signature::Error),
    #[error("Codec error for '{signature}' at offset {offset}: {fault}")]
    Codec {
        signature: String,
        offset: usize,
        fault: CodecFault,
    },
    #[error("Frame error: {0}")]
    Frame(FrameFault),
    #[error("Authentication error: {0}")]
    Auth(AuthFault),
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Timeout")]
    Timeout,
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Invalid bus address: '{0}'")]
    InvalidAddress(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    ErrorReply(DBusError),
}

impl ErrorKind {
    /// True for errors that mean the transport is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, ErrorKind::ChannelClosed)
    }
}

impl ChainErrorFrom<io::Error> for ErrorKind {
    fn chain_error_from(e: io::Error, line_filename: Option<String>) -> ChainError<Self> {
        let kind = match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => ErrorKind::ChannelClosed,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::Timeout,
            kind => ErrorKind::Io(kind),
        };
        ChainError::new(kind, Some(Box::from(e)), line_filename)
    }
}

impl ChainErrorFrom<dbus_signature::Error> for ErrorKind {
    fn chain_error_from(
        e: dbus_signature::Error,
        line_filename: Option<String>,
    ) -> ChainError<Self> {
        ChainError::new(
            ErrorKind::Signature(e.clone()),
            Some(Box::from(e)),
            line_filename,
        )
    }
}

/// Creates an [`Error`] of the given kind, recording the current source location.
#[macro_export]
macro_rules! context {
    ($kind:expr) => {
        $crate::Error::new(
            $kind,
            None,
            Some(concat!(file!(), ":", line!(), ":", column!()).to_string()),
        )
    };
}

/// Closure for `map_err` converting a foreign error via [`ChainErrorFrom`].
#[macro_export]
macro_rules! map_context {
    () => {
        |e| {
            <$crate::ErrorKind as $crate::ChainErrorFrom<_>>::chain_error_from(
                e,
                Some(concat!(file!(), ":", line!(), ":", column!()).to_string()),
            )
        }
    };
}

pub type Error = ChainError<ErrorKind>;
pub type Result<T> = ChainResult<T, ErrorKind>;
