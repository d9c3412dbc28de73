//! Whole messages on the wire.
//!
//! A frame is the 12 byte fixed header, the `a(yv)` field array, padding to
//! 8 and the body. All alignment inside a frame is relative to its first
//! byte, and the body's alignment is relative to the start of the body.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use dbus_signature::TypeNode;
use tracing::trace;

use crate::codec::{Decoder, Encoder, Endian, MAX_ARRAY_LEN};
use crate::error::{CodecFault, Error, ErrorKind, FrameFault, Result};
use crate::message::{HeaderField, Message, MessageFlags, MessageHeader, MessageType};
use crate::value::{Value, Variant};

pub const PROTOCOL_VERSION: u8 = 1;
/// Largest frame accepted or produced, header included.
pub const MAX_MESSAGE_SIZE: usize = 134_217_728;
/// Bytes needed to know the size of a frame.
pub const FIXED_HEADER_LEN: usize = 16;

fn field_array_type() -> TypeNode {
    TypeNode::array(TypeNode::structure(vec![TypeNode::BYTE, TypeNode::VARIANT]))
}

fn frame_fault(fault: FrameFault) -> Error {
    context!(ErrorKind::Frame(fault))
}

fn codec_fault(signature: &str, offset: usize, fault: CodecFault) -> Error {
    context!(ErrorKind::Codec {
        signature: signature.to_string(),
        offset,
        fault,
    })
}

/// Serializes a message into one frame.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    let header = msg.header();
    if header.serial == 0 {
        return Err(frame_fault(FrameFault::ZeroSerial));
    }

    let mut enc = Encoder::new(header.endian);
    enc.write_u8(header.endian.marker());
    enc.write_u8(header.message_type.code());
    enc.write_u8(header.flags.bits());
    enc.write_u8(PROTOCOL_VERSION);
    enc.write_u32(msg.body().len() as u32);
    enc.write_u32(header.serial);

    let fields = Value::Array(
        header
            .fields
            .iter()
            .map(|(code, variant)| {
                Value::Struct(vec![Value::Byte(*code), Value::from(variant.clone())])
            })
            .collect(),
    );
    enc.write_value(&field_array_type(), &fields)?;
    enc.pad(8);
    enc.write_bytes(msg.body());

    let frame = enc.finish();
    if frame.len() > MAX_MESSAGE_SIZE {
        return Err(frame_fault(FrameFault::TooLarge(frame.len())));
    }
    Ok(frame)
}

pub fn write_message<W: Write + ?Sized>(writer: &mut W, msg: &Message) -> Result<()> {
    let frame = encode_message(msg)?;
    trace!("writing {} byte frame: {}", frame.len(), msg);
    writer.write_all(&frame).map_err(map_context!())?;
    writer.flush().map_err(map_context!())?;
    Ok(())
}

/// Total frame length announced by the first 16 bytes.
///
/// An error here means the stream cannot be resynchronized.
pub fn frame_length(prefix: &[u8; FIXED_HEADER_LEN]) -> Result<usize> {
    let endian =
        Endian::from_marker(prefix[0]).ok_or_else(|| frame_fault(FrameFault::BadEndian(prefix[0])))?;
    let word = |at: usize| {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&prefix[at..at + 4]);
        match endian {
            Endian::Big => u32::from_be_bytes(raw) as usize,
            Endian::Little => u32::from_le_bytes(raw) as usize,
        }
    };
    let body_len = word(4);
    let fields_len = word(12);
    if fields_len > MAX_ARRAY_LEN {
        return Err(frame_fault(FrameFault::TooLarge(fields_len)));
    }
    let header_len = (FIXED_HEADER_LEN + fields_len + 7) & !7;
    let total = header_len + body_len;
    if total > MAX_MESSAGE_SIZE {
        return Err(frame_fault(FrameFault::TooLarge(total)));
    }
    Ok(total)
}

/// Outcome of looking for a frame at the start of a buffer.
#[derive(Debug)]
pub enum ParseResult {
    /// `len` bytes at the start of the buffer form one frame.
    Complete { len: usize },
    /// At least `needed` more bytes are required.
    Incomplete { needed: usize },
    /// The buffer can never become a valid frame.
    Invalid { error: Error },
}

/// Finds the extent of the first frame in `buf` without decoding it.
pub fn parse_frame(buf: &[u8]) -> ParseResult {
    if buf.len() < FIXED_HEADER_LEN {
        return ParseResult::Incomplete {
            needed: FIXED_HEADER_LEN - buf.len(),
        };
    }
    let mut prefix = [0u8; FIXED_HEADER_LEN];
    prefix.copy_from_slice(&buf[..FIXED_HEADER_LEN]);
    match frame_length(&prefix) {
        Ok(len) if len <= buf.len() => ParseResult::Complete { len },
        Ok(len) => ParseResult::Incomplete {
            needed: len - buf.len(),
        },
        Err(error) => ParseResult::Invalid { error },
    }
}

/// Reads exactly one frame from `reader`.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let mut prefix = [0u8; FIXED_HEADER_LEN];
    reader.read_exact(&mut prefix).map_err(map_context!())?;
    let total = frame_length(&prefix)?;

    let mut frame = vec![0u8; total];
    frame[..FIXED_HEADER_LEN].copy_from_slice(&prefix);
    reader
        .read_exact(&mut frame[FIXED_HEADER_LEN..])
        .map_err(map_context!())?;
    Ok(frame)
}

/// Decodes one complete frame.
pub fn decode_message(frame: &[u8]) -> Result<Message> {
    let marker = frame.first().copied().unwrap_or(0);
    let endian = Endian::from_marker(marker).ok_or_else(|| frame_fault(FrameFault::BadEndian(marker)))?;
    let mut dec = Decoder::new(frame, endian);
    let fixed = |f: CodecFault| codec_fault("yyyyuu", 0, f);

    dec.read_u8().map_err(fixed)?;
    let type_code = dec.read_u8().map_err(fixed)?;
    let flags = MessageFlags::from_bits_retain(dec.read_u8().map_err(fixed)?);
    let version = dec.read_u8().map_err(fixed)?;
    let body_len = dec.read_u32().map_err(fixed)? as usize;
    let serial = dec.read_u32().map_err(fixed)?;

    if version != PROTOCOL_VERSION {
        return Err(frame_fault(FrameFault::BadVersion(version)));
    }
    let message_type = MessageType::from_code(type_code)
        .ok_or_else(|| frame_fault(FrameFault::UnknownMessageType(type_code)))?;
    if serial == 0 {
        return Err(frame_fault(FrameFault::ZeroSerial));
    }

    let raw_fields = dec.read_value(&field_array_type())?;
    dec.align(8)
        .map_err(|f| codec_fault("yyyyuua(yv)", dec.position(), f))?;
    if dec.remaining() != body_len {
        return Err(frame_fault(FrameFault::BodyLength {
            declared: body_len,
            actual: dec.remaining(),
        }));
    }

    let mut fields = BTreeMap::new();
    for entry in raw_fields.as_array().unwrap_or(&[]) {
        if let Some([Value::Byte(code), Value::Variant(v)]) = entry.as_struct() {
            let variant: &Variant = v;
            if let Some(known) = HeaderField::from_code(*code) {
                if !variant.value().conforms_to(&known.value_type())
                    || variant.signature().single().map(TypeNode::code)
                        != Some(known.value_type().code())
                {
                    return Err(frame_fault(FrameFault::BadField(*code)));
                }
            }
            fields.insert(*code, variant.clone());
        }
    }

    let header = MessageHeader {
        endian,
        message_type,
        flags,
        serial,
        fields,
    };
    for required in message_type.required_fields() {
        if header.get(*required).is_none() {
            return Err(frame_fault(FrameFault::MissingField(*required)));
        }
    }
    if let Some(Value::Signature(s)) = header.get(HeaderField::Signature) {
        if s.is_empty() && body_len != 0 {
            return Err(frame_fault(FrameFault::BodyLength {
                declared: body_len,
                actual: 0,
            }));
        }
    } else if body_len != 0 {
        return Err(frame_fault(FrameFault::MissingField(HeaderField::Signature)));
    }

    Ok(Message::from_parts(header, dec.rest().to_vec()))
}

/// Reads and decodes one message.
///
/// A decode error leaves the reader positioned at the next frame.
pub fn read_message<R: Read + ?Sized>(reader: &mut R) -> Result<Message> {
    let frame = read_frame(reader)?;
    trace!("read {} byte frame", frame.len());
    decode_message(&frame)
}

/// Errors after which the stream is no longer usable.
pub fn is_fatal(e: &Error) -> bool {
    match e.kind() {
        ErrorKind::ChannelClosed | ErrorKind::Io(_) | ErrorKind::Timeout => true,
        ErrorKind::Frame(FrameFault::BadEndian(_)) | ErrorKind::Frame(FrameFault::TooLarge(_)) => {
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbus_signature::Signature;
    use std::io::Cursor;

    fn call() -> Message {
        let mut m = Message::method_call(
            Some("org.example.Service"),
            "/org/example/Object",
            Some("org.example.Iface"),
            "Hello",
        )
        .unwrap();
        m.set_body(
            &Signature::parse("si").unwrap(),
            &[Value::from("hello"), Value::from(42i32)],
        )
        .unwrap();
        m.set_serial(5);
        m
    }

    #[test]
    fn test_round_trip() {
        for endian in &[Endian::Big, Endian::Little] {
            let mut msg = call();
            msg.set_endian(*endian).unwrap();
            let mut buf = Vec::new();
            write_message(&mut buf, &msg).unwrap();
            assert_eq!(buf.len() % 8, (msg.body().len()) % 8);

            let back = read_message(&mut Cursor::new(buf)).unwrap();
            assert_eq!(back.message_type(), MessageType::MethodCall);
            assert_eq!(back.serial(), 5);
            assert_eq!(back.member(), Some("Hello"));
            assert_eq!(
                back.body_values().unwrap(),
                vec![Value::from("hello"), Value::from(42i32)]
            );
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn test_fixed_header_layout() {
        let mut msg = call();
        msg.set_endian(Endian::Little).unwrap();
        let frame = encode_message(&msg).unwrap();
        assert_eq!(frame[0], b'l');
        assert_eq!(frame[1], 1);
        assert_eq!(frame[2], 0);
        assert_eq!(frame[3], PROTOCOL_VERSION);
        assert_eq!(&frame[4..8], &(msg.body().len() as u32).to_le_bytes());
        assert_eq!(&frame[8..12], &5u32.to_le_bytes());

        let body_start = frame.len() - msg.body().len();
        assert_eq!(body_start % 8, 0);
        assert_eq!(&frame[body_start..], msg.body());
    }

    #[test]
    fn test_bad_endian_is_fatal() {
        let mut frame = encode_message(&call()).unwrap();
        frame[0] = b'x';
        let e = read_message(&mut Cursor::new(frame)).unwrap_err();
        assert_eq!(*e.kind(), ErrorKind::Frame(FrameFault::BadEndian(b'x')));
        assert!(is_fatal(&e));
    }

    #[test]
    fn test_body_length_mismatch() {
        let frame = encode_message(&call()).unwrap();
        let short = &frame[..frame.len() - 1];
        let e = decode_message(short).unwrap_err();
        assert!(matches!(
            e.kind(),
            ErrorKind::Frame(FrameFault::BodyLength { .. })
        ));
    }

    #[test]
    fn test_decode_error_keeps_stream_in_sync() {
        let mut bad = call();
        bad.set_serial(1);
        let mut bytes = encode_message(&bad).unwrap();
        bytes[3] = 9; // protocol version
        let good = encode_message(&call()).unwrap();
        bytes.extend_from_slice(&good);

        let mut cursor = Cursor::new(bytes);
        let e = read_message(&mut cursor).unwrap_err();
        assert_eq!(*e.kind(), ErrorKind::Frame(FrameFault::BadVersion(9)));
        assert!(!is_fatal(&e));
        assert_eq!(read_message(&mut cursor).unwrap().serial(), 5);
    }

    #[test]
    fn test_required_fields() {
        let mut reply = Message::new(MessageType::MethodReturn);
        reply.set_serial(2);
        let frame = encode_message(&reply).unwrap();
        let e = decode_message(&frame).unwrap_err();
        assert_eq!(
            *e.kind(),
            ErrorKind::Frame(FrameFault::MissingField(HeaderField::ReplySerial))
        );
    }

    #[test]
    fn test_zero_serial_rejected() {
        let mut msg = call();
        msg.set_serial(0);
        assert!(encode_message(&msg).is_err());
    }

    #[test]
    fn test_parse_frame() {
        let frame = encode_message(&call()).unwrap();
        match parse_frame(&frame[..10]) {
            ParseResult::Incomplete { needed } => assert_eq!(needed, 6),
            r => panic!("unexpected {:?}", r),
        }
        match parse_frame(&frame[..20]) {
            ParseResult::Incomplete { needed } => assert_eq!(needed, frame.len() - 20),
            r => panic!("unexpected {:?}", r),
        }
        match parse_frame(&frame) {
            ParseResult::Complete { len } => assert_eq!(len, frame.len()),
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn test_unknown_field_preserved() {
        let msg = call();
        let back = decode_message(&encode_message(&msg).unwrap()).unwrap();
        assert!(back.field(42).is_none());

        let mut header = msg.header().clone();
        header.fields.insert(
            42,
            Variant::new(Signature::parse("y").unwrap(), Value::from(7u8)).unwrap(),
        );
        let with_unknown = Message::from_parts(header, msg.body().to_vec());
        let frame = encode_message(&with_unknown).unwrap();
        let back = decode_message(&frame).unwrap();
        assert_eq!(back.field(42).map(|v| v.value()), Some(&Value::from(7u8)));
    }
}
