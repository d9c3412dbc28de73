//! Binary marshalling of [`Value`]s.
//!
//! Every value starts at a multiple of its type's alignment, measured from
//! the start of the buffer being built or read. Gaps are filled with zero
//! bytes, and the decoder refuses anything else in them.

use dbus_signature::{Signature, TypeCode, TypeNode};

use crate::error::{CodecFault, Error, ErrorKind, Result};
use crate::value::{ObjectPath, Value, Variant};

/// Largest array body the wire format allows, in bytes.
pub const MAX_ARRAY_LEN: usize = 67_108_864;
/// Containers of any kind, variants included, nest at most this deep in one value.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    pub fn native() -> Endian {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    /// The first byte of every message.
    pub fn marker(self) -> u8 {
        match self {
            Endian::Big => b'B',
            Endian::Little => b'l',
        }
    }

    pub fn from_marker(b: u8) -> Option<Endian> {
        match b {
            b'B' => Some(Endian::Big),
            b'l' => Some(Endian::Little),
            _ => None,
        }
    }
}

impl Default for Endian {
    fn default() -> Self {
        Endian::native()
    }
}

macro_rules! write_fixed {
    ($($name:ident: $t:ty),*) => {
        $(pub fn $name(&mut self, v: $t) {
            self.pad(std::mem::size_of::<$t>());
            match self.endian {
                Endian::Big => self.buf.extend_from_slice(&v.to_be_bytes()),
                Endian::Little => self.buf.extend_from_slice(&v.to_le_bytes()),
            }
        })*
    };
}

macro_rules! read_fixed {
    ($($name:ident: $t:ty),*) => {
        $(pub fn $name(&mut self) -> std::result::Result<$t, CodecFault> {
            const N: usize = std::mem::size_of::<$t>();
            self.align(N)?;
            let mut raw = [0u8; N];
            raw.copy_from_slice(self.take(N)?);
            Ok(match self.endian {
                Endian::Big => <$t>::from_be_bytes(raw),
                Endian::Little => <$t>::from_le_bytes(raw),
            })
        })*
    };
}

pub struct Encoder {
    buf: Vec<u8>,
    endian: Endian,
}

impl Encoder {
    pub fn new(endian: Endian) -> Self {
        Encoder {
            buf: Vec::new(),
            endian,
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Appends zero bytes up to the next multiple of `align`.
    pub fn pad(&mut self, align: usize) {
        let rem = self.buf.len() % align;
        if rem != 0 {
            self.buf.resize(self.buf.len() + align - rem, 0);
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    write_fixed!(write_u16: u16, write_i16: i16, write_u32: u32, write_i32: i32,
                 write_u64: u64, write_i64: i64);

    pub fn write_f64(&mut self, v: f64) {
        self.write_u64(v.to_bits());
    }

    /// Raw bytes, no alignment.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn fault(&self, t: &TypeNode, fault: CodecFault) -> Error {
        context!(ErrorKind::Codec {
            signature: t.to_string(),
            offset: self.buf.len(),
            fault,
        })
    }

    fn write_str(&mut self, t: &TypeNode, s: &str) -> Result<()> {
        if s.as_bytes().contains(&0) {
            return Err(self.fault(t, CodecFault::InteriorNul));
        }
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    pub fn write_signature(&mut self, s: &Signature) {
        let text = s.to_string();
        // parsed signatures are at most 255 bytes
        self.buf.push(text.len() as u8);
        self.buf.extend_from_slice(text.as_bytes());
        self.buf.push(0);
    }

    /// Writes `value`, which must conform to `t`.
    pub fn write_value(&mut self, t: &TypeNode, value: &Value) -> Result<()> {
        match (t.code(), value) {
            (TypeCode::Byte, Value::Byte(v)) => self.write_u8(*v),
            (TypeCode::Boolean, Value::Boolean(v)) => self.write_u32(u32::from(*v)),
            (TypeCode::Int16, Value::Int16(v)) => self.write_i16(*v),
            (TypeCode::Uint16, Value::Uint16(v)) => self.write_u16(*v),
            (TypeCode::Int32, Value::Int32(v)) => self.write_i32(*v),
            (TypeCode::Uint32, Value::Uint32(v)) => self.write_u32(*v),
            (TypeCode::Int64, Value::Int64(v)) => self.write_i64(*v),
            (TypeCode::Uint64, Value::Uint64(v)) => self.write_u64(*v),
            (TypeCode::Double, Value::Double(v)) => self.write_f64(*v),
            (TypeCode::String, Value::String(s)) => self.write_str(t, s)?,
            (TypeCode::ObjectPath, Value::ObjectPath(p)) => self.write_str(t, p.as_str())?,
            (TypeCode::Signature, Value::Signature(s)) => self.write_signature(s),
            (TypeCode::Array, Value::Array(items)) => self.write_array(t, items)?,
            (TypeCode::Struct, Value::Struct(fields)) if fields.len() == t.children().len() => {
                self.pad(8);
                for (ft, field) in t.children().iter().zip(fields) {
                    self.write_value(ft, field)?;
                }
            }
            (TypeCode::DictEntry, Value::DictEntry(k, v)) => {
                let (kt, vt) = t
                    .key_value()
                    .ok_or_else(|| self.fault(t, CodecFault::VariantArity(t.children().len())))?;
                self.pad(8);
                self.write_value(kt, k)?;
                self.write_value(vt, v)?;
            }
            (TypeCode::Variant, Value::Variant(v)) => {
                let inner = v
                    .signature()
                    .single()
                    .ok_or_else(|| self.fault(t, CodecFault::VariantArity(v.signature().len())))?;
                self.write_signature(v.signature());
                self.write_value(inner, v.value())?;
            }
            _ => {
                return Err(self.fault(
                    t,
                    CodecFault::TypeMismatch {
                        found: value.type_name(),
                    },
                ))
            }
        }
        Ok(())
    }

    fn write_array(&mut self, t: &TypeNode, items: &[Value]) -> Result<()> {
        let element = t
            .element()
            .ok_or_else(|| self.fault(t, CodecFault::TypeMismatch { found: "a".into() }))?;

        self.pad(4);
        let len_pos = self.buf.len();
        self.write_u32(0);
        self.pad(element.alignment());
        let start = self.buf.len();

        if element.code() == TypeCode::Byte {
            let mut bytes = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Byte(b) => bytes.push(*b),
                    other => {
                        return Err(self.fault(
                            element,
                            CodecFault::TypeMismatch {
                                found: other.type_name(),
                            },
                        ))
                    }
                }
            }
            self.buf.extend_from_slice(&bytes);
        } else {
            for item in items {
                self.write_value(element, item)?;
            }
            if !items.is_empty() && self.buf.len() == start {
                return Err(self.fault(t, CodecFault::ZeroSizedElement));
            }
        }

        let len = self.buf.len() - start;
        if len > MAX_ARRAY_LEN {
            return Err(self.fault(t, CodecFault::ArrayTooLong(len)));
        }
        let raw = match self.endian {
            Endian::Big => (len as u32).to_be_bytes(),
            Endian::Little => (len as u32).to_le_bytes(),
        };
        self.buf[len_pos..len_pos + 4].copy_from_slice(&raw);
        Ok(())
    }

    pub fn write_values(&mut self, signature: &Signature, values: &[Value]) -> Result<()> {
        if signature.len() != values.len() {
            return Err(context!(ErrorKind::Codec {
                signature: signature.to_string(),
                offset: self.buf.len(),
                fault: CodecFault::ValueCount {
                    expected: signature.len(),
                    found: values.len(),
                },
            }));
        }
        for (t, v) in signature.types().iter().zip(values) {
            self.write_value(t, v)?;
        }
        Ok(())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    endian: Endian,
    depth: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8], endian: Endian) -> Self {
        Decoder {
            buf,
            pos: 0,
            endian,
            depth: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// The unread rest of the buffer.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Skips padding up to the next multiple of `align`; padding must be zero.
    pub fn align(&mut self, align: usize) -> std::result::Result<(), CodecFault> {
        let rem = self.pos % align;
        if rem == 0 {
            return Ok(());
        }
        let padding = self.take(align - rem)?;
        if padding.iter().any(|b| *b != 0) {
            return Err(CodecFault::NonZeroPadding);
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], CodecFault> {
        if self.remaining() < n {
            return Err(CodecFault::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> std::result::Result<u8, CodecFault> {
        Ok(self.take(1)?[0])
    }

    read_fixed!(read_u16: u16, read_i16: i16, read_u32: u32, read_i32: i32,
                read_u64: u64, read_i64: i64);

    fn read_string(&mut self) -> std::result::Result<&'a str, CodecFault> {
        let len = self.read_u32()? as usize;
        self.read_text(len)
    }

    fn read_text(&mut self, len: usize) -> std::result::Result<&'a str, CodecFault> {
        let bytes = self.take(len)?;
        if self.read_u8()? != 0 {
            return Err(CodecFault::MissingNul);
        }
        if bytes.contains(&0) {
            return Err(CodecFault::InteriorNul);
        }
        std::str::from_utf8(bytes).map_err(|_| CodecFault::InvalidUtf8)
    }

    pub fn read_signature(&mut self) -> std::result::Result<Signature, CodecFault> {
        let len = self.read_u8()? as usize;
        let text = self.read_text(len)?;
        Signature::parse(text).map_err(CodecFault::InvalidSignature)
    }

    fn fault(&self, t: &TypeNode, start: usize, fault: CodecFault) -> Error {
        context!(ErrorKind::Codec {
            signature: t.to_string(),
            offset: start,
            fault,
        })
    }

    pub fn read_value(&mut self, t: &TypeNode) -> Result<Value> {
        if !t.code().is_container() {
            return self.read_contents(t);
        }
        if self.depth >= MAX_DEPTH {
            return Err(self.fault(t, self.pos, CodecFault::TooDeep));
        }
        self.depth += 1;
        let value = self.read_contents(t);
        self.depth -= 1;
        value
    }

    fn read_contents(&mut self, t: &TypeNode) -> Result<Value> {
        let start = self.pos;
        let wrap = |fault| {
            context!(ErrorKind::Codec {
                signature: t.to_string(),
                offset: start,
                fault,
            })
        };

        Ok(match t.code() {
            TypeCode::Byte => Value::Byte(self.read_u8().map_err(wrap)?),
            TypeCode::Boolean => match self.read_u32().map_err(wrap)? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                v => return Err(wrap(CodecFault::InvalidBoolean(v))),
            },
            TypeCode::Int16 => Value::Int16(self.read_i16().map_err(wrap)?),
            TypeCode::Uint16 => Value::Uint16(self.read_u16().map_err(wrap)?),
            TypeCode::Int32 => Value::Int32(self.read_i32().map_err(wrap)?),
            TypeCode::Uint32 => Value::Uint32(self.read_u32().map_err(wrap)?),
            TypeCode::Int64 => Value::Int64(self.read_i64().map_err(wrap)?),
            TypeCode::Uint64 => Value::Uint64(self.read_u64().map_err(wrap)?),
            TypeCode::Double => Value::Double(f64::from_bits(self.read_u64().map_err(wrap)?)),
            TypeCode::String => Value::String(self.read_string().map_err(wrap)?.to_string()),
            TypeCode::ObjectPath => {
                let path = self.read_string().map_err(wrap)?;
                if !ObjectPath::is_valid(path) {
                    return Err(wrap(CodecFault::InvalidObjectPath(path.to_string())));
                }
                Value::ObjectPath(ObjectPath::new(path)?)
            }
            TypeCode::Signature => Value::Signature(self.read_signature().map_err(wrap)?),
            TypeCode::Array => self.read_array(t)?,
            TypeCode::Struct => {
                self.align(8).map_err(wrap)?;
                let mut fields = Vec::with_capacity(t.children().len());
                for ft in t.children() {
                    fields.push(self.read_value(ft)?);
                }
                Value::Struct(fields)
            }
            TypeCode::DictEntry => {
                let (kt, vt) = t
                    .key_value()
                    .ok_or_else(|| wrap(CodecFault::VariantArity(t.children().len())))?;
                self.align(8).map_err(wrap)?;
                let k = self.read_value(kt)?;
                let v = self.read_value(vt)?;
                Value::DictEntry(Box::new(k), Box::new(v))
            }
            TypeCode::Variant => {
                let signature = self.read_signature().map_err(wrap)?;
                let inner = signature
                    .single()
                    .ok_or_else(|| wrap(CodecFault::VariantArity(signature.len())))?
                    .clone();
                let value = self.read_value(&inner)?;
                Value::Variant(Box::new(Variant::new_unchecked(signature, value)))
            }
        })
    }

    fn read_array(&mut self, t: &TypeNode) -> Result<Value> {
        let start = self.pos;
        let element = t
            .element()
            .ok_or_else(|| self.fault(t, start, CodecFault::VariantArity(0)))?;

        let len = self
            .read_u32()
            .map_err(|f| self.fault(t, start, f))? as usize;
        if len > MAX_ARRAY_LEN {
            return Err(self.fault(t, start, CodecFault::ArrayTooLong(len)));
        }
        self.align(element.alignment())
            .map_err(|f| self.fault(t, start, f))?;
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(self.fault(t, start, CodecFault::Truncated));
        }

        if element.code() == TypeCode::Byte {
            let bytes = self.take(len).map_err(|f| self.fault(t, start, f))?;
            return Ok(Value::Array(bytes.iter().copied().map(Value::Byte).collect()));
        }

        let mut items = Vec::new();
        while self.pos < end {
            let before = self.pos;
            items.push(self.read_value(element)?);
            if self.pos == before {
                return Err(self.fault(t, start, CodecFault::ZeroSizedElement));
            }
        }
        if self.pos != end {
            return Err(self.fault(
                t,
                start,
                CodecFault::ArrayBoundary {
                    expected: end,
                    actual: self.pos,
                },
            ));
        }
        Ok(Value::Array(items))
    }

    pub fn read_values(&mut self, signature: &Signature) -> Result<Vec<Value>> {
        signature
            .types()
            .iter()
            .map(|t| self.read_value(t))
            .collect()
    }
}

/// Marshals `values` according to `signature`, starting at offset 0.
pub fn encode(signature: &Signature, values: &[Value], endian: Endian) -> Result<Vec<u8>> {
    let mut encoder = Encoder::new(endian);
    encoder.write_values(signature, values)?;
    Ok(encoder.finish())
}

/// Unmarshals `bytes` according to `signature`. The whole buffer must be consumed.
pub fn decode(signature: &Signature, bytes: &[u8], endian: Endian) -> Result<Vec<Value>> {
    let mut decoder = Decoder::new(bytes, endian);
    let values = decoder.read_values(signature)?;
    if decoder.remaining() != 0 {
        return Err(context!(ErrorKind::Codec {
            signature: signature.to_string(),
            offset: decoder.position(),
            fault: CodecFault::TrailingBytes(decoder.remaining()),
        }));
    }
    Ok(values)
}
