//! In-memory representation of values carried on the wire.

use std::convert::TryFrom;
use std::fmt;

use dbus_signature::{Signature, TypeCode, TypeNode};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::error::{CodecFault, ErrorKind, Result};

/// A validated object path such as `/org/freedesktop/DBus`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new<S: Into<String>>(path: S) -> Result<ObjectPath> {
        let path = path.into();
        if ObjectPath::is_valid(&path) {
            Ok(ObjectPath(path))
        } else {
            Err(context!(ErrorKind::InvalidArgument(format!(
                "invalid object path '{}'",
                path
            ))))
        }
    }

    pub fn is_valid(path: &str) -> bool {
        if path == "/" {
            return true;
        }
        match path.strip_prefix('/') {
            Some(rest) => rest.split('/').all(|segment| {
                !segment.is_empty()
                    && segment
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b == b'_')
            }),
            None => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = crate::Error;

    fn try_from(s: &str) -> Result<Self> {
        ObjectPath::new(s)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A self-describing value: exactly one complete type plus a value of it.
#[derive(Clone, Debug, PartialEq)]
pub struct Variant {
    signature: Signature,
    value: Value,
}

impl Variant {
    /// Fails unless `signature` holds exactly one type and `value` conforms to it.
    pub fn new(signature: Signature, value: Value) -> Result<Variant> {
        match signature.single() {
            Some(t) if value.conforms_to(t) => {}
            Some(t) => {
                return Err(context!(ErrorKind::Codec {
                    signature: t.to_string(),
                    offset: 0,
                    fault: CodecFault::TypeMismatch {
                        found: value.type_name(),
                    },
                }))
            }
            None => {
                return Err(context!(ErrorKind::Codec {
                    signature: signature.to_string(),
                    offset: 0,
                    fault: CodecFault::VariantArity(signature.len()),
                }))
            }
        }
        Ok(Variant { signature, value })
    }

    /// Wraps `value`, inferring its type. Fails for empty arrays.
    pub fn from_value(value: Value) -> Result<Variant> {
        let t = value.type_node().ok_or_else(|| {
            context!(ErrorKind::InvalidArgument(
                "cannot infer the type of an empty array".into()
            ))
        })?;
        Ok(Variant {
            signature: Signature::from(t),
            value,
        })
    }

    pub(crate) fn new_unchecked(signature: Signature, value: Value) -> Variant {
        Variant { signature, value }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    Array(Vec<Value>),
    Struct(Vec<Value>),
    DictEntry(Box<Value>, Box<Value>),
    Variant(Box<Variant>),
}

impl Value {
    /// Builds an array of dict entries, keeping the given order.
    pub fn dict<I: IntoIterator<Item = (Value, Value)>>(entries: I) -> Value {
        Value::Array(
            entries
                .into_iter()
                .map(|(k, v)| Value::DictEntry(Box::new(k), Box::new(v)))
                .collect(),
        )
    }

    pub fn variant(value: Value) -> Result<Value> {
        Ok(Value::Variant(Box::new(Variant::from_value(value)?)))
    }

    pub fn code(&self) -> TypeCode {
        match self {
            Value::Byte(_) => TypeCode::Byte,
            Value::Boolean(_) => TypeCode::Boolean,
            Value::Int16(_) => TypeCode::Int16,
            Value::Uint16(_) => TypeCode::Uint16,
            Value::Int32(_) => TypeCode::Int32,
            Value::Uint32(_) => TypeCode::Uint32,
            Value::Int64(_) => TypeCode::Int64,
            Value::Uint64(_) => TypeCode::Uint64,
            Value::Double(_) => TypeCode::Double,
            Value::String(_) => TypeCode::String,
            Value::ObjectPath(_) => TypeCode::ObjectPath,
            Value::Signature(_) => TypeCode::Signature,
            Value::Array(_) => TypeCode::Array,
            Value::Struct(_) => TypeCode::Struct,
            Value::DictEntry(..) => TypeCode::DictEntry,
            Value::Variant(_) => TypeCode::Variant,
        }
    }

    /// Infers the complete type of this value.
    ///
    /// Arrays take the type of their first element, so an empty array has
    /// no inferable type.
    pub fn type_node(&self) -> Option<TypeNode> {
        Some(match self {
            Value::Array(items) => TypeNode::array(items.first()?.type_node()?),
            Value::Struct(fields) => TypeNode::structure(
                fields
                    .iter()
                    .map(Value::type_node)
                    .collect::<Option<Vec<_>>>()?,
            ),
            Value::DictEntry(k, v) => TypeNode::dict_entry(k.type_node()?, v.type_node()?).ok()?,
            Value::Byte(_) => TypeNode::BYTE,
            Value::Boolean(_) => TypeNode::BOOLEAN,
            Value::Int16(_) => TypeNode::INT16,
            Value::Uint16(_) => TypeNode::UINT16,
            Value::Int32(_) => TypeNode::INT32,
            Value::Uint32(_) => TypeNode::UINT32,
            Value::Int64(_) => TypeNode::INT64,
            Value::Uint64(_) => TypeNode::UINT64,
            Value::Double(_) => TypeNode::DOUBLE,
            Value::String(_) => TypeNode::STRING,
            Value::ObjectPath(_) => TypeNode::OBJECT_PATH,
            Value::Signature(_) => TypeNode::SIGNATURE,
            Value::Variant(_) => TypeNode::VARIANT,
        })
    }

    /// Checks the value against a type tree, recursively.
    pub fn conforms_to(&self, t: &TypeNode) -> bool {
        if self.code() != t.code() {
            return false;
        }
        match self {
            Value::Array(items) => match t.element() {
                Some(e) => items.iter().all(|item| item.conforms_to(e)),
                None => false,
            },
            Value::Struct(fields) => {
                fields.len() == t.children().len()
                    && fields.iter().zip(t.children()).all(|(f, c)| f.conforms_to(c))
            }
            Value::DictEntry(k, v) => match t.key_value() {
                Some((kt, vt)) => k.conforms_to(kt) && v.conforms_to(vt),
                None => false,
            },
            _ => true,
        }
    }

    /// Short description used in error messages.
    pub fn type_name(&self) -> String {
        match self.type_node() {
            Some(t) => t.to_string(),
            None => self.code().to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::ObjectPath(p) => Some(p.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Boolean(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Value::Uint32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            Value::Int32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Byte(v) => Some(v.into()),
            Value::Uint16(v) => Some(v.into()),
            Value::Uint32(v) => Some(v.into()),
            Value::Uint64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Byte(v) => Some(v.into()),
            Value::Int16(v) => Some(v.into()),
            Value::Uint16(v) => Some(v.into()),
            Value::Int32(v) => Some(v.into()),
            Value::Uint32(v) => Some(v.into()),
            Value::Int64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Double(v) => Some(v),
            _ => None,
        }
    }

    /// Contents of an `ay` array.
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Value::Array(items) => items
                .iter()
                .map(|v| match *v {
                    Value::Byte(b) => Some(b),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&[Value]> {
        match self {
            Value::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<&Variant> {
        match self {
            Value::Variant(v) => Some(v),
            _ => None,
        }
    }

    /// Looks up `key` in an array of dict entries.
    pub fn dict_get(&self, key: &Value) -> Option<&Value> {
        self.as_array()?.iter().find_map(|entry| match entry {
            Value::DictEntry(k, v) if k.as_ref() == key => Some(v.as_ref()),
            _ => None,
        })
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v)
            }
        })*
    };
}

value_from! {
    u8 => Byte,
    bool => Boolean,
    i16 => Int16,
    u16 => Uint16,
    i32 => Int32,
    u32 => Uint32,
    i64 => Int64,
    u64 => Uint64,
    f64 => Double,
    String => String,
    ObjectPath => ObjectPath,
    Signature => Signature,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Array(v.into_iter().map(Value::Byte).collect())
    }
}

impl From<Variant> for Value {
    fn from(v: Variant) -> Self {
        Value::Variant(Box::new(v))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Byte(v) => write!(f, "{}", v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Uint16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Uint32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Uint64(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{:?}", v),
            Value::ObjectPath(v) => write!(f, "{}", v),
            Value::Signature(v) => write!(f, "<{}>", v),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Struct(fields) => {
                f.write_str("(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                f.write_str(")")
            }
            Value::DictEntry(k, v) => write!(f, "{}: {}", k, v),
            Value::Variant(v) => write!(f, "{}", v.value),
        }
    }
}

fn is_dict(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(|v| matches!(v, Value::DictEntry(..)))
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Byte(v) => serializer.serialize_u8(*v),
            Value::Boolean(v) => serializer.serialize_bool(*v),
            Value::Int16(v) => serializer.serialize_i16(*v),
            Value::Uint16(v) => serializer.serialize_u16(*v),
            Value::Int32(v) => serializer.serialize_i32(*v),
            Value::Uint32(v) => serializer.serialize_u32(*v),
            Value::Int64(v) => serializer.serialize_i64(*v),
            Value::Uint64(v) => serializer.serialize_u64(*v),
            Value::Double(v) => serializer.serialize_f64(*v),
            Value::String(v) => serializer.serialize_str(v),
            Value::ObjectPath(v) => serializer.serialize_str(v.as_str()),
            Value::Signature(v) => serializer.collect_str(v),
            Value::Array(items) if is_dict(items) => {
                let mut map = serializer.serialize_map(Some(items.len()))?;
                for item in items {
                    if let Value::DictEntry(k, v) = item {
                        map.serialize_entry(&MapKey(k), v)?;
                    }
                }
                map.end()
            }
            Value::Array(items) | Value::Struct(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::DictEntry(k, v) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(k)?;
                seq.serialize_element(v)?;
                seq.end()
            }
            Value::Variant(v) => v.value.serialize(serializer),
        }
    }
}

/// Dict keys are basic types; map formats want strings.
struct MapKey<'a>(&'a Value);

impl Serialize for MapKey<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0 {
            Value::String(s) => serializer.serialize_str(s),
            other => serializer.collect_str(&other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path() {
        for ok in &["/", "/org", "/org/freedesktop/DBus", "/a_b/C9"] {
            assert!(ObjectPath::new(*ok).is_ok(), "{}", ok);
        }
        for bad in &["", "org", "/org/", "//", "/a//b", "/a-b", "/ä"] {
            assert!(ObjectPath::new(*bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_type_inference() {
        let v = Value::dict(vec![(Value::from("a"), Value::from(1i32))]);
        assert_eq!(v.type_node().unwrap().to_string(), "a{si}");
        assert!(Value::Array(vec![]).type_node().is_none());

        let s = Value::Struct(vec![Value::from(1u8), Value::from(vec![1u8, 2])]);
        assert_eq!(s.type_node().unwrap().to_string(), "(yay)");
    }

    #[test]
    fn test_variant_checks() {
        let sig = Signature::parse("as").unwrap();
        assert!(Variant::new(sig.clone(), Value::Array(vec![])).is_ok());
        assert!(Variant::new(sig, Value::from(1u32)).is_err());
        assert!(Variant::new(Signature::parse("ss").unwrap(), Value::from("x")).is_err());
        assert!(Variant::from_value(Value::Array(vec![])).is_err());
    }

    #[test]
    fn test_serialize_json() {
        let v = Value::Struct(vec![
            Value::from("x"),
            Value::dict(vec![(Value::from(1u32), Value::variant(Value::from(true)).unwrap())]),
            Value::from(vec![7u8]),
        ]);
        assert_eq!(
            serde_json::to_string(&v).unwrap(),
            r#"["x",{"1":true},[7]]"#
        );
    }
}
