/*!
 dbus_signature crate for parsing [D-Bus](https://dbus.freedesktop.org) type signatures.

 A signature is an ordered list of complete types. Every complete type is
 represented as a [`TypeNode`] tree, and a parsed [`Signature`] always prints
 back to the exact text it was parsed from.

 # Examples

 ```rust
 use dbus_signature::{Signature, TypeCode};

 let s = Signature::parse("a{sv}i").unwrap();
 assert_eq!(s.len(), 2);
 assert_eq!(s.types()[0].code(), TypeCode::Array);
 assert_eq!(s.types()[0].element().unwrap().code(), TypeCode::DictEntry);
 assert_eq!(s.to_string(), "a{sv}i");
 ```
!*/

use std::convert::TryFrom;
use std::str::FromStr;

mod format;

/// Longest signature the wire format can carry (one length byte).
pub const MAX_SIGNATURE_LEN: usize = 255;
/// Maximum nesting of arrays inside a single complete type.
pub const MAX_ARRAY_DEPTH: usize = 32;
/// Maximum nesting of structs and dict entries inside a single complete type.
pub const MAX_STRUCT_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("unknown type code '{code}' at offset {offset}")]
    UnknownTypeCode { code: char, offset: usize },
    #[error("'{open}' opened at offset {offset} is never closed")]
    Unclosed { open: char, offset: usize },
    #[error("unexpected '{close}' at offset {offset}")]
    UnexpectedClose { close: char, offset: usize },
    #[error("array at offset {offset} has no element type")]
    MissingArrayElement { offset: usize },
    #[error("dict entry key at offset {offset} is not a basic type")]
    ContainerDictKey { offset: usize },
    #[error("dict entry at offset {offset} must contain exactly a key and a value")]
    DictEntryArity { offset: usize },
    #[error("signature is {len} bytes long, at most 255 are allowed")]
    TooLong { len: usize },
    #[error("containers nested too deeply at offset {offset}")]
    TooDeep { offset: usize },
}

impl Error {
    /// Byte offset into the signature text the error refers to, if any.
    pub fn offset(&self) -> Option<usize> {
        match *self {
            Error::UnknownTypeCode { offset, .. }
            | Error::Unclosed { offset, .. }
            | Error::UnexpectedClose { offset, .. }
            | Error::MissingArrayElement { offset }
            | Error::ContainerDictKey { offset }
            | Error::DictEntryArity { offset }
            | Error::TooDeep { offset } => Some(offset),
            Error::TooLong { .. } => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The kind of a single D-Bus type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Byte,
    Boolean,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    String,
    ObjectPath,
    Signature,
    Array,
    Struct,
    DictEntry,
    Variant,
}

impl TypeCode {
    pub fn from_char(c: char) -> Option<TypeCode> {
        Some(match c {
            'y' => TypeCode::Byte,
            'b' => TypeCode::Boolean,
            'n' => TypeCode::Int16,
            'q' => TypeCode::Uint16,
            'i' => TypeCode::Int32,
            'u' => TypeCode::Uint32,
            'x' => TypeCode::Int64,
            't' => TypeCode::Uint64,
            'd' => TypeCode::Double,
            's' => TypeCode::String,
            'o' => TypeCode::ObjectPath,
            'g' => TypeCode::Signature,
            'a' => TypeCode::Array,
            'v' => TypeCode::Variant,
            _ => return None,
        })
    }

    /// The character that opens this type in a signature.
    pub fn as_char(self) -> char {
        match self {
            TypeCode::Byte => 'y',
            TypeCode::Boolean => 'b',
            TypeCode::Int16 => 'n',
            TypeCode::Uint16 => 'q',
            TypeCode::Int32 => 'i',
            TypeCode::Uint32 => 'u',
            TypeCode::Int64 => 'x',
            TypeCode::Uint64 => 't',
            TypeCode::Double => 'd',
            TypeCode::String => 's',
            TypeCode::ObjectPath => 'o',
            TypeCode::Signature => 'g',
            TypeCode::Array => 'a',
            TypeCode::Struct => '(',
            TypeCode::DictEntry => '{',
            TypeCode::Variant => 'v',
        }
    }

    /// Wire alignment in bytes.
    pub fn alignment(self) -> usize {
        match self {
            TypeCode::Byte | TypeCode::Signature | TypeCode::Variant => 1,
            TypeCode::Int16 | TypeCode::Uint16 => 2,
            TypeCode::Boolean
            | TypeCode::Int32
            | TypeCode::Uint32
            | TypeCode::String
            | TypeCode::ObjectPath
            | TypeCode::Array => 4,
            TypeCode::Int64
            | TypeCode::Uint64
            | TypeCode::Double
            | TypeCode::Struct
            | TypeCode::DictEntry => 8,
        }
    }

    /// Basic types are the ones allowed as dict entry keys.
    pub fn is_basic(self) -> bool {
        !matches!(
            self,
            TypeCode::Array | TypeCode::Struct | TypeCode::DictEntry | TypeCode::Variant
        )
    }

    pub fn is_container(self) -> bool {
        matches!(
            self,
            TypeCode::Array | TypeCode::Struct | TypeCode::DictEntry | TypeCode::Variant
        )
    }
}

/// One complete type.
///
/// `Array` nodes have exactly one child, `DictEntry` nodes exactly two
/// (key first), `Struct` nodes any number, every other code none.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeNode {
    code: TypeCode,
    children: Vec<TypeNode>,
}

macro_rules! leaf_nodes {
    ($($name:ident => $code:ident),* $(,)?) => {
        $(pub const $name: TypeNode = TypeNode {
            code: TypeCode::$code,
            children: Vec::new(),
        };)*
    };
}

impl TypeNode {
    leaf_nodes! {
        BYTE => Byte,
        BOOLEAN => Boolean,
        INT16 => Int16,
        UINT16 => Uint16,
        INT32 => Int32,
        UINT32 => Uint32,
        INT64 => Int64,
        UINT64 => Uint64,
        DOUBLE => Double,
        STRING => String,
        OBJECT_PATH => ObjectPath,
        SIGNATURE => Signature,
        VARIANT => Variant,
    }

    pub fn array(element: TypeNode) -> TypeNode {
        TypeNode {
            code: TypeCode::Array,
            children: vec![element],
        }
    }

    pub fn structure(fields: Vec<TypeNode>) -> TypeNode {
        TypeNode {
            code: TypeCode::Struct,
            children: fields,
        }
    }

    /// Fails when `key` is not a basic type.
    pub fn dict_entry(key: TypeNode, value: TypeNode) -> Result<TypeNode> {
        if !key.code.is_basic() {
            return Err(Error::ContainerDictKey { offset: 1 });
        }
        Ok(TypeNode {
            code: TypeCode::DictEntry,
            children: vec![key, value],
        })
    }

    pub fn code(&self) -> TypeCode {
        self.code
    }

    pub fn children(&self) -> &[TypeNode] {
        &self.children
    }

    pub fn alignment(&self) -> usize {
        self.code.alignment()
    }

    /// Element type of an array.
    pub fn element(&self) -> Option<&TypeNode> {
        match self.code {
            TypeCode::Array => self.children.first(),
            _ => None,
        }
    }

    /// Key and value types of a dict entry.
    pub fn key_value(&self) -> Option<(&TypeNode, &TypeNode)> {
        match (self.code, self.children.as_slice()) {
            (TypeCode::DictEntry, [k, v]) => Some((k, v)),
            _ => None,
        }
    }

    /// Length of the canonical text form.
    pub fn text_len(&self) -> usize {
        match self.code {
            TypeCode::Struct | TypeCode::DictEntry => {
                2 + self.children.iter().map(TypeNode::text_len).sum::<usize>()
            }
            _ => 1 + self.children.iter().map(TypeNode::text_len).sum::<usize>(),
        }
    }

    fn depths(&self) -> (usize, usize) {
        let (a, s) = self
            .children
            .iter()
            .map(TypeNode::depths)
            .fold((0, 0), |(a, s), (ca, cs)| (a.max(ca), s.max(cs)));
        match self.code {
            TypeCode::Array => (a + 1, s),
            TypeCode::Struct | TypeCode::DictEntry => (a, s + 1),
            _ => (a, s),
        }
    }
}

/// An ordered sequence of complete types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Signature {
    types: Vec<TypeNode>,
}

impl Signature {
    /// The signature with no types at all, `""`.
    pub fn empty() -> Signature {
        Signature { types: Vec::new() }
    }

    pub fn parse(text: &str) -> Result<Signature> {
        if text.len() > MAX_SIGNATURE_LEN {
            return Err(Error::TooLong { len: text.len() });
        }
        let mut parser = Parser { text, pos: 0 };
        let mut types = Vec::new();
        while parser.pos < text.len() {
            types.push(parser.complete_type(0, 0)?);
        }
        Ok(Signature { types })
    }

    /// Builds a signature from already constructed type trees, enforcing
    /// the length and nesting limits.
    pub fn from_types(types: Vec<TypeNode>) -> Result<Signature> {
        let len: usize = types.iter().map(TypeNode::text_len).sum();
        if len > MAX_SIGNATURE_LEN {
            return Err(Error::TooLong { len });
        }
        let mut offset = 0;
        for t in &types {
            let (arrays, structs) = t.depths();
            if arrays > MAX_ARRAY_DEPTH || structs > MAX_STRUCT_DEPTH {
                return Err(Error::TooDeep { offset });
            }
            offset += t.text_len();
        }
        Ok(Signature { types })
    }

    pub fn types(&self) -> &[TypeNode] {
        &self.types
    }

    pub fn into_types(self) -> Vec<TypeNode> {
        self.types
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// The only type of a single-type signature, as carried by a variant.
    pub fn single(&self) -> Option<&TypeNode> {
        match self.types.as_slice() {
            [t] => Some(t),
            _ => None,
        }
    }

    pub fn text_len(&self) -> usize {
        self.types.iter().map(TypeNode::text_len).sum()
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Signature::parse(s)
    }
}

impl TryFrom<&str> for Signature {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Signature::parse(s)
    }
}

impl From<TypeNode> for Signature {
    fn from(t: TypeNode) -> Self {
        Signature { types: vec![t] }
    }
}

impl<'a> IntoIterator for &'a Signature {
    type Item = &'a TypeNode;
    type IntoIter = std::slice::Iter<'a, TypeNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.types.iter()
    }
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn complete_type(&mut self, arrays: usize, structs: usize) -> Result<TypeNode> {
        let offset = self.pos;
        let c = match self.peek() {
            Some(c) => c,
            None => return Err(Error::MissingArrayElement { offset }),
        };
        self.pos += c.len_utf8();

        match c {
            'a' => {
                if arrays + 1 > MAX_ARRAY_DEPTH {
                    return Err(Error::TooDeep { offset });
                }
                match self.peek() {
                    None | Some(')') | Some('}') => {
                        return Err(Error::MissingArrayElement { offset })
                    }
                    _ => {}
                }
                let element = self.complete_type(arrays + 1, structs)?;
                Ok(TypeNode::array(element))
            }
            '(' => {
                if structs + 1 > MAX_STRUCT_DEPTH {
                    return Err(Error::TooDeep { offset });
                }
                let mut fields = Vec::new();
                loop {
                    match self.peek() {
                        None => return Err(Error::Unclosed { open: '(', offset }),
                        Some(')') => {
                            self.pos += 1;
                            break;
                        }
                        Some('}') => {
                            return Err(Error::UnexpectedClose {
                                close: '}',
                                offset: self.pos,
                            })
                        }
                        Some(_) => fields.push(self.complete_type(arrays, structs + 1)?),
                    }
                }
                Ok(TypeNode::structure(fields))
            }
            '{' => {
                if structs + 1 > MAX_STRUCT_DEPTH {
                    return Err(Error::TooDeep { offset });
                }
                let mut fields = Vec::with_capacity(2);
                loop {
                    match self.peek() {
                        None => return Err(Error::Unclosed { open: '{', offset }),
                        Some('}') => {
                            self.pos += 1;
                            break;
                        }
                        Some(')') => {
                            return Err(Error::UnexpectedClose {
                                close: ')',
                                offset: self.pos,
                            })
                        }
                        Some(_) if fields.len() == 2 => {
                            return Err(Error::DictEntryArity { offset })
                        }
                        Some(_) => {
                            let field_offset = self.pos;
                            let field = self.complete_type(arrays, structs + 1)?;
                            if fields.is_empty() && !field.code.is_basic() {
                                return Err(Error::ContainerDictKey {
                                    offset: field_offset,
                                });
                            }
                            fields.push(field);
                        }
                    }
                }
                let mut fields = fields.into_iter();
                match (fields.next(), fields.next()) {
                    (Some(key), Some(value)) => Ok(TypeNode {
                        code: TypeCode::DictEntry,
                        children: vec![key, value],
                    }),
                    _ => Err(Error::DictEntryArity { offset }),
                }
            }
            ')' | '}' => Err(Error::UnexpectedClose { close: c, offset }),
            c => TypeCode::from_char(c)
                .map(|code| TypeNode {
                    code,
                    children: Vec::new(),
                })
                .ok_or(Error::UnknownTypeCode { code: c, offset }),
        }
    }
}
