use std::fmt;

use crate::{Signature, TypeCode, TypeNode};

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TypeCode::Byte => "BYTE",
            TypeCode::Boolean => "BOOLEAN",
            TypeCode::Int16 => "INT16",
            TypeCode::Uint16 => "UINT16",
            TypeCode::Int32 => "INT32",
            TypeCode::Uint32 => "UINT32",
            TypeCode::Int64 => "INT64",
            TypeCode::Uint64 => "UINT64",
            TypeCode::Double => "DOUBLE",
            TypeCode::String => "STRING",
            TypeCode::ObjectPath => "OBJECT_PATH",
            TypeCode::Signature => "SIGNATURE",
            TypeCode::Array => "ARRAY",
            TypeCode::Struct => "STRUCT",
            TypeCode::DictEntry => "DICT_ENTRY",
            TypeCode::Variant => "VARIANT",
        };
        f.write_str(name)
    }
}

impl fmt::Display for TypeNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use fmt::Write;

        f.write_char(self.code().as_char())?;
        for child in self.children() {
            fmt::Display::fmt(child, f)?;
        }
        match self.code() {
            TypeCode::Struct => f.write_char(')'),
            TypeCode::DictEntry => f.write_char('}'),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for t in self.types() {
            fmt::Display::fmt(t, f)?;
        }
        Ok(())
    }
}
