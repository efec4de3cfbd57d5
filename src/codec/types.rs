//! Column Type Tags
//!
//! Scalar tags occupy one byte on the wire. A repeated column is written as
//! the two bytes `{LIST, element}`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const TAG_STRING: u8 = 1;
const TAG_LONG: u8 = 2;
const TAG_INTEGER: u8 = 3;
const TAG_SHORT: u8 = 4;
const TAG_FLOAT: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_BOOLEAN: u8 = 7;
const TAG_DATETIME: u8 = 8;
const TAG_LIST: u8 = 10;

/// Scalar column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    String,
    Long,
    Integer,
    Short,
    Float,
    Double,
    Boolean,
    DateTime,
    /// Written exactly like `String`
    Enum,
}

impl TypeTag {
    /// Byte written for this tag. `Enum` shares `String`'s byte.
    pub fn wire_byte(self) -> u8 {
        match self {
            TypeTag::String | TypeTag::Enum => TAG_STRING,
            TypeTag::Long => TAG_LONG,
            TypeTag::Integer => TAG_INTEGER,
            TypeTag::Short => TAG_SHORT,
            TypeTag::Float => TAG_FLOAT,
            TypeTag::Double => TAG_DOUBLE,
            TypeTag::Boolean => TAG_BOOLEAN,
            TypeTag::DateTime => TAG_DATETIME,
        }
    }

    /// Parse a scalar tag byte
    pub fn from_wire_byte(byte: u8) -> Result<Self> {
        match byte {
            TAG_STRING => Ok(TypeTag::String),
            TAG_LONG => Ok(TypeTag::Long),
            TAG_INTEGER => Ok(TypeTag::Integer),
            TAG_SHORT => Ok(TypeTag::Short),
            TAG_FLOAT => Ok(TypeTag::Float),
            TAG_DOUBLE => Ok(TypeTag::Double),
            TAG_BOOLEAN => Ok(TypeTag::Boolean),
            TAG_DATETIME => Ok(TypeTag::DateTime),
            TAG_LIST => Err(Error::Schema("LIST is not a scalar type tag".into())),
            other => Err(Error::Schema(format!("Unknown type tag {}", other))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeTag::String => "STRING",
            TypeTag::Long => "LONG",
            TypeTag::Integer => "INTEGER",
            TypeTag::Short => "SHORT",
            TypeTag::Float => "FLOAT",
            TypeTag::Double => "DOUBLE",
            TypeTag::Boolean => "BOOLEAN",
            TypeTag::DateTime => "DATETIME",
            TypeTag::Enum => "ENUM",
        }
    }
}

/// Type of one column: a single scalar or zero or more repeated scalars
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Scalar(TypeTag),
    List(TypeTag),
}

impl ColumnType {
    /// Tag of the individual values in this column
    pub fn element(&self) -> TypeTag {
        match self {
            ColumnType::Scalar(tag) | ColumnType::List(tag) => *tag,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, ColumnType::List(_))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ColumnType::Scalar(tag) => vec![tag.wire_byte()],
            ColumnType::List(tag) => vec![TAG_LIST, tag.wire_byte()],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [TAG_LIST, element] => Ok(ColumnType::List(TypeTag::from_wire_byte(*element)?)),
            [tag] => Ok(ColumnType::Scalar(TypeTag::from_wire_byte(*tag)?)),
            _ => Err(Error::Schema(format!(
                "Invalid column type encoding {:?}",
                bytes
            ))),
        }
    }
}

impl From<TypeTag> for ColumnType {
    fn from(tag: TypeTag) -> Self {
        ColumnType::Scalar(tag)
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::Scalar(tag) => write!(f, "{}", tag.name()),
            ColumnType::List(tag) => write!(f, "LIST<{}>", tag.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_is_written_as_string() {
        assert_eq!(
            ColumnType::Scalar(TypeTag::Enum).to_bytes(),
            ColumnType::Scalar(TypeTag::String).to_bytes()
        );
        assert_eq!(
            ColumnType::from_bytes(&[TAG_STRING]).unwrap(),
            ColumnType::Scalar(TypeTag::String)
        );
    }

    #[test]
    fn test_list_tag() {
        let list = ColumnType::List(TypeTag::Long);
        assert_eq!(list.to_bytes(), vec![TAG_LIST, TAG_LONG]);
        assert_eq!(ColumnType::from_bytes(&list.to_bytes()).unwrap(), list);
        assert_eq!(list.to_string(), "LIST<LONG>");
    }

    #[test]
    fn test_invalid_encodings() {
        assert!(ColumnType::from_bytes(&[]).is_err());
        assert!(ColumnType::from_bytes(&[TAG_LIST]).is_err());
        assert!(ColumnType::from_bytes(&[TAG_LIST, TAG_LIST]).is_err());
        assert!(ColumnType::from_bytes(&[99]).is_err());
        assert!(ColumnType::from_bytes(&[TAG_LONG, TAG_LONG, TAG_LONG]).is_err());
    }
}
