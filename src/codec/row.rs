//! Row Payloads
//!
//! The pipeline treats a payload as an opaque blob keyed by its schema. The
//! renderer that produces it must emit values in header order using this
//! layout (big-endian):
//!
//! | type             | bytes                         |
//! |------------------|-------------------------------|
//! | STRING, ENUM     | `u32` length + UTF-8          |
//! | LONG / DATETIME  | `i64` (DATETIME = epoch ms)   |
//! | INTEGER          | `i32`                         |
//! | SHORT            | `i16`                         |
//! | FLOAT / DOUBLE   | `f32` / `f64`                 |
//! | BOOLEAN          | one byte, 0 or 1              |
//! | LIST             | `u32` count, then elements    |

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use super::schema::Schema;
use super::types::{ColumnType, TypeTag};
use crate::error::{Error, Result};

/// Produces payload bytes for a business object under a fixed schema
pub trait RowRenderer<T>: Send + Sync {
    fn schema(&self) -> &Schema;

    fn render(&self, object: &T) -> Result<Vec<u8>>;
}

/// Decoded column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Long(i64),
    Integer(i32),
    Short(i16),
    Float(f32),
    Double(f64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    List(Vec<Value>),
}

impl Value {
    fn matches(&self, tag: TypeTag) -> bool {
        matches!(
            (self, tag),
            (Value::String(_), TypeTag::String | TypeTag::Enum)
                | (Value::Long(_), TypeTag::Long)
                | (Value::Integer(_), TypeTag::Integer)
                | (Value::Short(_), TypeTag::Short)
                | (Value::Float(_), TypeTag::Float)
                | (Value::Double(_), TypeTag::Double)
                | (Value::Boolean(_), TypeTag::Boolean)
                | (Value::DateTime(_), TypeTag::DateTime)
        )
    }
}

/// Appends rows to a payload buffer
pub struct RowEncoder<'a> {
    schema: &'a Schema,
    buf: BytesMut,
    rows: usize,
}

impl<'a> RowEncoder<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            buf: BytesMut::new(),
            rows: 0,
        }
    }

    /// Encode one row; nothing is appended if any value mismatches its column.
    pub fn push_row(&mut self, values: &[Value]) -> Result<()> {
        if values.len() != self.schema.len() {
            return Err(Error::Row(format!(
                "Row has {} values, schema has {} columns",
                values.len(),
                self.schema.len()
            )));
        }

        let mut row = BytesMut::new();
        for ((name, column_type), value) in self.schema.columns().zip(values) {
            encode_value(&mut row, name, column_type, value)?;
        }

        self.buf.put_slice(&row);
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

fn encode_value(buf: &mut BytesMut, name: &str, column_type: ColumnType, value: &Value) -> Result<()> {
    match (column_type, value) {
        (ColumnType::List(element), Value::List(items)) => {
            buf.put_u32(items.len() as u32);
            for item in items {
                encode_scalar(buf, name, element, item)?;
            }
            Ok(())
        }
        (ColumnType::List(_), other) => Err(Error::Row(format!(
            "Column '{}' is {} but got {:?}",
            name, column_type, other
        ))),
        (ColumnType::Scalar(tag), value) => encode_scalar(buf, name, tag, value),
    }
}

fn encode_scalar(buf: &mut BytesMut, name: &str, tag: TypeTag, value: &Value) -> Result<()> {
    if !value.matches(tag) {
        return Err(Error::Row(format!(
            "Column '{}' is {} but got {:?}",
            name,
            tag.name(),
            value
        )));
    }

    match value {
        Value::String(s) => {
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Value::Long(v) => buf.put_i64(*v),
        Value::Integer(v) => buf.put_i32(*v),
        Value::Short(v) => buf.put_i16(*v),
        Value::Float(v) => buf.put_f32(*v),
        Value::Double(v) => buf.put_f64(*v),
        Value::Boolean(v) => buf.put_u8(u8::from(*v)),
        Value::DateTime(t) => buf.put_i64(t.timestamp_millis()),
        Value::List(_) => {
            return Err(Error::Row(format!("Column '{}' does not accept nested lists", name)))
        }
    }
    Ok(())
}

/// Reads rows back out of a payload
pub struct RowDecoder<'a> {
    schema: &'a Schema,
    bytes: &'a [u8],
}

impl<'a> RowDecoder<'a> {
    pub fn new(schema: &'a Schema, bytes: &'a [u8]) -> Self {
        Self { schema, bytes }
    }

    /// Decode the next row, or `None` at the end of the payload
    pub fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        if !self.bytes.has_remaining() {
            return Ok(None);
        }

        let schema = self.schema;
        if schema.is_empty() {
            return Err(Error::Row(format!(
                "{} bytes left over for a schema with no columns",
                self.bytes.remaining()
            )));
        }

        let mut row = Vec::with_capacity(schema.len());
        for (name, column_type) in schema.columns() {
            let value = match column_type {
                ColumnType::Scalar(tag) => self.decode_scalar(name, tag)?,
                ColumnType::List(element) => {
                    let count = self.take::<4>(name)?;
                    let count = u32::from_be_bytes(count) as usize;
                    let mut items = Vec::with_capacity(count.min(1024));
                    for _ in 0..count {
                        items.push(self.decode_scalar(name, element)?);
                    }
                    Value::List(items)
                }
            };
            row.push(value);
        }
        Ok(Some(row))
    }

    /// Decode every remaining row
    pub fn read_all(mut self) -> Result<Vec<Vec<Value>>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }

    fn take<const N: usize>(&mut self, name: &str) -> Result<[u8; N]> {
        if self.bytes.remaining() < N {
            return Err(Error::Row(format!("Truncated value for column '{}'", name)));
        }
        let mut out = [0u8; N];
        self.bytes.copy_to_slice(&mut out);
        Ok(out)
    }

    fn decode_scalar(&mut self, name: &str, tag: TypeTag) -> Result<Value> {
        let value = match tag {
            TypeTag::String | TypeTag::Enum => {
                let len = u32::from_be_bytes(self.take::<4>(name)?) as usize;
                if self.bytes.remaining() < len {
                    return Err(Error::Row(format!("Truncated string in column '{}'", name)));
                }
                let s = std::str::from_utf8(&self.bytes[..len])
                    .map_err(|e| Error::Row(format!("Column '{}' is not UTF-8: {}", name, e)))?
                    .to_string();
                self.bytes.advance(len);
                Value::String(s)
            }
            TypeTag::Long => Value::Long(i64::from_be_bytes(self.take(name)?)),
            TypeTag::Integer => Value::Integer(i32::from_be_bytes(self.take(name)?)),
            TypeTag::Short => Value::Short(i16::from_be_bytes(self.take(name)?)),
            TypeTag::Float => Value::Float(f32::from_be_bytes(self.take(name)?)),
            TypeTag::Double => Value::Double(f64::from_be_bytes(self.take(name)?)),
            TypeTag::Boolean => match self.take::<1>(name)?[0] {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => {
                    return Err(Error::Row(format!(
                        "Column '{}' has invalid boolean byte {}",
                        name, other
                    )))
                }
            },
            TypeTag::DateTime => {
                let millis = i64::from_be_bytes(self.take(name)?);
                let t = Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
                    Error::Row(format!("Column '{}' has out-of-range datetime {}", name, millis))
                })?;
                Value::DateTime(t)
            }
        };
        Ok(value)
    }
}
