//! Header Metadata
//!
//! A schema is the ordered list of `(name, type)` pairs for one stream.
//! Encoded form (big-endian):
//!
//! ```text
//! [count: u16] then per column [name_len: u16][name: utf8][type_len: u8][type bytes]
//! ```

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::types::ColumnType;
use crate::error::{Error, Result};

/// Ordered column names and their types
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    headers: Vec<String>,
    column_types: Vec<ColumnType>,
}

impl Schema {
    /// Build a schema; one type per header is required.
    pub fn new(headers: Vec<String>, column_types: Vec<ColumnType>) -> Result<Self> {
        if headers.len() != column_types.len() {
            return Err(Error::Schema(format!(
                "{} headers but {} column types",
                headers.len(),
                column_types.len()
            )));
        }
        if headers.len() > u16::MAX as usize {
            return Err(Error::Schema(format!("Too many columns: {}", headers.len())));
        }
        Ok(Self {
            headers,
            column_types,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn column_types(&self) -> &[ColumnType] {
        &self.column_types
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Iterate `(name, type)` pairs in header order
    pub fn columns(&self) -> impl Iterator<Item = (&str, ColumnType)> {
        self.headers
            .iter()
            .map(String::as_str)
            .zip(self.column_types.iter().copied())
    }

    /// Column types as raw wire bytes
    pub fn column_type_bytes(&self) -> Vec<Vec<u8>> {
        self.column_types.iter().map(ColumnType::to_bytes).collect()
    }

    /// Build a schema from raw wire type bytes
    pub fn from_type_bytes(headers: Vec<String>, column_types: &[Vec<u8>]) -> Result<Self> {
        let types = column_types
            .iter()
            .map(|b| ColumnType::from_bytes(b))
            .collect::<Result<Vec<_>>>()?;
        Self::new(headers, types)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(2 + self.headers.len() * 16);
        buf.put_u16(self.headers.len() as u16);

        for (name, column_type) in self.columns() {
            if name.len() > u16::MAX as usize {
                return Err(Error::Schema(format!("Header name too long: {}", name.len())));
            }
            buf.put_u16(name.len() as u16);
            buf.put_slice(name.as_bytes());

            let type_bytes = column_type.to_bytes();
            buf.put_u8(type_bytes.len() as u8);
            buf.put_slice(&type_bytes);
        }

        Ok(buf.to_vec())
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        let truncated = || Error::Schema("Truncated schema header".into());

        if bytes.remaining() < 2 {
            return Err(truncated());
        }
        let count = bytes.get_u16() as usize;

        let mut headers = Vec::with_capacity(count);
        let mut column_types = Vec::with_capacity(count);

        for _ in 0..count {
            if bytes.remaining() < 2 {
                return Err(truncated());
            }
            let name_len = bytes.get_u16() as usize;
            if bytes.remaining() < name_len + 1 {
                return Err(truncated());
            }
            let name = std::str::from_utf8(&bytes[..name_len])
                .map_err(|e| Error::Schema(format!("Header name is not UTF-8: {}", e)))?
                .to_string();
            bytes.advance(name_len);

            let type_len = bytes.get_u8() as usize;
            if bytes.remaining() < type_len {
                return Err(truncated());
            }
            column_types.push(ColumnType::from_bytes(&bytes[..type_len])?);
            bytes.advance(type_len);

            headers.push(name);
        }

        if bytes.has_remaining() {
            return Err(Error::Schema(format!(
                "{} trailing bytes after schema header",
                bytes.remaining()
            )));
        }

        Self::new(headers, column_types)
    }
}
