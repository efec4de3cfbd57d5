//! Log Stream Identity

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::schema::Schema;
use super::types::ColumnType;
use crate::error::Result;

/// Identity of one logical, schema-stable log stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogId {
    file_prefix: String,
    log_type: String,
    client_hostname: String,
    tags: BTreeMap<String, String>,
    schema: Schema,
}

impl LogId {
    pub fn new(
        file_prefix: impl Into<String>,
        log_type: impl Into<String>,
        client_hostname: impl Into<String>,
        tags: BTreeMap<String, String>,
        headers: Vec<String>,
        column_types: Vec<ColumnType>,
    ) -> Result<Self> {
        Ok(Self::with_schema(
            file_prefix,
            log_type,
            client_hostname,
            tags,
            Schema::new(headers, column_types)?,
        ))
    }

    pub fn with_schema(
        file_prefix: impl Into<String>,
        log_type: impl Into<String>,
        client_hostname: impl Into<String>,
        tags: BTreeMap<String, String>,
        schema: Schema,
    ) -> Self {
        Self {
            file_prefix: file_prefix.into(),
            log_type: log_type.into(),
            client_hostname: client_hostname.into(),
            tags,
            schema,
        }
    }

    pub fn file_prefix(&self) -> &str {
        &self.file_prefix
    }

    pub fn log_type(&self) -> &str {
        &self.log_type
    }

    pub fn client_hostname(&self) -> &str {
        &self.client_hostname
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn headers(&self) -> &[String] {
        self.schema.headers()
    }

    pub fn column_types(&self) -> &[ColumnType] {
        self.schema.column_types()
    }

    /// Deterministic hash of `log_type + headers + column types`.
    ///
    /// Every field is length-delimited so that moving bytes between adjacent
    /// headers changes the hash.
    pub fn schema_hash(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        let mut field = |bytes: &[u8]| {
            hasher.update(&(bytes.len() as u32).to_be_bytes());
            hasher.update(bytes);
        };

        field(self.log_type.as_bytes());
        for header in self.schema.headers() {
            field(header.as_bytes());
        }
        for column_type in self.schema.column_types() {
            field(&column_type.to_bytes());
        }

        hasher.finalize()
    }
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}@{} ({:08x})",
            self.file_prefix,
            self.log_type,
            self.client_hostname,
            self.schema_hash()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TypeTag;

    fn id(headers: &[&str], types: Vec<ColumnType>) -> LogId {
        LogId::new(
            "clicks",
            "click",
            "web-1",
            BTreeMap::new(),
            headers.iter().map(|h| h.to_string()).collect(),
            types,
        )
        .unwrap()
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = id(&["user"], vec![TypeTag::String.into()]);
        let b = id(&["user"], vec![TypeTag::String.into()]);
        assert_eq!(a, b);
        assert_eq!(a.schema_hash(), b.schema_hash());
    }

    #[test]
    fn test_hash_follows_schema() {
        let base = id(&["user", "count"], vec![TypeTag::String.into(), TypeTag::Long.into()]);
        let retyped = id(&["user", "count"], vec![TypeTag::String.into(), TypeTag::Integer.into()]);
        let renamed = id(&["user", "total"], vec![TypeTag::String.into(), TypeTag::Long.into()]);
        let shifted = id(&["use", "rcount"], vec![TypeTag::String.into(), TypeTag::Long.into()]);

        assert_ne!(base.schema_hash(), retyped.schema_hash());
        assert_ne!(base.schema_hash(), renamed.schema_hash());
        assert_ne!(base.schema_hash(), shifted.schema_hash());
    }

    #[test]
    fn test_hash_ignores_routing_fields() {
        let a = id(&["user"], vec![TypeTag::String.into()]);
        let mut tags = BTreeMap::new();
        tags.insert("tenant".to_string(), "acme".to_string());
        let b = LogId::with_schema("other", "click", "web-2", tags, a.schema().clone());

        assert_ne!(a, b);
        assert_eq!(a.schema_hash(), b.schema_hash());
    }

    #[test]
    fn test_mismatched_schema_is_rejected() {
        let result = LogId::new(
            "clicks",
            "click",
            "web-1",
            BTreeMap::new(),
            vec!["a".into(), "b".into()],
            vec![TypeTag::String.into()],
        );
        assert!(result.is_err());
    }
}
