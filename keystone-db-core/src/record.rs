//! Records and store metadata.

use crate::index::IndexMeta;
use crate::tuple::Tuple;
use serde::{Deserialize, Serialize};

/// A stored record: an opaque payload under a primary key, tagged with its
/// record type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Primary key; for a type with a type prefix, the first element is the
    /// type's key
    pub primary_key: Tuple,
    /// Name of the record type
    pub record_type: String,
    /// Opaque payload; the store never interprets it
    pub payload: Vec<u8>,
}

impl Record {
    /// Create a record
    pub fn new(
        primary_key: Tuple,
        record_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Record {
            primary_key,
            record_type: record_type.into(),
            payload: payload.into(),
        }
    }
}

/// Declared record type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTypeMeta {
    /// Type name, unique within the metadata
    pub name: String,
    /// Fixed leading primary-key component, when this type has one. Types
    /// with a prefix can be range-bounded without scanning foreign types.
    pub type_key: Option<i64>,
}

impl RecordTypeMeta {
    /// A type whose primary keys carry no fixed leading component
    pub fn new(name: impl Into<String>) -> Self {
        RecordTypeMeta {
            name: name.into(),
            type_key: None,
        }
    }

    /// A type whose primary keys start with `type_key`
    pub fn with_prefix(name: impl Into<String>, type_key: i64) -> Self {
        RecordTypeMeta {
            name: name.into(),
            type_key: Some(type_key),
        }
    }
}

/// Schema of a record store: its record types and secondary indexes.
///
/// The version is persisted in the store header at creation; opening with
/// metadata at a different version is a [`crate::Error::MetaDataMismatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetaData {
    /// Monotonic schema version
    pub version: u64,
    /// Declared record types
    pub record_types: Vec<RecordTypeMeta>,
    /// Declared secondary indexes
    pub indexes: Vec<IndexMeta>,
}

impl RecordMetaData {
    /// Create metadata at a version
    pub fn new(version: u64) -> Self {
        RecordMetaData {
            version,
            record_types: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Builder-style: add a record type
    pub fn with_record_type(mut self, record_type: RecordTypeMeta) -> Self {
        self.record_types.push(record_type);
        self
    }

    /// Builder-style: add an index
    pub fn with_index(mut self, index: IndexMeta) -> Self {
        self.indexes.push(index);
        self
    }

    /// Look up a record type by name
    pub fn record_type(&self, name: &str) -> Option<&RecordTypeMeta> {
        self.record_types.iter().find(|t| t.name == name)
    }

    /// Look up an index by name
    pub fn index(&self, name: &str) -> Option<&IndexMeta> {
        self.indexes.iter().find(|i| i.name == name)
    }
}
