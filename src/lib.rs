// An embeddable key-value store built as a log-structured merge tree.
//
// Writes are appended to a log (`database.log`) and mirrored in memory. Once the
// log grows past a threshold its contents are sorted into an immutable level
// file (`NNNN.level`) and the log is truncated. Once there are too many levels
// they are all merged into one, dropping deleted keys for good.
//
// Reads consult the log's mirror first and then the levels from newest to
// oldest; the first level that knows about a key (either a value or a delete)
// decides the answer.

pub mod config;
pub mod db;
pub mod encoding;
pub mod error;
pub mod level;
pub mod log;

pub use config::Options;
pub use db::{Database, Stats};
pub use encoding::{
    BytesSerializer, FieldReader, FieldSerializer, FieldValue, FieldWriter, Fields, Serializer,
    StringSerializer,
};
pub use error::Error;
pub use level::Level;
pub use crate::log::{Log, LogObserver};

/// Anything the store can hold.
pub trait Value: std::fmt::Debug + Clone + Default + Send + Sync + 'static {}

impl<T> Value for T where T: std::fmt::Debug + Clone + Default + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Write = 0,
    Delete = 1,
}

impl Operation {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Operation::Write),
            1 => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// One record of the log or of a level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry<T> {
    pub key: String,
    pub operation: Operation,
    // Always `None` for deletes. A write whose value serialized to nothing also
    // reads back as `None`.
    pub value: Option<T>,
}

impl<T> LogEntry<T> {
    pub fn write<K: Into<String>>(key: K, value: T) -> Self {
        LogEntry {
            key: key.into(),
            operation: Operation::Write,
            value: Some(value),
        }
    }

    pub fn delete<K: Into<String>>(key: K) -> Self {
        LogEntry {
            key: key.into(),
            operation: Operation::Delete,
            value: None,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }
}

impl<T: Default> LogEntry<T> {
    pub fn into_lookup(self) -> Lookup<T> {
        match self.operation {
            Operation::Write => Lookup::Found(self.value.unwrap_or_default()),
            Operation::Delete => Lookup::Tombstoned,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue<T> {
    pub key: String,
    pub value: T,
}

/// What one generation of the store knows about a key. `Tombstoned` is
/// distinct from `NotFound` so that an older level can't resurrect a deleted
/// value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    NotFound,
    Tombstoned,
    Found(T),
}

impl<T> Lookup<T> {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Lookup::NotFound)
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::NotFound | Lookup::Tombstoned => None,
        }
    }
}
