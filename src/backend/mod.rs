//! The store collaborator: where documents actually live.
//!
//! The session only ever issues identifier-keyed conditional writes through
//! [`DocumentStore`]; the memory and Postgres backends share the field-op
//! semantics in [`ops`].

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::{Result, path::FieldPath};

pub mod memory;
pub mod ops;
pub mod postgres;

pub use memory::{MemoryStore, Operation};
pub use postgres::PostgresStore;

/// A stored document. The identifier lives under `_id`.
pub type Document = JsonMap<String, JsonValue>;

#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Eq(FieldPath, JsonValue),
    /// Path absent or null.
    Missing(FieldPath),
}

/// Conjunction of conditions a document must satisfy to be written.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Predicate {
    conditions: Vec<Condition>,
}

impl Predicate {
    pub fn by_id(id: JsonValue) -> Self {
        Self::default().eq("_id", id)
    }

    pub fn eq(mut self, path: impl Into<FieldPath>, value: JsonValue) -> Self {
        self.conditions.push(Condition::Eq(path.into(), value));
        self
    }

    pub fn missing(mut self, path: impl Into<FieldPath>) -> Self {
        self.conditions.push(Condition::Missing(path.into()));
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq(path, expected) => ops::get_path(document, path) == Some(expected),
            Condition::Missing(path) => ops::get_path(document, path).is_none_or(JsonValue::is_null),
        })
    }
}

/// One field-level modification. Applied in order within a write.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldOp {
    Set(FieldPath, JsonValue),
    Unset(FieldPath),
    /// Append to an array, creating it when absent.
    Push(FieldPath, Vec<JsonValue>),
    /// Remove array positions, all counted against the array before the op.
    PullAt(FieldPath, Vec<usize>),
    /// Remove every element equal to one of the values.
    PullAll(FieldPath, Vec<JsonValue>),
    /// Append values not already present.
    AddToSet(FieldPath, Vec<JsonValue>),
}

impl FieldOp {
    pub fn path(&self) -> &FieldPath {
        match self {
            FieldOp::Set(path, _)
            | FieldOp::Unset(path)
            | FieldOp::Push(path, _)
            | FieldOp::PullAt(path, _)
            | FieldOp::PullAll(path, _)
            | FieldOp::AddToSet(path, _) => path,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Write {
    Fields(Vec<FieldOp>),
    /// Replace the whole document, keeping its `_id`.
    Replace(Document),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert `document`, assigning `_id` when absent. Returns the identifier.
    async fn insert(&self, collection: &str, document: Document) -> Result<JsonValue>;

    /// Apply `write` to every document matching `predicate`; returns the
    /// matched count.
    async fn update(&self, collection: &str, predicate: &Predicate, write: &Write) -> Result<u64>;

    async fn delete(&self, collection: &str, predicate: &Predicate) -> Result<u64>;

    async fn find_one(&self, collection: &str, predicate: &Predicate) -> Result<Option<Document>>;

    async fn find_many(&self, collection: &str, predicate: &Predicate) -> Result<Vec<Document>>;

    /// Next value of a named counter, starting at 1.
    async fn next_sequence(&self, name: &str) -> Result<i64>;
}
