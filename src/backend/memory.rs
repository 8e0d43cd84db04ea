use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::{Error, Result};

use super::{Document, DocumentStore, Predicate, Write, ops};

/// A write issued against a [`MemoryStore`], recorded in issue order.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Insert {
        collection: String,
        document: Document,
    },
    Update {
        collection: String,
        predicate: Predicate,
        write: Write,
        matched: u64,
    },
    Delete {
        collection: String,
        predicate: Predicate,
        matched: u64,
    },
}

impl Operation {
    pub fn collection(&self) -> &str {
        match self {
            Operation::Insert { collection, .. }
            | Operation::Update { collection, .. }
            | Operation::Delete { collection, .. } => collection,
        }
    }

    /// Whether the operation changed stored state.
    pub fn applied(&self) -> bool {
        match self {
            Operation::Insert { .. } => true,
            Operation::Update { matched, .. } | Operation::Delete { matched, .. } => *matched > 0,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Operation::Insert { .. })
    }

    pub fn is_update(&self) -> bool {
        matches!(self, Operation::Update { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete { .. })
    }
}

#[derive(Default)]
struct Inner {
    collections: BTreeMap<String, Vec<Document>>,
    sequences: HashMap<String, i64>,
    next_id: u64,
    operations: Vec<Operation>,
}

impl Inner {
    fn assign_id(&mut self) -> JsonValue {
        self.next_id += 1;
        JsonValue::String(format!("{:024x}", self.next_id))
    }
}

/// Process-local store with an operation log, for tests and tools.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes finish before the guard drops, so a poisoned lock still
    /// guards consistent state.
    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every write issued so far, including conditional writes that matched
    /// nothing.
    pub fn operations(&self) -> Vec<Operation> {
        self.state().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.state().operations.clear();
    }

    /// Write a document directly, bypassing the log. Stands in for a
    /// concurrent writer.
    pub fn put_raw(&self, collection: &str, document: Document) {
        let mut inner = self.state();
        let docs = inner.collections.entry(collection.to_owned()).or_default();
        let id = document.get("_id").cloned();
        match docs.iter_mut().find(|d| d.get("_id") == id.as_ref()) {
            Some(existing) => *existing = document,
            None => docs.push(document),
        }
    }

    pub fn get_raw(&self, collection: &str, id: &JsonValue) -> Option<Document> {
        let inner = self.state();
        inner
            .collections
            .get(collection)?
            .iter()
            .find(|d| d.get("_id") == Some(id))
            .cloned()
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        let inner = self.state();
        inner.collections.get(collection).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, collection: &str, mut document: Document) -> Result<JsonValue> {
        let mut inner = self.state();
        let id = match document.get("_id") {
            Some(id) if !id.is_null() => id.clone(),
            _ => inner.assign_id(),
        };
        let docs = inner.collections.entry(collection.to_owned()).or_default();
        if docs.iter().any(|d| d.get("_id") == Some(&id)) {
            return Err(Error::ConstraintViolation {
                constraint: format!("{collection}._id"),
                detail: format!("duplicate identifier {id}"),
            });
        }
        document.insert("_id".into(), id.clone());
        docs.push(document.clone());
        inner.operations.push(Operation::Insert {
            collection: collection.to_owned(),
            document,
        });
        Ok(id)
    }

    async fn update(&self, collection: &str, predicate: &Predicate, write: &Write) -> Result<u64> {
        let mut inner = self.state();
        let mut matched = 0;
        if let Some(docs) = inner.collections.get_mut(collection) {
            for document in docs.iter_mut().filter(|d| predicate.matches(d)) {
                let mut updated = document.clone();
                ops::apply_write(&mut updated, write)?;
                *document = updated;
                matched += 1;
            }
        }
        inner.operations.push(Operation::Update {
            collection: collection.to_owned(),
            predicate: predicate.clone(),
            write: write.clone(),
            matched,
        });
        Ok(matched)
    }

    async fn delete(&self, collection: &str, predicate: &Predicate) -> Result<u64> {
        let mut inner = self.state();
        let mut matched = 0;
        if let Some(docs) = inner.collections.get_mut(collection) {
            let before = docs.len();
            docs.retain(|d| !predicate.matches(d));
            matched = (before - docs.len()) as u64;
        }
        inner.operations.push(Operation::Delete {
            collection: collection.to_owned(),
            predicate: predicate.clone(),
            matched,
        });
        Ok(matched)
    }

    async fn find_one(&self, collection: &str, predicate: &Predicate) -> Result<Option<Document>> {
        let inner = self.state();
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| predicate.matches(d)))
            .cloned())
    }

    async fn find_many(&self, collection: &str, predicate: &Predicate) -> Result<Vec<Document>> {
        let inner = self.state();
        Ok(inner
            .collections
            .get(collection)
            .map(|docs| docs.iter().filter(|d| predicate.matches(d)).cloned().collect())
            .unwrap_or_default())
    }

    async fn next_sequence(&self, name: &str) -> Result<i64> {
        let mut inner = self.state();
        let value = inner.sequences.entry(name.to_owned()).or_insert(0);
        *value += 1;
        Ok(*value)
    }
}
