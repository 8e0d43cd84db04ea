use serde_json::Value as JsonValue;

use crate::{
    Error, Result,
    backend::{FieldOp, Predicate, Write},
    changeset::ChangeSet,
    graph::Graph,
    hydrator::{Hydrator, InsertDocument, Source, scalar_to_json},
    identity::LockMode,
    metadata::ClassMetadata,
    object::ObjectId,
    path::FieldPath,
    value::{NULL, Value},
};

use super::change_ops;

/// A conditional update ready to be issued.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedUpdate {
    pub predicate: Predicate,
    pub write: Write,
    /// Version the document carries once the update lands.
    pub new_version: Option<i64>,
    /// Version the predicate expects.
    pub expected_version: Option<i64>,
}

/// Per-object write construction for top-level documents.
pub struct DocumentPersister<'a> {
    graph: Graph<'a>,
}

impl<'a> DocumentPersister<'a> {
    pub(crate) fn new(graph: Graph<'a>) -> Self {
        Self { graph }
    }

    pub(crate) fn insert_document(&self, object: ObjectId) -> Result<InsertDocument> {
        Hydrator::insert_document(self.graph, object)
    }

    /// Reject a change set that touches the shard key.
    pub fn check_shard_key(&self, change_set: &ChangeSet) -> Result<()> {
        let object = change_set.object();
        let class = self.graph.class(object)?;
        for key in &class.shard_key {
            if change_set.contains(key) {
                return Err(Error::ShardKeyImmutable {
                    class: class.name.clone(),
                    id: self.id_string(object),
                    field: key.clone(),
                });
            }
        }
        Ok(())
    }

    /// The update for `change_set`, or `None` when nothing is written.
    pub(crate) fn update(&self, change_set: &ChangeSet) -> Result<Option<PreparedUpdate>> {
        let object = change_set.object();
        let class = self.graph.class(object)?;
        if self.graph.tracker.entry(object).is_some_and(|e| e.is_read_only()) {
            return Ok(None);
        }
        self.check_shard_key(change_set)?;
        if change_set.is_empty() {
            return Ok(None);
        }

        let mut ops = Vec::new();
        let atomic = change_ops(self.graph, change_set, &FieldPath::default(), &mut ops)?;

        let mut predicate = self.identity_predicate(object)?;
        let mut expected_version = None;
        let mut new_version = None;
        let mut version_path = None;
        if let Some(version_field) = &class.version_field {
            let stored = class.require_field(version_field)?.stored_name.clone();
            let current = self.snapshot_value(object, version_field).as_i64();
            predicate = match current {
                Some(v) => predicate.eq(stored.as_str(), JsonValue::from(v)),
                None => predicate.missing(stored.as_str()),
            };
            expected_version = current;
            new_version = Some(current.unwrap_or(0) + 1);
            version_path = Some(stored);
        }
        predicate = self.with_lock_condition(predicate, object, class);

        let write = if atomic {
            let mut document = Hydrator::document(self.graph, object, Source::Current)?;
            document.remove("_id");
            if let (Some(path), Some(version)) = (&version_path, new_version) {
                document.insert(path.clone(), JsonValue::from(version));
            }
            if let (Some(lock), Some(mode)) = (&class.lock_field, self.held_lock(object)) {
                document.insert(lock.clone(), JsonValue::from(mode.marker()));
            }
            Write::Replace(document)
        } else {
            if let (Some(path), Some(version)) = (version_path, new_version) {
                ops.push(FieldOp::Set(path.into(), JsonValue::from(version)));
            }
            Write::Fields(ops)
        };

        Ok(Some(PreparedUpdate {
            predicate,
            write,
            new_version,
            expected_version,
        }))
    }

    /// Fill in reference fields that could not be rendered at insert time.
    pub(crate) fn deferred_update(&self, object: ObjectId, fields: &[String]) -> Result<(Predicate, Write)> {
        let class = self.graph.class(object)?;
        let mut ops = Vec::new();
        for name in fields {
            let field = class.require_field(name)?;
            let json = match Hydrator::field_json(self.graph, object, field, Source::Current)? {
                crate::hydrator::FieldJson::Value(json) => json,
                _ => {
                    return Err(Error::Mapping(format!(
                        "`{}.{name}` still references an object without an identifier",
                        class.name
                    )));
                }
            };
            ops.push(FieldOp::Set(FieldPath::root(field.stored_name.clone()), json));
        }
        Ok((self.identity_predicate(object)?, Write::Fields(ops)))
    }

    pub fn delete_predicate(&self, object: ObjectId) -> Result<Predicate> {
        let class = self.graph.class(object)?;
        let predicate = self.identity_predicate(object)?;
        Ok(self.with_lock_condition(predicate, object, class))
    }

    /// Identifier plus the shard key values last persisted.
    pub fn identity_predicate(&self, object: ObjectId) -> Result<Predicate> {
        let class = self.graph.class(object)?;
        let id = self
            .graph
            .identifier(object)
            .ok_or_else(|| Error::MissingIdentifier {
                class: class.name.clone(),
            })?;
        let mut predicate = Predicate::by_id(id.to_json());
        for key in &class.shard_key {
            let field = class.require_field(key)?;
            let value = self.snapshot_value(object, key);
            predicate = match value {
                Value::Null => predicate.missing(field.stored_name.as_str()),
                other => predicate.eq(field.stored_name.as_str(), scalar_to_json(key, other)?),
            };
        }
        Ok(predicate)
    }

    fn with_lock_condition(&self, predicate: Predicate, object: ObjectId, class: &ClassMetadata) -> Predicate {
        let Some(lock) = &class.lock_field else {
            return predicate;
        };
        match self.held_lock(object) {
            Some(mode) => predicate.eq(lock.as_str(), JsonValue::from(mode.marker())),
            None => predicate.missing(lock.as_str()),
        }
    }

    /// Pessimistic lock this session holds on `object`.
    fn held_lock(&self, object: ObjectId) -> Option<LockMode> {
        self.graph
            .tracker
            .entry(object)
            .and_then(|e| e.lock())
            .filter(|mode| *mode != LockMode::Optimistic)
    }

    fn snapshot_value(&self, object: ObjectId, field: &str) -> &'a Value {
        match self.graph.tracker.entry(object).and_then(|e| e.snapshot()) {
            Some(snapshot) => snapshot.get(field),
            None => self
                .graph
                .objects
                .loaded(object)
                .map(|o| o.field(field))
                .unwrap_or(&NULL),
        }
    }

    fn id_string(&self, object: ObjectId) -> String {
        self.graph
            .identifier(object)
            .map(|id| id.to_string())
            .unwrap_or_default()
    }
}
