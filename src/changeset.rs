//! Field-level diffs between an object and its last persisted snapshot.

use std::collections::HashSet;

use crate::{
    Error, Result,
    graph::Graph,
    hydrator::{Hydrator, Source},
    identity::{ObjectState, ObjectTracker, ParentAssociation, Snapshot},
    metadata::{FieldKind, FieldMapping, MetadataRegistry},
    object::{Arena, ObjectData, ObjectId},
    value::{Identifier, NULL, Value},
};

/// Change of one field.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldChange {
    /// The value was replaced. For embed-one fields this means a different
    /// embedded object with different content.
    Value { old: Value, new: Value },
    /// Same embedded object, changed inside.
    Nested(ChangeSet),
    Collection(CollectionChange),
}

/// Diff of one many-association against its baseline.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollectionChange {
    pub inserted: Vec<ObjectId>,
    /// Removed elements with their baseline position.
    pub deleted: Vec<(usize, ObjectId)>,
    pub cleared: bool,
    /// The collection has never been persisted.
    pub new_collection: bool,
    /// Retained embedded elements that changed inside, with their baseline
    /// position.
    pub dirty_elements: Vec<(usize, ChangeSet)>,
}

impl CollectionChange {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.deleted.is_empty()
            && !self.cleared
            && !self.new_collection
            && self.dirty_elements.is_empty()
    }
}

/// Changed fields of one object, in field declaration order.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeSet {
    object: ObjectId,
    changes: Vec<(String, FieldChange)>,
}

impl ChangeSet {
    pub(crate) fn new(object: ObjectId) -> Self {
        Self {
            object,
            changes: Vec::new(),
        }
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.changes.iter().find(|(name, _)| name == field).map(|(_, c)| c)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|(name, _)| name.as_str())
    }

    pub fn changes(&self) -> &[(String, FieldChange)] {
        &self.changes
    }

    fn push(&mut self, field: &str, change: FieldChange) {
        self.changes.push((field.to_owned(), change));
    }
}

pub(crate) struct ChangeSetComputer<'a> {
    graph: Graph<'a>,
}

impl<'a> ChangeSetComputer<'a> {
    pub fn new(graph: Graph<'a>) -> Self {
        Self { graph }
    }

    /// Diff a top-level object, rejecting identifier reassignment.
    pub fn compute(&self, object: ObjectId) -> Result<ChangeSet> {
        let class = self.graph.class(object)?;
        if let (Some(field), Some(tracked)) = (class.identifier_field(), self.graph.tracker.identifier(object)) {
            let current = self.graph.loaded(object)?.field(field);
            if Identifier::from_value(current).as_ref() != Some(tracked) {
                return Err(Error::IdentifierReassignment {
                    class: class.name.clone(),
                    id: tracked.to_string(),
                });
            }
        }
        self.diff(object)
    }

    fn diff(&self, object: ObjectId) -> Result<ChangeSet> {
        let class = self.graph.class(object)?;
        let loaded = self.graph.loaded(object)?;
        let snapshot = self.graph.tracker.entry(object).and_then(|e| e.snapshot());
        let mut change_set = ChangeSet::new(object);

        for field in &class.fields {
            if Some(field.name.as_str()) == class.identifier_field()
                || Some(&field.name) == class.version_field.as_ref()
            {
                continue;
            }
            if field.kind.is_collection() {
                if let Some(change) = self.collection_change(object, field)? {
                    change_set.push(&field.name, FieldChange::Collection(change));
                }
                continue;
            }

            let new = loaded.field(&field.name);
            let old = snapshot.map(|s| s.get(&field.name)).unwrap_or(&NULL);
            match (&field.kind, old, new) {
                (FieldKind::EmbedOne(_), Value::Embedded(before), Value::Embedded(after)) => {
                    if before == after {
                        let nested = self.diff(*after)?;
                        if !nested.is_empty() {
                            change_set.push(&field.name, FieldChange::Nested(nested));
                        }
                    } else if !self.same_content(*before, *after)? {
                        change_set.push(
                            &field.name,
                            FieldChange::Value {
                                old: old.clone(),
                                new: new.clone(),
                            },
                        );
                    }
                }
                _ if old != new => change_set.push(
                    &field.name,
                    FieldChange::Value {
                        old: old.clone(),
                        new: new.clone(),
                    },
                ),
                _ => {}
            }
        }
        Ok(change_set)
    }

    fn same_content(&self, before: ObjectId, after: ObjectId) -> Result<bool> {
        let old = Hydrator::embedded_document(self.graph, before, Source::Snapshot)?;
        let new = Hydrator::embedded_document(self.graph, after, Source::Current)?;
        Ok(old == new)
    }

    fn collection_change(&self, object: ObjectId, field: &FieldMapping) -> Result<Option<CollectionChange>> {
        let loaded = self.graph.loaded(object)?;
        let Some(collection) = loaded.collection(&field.name) else {
            return Ok(None);
        };

        if collection.is_new() {
            if collection.is_empty() {
                return Ok(None);
            }
            return Ok(Some(CollectionChange {
                inserted: collection.elements().to_vec(),
                new_collection: true,
                ..Default::default()
            }));
        }

        let embedded = matches!(field.kind, FieldKind::EmbedMany(_));
        if embedded && !collection.is_cleared() {
            let old = Hydrator::field_json(self.graph, object, field, Source::Snapshot)?;
            let new = Hydrator::field_json(self.graph, object, field, Source::Current)?;
            if old == new {
                return Ok(None);
            }
        }

        let mut change = CollectionChange {
            inserted: collection.insert_diff(),
            deleted: collection.delete_diff(),
            cleared: collection.is_cleared(),
            ..Default::default()
        };
        if embedded {
            for (position, element) in collection.retained() {
                let nested = self.diff(element)?;
                if !nested.is_empty() {
                    change.dirty_elements.push((position, nested));
                }
            }
        }
        if change.is_empty() && collection.has_changes() {
            // Same elements, new order.
            change.inserted = collection.elements().to_vec();
            change.deleted = collection
                .baseline()
                .unwrap_or_default()
                .iter()
                .copied()
                .enumerate()
                .collect();
        }
        Ok((!change.is_empty()).then_some(change))
    }
}

/// Adopt the current state of `root` and its embedded tree as persisted:
/// snapshots are overwritten, collection diffs cleared, parent positions
/// refreshed, and embedded objects no longer reachable forgotten.
pub(crate) fn snapshot_tree(
    metadata: &MetadataRegistry,
    objects: &mut Arena,
    tracker: &mut ObjectTracker,
    root: ObjectId,
) -> Result<()> {
    let before = embedded_descendants(metadata, objects, tracker, root, Source::Snapshot)?;

    let mut reachable = HashSet::new();
    let mut stack = vec![root];
    while let Some(object) = stack.pop() {
        let Some(ObjectData::Loaded(loaded)) = objects.get(object) else {
            continue;
        };
        let class = metadata.get(&loaded.class)?;
        tracker.set_snapshot(object, Snapshot::new(loaded.fields.clone()));
        if let Some(entry) = tracker.entry_mut(object) {
            if entry.state == ObjectState::New {
                entry.state = ObjectState::Managed;
            }
        }
        for field in &class.fields {
            let children: Vec<(ObjectId, Option<usize>)> = match &field.kind {
                FieldKind::EmbedOne(_) => loaded
                    .field(&field.name)
                    .as_embedded()
                    .map(|child| vec![(child, None)])
                    .unwrap_or_default(),
                FieldKind::EmbedMany(_) => loaded
                    .collection(&field.name)
                    .map(|c| c.elements().iter().enumerate().map(|(i, e)| (*e, Some(i))).collect())
                    .unwrap_or_default(),
                _ => continue,
            };
            for (child, position) in children {
                tracker.set_parent(
                    child,
                    ParentAssociation {
                        owner: object,
                        field: field.name.clone(),
                        position,
                    },
                );
                reachable.insert(child);
                stack.push(child);
            }
        }
        for collection in objects.loaded_mut(object)?.collections.values_mut() {
            collection.take_snapshot();
        }
    }

    for stale in before.difference(&reachable) {
        tracker.forget(*stale);
    }
    Ok(())
}

/// Embedded objects below `root` as seen through either its current values
/// or its snapshots.
pub(crate) fn embedded_descendants(
    metadata: &MetadataRegistry,
    objects: &Arena,
    tracker: &ObjectTracker,
    root: ObjectId,
    source: Source,
) -> Result<HashSet<ObjectId>> {
    let mut found = HashSet::new();
    let mut stack = vec![root];
    while let Some(object) = stack.pop() {
        let Some(ObjectData::Loaded(loaded)) = objects.get(object) else {
            continue;
        };
        let class = metadata.get(&loaded.class)?;
        let snapshot = match source {
            Source::Snapshot => tracker.entry(object).and_then(|e| e.snapshot()),
            Source::Current => None,
        };
        for field in &class.fields {
            match &field.kind {
                FieldKind::EmbedOne(_) => {
                    let value = match snapshot {
                        Some(snapshot) => snapshot.get(&field.name),
                        None if source == Source::Snapshot => continue,
                        None => loaded.field(&field.name),
                    };
                    if let Value::Embedded(child) = value {
                        if found.insert(*child) {
                            stack.push(*child);
                        }
                    }
                }
                FieldKind::EmbedMany(_) => {
                    let Some(collection) = loaded.collection(&field.name) else {
                        continue;
                    };
                    let elements = match source {
                        Source::Snapshot => collection.baseline().unwrap_or_default(),
                        Source::Current => collection.elements(),
                    };
                    for child in elements {
                        if found.insert(*child) {
                            stack.push(*child);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    Ok(found)
}
