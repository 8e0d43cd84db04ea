//! Identity map and per-object lifecycle tracking.

use std::collections::{BTreeMap, HashMap};

use crate::{
    Error, Result,
    metadata::ClassMetadata,
    object::ObjectId,
    value::{Identifier, Value},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectState {
    /// Persisted by the caller, identifier not yet known.
    New,
    Managed,
    /// Scheduled for deletion at the next flush.
    Removed,
    /// No longer diffed or cascaded; can only come back through merge.
    Detached,
}

/// Lock requested through `DocumentSession::lock`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Verify the held version without touching the store.
    Optimistic,
    PessimisticRead,
    PessimisticWrite,
}

impl LockMode {
    /// Value written into the lock field.
    pub fn marker(&self) -> i64 {
        match self {
            LockMode::Optimistic => 1,
            LockMode::PessimisticRead => 2,
            LockMode::PessimisticWrite => 4,
        }
    }
}

/// Where an embedded object lives inside its owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentAssociation {
    pub owner: ObjectId,
    pub field: String,
    /// Index within the owner's collection, for collection elements.
    pub position: Option<usize>,
}

/// Last-known persisted field values of one object.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub(crate) fields: BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }

    pub fn get(&self, field: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.fields.get(field).unwrap_or(&NULL)
    }
}

#[derive(Clone, Debug)]
pub struct TrackedEntry {
    pub(crate) state: ObjectState,
    pub(crate) class: String,
    pub(crate) root: String,
    pub(crate) embedded: bool,
    pub(crate) identifier: Option<Identifier>,
    pub(crate) snapshot: Option<Snapshot>,
    pub(crate) original_discriminator: Option<String>,
    pub(crate) read_only: bool,
    pub(crate) lock: Option<LockMode>,
}

impl TrackedEntry {
    pub fn state(&self) -> ObjectState {
        self.state
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn identifier(&self) -> Option<&Identifier> {
        self.identifier.as_ref()
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn lock(&self) -> Option<LockMode> {
        self.lock
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, ObjectState::New | ObjectState::Managed)
    }
}

/// (root class, identifier) to object. Subclasses share their root's key
/// space so a lookup through the base class finds the same instance.
#[derive(Debug, Default)]
pub struct IdentityMap {
    map: HashMap<(String, Identifier), ObjectId>,
}

impl IdentityMap {
    pub fn resolve(&self, root: &str, id: &Identifier) -> Option<ObjectId> {
        self.map.get(&(root.to_owned(), id.clone())).copied()
    }

    fn insert(&mut self, root: &str, id: Identifier, object: ObjectId) -> Option<ObjectId> {
        self.map.insert((root.to_owned(), id), object)
    }

    fn remove(&mut self, root: &str, id: &Identifier) {
        self.map.remove(&(root.to_owned(), id.clone()));
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ObjectTracker {
    entries: HashMap<ObjectId, TrackedEntry>,
    identity: IdentityMap,
    parents: HashMap<ObjectId, ParentAssociation>,
}

impl ObjectTracker {
    /// Start tracking `object` or move it to `state`.
    pub fn track(
        &mut self,
        object: ObjectId,
        class: &ClassMetadata,
        state: ObjectState,
    ) -> &mut TrackedEntry {
        let entry = self.entries.entry(object).or_insert_with(|| TrackedEntry {
            state,
            class: class.name.clone(),
            root: class.root.clone(),
            embedded: class.embedded,
            identifier: None,
            snapshot: None,
            original_discriminator: class.discriminator_value.clone(),
            read_only: class.read_only,
            lock: None,
        });
        entry.state = state;
        entry
    }

    /// Record the identity of a tracked object. Resolving an identity that
    /// another live object already owns is an error.
    pub fn register_identity(&mut self, object: ObjectId, id: Identifier) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&object)
            .ok_or_else(|| Error::Mapping(format!("object {object} is not tracked")))?;
        if let Some(existing) = self.identity.resolve(&entry.root, &id) {
            if existing != object {
                return Err(Error::IdentityConflict {
                    class: entry.class.clone(),
                    id: id.to_string(),
                });
            }
        }
        entry.identifier = Some(id.clone());
        self.identity.insert(&entry.root, id, object);
        Ok(())
    }

    pub fn resolve(&self, class: &ClassMetadata, id: &Identifier) -> Option<ObjectId> {
        self.identity.resolve(&class.root, id)
    }

    pub fn entry(&self, object: ObjectId) -> Option<&TrackedEntry> {
        self.entries.get(&object)
    }

    pub(crate) fn entry_mut(&mut self, object: ObjectId) -> Option<&mut TrackedEntry> {
        self.entries.get_mut(&object)
    }

    pub fn state(&self, object: ObjectId) -> Option<ObjectState> {
        self.entries.get(&object).map(|e| e.state)
    }

    pub fn is_live(&self, object: ObjectId) -> bool {
        self.entries.get(&object).is_some_and(TrackedEntry::is_live)
    }

    pub fn identifier(&self, object: ObjectId) -> Option<&Identifier> {
        self.entries.get(&object).and_then(|e| e.identifier.as_ref())
    }

    pub fn set_snapshot(&mut self, object: ObjectId, snapshot: Snapshot) {
        if let Some(entry) = self.entries.get_mut(&object) {
            entry.snapshot = Some(snapshot);
        }
    }

    pub fn set_parent(&mut self, child: ObjectId, parent: ParentAssociation) {
        self.parents.insert(child, parent);
    }

    pub fn parent(&self, child: ObjectId) -> Option<&ParentAssociation> {
        self.parents.get(&child)
    }

    /// Drop every trace of `object`.
    pub fn forget(&mut self, object: ObjectId) {
        if let Some(entry) = self.entries.remove(&object) {
            if let Some(id) = &entry.identifier {
                if self.identity.resolve(&entry.root, id) == Some(object) {
                    self.identity.remove(&entry.root, id);
                }
            }
        }
        self.parents.remove(&object);
    }

    /// Keep the entry as DETACHED but stop resolving its identity.
    pub fn detach(&mut self, object: ObjectId) {
        if let Some(entry) = self.entries.get_mut(&object) {
            if let Some(id) = &entry.identifier {
                if self.identity.resolve(&entry.root, id) == Some(object) {
                    self.identity.remove(&entry.root, id);
                }
            }
            entry.state = ObjectState::Detached;
            entry.snapshot = None;
            entry.lock = None;
        }
    }

    /// Detach everything.
    pub fn clear(&mut self) {
        self.identity = IdentityMap::default();
        for entry in self.entries.values_mut() {
            entry.state = ObjectState::Detached;
            entry.snapshot = None;
            entry.lock = None;
        }
    }

    /// Tracked top-level objects in the given states, in handle order.
    pub fn documents_in(&self, states: &[ObjectState]) -> Vec<ObjectId> {
        let mut objects: Vec<ObjectId> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.embedded && states.contains(&e.state))
            .map(|(id, _)| *id)
            .collect();
        objects.sort();
        objects
    }

    /// Every live object, top-level and embedded, in handle order.
    pub fn live_objects(&self) -> Vec<ObjectId> {
        let mut objects: Vec<ObjectId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_live())
            .map(|(id, _)| *id)
            .collect();
        objects.sort();
        objects
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ClassMetadata, IdStrategy};
    use crate::object::{Arena, ObjectData, Object};

    fn user() -> ClassMetadata {
        ClassMetadata::document("User", "users").id("id", IdStrategy::Uuid)
    }

    #[test]
    fn resolve_is_idempotent_and_conflicts_are_rejected() {
        let class = user();
        let mut arena = Arena::default();
        let a = arena.allocate(ObjectData::Loaded(Object::blank(&class)));
        let b = arena.allocate(ObjectData::Loaded(Object::blank(&class)));
        let id = Identifier::Int(1);

        let mut tracker = ObjectTracker::default();
        tracker.track(a, &class, ObjectState::Managed);
        tracker.register_identity(a, id.clone()).unwrap();
        assert_eq!(tracker.resolve(&class, &id), Some(a));
        assert_eq!(tracker.resolve(&class, &id), Some(a));

        tracker.track(b, &class, ObjectState::Managed);
        assert!(matches!(
            tracker.register_identity(b, id.clone()),
            Err(Error::IdentityConflict { .. })
        ));
    }

    #[test]
    fn detach_and_forget_release_the_identity() {
        let class = user();
        let mut arena = Arena::default();
        let a = arena.allocate(ObjectData::Loaded(Object::blank(&class)));
        let id = Identifier::Int(1);
        let mut tracker = ObjectTracker::default();
        tracker.track(a, &class, ObjectState::Managed);
        tracker.register_identity(a, id.clone()).unwrap();

        tracker.detach(a);
        assert_eq!(tracker.state(a), Some(ObjectState::Detached));
        assert_eq!(tracker.resolve(&class, &id), None);

        tracker.forget(a);
        assert!(tracker.entry(a).is_none());
    }
}
