use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::{
    Error, Result,
    metadata::{ClassMetadata, FieldKind},
    value::{Identifier, Value},
};

/// Handle to an object living in a session's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Field values of a loaded object.
#[derive(Clone, Debug)]
pub struct Object {
    pub(crate) class: String,
    pub(crate) fields: BTreeMap<String, Value>,
    pub(crate) collections: BTreeMap<String, PersistentCollection>,
}

impl Object {
    /// Every mapped field present, scalars null and collections empty.
    pub(crate) fn blank(class: &ClassMetadata) -> Self {
        let mut fields = BTreeMap::new();
        let mut collections = BTreeMap::new();
        for field in &class.fields {
            match field.kind {
                FieldKind::EmbedMany(_) | FieldKind::ReferenceMany(_) => {
                    collections.insert(field.name.clone(), PersistentCollection::new());
                }
                _ => {
                    fields.insert(field.name.clone(), Value::Null);
                }
            }
        }
        Self {
            class: class.name.clone(),
            fields,
            collections,
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn field(&self, name: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.fields.get(name).unwrap_or(&NULL)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn collection(&self, name: &str) -> Option<&PersistentCollection> {
        self.collections.get(name)
    }

    pub(crate) fn collection_mut(&mut self, name: &str) -> Option<&mut PersistentCollection> {
        self.collections.get_mut(name)
    }
}

/// An arena slot: either the object itself or a lazy stand-in that only
/// knows the identity it will load.
#[derive(Clone, Debug)]
pub enum ObjectData {
    Loaded(Object),
    Unloaded { class: String, id: Identifier },
}

impl ObjectData {
    pub fn class(&self) -> &str {
        match self {
            ObjectData::Loaded(object) => &object.class,
            ObjectData::Unloaded { class, .. } => class,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, ObjectData::Loaded(_))
    }

    pub fn as_loaded(&self) -> Option<&Object> {
        match self {
            ObjectData::Loaded(object) => Some(object),
            ObjectData::Unloaded { .. } => None,
        }
    }
}

/// Owns every object a session has created or loaded. Slots are never
/// reused, so a handle stays valid for the session's lifetime.
#[derive(Debug, Default)]
pub struct Arena {
    next: u64,
    slots: HashMap<ObjectId, ObjectData>,
}

impl Arena {
    pub(crate) fn allocate(&mut self, data: ObjectData) -> ObjectId {
        self.next += 1;
        let id = ObjectId(self.next);
        self.slots.insert(id, data);
        id
    }

    pub fn get(&self, id: ObjectId) -> Option<&ObjectData> {
        self.slots.get(&id)
    }

    pub(crate) fn replace(&mut self, id: ObjectId, data: ObjectData) {
        self.slots.insert(id, data);
    }

    pub fn slot(&self, id: ObjectId) -> Result<&ObjectData> {
        self.slots
            .get(&id)
            .ok_or_else(|| Error::Mapping(format!("object {id} does not belong to this session")))
    }

    pub fn loaded(&self, id: ObjectId) -> Result<&Object> {
        match self.slot(id)? {
            ObjectData::Loaded(object) => Ok(object),
            ObjectData::Unloaded { class, id } => Err(Error::NotLoaded {
                class: class.clone(),
                id: id.to_string(),
            }),
        }
    }

    pub(crate) fn loaded_mut(&mut self, id: ObjectId) -> Result<&mut Object> {
        let slot = self
            .slots
            .get_mut(&id)
            .ok_or_else(|| Error::Mapping(format!("object {id} does not belong to this session")))?;
        match slot {
            ObjectData::Loaded(object) => Ok(object),
            ObjectData::Unloaded { class, id } => Err(Error::NotLoaded {
                class: class.clone(),
                id: id.to_string(),
            }),
        }
    }

    pub fn class_of(&self, id: ObjectId) -> Result<&str> {
        Ok(self.slot(id)?.class())
    }
}

/// Element list of a many-association together with the baseline it was
/// last persisted as.
///
/// Diffs compare elements by handle and count duplicates, so pushing the
/// same element twice yields two insertions.
#[derive(Clone, Debug, Default)]
pub struct PersistentCollection {
    elements: Vec<ObjectId>,
    baseline: Option<Vec<ObjectId>>,
    dirty: bool,
    cleared: bool,
}

impl PersistentCollection {
    /// A collection that has never been written.
    pub fn new() -> Self {
        Self::default()
    }

    /// A collection hydrated from the store; its baseline is the loaded list.
    pub fn loaded(elements: Vec<ObjectId>) -> Self {
        Self {
            baseline: Some(elements.clone()),
            elements,
            dirty: false,
            cleared: false,
        }
    }

    pub fn elements(&self) -> &[ObjectId] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn contains(&self, element: ObjectId) -> bool {
        self.elements.contains(&element)
    }

    pub fn baseline(&self) -> Option<&[ObjectId]> {
        self.baseline.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    pub fn is_new(&self) -> bool {
        self.baseline.is_none()
    }

    pub(crate) fn push(&mut self, element: ObjectId) {
        self.elements.push(element);
        self.dirty = true;
    }

    pub(crate) fn insert(&mut self, index: usize, element: ObjectId) {
        let index = index.min(self.elements.len());
        self.elements.insert(index, element);
        self.dirty = true;
    }

    pub(crate) fn remove(&mut self, element: ObjectId) -> bool {
        match self.elements.iter().position(|e| *e == element) {
            Some(index) => {
                self.elements.remove(index);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> Option<ObjectId> {
        if index >= self.elements.len() {
            return None;
        }
        self.dirty = true;
        Some(self.elements.remove(index))
    }

    pub(crate) fn clear(&mut self) {
        self.elements.clear();
        self.dirty = true;
        if self.baseline.as_ref().is_some_and(|b| !b.is_empty()) {
            self.cleared = true;
        }
    }

    /// Swap in a new element list, keeping the baseline for diffing.
    pub(crate) fn replace(&mut self, elements: Vec<ObjectId>) {
        if elements != self.elements {
            self.elements = elements;
            self.dirty = true;
        }
    }

    /// Treat the collection as never written, so the next write sets it
    /// whole.
    pub(crate) fn reset_baseline(&mut self) {
        self.baseline = None;
        self.cleared = false;
    }

    /// Elements added since the baseline, in current order.
    pub fn insert_diff(&self) -> Vec<ObjectId> {
        let Some(baseline) = &self.baseline else {
            return self.elements.clone();
        };
        let mut remaining = counts(baseline);
        let mut inserted = Vec::new();
        for element in &self.elements {
            match remaining.get_mut(element) {
                Some(count) if *count > 0 => *count -= 1,
                _ => inserted.push(*element),
            }
        }
        inserted
    }

    /// Baseline elements no longer present, with their baseline position.
    pub fn delete_diff(&self) -> Vec<(usize, ObjectId)> {
        let Some(baseline) = &self.baseline else {
            return Vec::new();
        };
        let mut remaining = counts(&self.elements);
        let mut deleted = Vec::new();
        for (index, element) in baseline.iter().enumerate() {
            match remaining.get_mut(element) {
                Some(count) if *count > 0 => *count -= 1,
                _ => deleted.push((index, *element)),
            }
        }
        deleted
    }

    /// Elements present both now and in the baseline, paired with their
    /// baseline position.
    pub fn retained(&self) -> Vec<(usize, ObjectId)> {
        let Some(baseline) = &self.baseline else {
            return Vec::new();
        };
        let mut remaining = counts(&self.elements);
        let mut kept = Vec::new();
        for (index, element) in baseline.iter().enumerate() {
            if let Some(count) = remaining.get_mut(element) {
                if *count > 0 {
                    *count -= 1;
                    kept.push((index, *element));
                }
            }
        }
        kept
    }

    /// Whether the elements differ from the baseline at all, by handle.
    pub fn has_changes(&self) -> bool {
        match &self.baseline {
            None => true,
            Some(baseline) => *baseline != self.elements,
        }
    }

    /// Adopt the current elements as the persisted baseline.
    pub(crate) fn take_snapshot(&mut self) {
        self.baseline = Some(self.elements.clone());
        self.dirty = false;
        self.cleared = false;
    }
}

fn counts(elements: &[ObjectId]) -> HashMap<ObjectId, usize> {
    let mut counts = HashMap::new();
    for element in elements {
        *counts.entry(*element).or_insert(0) += 1;
    }
    counts
}
