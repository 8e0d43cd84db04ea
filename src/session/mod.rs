//! The unit of work.
//!
//! A [`DocumentSession`] owns every object it creates or loads in an arena
//! and hands out [`ObjectId`] handles. Field access goes through the
//! session, lifecycle calls only record intent, and [`DocumentSession::flush`]
//! turns the accumulated differences into the smallest set of store writes.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::{
    Error, Result,
    backend::{Document, Predicate},
    changeset::{ChangeSet, ChangeSetComputer, snapshot_tree},
    context::SessionContext,
    graph::Graph,
    hydrator::{FieldJson, Hydrator, Source},
    identity::{IdentityMap, ObjectState, ObjectTracker},
    metadata::{ClassMetadata, CollectionStrategy, FieldKind, FieldType, MetadataRegistry},
    metrics,
    object::{Arena, Object, ObjectData, ObjectId, PersistentCollection},
    value::{Identifier, Value},
};

mod flush;
mod lifecycle;
mod merge;

pub use flush::FlushReport;

pub struct DocumentSession {
    context: SessionContext,
    objects: Arena,
    tracker: ObjectTracker,
    /// Top-level objects awaiting insert, in registration order.
    inserts: Vec<ObjectId>,
    /// Top-level objects awaiting delete, in registration order.
    removals: Vec<ObjectId>,
}

impl DocumentSession {
    pub fn new(context: SessionContext) -> Self {
        Self {
            context,
            objects: Arena::default(),
            tracker: ObjectTracker::default(),
            inserts: Vec::new(),
            removals: Vec::new(),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn metadata(&self) -> &MetadataRegistry {
        &self.context.metadata
    }

    pub(crate) fn graph(&self) -> Graph<'_> {
        Graph {
            metadata: &self.context.metadata,
            objects: &self.objects,
            tracker: &self.tracker,
        }
    }

    pub(crate) fn class(&self, object: ObjectId) -> Result<Arc<ClassMetadata>> {
        let name = self.objects.class_of(object)?;
        Ok(self.context.metadata.get(name)?.clone())
    }

    /// A blank, untracked object of `class`. It becomes part of the unit of
    /// work through [`persist`](Self::persist), or by being embedded in or
    /// cascaded from an object that is.
    pub fn create(&mut self, class: &str) -> Result<ObjectId> {
        let class = self.context.metadata.get(class)?;
        Ok(self.objects.allocate(ObjectData::Loaded(Object::blank(class))))
    }

    /// Loaded state of `object`.
    pub fn object(&self, object: ObjectId) -> Result<&Object> {
        self.objects.loaded(object)
    }

    pub fn class_of(&self, object: ObjectId) -> Result<&str> {
        self.objects.class_of(object)
    }

    pub fn is_loaded(&self, object: ObjectId) -> bool {
        self.graph().is_loaded(object)
    }

    pub fn get(&self, object: ObjectId, field: &str) -> Result<&Value> {
        let class = self.class(object)?;
        let mapping = class.require_field(field)?;
        if mapping.kind.is_collection() {
            return Err(Error::Mapping(format!(
                "`{}.{field}` is a collection; use `elements`",
                class.name
            )));
        }
        Ok(self.objects.loaded(object)?.field(field))
    }

    pub fn set(&mut self, object: ObjectId, field: &str, value: impl Into<Value>) -> Result<()> {
        let class = self.class(object)?;
        let mapping = class.require_field(field)?;
        let value = self.check_value(&class, field, &mapping.kind, value.into())?;
        self.objects
            .loaded_mut(object)?
            .fields
            .insert(field.to_owned(), value);
        Ok(())
    }

    fn check_value(&self, class: &ClassMetadata, field: &str, kind: &FieldKind, value: Value) -> Result<Value> {
        let invalid = |detail: String| Error::InvalidValue {
            field: format!("{}.{field}", class.name),
            detail,
        };
        match (kind, value) {
            (_, Value::Null) => Ok(Value::Null),
            (FieldKind::Scalar(ty), value) => coerce_scalar(*ty, value).map_err(invalid),
            (FieldKind::EmbedOne(a), Value::Embedded(target)) => {
                self.check_target(&a.target, target, true).map_err(invalid)?;
                Ok(Value::Embedded(target))
            }
            (FieldKind::ReferenceOne(a), Value::Reference(target)) => {
                self.check_target(&a.target, target, false).map_err(invalid)?;
                Ok(Value::Reference(target))
            }
            (FieldKind::EmbedMany(_) | FieldKind::ReferenceMany(_), _) => {
                Err(invalid("collections are changed element by element".into()))
            }
            (kind, other) => Err(invalid(format!("{} value in a {kind:?} field", other.type_name()))),
        }
    }

    fn check_target(&self, expected: &str, target: ObjectId, embedded: bool) -> std::result::Result<(), String> {
        let class = self.objects.class_of(target).map_err(|e| e.to_string())?;
        if !self.context.metadata.is_subclass_of(class, expected) {
            return Err(format!("{class} is not a {expected}"));
        }
        let is_embedded = self
            .context
            .metadata
            .get(class)
            .map(|c| c.embedded)
            .map_err(|e| e.to_string())?;
        if is_embedded != embedded {
            return Err(format!("{class} cannot be stored here"));
        }
        Ok(())
    }

    pub fn elements(&self, object: ObjectId, field: &str) -> Result<&[ObjectId]> {
        let class = self.class(object)?;
        class.require_field(field)?;
        self.objects
            .loaded(object)?
            .collection(field)
            .map(|c| c.elements())
            .ok_or_else(|| Error::Mapping(format!("`{}.{field}` is not a collection", class.name)))
    }

    /// Append `element`. On an add-to-set collection an element equal to one
    /// already present is skipped and `false` returned.
    pub fn push(&mut self, object: ObjectId, field: &str, element: ObjectId) -> Result<bool> {
        let (embedded, strategy) = self.check_element(object, field, element)?;
        if strategy == CollectionStrategy::AddToSet && self.has_equal_element(object, field, element, embedded)? {
            return Ok(false);
        }
        self.collection_mut(object, field)?.push(element);
        Ok(true)
    }

    /// Insert `element` at `index`, with the same duplicate rule as `push`.
    pub fn insert_element(&mut self, object: ObjectId, field: &str, index: usize, element: ObjectId) -> Result<bool> {
        let (embedded, strategy) = self.check_element(object, field, element)?;
        if strategy == CollectionStrategy::AddToSet && self.has_equal_element(object, field, element, embedded)? {
            return Ok(false);
        }
        self.collection_mut(object, field)?.insert(index, element);
        Ok(true)
    }

    /// Remove the first occurrence of `element`.
    pub fn remove_element(&mut self, object: ObjectId, field: &str, element: ObjectId) -> Result<bool> {
        Ok(self.collection_mut(object, field)?.remove(element))
    }

    pub fn remove_element_at(&mut self, object: ObjectId, field: &str, index: usize) -> Result<Option<ObjectId>> {
        Ok(self.collection_mut(object, field)?.remove_at(index))
    }

    pub fn clear_collection(&mut self, object: ObjectId, field: &str) -> Result<()> {
        self.collection_mut(object, field)?.clear();
        Ok(())
    }

    fn collection_mut(&mut self, object: ObjectId, field: &str) -> Result<&mut PersistentCollection> {
        let class = self.class(object)?;
        class.require_field(field)?;
        self.objects
            .loaded_mut(object)?
            .collection_mut(field)
            .ok_or_else(|| Error::Mapping(format!("`{}.{field}` is not a collection", class.name)))
    }

    fn check_element(&self, object: ObjectId, field: &str, element: ObjectId) -> Result<(bool, CollectionStrategy)> {
        let class = self.class(object)?;
        let mapping = class.require_field(field)?;
        let (association, embedded) = match &mapping.kind {
            FieldKind::EmbedMany(a) => (a, true),
            FieldKind::ReferenceMany(a) => (a, false),
            _ => return Err(Error::Mapping(format!("`{}.{field}` is not a collection", class.name))),
        };
        self.check_target(&association.target, element, embedded)
            .map_err(|detail| Error::InvalidValue {
                field: format!("{}.{field}", class.name),
                detail,
            })?;
        Ok((embedded, association.strategy))
    }

    fn has_equal_element(&self, object: ObjectId, field: &str, element: ObjectId, embedded: bool) -> Result<bool> {
        self.contains_equal(self.elements(object, field)?, element, embedded)
    }

    /// Whether `existing` holds `element` or, for embedded elements, one with
    /// the same content.
    pub(crate) fn contains_equal(&self, existing: &[ObjectId], element: ObjectId, embedded: bool) -> Result<bool> {
        if !embedded {
            return Ok(existing.contains(&element));
        }
        let graph = self.graph();
        let FieldJson::Value(candidate) = Hydrator::embedded_document(graph, element, Source::Current)? else {
            return Ok(false);
        };
        for other in existing {
            if let FieldJson::Value(json) = Hydrator::embedded_document(graph, *other, Source::Current)? {
                if json == candidate {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub fn state(&self, object: ObjectId) -> Option<ObjectState> {
        self.tracker.state(object)
    }

    /// Whether `object` is part of the unit of work and not scheduled for
    /// removal.
    pub fn contains(&self, object: ObjectId) -> bool {
        self.tracker.is_live(object)
    }

    pub fn identifier(&self, object: ObjectId) -> Option<Identifier> {
        self.graph().identifier(object)
    }

    pub fn identity_map(&self) -> &IdentityMap {
        self.tracker.identity_map()
    }

    pub fn is_scheduled_for_insert(&self, object: ObjectId) -> bool {
        self.inserts.contains(&object)
    }

    pub fn is_scheduled_for_removal(&self, object: ObjectId) -> bool {
        self.removals.contains(&object)
    }

    /// Pending changes of a managed document, as the next flush would see
    /// them.
    pub fn change_set(&self, object: ObjectId) -> Result<ChangeSet> {
        let class = self.class(object)?;
        if class.embedded || !self.tracker.is_live(object) {
            return Err(Error::UnmanagedObject {
                class: class.name.clone(),
            });
        }
        ChangeSetComputer::new(self.graph()).compute(object)
    }

    /// Never write updates for `object` again in this session.
    pub fn mark_read_only(&mut self, object: ObjectId) -> Result<()> {
        let class = self.class(object)?;
        match self.tracker.entry_mut(object) {
            Some(entry) if entry.is_live() => {
                entry.read_only = true;
                Ok(())
            }
            _ => Err(Error::UnmanagedObject {
                class: class.name.clone(),
            }),
        }
    }

    /// Detach everything and drop scheduled work.
    pub fn clear(&mut self) {
        self.tracker.clear();
        self.inserts.clear();
        self.removals.clear();
    }

    /// Load the document of `class` with `id`, returning the instance already
    /// in the identity map when there is one.
    #[instrument(skip_all, fields(class = %class))]
    pub async fn find(&mut self, class: &str, id: impl Into<Identifier>) -> Result<Option<ObjectId>> {
        let id = id.into();
        let requested = self.context.metadata.get(class)?.clone();
        if requested.embedded {
            return Err(Error::Mapping(format!("embedded {class} cannot be loaded on its own")));
        }

        if let Some(existing) = self.tracker.resolve(&requested, &id) {
            if self.tracker.state(existing) == Some(ObjectState::Removed) {
                return Ok(None);
            }
            if !self.is_loaded(existing) {
                match self.ensure_loaded(existing).await {
                    Ok(()) => {}
                    Err(Error::DocNotFound) => return Ok(None),
                    Err(err) => return Err(err),
                }
            }
            let concrete = self.objects.class_of(existing)?;
            return Ok(self
                .context
                .metadata
                .is_subclass_of(concrete, class)
                .then_some(existing));
        }

        let Some(raw) = self.fetch(&requested, &id).await? else {
            debug!(%id, "document not found");
            return Ok(None);
        };
        self.hydrate_into(None, &requested, &raw)
    }

    /// A handle for `class` with `id` that loads on first use. No store
    /// access happens here.
    pub fn get_reference(&mut self, class: &str, id: impl Into<Identifier>) -> Result<ObjectId> {
        let id = id.into();
        let class = self.context.metadata.get(class)?.clone();
        if class.embedded {
            return Err(Error::Mapping(format!("embedded {} has no identity", class.name)));
        }
        if let Some(existing) = self.tracker.resolve(&class, &id) {
            return Ok(existing);
        }
        let proxy = self.objects.allocate(ObjectData::Unloaded {
            class: class.name.clone(),
            id: id.clone(),
        });
        self.tracker.track(proxy, &class, ObjectState::Managed);
        self.tracker.register_identity(proxy, id)?;
        Ok(proxy)
    }

    /// Load a lazy handle in place. Fails with [`Error::DocNotFound`] when
    /// its document no longer exists.
    pub async fn ensure_loaded(&mut self, object: ObjectId) -> Result<()> {
        let (class, id) = match self.objects.slot(object)? {
            ObjectData::Loaded(_) => return Ok(()),
            ObjectData::Unloaded { class, id } => (class.clone(), id.clone()),
        };
        let requested = self.context.metadata.get(&class)?.clone();
        let raw = self.fetch(&requested, &id).await?.ok_or(Error::DocNotFound)?;
        self.hydrate_into(Some(object), &requested, &raw)?
            .ok_or(Error::DocNotFound)?;
        Ok(())
    }

    pub(crate) async fn fetch(&self, class: &ClassMetadata, id: &Identifier) -> Result<Option<Document>> {
        let collection = class.collection_name()?;
        let found = self
            .context
            .store
            .find_one(collection, &Predicate::by_id(id.to_json()))
            .await?;
        if found.is_some() {
            metrics::record_doc_read(1);
        }
        Ok(found)
    }

    /// Turn `raw` into a managed object, reusing `slot` when given. Returns
    /// `None` when the stored type is not a `requested`.
    pub(crate) fn hydrate_into(
        &mut self,
        slot: Option<ObjectId>,
        requested: &Arc<ClassMetadata>,
        raw: &Document,
    ) -> Result<Option<ObjectId>> {
        let metadata = self.context.metadata.clone();
        let concrete = Hydrator::resolve_class(&metadata, requested, raw)?.clone();
        if !metadata.is_subclass_of(&concrete.name, &requested.name) {
            return Ok(None);
        }
        let id_type = concrete
            .id_strategy()
            .map(|s| s.field_type())
            .unwrap_or(FieldType::Id);
        let raw_id = raw
            .get("_id")
            .ok_or_else(|| Error::Mapping(format!("stored {} without `_id`", concrete.name)))?;
        let id = Identifier::from_json(raw_id, id_type)?;

        let object = match slot {
            Some(object) => object,
            None => self.objects.allocate(ObjectData::Unloaded {
                class: concrete.name.clone(),
                id: id.clone(),
            }),
        };
        let entry = self.tracker.track(object, &concrete, ObjectState::Managed);
        entry.class = concrete.name.clone();
        entry.original_discriminator = concrete.discriminator_value.clone();
        entry.read_only |= concrete.read_only;
        self.tracker.register_identity(object, id)?;

        Hydrator::hydrate(&metadata, &mut self.objects, &mut self.tracker, object, &concrete, raw)?;
        snapshot_tree(&metadata, &mut self.objects, &mut self.tracker, object)?;
        Ok(Some(object))
    }
}

fn coerce_scalar(ty: FieldType, value: Value) -> std::result::Result<Value, String> {
    let ok = match (ty, &value) {
        (FieldType::Id, Value::Int(_) | Value::String(_) | Value::Uuid(_)) => true,
        (FieldType::String, Value::String(_)) => true,
        (FieldType::Int, Value::Int(_)) => true,
        (FieldType::Float, Value::Float(_)) => true,
        (FieldType::Float, Value::Int(v)) => return Ok(Value::Float(*v as f64)),
        (FieldType::Bool, Value::Bool(_)) => true,
        (FieldType::Date | FieldType::Timestamp, Value::DateTime(_) | Value::Timestamp(_)) => true,
        (FieldType::Uuid, Value::Uuid(_)) => true,
        (FieldType::Json, Value::Json(_)) => true,
        (FieldType::Json, Value::String(s)) => return Ok(Value::Json(s.clone().into())),
        _ => false,
    };
    if ok {
        Ok(value)
    } else {
        Err(format!("{} value in a {ty:?} field", value.type_name()))
    }
}
