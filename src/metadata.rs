//! Class descriptors consumed read-only by the session.
//!
//! Mapping facts are declared once through the builder methods on
//! [`ClassMetadata`] and frozen by [`MetadataRegistryBuilder::build`], which
//! resolves inheritance and discriminator maps and rejects invalid mappings
//! before any session exists.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::{Error, Result, path::FieldPath, persister::CollectionPersister};

/// Storage type of a scalar field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    /// Identifier whose concrete type is decided by the stored value.
    Id,
    String,
    Int,
    Float,
    Bool,
    /// Date with an offset, stored as RFC 3339.
    Date,
    /// UTC timestamp, stored as RFC 3339.
    Timestamp,
    Uuid,
    /// Opaque JSON stored verbatim.
    Json,
}

/// How a document obtains its identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdStrategy {
    /// Random v4 UUID generated when the object is persisted.
    Uuid,
    /// Next value of a store sequence, fetched when the object is persisted.
    Increment,
    /// The caller sets the identifier field before persisting.
    Manual(FieldType),
    /// The store assigns the identifier during insert.
    Store,
}

impl IdStrategy {
    pub fn field_type(&self) -> FieldType {
        match self {
            IdStrategy::Uuid => FieldType::Uuid,
            IdStrategy::Increment => FieldType::Int,
            IdStrategy::Manual(ty) => *ty,
            IdStrategy::Store => FieldType::String,
        }
    }

    /// Identifier unknown until the insert returns.
    pub fn assigned_by_store(&self) -> bool {
        matches!(self, IdStrategy::Store)
    }
}

/// A lifecycle operation that may propagate along associations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CascadeOp {
    Persist,
    Remove,
    Detach,
    Merge,
    Refresh,
}

impl CascadeOp {
    fn bit(self) -> u8 {
        match self {
            CascadeOp::Persist => 1,
            CascadeOp::Remove => 1 << 1,
            CascadeOp::Detach => 1 << 2,
            CascadeOp::Merge => 1 << 3,
            CascadeOp::Refresh => 1 << 4,
        }
    }
}

/// Set of operations a reference association cascades.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cascade(u8);

impl Cascade {
    pub const NONE: Cascade = Cascade(0);
    pub const PERSIST: Cascade = Cascade(1);
    pub const REMOVE: Cascade = Cascade(1 << 1);
    pub const DETACH: Cascade = Cascade(1 << 2);
    pub const MERGE: Cascade = Cascade(1 << 3);
    pub const REFRESH: Cascade = Cascade(1 << 4);
    pub const ALL: Cascade = Cascade(0b1_1111);

    pub fn contains(self, op: CascadeOp) -> bool {
        self.0 & op.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Cascade {
    type Output = Cascade;

    fn bitor(self, rhs: Self) -> Self::Output {
        Cascade(self.0 | rhs.0)
    }
}

/// How changes to a many-association are written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CollectionStrategy {
    /// Overwrite the whole array.
    Set,
    /// Pull removed positions and push appended elements.
    #[default]
    PushAll,
    /// Pull removed positions and append only absent elements.
    AddToSet,
    /// Rewrite the whole owning document.
    AtomicSet,
    /// Rewrite the whole owning document with the array re-keyed.
    AtomicSetArray,
}

impl CollectionStrategy {
    pub fn is_atomic(&self) -> bool {
        matches!(
            self,
            CollectionStrategy::AtomicSet | CollectionStrategy::AtomicSetArray
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionStrategy::Set => "set",
            CollectionStrategy::PushAll => "pushAll",
            CollectionStrategy::AddToSet => "addToSet",
            CollectionStrategy::AtomicSet => "atomicSet",
            CollectionStrategy::AtomicSetArray => "atomicSetArray",
        }
    }
}

impl fmt::Display for CollectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored shape of a reference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReferenceStorage {
    /// The raw identifier.
    #[default]
    Id,
    /// `{"$ref": collection, "$id": id}` plus the target's discriminator.
    Ref,
}

#[derive(Clone, Debug)]
pub struct Association {
    pub target: String,
    pub storage: ReferenceStorage,
    pub cascade: Cascade,
    pub orphan_removal: bool,
    pub strategy: CollectionStrategy,
}

impl Association {
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            storage: ReferenceStorage::Id,
            cascade: Cascade::NONE,
            orphan_removal: false,
            strategy: CollectionStrategy::default(),
        }
    }

    pub fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn orphan_removal(mut self) -> Self {
        self.orphan_removal = true;
        self
    }

    pub fn strategy(mut self, strategy: CollectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn storage(mut self, storage: ReferenceStorage) -> Self {
        self.storage = storage;
        self
    }
}

#[derive(Clone, Debug)]
pub enum FieldKind {
    Scalar(FieldType),
    EmbedOne(Association),
    EmbedMany(Association),
    ReferenceOne(Association),
    ReferenceMany(Association),
}

impl FieldKind {
    pub fn association(&self) -> Option<&Association> {
        match self {
            FieldKind::Scalar(_) => None,
            FieldKind::EmbedOne(a)
            | FieldKind::EmbedMany(a)
            | FieldKind::ReferenceOne(a)
            | FieldKind::ReferenceMany(a) => Some(a),
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, FieldKind::EmbedMany(_) | FieldKind::ReferenceMany(_))
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, FieldKind::EmbedOne(_) | FieldKind::EmbedMany(_))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, FieldKind::ReferenceOne(_) | FieldKind::ReferenceMany(_))
    }
}

#[derive(Clone, Debug)]
pub struct FieldMapping {
    pub name: String,
    pub stored_name: String,
    pub kind: FieldKind,
}

#[derive(Clone, Debug)]
pub struct IdentifierMapping {
    pub field: String,
    pub strategy: IdStrategy,
}

#[derive(Clone, Debug)]
pub struct ClassMetadata {
    pub name: String,
    pub collection: Option<String>,
    pub embedded: bool,
    pub parent: Option<String>,
    pub root: String,
    pub identifier: Option<IdentifierMapping>,
    pub fields: Vec<FieldMapping>,
    pub version_field: Option<String>,
    pub lock_field: Option<String>,
    pub shard_key: Vec<String>,
    pub discriminator_field: Option<String>,
    pub discriminator_value: Option<String>,
    pub discriminator_map: BTreeMap<String, String>,
    pub default_discriminator: Option<String>,
    pub read_only: bool,
}

impl ClassMetadata {
    fn blank(name: String, collection: Option<String>, embedded: bool) -> Self {
        Self {
            root: name.clone(),
            name,
            collection,
            embedded,
            parent: None,
            identifier: None,
            fields: Vec::new(),
            version_field: None,
            lock_field: None,
            shard_key: Vec::new(),
            discriminator_field: None,
            discriminator_value: None,
            discriminator_map: BTreeMap::new(),
            default_discriminator: None,
            read_only: false,
        }
    }

    /// A top-level document stored in `collection`.
    pub fn document(name: impl Into<String>, collection: impl Into<String>) -> Self {
        Self::blank(name.into(), Some(collection.into()), false)
    }

    /// A class only ever stored inline inside its owner.
    pub fn embedded(name: impl Into<String>) -> Self {
        Self::blank(name.into(), None, true)
    }

    /// A subclass sharing `parent`'s collection (or embedding) and fields.
    pub fn subclass(name: impl Into<String>, parent: impl Into<String>) -> Self {
        let mut class = Self::blank(name.into(), None, false);
        class.parent = Some(parent.into());
        class
    }

    pub fn id(mut self, field: impl Into<String>, strategy: IdStrategy) -> Self {
        let field = field.into();
        self.push_field(FieldMapping {
            name: field.clone(),
            stored_name: "_id".into(),
            kind: FieldKind::Scalar(strategy.field_type()),
        });
        self.identifier = Some(IdentifierMapping { field, strategy });
        self
    }

    pub fn field(self, name: impl Into<String>, ty: FieldType) -> Self {
        let name = name.into();
        self.field_stored_as(name.clone(), name, ty)
    }

    pub fn field_stored_as(
        mut self,
        name: impl Into<String>,
        stored_name: impl Into<String>,
        ty: FieldType,
    ) -> Self {
        self.push_field(FieldMapping {
            name: name.into(),
            stored_name: stored_name.into(),
            kind: FieldKind::Scalar(ty),
        });
        self
    }

    pub fn embed_one(self, name: impl Into<String>, association: Association) -> Self {
        self.association(name.into(), FieldKind::EmbedOne(association))
    }

    pub fn embed_many(self, name: impl Into<String>, association: Association) -> Self {
        self.association(name.into(), FieldKind::EmbedMany(association))
    }

    pub fn reference_one(self, name: impl Into<String>, association: Association) -> Self {
        self.association(name.into(), FieldKind::ReferenceOne(association))
    }

    pub fn reference_many(self, name: impl Into<String>, association: Association) -> Self {
        self.association(name.into(), FieldKind::ReferenceMany(association))
    }

    fn association(mut self, name: String, kind: FieldKind) -> Self {
        self.push_field(FieldMapping {
            stored_name: name.clone(),
            name,
            kind,
        });
        self
    }

    /// Integer version field checked and incremented by every update.
    pub fn version(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if self.field_mapping(&field).is_none() {
            self = self.field(field.clone(), FieldType::Int);
        }
        self.version_field = Some(field);
        self
    }

    /// Document key holding the pessimistic lock marker.
    pub fn lock(mut self, stored_name: impl Into<String>) -> Self {
        self.lock_field = Some(stored_name.into());
        self
    }

    pub fn shard_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shard_key = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn discriminator(mut self, field: impl Into<String>) -> Self {
        self.discriminator_field = Some(field.into());
        self
    }

    pub fn discriminator_value(mut self, value: impl Into<String>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }

    pub fn default_discriminator(mut self, value: impl Into<String>) -> Self {
        self.default_discriminator = Some(value.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    fn push_field(&mut self, mapping: FieldMapping) {
        if let Some(existing) = self.fields.iter_mut().find(|f| f.name == mapping.name) {
            *existing = mapping;
        } else {
            self.fields.push(mapping);
        }
    }

    pub fn field_mapping(&self, name: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn require_field(&self, name: &str) -> Result<&FieldMapping> {
        self.field_mapping(name).ok_or_else(|| Error::UnknownField {
            class: self.name.clone(),
            field: name.to_owned(),
        })
    }

    pub fn identifier_field(&self) -> Option<&str> {
        self.identifier.as_ref().map(|id| id.field.as_str())
    }

    pub fn id_strategy(&self) -> Option<IdStrategy> {
        self.identifier.as_ref().map(|id| id.strategy)
    }

    pub fn collection_name(&self) -> Result<&str> {
        self.collection
            .as_deref()
            .ok_or_else(|| Error::Mapping(format!("{} is not stored in a collection", self.name)))
    }

    pub fn is_versioned(&self) -> bool {
        self.version_field.is_some()
    }

    pub fn is_lockable(&self) -> bool {
        self.lock_field.is_some()
    }

    pub fn collection_fields(&self) -> impl Iterator<Item = &FieldMapping> {
        self.fields.iter().filter(|f| f.kind.is_collection())
    }

    /// Concrete class named by a stored discriminator value.
    pub fn class_for_discriminator(&self, value: &str) -> Option<&str> {
        self.discriminator_map.get(value).map(String::as_str)
    }
}

/// Immutable table of every mapped class.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    classes: HashMap<String, Arc<ClassMetadata>>,
}

impl MetadataRegistry {
    pub fn builder() -> MetadataRegistryBuilder {
        MetadataRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Result<&Arc<ClassMetadata>> {
        self.classes
            .get(name)
            .ok_or_else(|| Error::UnknownClass(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn classes(&self) -> impl Iterator<Item = &Arc<ClassMetadata>> {
        self.classes.values()
    }

    /// Whether `class` is `ancestor` or inherits from it.
    pub fn is_subclass_of(&self, class: &str, ancestor: &str) -> bool {
        let mut current = Some(class);
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = self.classes.get(name).and_then(|c| c.parent.as_deref());
        }
        false
    }
}

#[derive(Default)]
pub struct MetadataRegistryBuilder {
    classes: Vec<ClassMetadata>,
}

impl MetadataRegistryBuilder {
    pub fn class(mut self, class: ClassMetadata) -> Self {
        self.classes.push(class);
        self
    }

    pub fn build(self) -> Result<MetadataRegistry> {
        let mut declared: HashMap<String, ClassMetadata> = HashMap::new();
        for class in self.classes {
            if declared.contains_key(&class.name) {
                return Err(Error::Mapping(format!("class `{}` declared twice", class.name)));
            }
            declared.insert(class.name.clone(), class);
        }

        let mut resolved: HashMap<String, ClassMetadata> = HashMap::new();
        let names: Vec<String> = declared.keys().cloned().collect();
        for name in &names {
            resolve_inheritance(name, &declared, &mut resolved, &mut Vec::new())?;
        }

        assign_discriminator_maps(&mut resolved);

        for class in resolved.values() {
            validate_class(class, &resolved)?;
        }

        Ok(MetadataRegistry {
            classes: resolved
                .into_iter()
                .map(|(name, class)| (name, Arc::new(class)))
                .collect(),
        })
    }
}

fn resolve_inheritance(
    name: &str,
    declared: &HashMap<String, ClassMetadata>,
    resolved: &mut HashMap<String, ClassMetadata>,
    stack: &mut Vec<String>,
) -> Result<()> {
    if resolved.contains_key(name) {
        return Ok(());
    }
    if stack.iter().any(|n| n == name) {
        return Err(Error::Mapping(format!("inheritance cycle through `{name}`")));
    }
    let class = declared
        .get(name)
        .ok_or_else(|| Error::UnknownClass(name.to_owned()))?;

    let Some(parent_name) = class.parent.clone() else {
        resolved.insert(name.to_owned(), class.clone());
        return Ok(());
    };

    stack.push(name.to_owned());
    resolve_inheritance(&parent_name, declared, resolved, stack)?;
    stack.pop();

    let parent = &resolved[&parent_name];
    let mut merged = parent.clone();
    merged.name = class.name.clone();
    merged.parent = Some(parent_name);
    merged.discriminator_value = class.discriminator_value.clone();
    merged.discriminator_map = BTreeMap::new();
    if class.identifier.is_some() {
        merged.identifier = class.identifier.clone();
    }
    for field in &class.fields {
        merged.push_field(field.clone());
    }
    if class.version_field.is_some() {
        merged.version_field = class.version_field.clone();
    }
    if class.lock_field.is_some() {
        merged.lock_field = class.lock_field.clone();
    }
    if !class.shard_key.is_empty() {
        return Err(Error::Mapping(format!(
            "subclass `{}` cannot redeclare the shard key of `{}`",
            class.name, parent.root
        )));
    }
    if class.default_discriminator.is_some() {
        merged.default_discriminator = class.default_discriminator.clone();
    }
    merged.read_only = parent.read_only || class.read_only;
    resolved.insert(name.to_owned(), merged);
    Ok(())
}

fn assign_discriminator_maps(classes: &mut HashMap<String, ClassMetadata>) {
    let mut maps: HashMap<String, BTreeMap<String, String>> = HashMap::new();
    for class in classes.values() {
        if class.discriminator_field.is_none() {
            continue;
        }
        let value = class
            .discriminator_value
            .clone()
            .unwrap_or_else(|| class.name.clone());
        maps.entry(class.root.clone())
            .or_default()
            .insert(value, class.name.clone());
    }
    for class in classes.values_mut() {
        if class.discriminator_field.is_none() {
            continue;
        }
        if class.discriminator_value.is_none() {
            class.discriminator_value = Some(class.name.clone());
        }
        if let Some(map) = maps.get(&class.root) {
            class.discriminator_map = map.clone();
        }
    }
}

fn validate_class(class: &ClassMetadata, classes: &HashMap<String, ClassMetadata>) -> Result<()> {
    if !class.embedded {
        if class.collection.is_none() {
            return Err(Error::Mapping(format!("document `{}` has no collection", class.name)));
        }
        if class.identifier.is_none() {
            return Err(Error::Mapping(format!("document `{}` has no identifier", class.name)));
        }
    }

    for field in &class.fields {
        let Some(association) = field.kind.association() else {
            continue;
        };
        let target = classes.get(&association.target).ok_or_else(|| {
            Error::Mapping(format!(
                "`{}.{}` targets unknown class `{}`",
                class.name, field.name, association.target
            ))
        })?;
        if field.kind.is_embedded() && !target.embedded {
            return Err(Error::Mapping(format!(
                "`{}.{}` embeds `{}`, which is not an embedded class",
                class.name, field.name, target.name
            )));
        }
        if field.kind.is_reference() && target.embedded {
            return Err(Error::Mapping(format!(
                "`{}.{}` references embedded class `{}`",
                class.name, field.name, target.name
            )));
        }
    }

    if let Some(version) = &class.version_field {
        match class.field_mapping(version).map(|f| &f.kind) {
            Some(FieldKind::Scalar(FieldType::Int)) => {}
            _ => {
                return Err(Error::Mapping(format!(
                    "version field `{}.{version}` must be an int field",
                    class.name
                )));
            }
        }
    }

    for key in &class.shard_key {
        if !matches!(
            class.field_mapping(key).map(|f| &f.kind),
            Some(FieldKind::Scalar(_))
        ) {
            return Err(Error::Mapping(format!(
                "shard key `{}.{key}` must be a scalar field",
                class.name
            )));
        }
    }

    // Embedded classes only ever sit below a top-level field, so their
    // collections are validated at a nested placement.
    for field in class.collection_fields() {
        let path = if class.embedded {
            FieldPath::root(class.name.clone()).child(field.name.clone())
        } else {
            FieldPath::root(field.name.clone())
        };
        if let Some(association) = field.kind.association() {
            CollectionPersister::new(&class.name, path, association)?;
        }
    }

    Ok(())
}
