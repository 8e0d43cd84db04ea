use std::sync::Arc;

use crate::{
    Result,
    identity::ObjectTracker,
    metadata::{ClassMetadata, FieldMapping, MetadataRegistry},
    object::{Arena, Object, ObjectData, ObjectId},
    value::{Identifier, Value},
};

/// Read-only view over a session's objects, shared by the change-set
/// computer, the cascade planner, the hydrator and the persisters.
#[derive(Clone, Copy)]
pub(crate) struct Graph<'a> {
    pub metadata: &'a MetadataRegistry,
    pub objects: &'a Arena,
    pub tracker: &'a ObjectTracker,
}

/// One association edge leaving an object.
pub(crate) struct Edge<'a> {
    pub field: &'a FieldMapping,
    pub target: ObjectId,
    pub position: Option<usize>,
}

impl<'a> Graph<'a> {
    pub fn class(&self, object: ObjectId) -> Result<&'a Arc<ClassMetadata>> {
        let class = self.objects.class_of(object)?;
        self.metadata.get(class)
    }

    pub fn loaded(&self, object: ObjectId) -> Result<&'a Object> {
        self.objects.loaded(object)
    }

    pub fn is_loaded(&self, object: ObjectId) -> bool {
        self.objects.get(object).is_some_and(ObjectData::is_loaded)
    }

    /// Known identifier: tracked, proxied, or set on the id field.
    pub fn identifier(&self, object: ObjectId) -> Option<Identifier> {
        if let Some(id) = self.tracker.identifier(object) {
            return Some(id.clone());
        }
        match self.objects.get(object)? {
            ObjectData::Unloaded { id, .. } => Some(id.clone()),
            ObjectData::Loaded(loaded) => {
                let class = self.metadata.get(&loaded.class).ok()?;
                let field = class.identifier_field()?;
                Identifier::from_value(loaded.field(field))
            }
        }
    }

    /// Association edges of a loaded object in field declaration order.
    /// Unloaded objects have none.
    pub fn edges(&self, object: ObjectId) -> Result<Vec<Edge<'a>>> {
        let Some(ObjectData::Loaded(loaded)) = self.objects.get(object) else {
            return Ok(Vec::new());
        };
        let class = self.metadata.get(&loaded.class)?;
        let mut edges = Vec::new();
        for field in &class.fields {
            if field.kind.association().is_none() {
                continue;
            }
            if field.kind.is_collection() {
                if let Some(collection) = loaded.collection(&field.name) {
                    for (position, target) in collection.elements().iter().enumerate() {
                        edges.push(Edge {
                            field,
                            target: *target,
                            position: Some(position),
                        });
                    }
                }
            } else {
                match loaded.field(&field.name) {
                    Value::Embedded(target) | Value::Reference(target) => edges.push(Edge {
                        field,
                        target: *target,
                        position: None,
                    }),
                    _ => {}
                }
            }
        }
        Ok(edges)
    }
}
