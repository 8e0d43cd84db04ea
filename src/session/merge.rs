use std::collections::HashMap;

use tracing::{debug, instrument};

use crate::{
    ConflictKind, Error, Result,
    cascade::CascadePlanner,
    identity::ObjectState,
    metadata::{CascadeOp, CollectionStrategy, FieldKind},
    object::{Object, ObjectId},
    value::Value,
};

use super::DocumentSession;

impl DocumentSession {
    /// Copy the state of a detached or unmanaged `object` onto the managed
    /// instance with the same identity, loading or creating it as needed,
    /// and return that instance. `object` itself stays untracked.
    #[instrument(skip_all, fields(object = %object))]
    pub async fn merge(&mut self, object: ObjectId) -> Result<ObjectId> {
        let class = self.class(object)?;
        if class.embedded {
            return Err(Error::Mapping(format!(
                "embedded {} is merged through its owner",
                class.name
            )));
        }
        match self.tracker.state(object) {
            Some(ObjectState::Managed | ObjectState::New) => return Ok(object),
            Some(ObjectState::Removed) => {
                return Err(Error::Mapping(format!("removed {} cannot be merged", class.name)));
            }
            _ => {}
        }

        let plan = CascadePlanner::new(self.graph()).plan(object, CascadeOp::Merge)?;
        let mut sources = Vec::new();
        for step in plan.steps {
            if !self.class(step.object)?.embedded {
                sources.push(step.object);
            }
        }

        let mut merged: HashMap<ObjectId, ObjectId> = HashMap::new();
        let mut created = Vec::new();
        for source in &sources {
            let (target, is_new) = self.merge_target(*source).await?;
            merged.insert(*source, target);
            if is_new {
                created.push(target);
            }
        }

        for source in &sources {
            let target = merged[source];
            if target != *source && self.is_loaded(*source) {
                let state = self.objects.loaded(*source)?.clone();
                self.copy_fields(&state, target, &merged)?;
            }
        }

        if !created.is_empty() {
            self.cascade_persist(&created, false).await?;
        }
        debug!(merged = merged.len(), created = created.len(), "merge complete");
        Ok(merged[&object])
    }

    /// Managed counterpart of `source`, and whether it had to be created.
    async fn merge_target(&mut self, source: ObjectId) -> Result<(ObjectId, bool)> {
        match self.tracker.state(source) {
            Some(ObjectState::Managed | ObjectState::New) => return Ok((source, false)),
            Some(ObjectState::Removed) => {
                return Err(Error::Mapping(format!(
                    "removed {} cannot be merged",
                    self.class(source)?.name
                )));
            }
            _ => {}
        }
        let class = self.class(source)?;
        let id = self.graph().identifier(source);

        if !self.is_loaded(source) {
            let id = id.ok_or_else(|| Error::MissingIdentifier {
                class: class.name.clone(),
            })?;
            return Ok((self.get_reference(&class.name, id)?, false));
        }

        if let Some(id) = &id {
            if let Some(existing) = self.find(&class.name, id.clone()).await? {
                if let Some(version_field) = &class.version_field {
                    let theirs = self.objects.loaded(source)?.field(version_field).as_i64();
                    let ours = self.objects.loaded(existing)?.field(version_field).as_i64();
                    if let Some(expected) = theirs {
                        if ours != Some(expected) {
                            return Err(self.conflict_error(&class.name, id, ConflictKind::Version { expected }));
                        }
                    }
                }
                return Ok((existing, false));
            }
        }

        let copy = self.create(&class.name)?;
        if let (Some(id), Some(field)) = (id, class.identifier_field()) {
            self.objects
                .loaded_mut(copy)?
                .fields
                .insert(field.to_owned(), id.to_value());
        }
        Ok((copy, true))
    }

    /// Overwrite the mapped fields of `target` with those of `source`.
    fn copy_fields(&mut self, source: &Object, target: ObjectId, merged: &HashMap<ObjectId, ObjectId>) -> Result<()> {
        let class = self.context.metadata.get(&source.class)?.clone();
        for field in &class.fields {
            if Some(field.name.as_str()) == class.identifier_field()
                || Some(&field.name) == class.version_field.as_ref()
            {
                continue;
            }
            match &field.kind {
                FieldKind::Scalar(_) => {
                    let value = source.field(&field.name).clone();
                    self.objects.loaded_mut(target)?.fields.insert(field.name.clone(), value);
                }
                FieldKind::EmbedOne(_) => {
                    let value = match source.field(&field.name) {
                        Value::Embedded(child) => Value::Embedded(self.copy_embedded(*child, merged)?),
                        _ => Value::Null,
                    };
                    self.objects.loaded_mut(target)?.fields.insert(field.name.clone(), value);
                }
                FieldKind::ReferenceOne(_) => {
                    let value = match source.field(&field.name) {
                        Value::Reference(referenced) => {
                            Value::Reference(self.merged_reference(*referenced, source, &field.name, merged)?)
                        }
                        _ => Value::Null,
                    };
                    self.objects.loaded_mut(target)?.fields.insert(field.name.clone(), value);
                }
                FieldKind::EmbedMany(_) | FieldKind::ReferenceMany(_) => {
                    let elements = source
                        .collection(&field.name)
                        .map(|c| c.elements().to_vec())
                        .unwrap_or_default();
                    let add_to_set = field
                        .kind
                        .association()
                        .is_some_and(|a| a.strategy == CollectionStrategy::AddToSet);
                    let mut copied = Vec::with_capacity(elements.len());
                    for element in elements {
                        let element = if field.kind.is_embedded() {
                            self.copy_embedded(element, merged)?
                        } else {
                            self.merged_reference(element, source, &field.name, merged)?
                        };
                        if add_to_set && self.contains_equal(&copied, element, field.kind.is_embedded())? {
                            continue;
                        }
                        copied.push(element);
                    }
                    if let Some(collection) = self.objects.loaded_mut(target)?.collection_mut(&field.name) {
                        collection.replace(copied);
                    }
                }
            }
        }
        Ok(())
    }

    fn copy_embedded(&mut self, source: ObjectId, merged: &HashMap<ObjectId, ObjectId>) -> Result<ObjectId> {
        let state = self.objects.loaded(source)?.clone();
        let copy = self.create(&state.class)?;
        self.copy_fields(&state, copy, merged)?;
        Ok(copy)
    }

    fn merged_reference(
        &mut self,
        referenced: ObjectId,
        owner: &Object,
        field: &str,
        merged: &HashMap<ObjectId, ObjectId>,
    ) -> Result<ObjectId> {
        if let Some(target) = merged.get(&referenced) {
            return Ok(*target);
        }
        if self.tracker.is_live(referenced) {
            return Ok(referenced);
        }
        let class = self.class(referenced)?;
        match self.graph().identifier(referenced) {
            Some(id) => self.get_reference(&class.name, id),
            None => Err(Error::NewObjectThroughRelationship {
                owner: owner.class.clone(),
                field: field.to_owned(),
                class: class.name.clone(),
            }),
        }
    }
}
