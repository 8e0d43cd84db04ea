//! Conversion between stored documents and arena objects.
//!
//! Dehydration renders either the current field values or the snapshot
//! values of an object graph, so the change-set computer can compare
//! embedded structures by content. Hydration creates embedded objects as
//! managed children and turns stored references into identity-map lookups,
//! falling back to unloaded stand-ins, so loading never recurses into other
//! documents.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{
    Error, Result,
    backend::Document,
    graph::Graph,
    identity::{ObjectState, ObjectTracker, ParentAssociation},
    metadata::{Association, ClassMetadata, FieldKind, FieldMapping, FieldType, MetadataRegistry, ReferenceStorage},
    object::{Arena, Object, ObjectData, ObjectId, PersistentCollection},
    value::{Identifier, Value},
};

/// Which values of an object to render.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Source {
    Current,
    Snapshot,
}

/// Rendering of one field.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum FieldJson {
    Value(JsonValue),
    /// Null field; left out of documents.
    Absent,
    /// Holds a reference whose identifier the store has not assigned yet.
    Pending,
}

/// A top-level document ready for insert plus the fields that must wait
/// for other inserts.
pub(crate) struct InsertDocument {
    pub document: Document,
    pub deferred: Vec<String>,
}

pub(crate) struct Hydrator;

impl Hydrator {
    /// Full stored form of a top-level object. Pending references are an
    /// error here; inserts go through [`Hydrator::insert_document`].
    pub fn document(graph: Graph<'_>, object: ObjectId, source: Source) -> Result<Document> {
        let rendered = Self::insert_document_from(graph, object, source)?;
        if let Some(field) = rendered.deferred.first() {
            return Err(Error::Mapping(format!(
                "`{field}` references an object without an identifier"
            )));
        }
        Ok(rendered.document)
    }

    pub fn insert_document(graph: Graph<'_>, object: ObjectId) -> Result<InsertDocument> {
        Self::insert_document_from(graph, object, Source::Current)
    }

    fn insert_document_from(graph: Graph<'_>, object: ObjectId, source: Source) -> Result<InsertDocument> {
        let class = graph.class(object)?;
        let mut document = Document::new();
        let mut deferred = Vec::new();
        if let Some(id) = graph.identifier(object) {
            document.insert("_id".into(), id.to_json());
        }
        if let (Some(field), Some(value)) = (&class.discriminator_field, &class.discriminator_value) {
            document.insert(field.clone(), JsonValue::String(value.clone()));
        }
        for field in &class.fields {
            if Some(field.name.as_str()) == class.identifier_field() {
                continue;
            }
            match Self::field_json(graph, object, field, source)? {
                FieldJson::Value(json) => {
                    document.insert(field.stored_name.clone(), json);
                }
                FieldJson::Absent => {}
                FieldJson::Pending => deferred.push(field.name.clone()),
            }
        }
        Ok(InsertDocument { document, deferred })
    }

    /// Inline form of an embedded object, including its discriminator.
    pub fn embedded_document(graph: Graph<'_>, object: ObjectId, source: Source) -> Result<FieldJson> {
        let class = graph.class(object)?;
        let mut document = Document::new();
        if let (Some(field), Some(value)) = (&class.discriminator_field, &class.discriminator_value) {
            document.insert(field.clone(), JsonValue::String(value.clone()));
        }
        for field in &class.fields {
            match Self::field_json(graph, object, field, source)? {
                FieldJson::Value(json) => {
                    document.insert(field.stored_name.clone(), json);
                }
                FieldJson::Absent => {}
                FieldJson::Pending => return Ok(FieldJson::Pending),
            }
        }
        Ok(FieldJson::Value(JsonValue::Object(document)))
    }

    pub fn field_json(
        graph: Graph<'_>,
        object: ObjectId,
        field: &FieldMapping,
        source: Source,
    ) -> Result<FieldJson> {
        let loaded = graph.loaded(object)?;
        let snapshot = match source {
            Source::Snapshot => graph.tracker.entry(object).and_then(|e| e.snapshot()),
            Source::Current => None,
        };

        if field.kind.is_collection() {
            let Some(collection) = loaded.collection(&field.name) else {
                return Ok(FieldJson::Absent);
            };
            let elements = match (source, collection.baseline()) {
                (Source::Snapshot, Some(baseline)) => baseline,
                _ => collection.elements(),
            };
            let mut items = Vec::with_capacity(elements.len());
            for element in elements {
                match Self::element_json(graph, &field.kind, *element, source)? {
                    FieldJson::Value(json) => items.push(json),
                    FieldJson::Absent => items.push(JsonValue::Null),
                    FieldJson::Pending => return Ok(FieldJson::Pending),
                }
            }
            return Ok(FieldJson::Value(JsonValue::Array(items)));
        }

        let value = match snapshot {
            Some(snapshot) => snapshot.get(&field.name),
            None => loaded.field(&field.name),
        };
        Self::value_json(graph, field, value, source)
    }

    pub fn value_json(
        graph: Graph<'_>,
        field: &FieldMapping,
        value: &Value,
        source: Source,
    ) -> Result<FieldJson> {
        match (&field.kind, value) {
            (_, Value::Null) => Ok(FieldJson::Absent),
            (FieldKind::EmbedOne(_), Value::Embedded(target)) => {
                Self::embedded_document(graph, *target, source)
            }
            (FieldKind::ReferenceOne(association), Value::Reference(target)) => {
                Self::reference_json(graph, association, *target)
            }
            (FieldKind::Scalar(_), scalar) => Ok(FieldJson::Value(scalar_to_json(&field.name, scalar)?)),
            (_, other) => Err(Error::InvalidValue {
                field: field.name.clone(),
                detail: format!("{} value in a {:?} field", other.type_name(), field.kind),
            }),
        }
    }

    pub fn element_json(
        graph: Graph<'_>,
        kind: &FieldKind,
        element: ObjectId,
        source: Source,
    ) -> Result<FieldJson> {
        match kind {
            FieldKind::EmbedMany(_) => Self::embedded_document(graph, element, source),
            FieldKind::ReferenceMany(association) => Self::reference_json(graph, association, element),
            _ => Err(Error::Mapping(format!("{kind:?} is not a collection"))),
        }
    }

    pub fn reference_json(graph: Graph<'_>, association: &Association, target: ObjectId) -> Result<FieldJson> {
        let Some(id) = graph.identifier(target) else {
            return Ok(FieldJson::Pending);
        };
        match association.storage {
            ReferenceStorage::Id => Ok(FieldJson::Value(id.to_json())),
            ReferenceStorage::Ref => {
                let class = graph.class(target)?;
                let mut reference = Document::new();
                reference.insert("$ref".into(), JsonValue::String(class.collection_name()?.to_owned()));
                reference.insert("$id".into(), id.to_json());
                if let (Some(field), Some(value)) = (&class.discriminator_field, &class.discriminator_value) {
                    reference.insert(field.clone(), JsonValue::String(value.clone()));
                }
                Ok(FieldJson::Value(JsonValue::Object(reference)))
            }
        }
    }

    /// Concrete class of a stored document requested as `requested`.
    pub fn resolve_class<'m>(
        metadata: &'m MetadataRegistry,
        requested: &'m Arc<ClassMetadata>,
        raw: &Document,
    ) -> Result<&'m Arc<ClassMetadata>> {
        let Some(field) = &requested.discriminator_field else {
            return Ok(requested);
        };
        let value = raw
            .get(field)
            .and_then(JsonValue::as_str)
            .or(requested.default_discriminator.as_deref());
        match value.and_then(|v| requested.class_for_discriminator(v)) {
            Some(concrete) => metadata.get(concrete),
            None => Ok(requested),
        }
    }

    /// Build the fields of `target` from `raw`, creating embedded children
    /// and reference stand-ins as it goes. `target` must already be in the
    /// identity map when it is a document.
    pub fn hydrate(
        metadata: &MetadataRegistry,
        objects: &mut Arena,
        tracker: &mut ObjectTracker,
        target: ObjectId,
        class: &ClassMetadata,
        raw: &Document,
    ) -> Result<()> {
        let mut object = Object::blank(class);
        for field in &class.fields {
            let stored = raw.get(&field.stored_name).filter(|v| !v.is_null());
            match &field.kind {
                FieldKind::Scalar(ty) => {
                    let value = match stored {
                        Some(json) => scalar_from_json(&field.name, *ty, json)?,
                        None => Value::Null,
                    };
                    object.fields.insert(field.name.clone(), value);
                }
                FieldKind::EmbedOne(association) => {
                    let value = match stored {
                        Some(json) => {
                            let child = Self::hydrate_embedded(
                                metadata,
                                objects,
                                tracker,
                                association,
                                json,
                                ParentAssociation {
                                    owner: target,
                                    field: field.name.clone(),
                                    position: None,
                                },
                            )?;
                            Value::Embedded(child)
                        }
                        None => Value::Null,
                    };
                    object.fields.insert(field.name.clone(), value);
                }
                FieldKind::ReferenceOne(association) => {
                    let value = match stored {
                        Some(json) => Value::Reference(Self::hydrate_reference(
                            metadata,
                            objects,
                            tracker,
                            association,
                            json,
                        )?),
                        None => Value::Null,
                    };
                    object.fields.insert(field.name.clone(), value);
                }
                FieldKind::EmbedMany(association) | FieldKind::ReferenceMany(association) => {
                    let items = match stored {
                        Some(JsonValue::Array(items)) => items.as_slice(),
                        Some(other) => {
                            return Err(Error::InvalidValue {
                                field: field.name.clone(),
                                detail: format!("expected an array, found {other}"),
                            });
                        }
                        None => &[],
                    };
                    let mut elements = Vec::with_capacity(items.len());
                    for (position, item) in items.iter().enumerate() {
                        let element = if field.kind.is_embedded() {
                            Self::hydrate_embedded(
                                metadata,
                                objects,
                                tracker,
                                association,
                                item,
                                ParentAssociation {
                                    owner: target,
                                    field: field.name.clone(),
                                    position: Some(position),
                                },
                            )?
                        } else {
                            Self::hydrate_reference(metadata, objects, tracker, association, item)?
                        };
                        elements.push(element);
                    }
                    object
                        .collections
                        .insert(field.name.clone(), PersistentCollection::loaded(elements));
                }
            }
        }
        objects.replace(target, ObjectData::Loaded(object));
        Ok(())
    }

    fn hydrate_embedded(
        metadata: &MetadataRegistry,
        objects: &mut Arena,
        tracker: &mut ObjectTracker,
        association: &Association,
        json: &JsonValue,
        parent: ParentAssociation,
    ) -> Result<ObjectId> {
        let JsonValue::Object(raw) = json else {
            return Err(Error::InvalidValue {
                field: parent.field.clone(),
                detail: format!("expected an embedded document, found {json}"),
            });
        };
        let requested = metadata.get(&association.target)?;
        let class = Self::resolve_class(metadata, requested, raw)?.clone();
        let child = objects.allocate(ObjectData::Loaded(Object::blank(&class)));
        tracker.track(child, &class, ObjectState::Managed);
        tracker.set_parent(child, parent);
        Self::hydrate(metadata, objects, tracker, child, &class, raw)?;
        Ok(child)
    }

    fn hydrate_reference(
        metadata: &MetadataRegistry,
        objects: &mut Arena,
        tracker: &mut ObjectTracker,
        association: &Association,
        json: &JsonValue,
    ) -> Result<ObjectId> {
        let mut class = metadata.get(&association.target)?;
        let id_json = match (association.storage, json) {
            (ReferenceStorage::Ref, JsonValue::Object(reference)) => {
                class = Self::resolve_class(metadata, class, reference)?;
                reference.get("$id").ok_or_else(|| Error::InvalidValue {
                    field: association.target.clone(),
                    detail: "reference without `$id`".into(),
                })?
            }
            _ => json,
        };
        let id_type = class
            .id_strategy()
            .map(|s| s.field_type())
            .unwrap_or(FieldType::Id);
        let id = Identifier::from_json(id_json, id_type)?;
        if let Some(existing) = tracker.resolve(class, &id) {
            return Ok(existing);
        }
        let proxy = objects.allocate(ObjectData::Unloaded {
            class: class.name.clone(),
            id: id.clone(),
        });
        tracker.track(proxy, class, ObjectState::Managed);
        tracker.register_identity(proxy, id)?;
        Ok(proxy)
    }
}

pub(crate) fn scalar_to_json(field: &str, value: &Value) -> Result<JsonValue> {
    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::Bool(v) => JsonValue::Bool(*v),
        Value::Int(v) => JsonValue::from(*v),
        Value::Float(v) => serde_json::Number::from_f64(*v)
            .map(JsonValue::Number)
            .ok_or_else(|| Error::InvalidValue {
                field: field.to_owned(),
                detail: format!("{v} cannot be stored"),
            })?,
        Value::String(v) => JsonValue::String(v.clone()),
        Value::DateTime(v) => JsonValue::String(v.to_rfc3339_opts(SecondsFormat::Micros, false)),
        Value::Timestamp(v) => JsonValue::String(v.to_rfc3339_opts(SecondsFormat::Micros, true)),
        Value::Uuid(v) => JsonValue::String(v.to_string()),
        Value::Json(v) => v.clone(),
        Value::Embedded(_) | Value::Reference(_) => {
            return Err(Error::InvalidValue {
                field: field.to_owned(),
                detail: "association value in a scalar field".into(),
            });
        }
    })
}

pub(crate) fn scalar_from_json(field: &str, ty: FieldType, json: &JsonValue) -> Result<Value> {
    let invalid = || Error::InvalidValue {
        field: field.to_owned(),
        detail: format!("{json} is not a valid {ty:?}"),
    };
    Ok(match ty {
        FieldType::Id => match json {
            JsonValue::Number(n) => Value::Int(n.as_i64().ok_or_else(invalid)?),
            JsonValue::String(s) => Value::String(s.clone()),
            _ => return Err(invalid()),
        },
        FieldType::String => Value::String(json.as_str().ok_or_else(invalid)?.to_owned()),
        FieldType::Int => Value::Int(json.as_i64().ok_or_else(invalid)?),
        FieldType::Float => Value::Float(json.as_f64().ok_or_else(invalid)?),
        FieldType::Bool => Value::Bool(json.as_bool().ok_or_else(invalid)?),
        FieldType::Date => {
            let raw = json.as_str().ok_or_else(invalid)?;
            Value::DateTime(DateTime::parse_from_rfc3339(raw).map_err(|_| invalid())?)
        }
        FieldType::Timestamp => {
            let raw = json.as_str().ok_or_else(invalid)?;
            let parsed = DateTime::parse_from_rfc3339(raw).map_err(|_| invalid())?;
            Value::Timestamp(parsed.with_timezone(&Utc))
        }
        FieldType::Uuid => {
            let raw = json.as_str().ok_or_else(invalid)?;
            Value::Uuid(Uuid::parse_str(raw).map_err(|_| invalid())?)
        }
        FieldType::Json => Value::Json(json.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn scalars_round_trip_through_json() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let json = scalar_to_json("at", &Value::Timestamp(ts)).unwrap();
        assert_eq!(json, json!("2024-05-06T07:08:09.000000Z"));
        assert_eq!(
            scalar_from_json("at", FieldType::Timestamp, &json).unwrap(),
            Value::Timestamp(ts)
        );
        assert!(scalar_from_json("n", FieldType::Int, &json!("1")).is_err());
        assert!(scalar_to_json("f", &Value::Float(f64::INFINITY)).is_err());
    }
}
