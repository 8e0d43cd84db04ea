//! Change sets to store writes.

use crate::{
    Error, Result,
    backend::FieldOp,
    changeset::{ChangeSet, FieldChange},
    graph::Graph,
    hydrator::{FieldJson, Hydrator, Source},
    metadata::FieldMapping,
    path::FieldPath,
    value::Value,
};

pub mod collection;
pub mod document;

pub use collection::{CollectionPersister, CollectionWrite};
pub use document::DocumentPersister;

/// Append the field ops for `change_set` below `base` (empty for a
/// top-level document). Returns whether an atomic collection asked for a
/// whole-document write instead.
pub(crate) fn change_ops(
    graph: Graph<'_>,
    change_set: &ChangeSet,
    base: &FieldPath,
    ops: &mut Vec<FieldOp>,
) -> Result<bool> {
    let object = change_set.object();
    let class = graph.class(object)?;
    let mut atomic = false;
    for (name, change) in change_set.changes() {
        let field = class.require_field(name)?;
        let path = base.child(field.stored_name.clone());
        match change {
            FieldChange::Value { new, .. } => ops.push(value_op(graph, field, new, path)?),
            FieldChange::Nested(nested) => {
                atomic |= change_ops(graph, nested, &path, ops)?;
            }
            FieldChange::Collection(diff) => {
                let association = field
                    .kind
                    .association()
                    .ok_or_else(|| Error::Mapping(format!("`{}.{name}` is not an association", class.name)))?;
                let persister = CollectionPersister::new(&class.name, path, association)?;
                match persister.write(graph, object, field, diff)? {
                    CollectionWrite::Ops(collection_ops) => ops.extend(collection_ops),
                    CollectionWrite::SatisfiedByDocumentWrite => atomic = true,
                }
            }
        }
    }
    Ok(atomic)
}

/// Ops for an embedded element's own changes at `base`.
pub(crate) fn embedded_ops(
    graph: Graph<'_>,
    change_set: &ChangeSet,
    base: &FieldPath,
    ops: &mut Vec<FieldOp>,
) -> Result<()> {
    if change_ops(graph, change_set, base, ops)? {
        return Err(Error::Mapping(format!(
            "atomic collection below `{base}` cannot be written in place"
        )));
    }
    Ok(())
}

fn value_op(graph: Graph<'_>, field: &FieldMapping, value: &Value, path: FieldPath) -> Result<FieldOp> {
    match Hydrator::value_json(graph, field, value, Source::Current)? {
        FieldJson::Value(json) => Ok(FieldOp::Set(path, json)),
        FieldJson::Absent => Ok(FieldOp::Unset(path)),
        FieldJson::Pending => Err(Error::Mapping(format!(
            "`{path}` references an object without an identifier"
        ))),
    }
}
