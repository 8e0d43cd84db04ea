use serde_json::Value as JsonValue;

use crate::{
    Error, Result,
    backend::FieldOp,
    changeset::CollectionChange,
    graph::Graph,
    hydrator::{FieldJson, Hydrator, Source},
    metadata::{Association, CollectionStrategy, FieldMapping},
    object::ObjectId,
    path::FieldPath,
};

use super::embedded_ops;

/// What the owning document's update has to carry for one collection.
#[derive(Clone, Debug, PartialEq)]
pub enum CollectionWrite {
    Ops(Vec<FieldOp>),
    /// An atomic strategy: the owning document is rewritten as a whole.
    SatisfiedByDocumentWrite,
}

/// Turns a collection diff into field ops using the association's strategy.
#[derive(Clone, Debug)]
pub struct CollectionPersister {
    owner: String,
    path: FieldPath,
    strategy: CollectionStrategy,
}

impl CollectionPersister {
    /// Fails when an atomic strategy sits anywhere but directly on a
    /// top-level document.
    pub fn new(owner_class: &str, path: FieldPath, association: &Association) -> Result<Self> {
        if association.strategy.is_atomic() && !path.is_top_level() {
            return Err(Error::CollectionStrategyPlacement {
                class: owner_class.to_owned(),
                path: path.to_string(),
                strategy: association.strategy.to_string(),
            });
        }
        Ok(Self {
            owner: owner_class.to_owned(),
            path,
            strategy: association.strategy,
        })
    }

    pub fn strategy(&self) -> CollectionStrategy {
        self.strategy
    }

    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    pub(crate) fn write(
        &self,
        graph: Graph<'_>,
        owner: ObjectId,
        field: &FieldMapping,
        change: &CollectionChange,
    ) -> Result<CollectionWrite> {
        if self.strategy.is_atomic() {
            return Ok(CollectionWrite::SatisfiedByDocumentWrite);
        }
        if change.new_collection || change.cleared {
            return Ok(CollectionWrite::Ops(vec![self.set_whole(graph, owner, field)?]));
        }

        let structural = !change.inserted.is_empty() || !change.deleted.is_empty();
        let rewrite = structural
            && (self.strategy == CollectionStrategy::Set
                || !self.appends_preserve_order(graph, owner, field, change)?);
        let mut ops = Vec::new();
        if rewrite {
            ops.push(self.set_whole(graph, owner, field)?);
        } else {
            for (position, nested) in &change.dirty_elements {
                embedded_ops(graph, nested, &self.path.index(*position), &mut ops)?;
            }
            if !change.deleted.is_empty() {
                ops.push(FieldOp::PullAt(
                    self.path.clone(),
                    change.deleted.iter().map(|(position, _)| *position).collect(),
                ));
            }
            if !change.inserted.is_empty() {
                let values = self.elements_json(graph, field, &change.inserted)?;
                ops.push(match self.strategy {
                    CollectionStrategy::AddToSet => FieldOp::AddToSet(self.path.clone(), values),
                    _ => FieldOp::Push(self.path.clone(), values),
                });
            }
        }
        Ok(CollectionWrite::Ops(ops))
    }

    /// Pulling deleted positions and appending the inserted elements yields
    /// the in-memory order.
    fn appends_preserve_order(
        &self,
        graph: Graph<'_>,
        owner: ObjectId,
        field: &FieldMapping,
        change: &CollectionChange,
    ) -> Result<bool> {
        let loaded = graph.loaded(owner)?;
        let Some(collection) = loaded.collection(&field.name) else {
            return Ok(false);
        };
        let expected: Vec<ObjectId> = collection
            .retained()
            .into_iter()
            .map(|(_, element)| element)
            .chain(change.inserted.iter().copied())
            .collect();
        Ok(expected == collection.elements())
    }

    fn set_whole(&self, graph: Graph<'_>, owner: ObjectId, field: &FieldMapping) -> Result<FieldOp> {
        match Hydrator::field_json(graph, owner, field, Source::Current)? {
            FieldJson::Value(json) => Ok(FieldOp::Set(self.path.clone(), json)),
            FieldJson::Absent => Ok(FieldOp::Set(self.path.clone(), JsonValue::Array(Vec::new()))),
            FieldJson::Pending => Err(self.pending()),
        }
    }

    fn elements_json(&self, graph: Graph<'_>, field: &FieldMapping, elements: &[ObjectId]) -> Result<Vec<JsonValue>> {
        elements
            .iter()
            .map(|element| match Hydrator::element_json(graph, &field.kind, *element, Source::Current)? {
                FieldJson::Value(json) => Ok(json),
                FieldJson::Absent => Ok(JsonValue::Null),
                FieldJson::Pending => Err(self.pending()),
            })
            .collect()
    }

    fn pending(&self) -> Error {
        Error::Mapping(format!(
            "`{}.{}` holds an element without an identifier",
            self.owner, self.path
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_strategies_require_a_top_level_field() {
        let atomic = Association::to("Line").strategy(CollectionStrategy::AtomicSetArray);
        assert!(CollectionPersister::new("Order", FieldPath::root("lines"), &atomic).is_ok());

        let nested = FieldPath::root("sections").index(0).child("lines");
        let err = CollectionPersister::new("Order", nested, &atomic).unwrap_err();
        assert!(matches!(err, Error::CollectionStrategyPlacement { .. }));

        let plain = Association::to("Line").strategy(CollectionStrategy::PushAll);
        let nested = FieldPath::root("sections").index(0).child("lines");
        assert!(CollectionPersister::new("Order", nested, &plain).is_ok());
    }
}
