use std::collections::HashSet;

use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    ConflictKind, Error, Result,
    backend::{FieldOp, Write},
    cascade::{CascadePlanner, PlannedStep},
    changeset::embedded_descendants,
    hydrator::Source,
    identity::{LockMode, ObjectState, ParentAssociation},
    metadata::{CascadeOp, IdStrategy},
    metrics,
    object::ObjectId,
    path::FieldPath,
    persister::DocumentPersister,
    value::Identifier,
};

use super::DocumentSession;

impl DocumentSession {
    /// Make `object` part of the unit of work. It is inserted at the next
    /// flush, together with everything reachable through embedded fields and
    /// persist-cascading references.
    #[instrument(skip_all, fields(object = %object))]
    pub async fn persist(&mut self, object: ObjectId) -> Result<()> {
        let class = self.class(object)?;
        if class.embedded {
            return Err(Error::Mapping(format!(
                "embedded {} is persisted through its owner",
                class.name
            )));
        }
        if self.tracker.state(object) == Some(ObjectState::Detached) {
            return Err(Error::DetachedObject {
                class: class.name.clone(),
            });
        }
        self.cascade_persist(&[object], true).await
    }

    /// Walk the persist cascade from `roots`, tracking new embedded objects
    /// and scheduling new documents. With `revive`, removed objects reached
    /// on the way become managed again.
    pub(crate) async fn cascade_persist(&mut self, roots: &[ObjectId], revive: bool) -> Result<()> {
        let mut steps: Vec<PlannedStep> = Vec::new();
        {
            let mut planner = CascadePlanner::new(self.graph());
            for root in roots {
                steps.extend(planner.plan(*root, CascadeOp::Persist)?.steps);
            }
        }

        for step in &steps {
            if self.tracker.state(step.object).is_none() {
                self.check_assignable_id(step.object)?;
            }
        }

        for step in steps {
            let class = self.class(step.object)?;
            match self.tracker.state(step.object) {
                None if class.embedded => {
                    self.tracker.track(step.object, &class, ObjectState::New);
                    if let Some((owner, field)) = step.via {
                        self.tracker.set_parent(
                            step.object,
                            ParentAssociation {
                                owner,
                                field,
                                position: step.position,
                            },
                        );
                    }
                }
                None => self.schedule_insert(step.object).await?,
                Some(ObjectState::Removed) if revive => {
                    if let Some(entry) = self.tracker.entry_mut(step.object) {
                        entry.state = ObjectState::Managed;
                    }
                    self.removals.retain(|o| *o != step.object);
                    debug!(object = %step.object, "removal cancelled");
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Manual identifiers must be set before anything is scheduled.
    fn check_assignable_id(&self, object: ObjectId) -> Result<()> {
        let class = self.class(object)?;
        if let Some(IdStrategy::Manual(_)) = class.id_strategy() {
            if self.graph().identifier(object).is_none() {
                return Err(Error::MissingIdentifier {
                    class: class.name.clone(),
                });
            }
        }
        Ok(())
    }

    async fn schedule_insert(&mut self, object: ObjectId) -> Result<()> {
        let class = self.class(object)?;
        let strategy = class.id_strategy().ok_or_else(|| Error::MissingIdentifier {
            class: class.name.clone(),
        })?;
        let id = match (strategy, self.graph().identifier(object)) {
            (_, Some(id)) => Some(id),
            (IdStrategy::Uuid, None) => Some(Identifier::Uuid(Uuid::new_v4())),
            (IdStrategy::Increment, None) => {
                let name = self.context.options.sequence_name(class.collection_name()?);
                Some(Identifier::Int(self.context.store.next_sequence(&name).await?))
            }
            (IdStrategy::Manual(_), None) => {
                return Err(Error::MissingIdentifier {
                    class: class.name.clone(),
                });
            }
            (IdStrategy::Store, None) => None,
        };

        if let Some(id) = &id {
            if let Some(existing) = self.tracker.resolve(&class, id) {
                if existing != object {
                    return Err(Error::IdentityConflict {
                        class: class.name.clone(),
                        id: id.to_string(),
                    });
                }
            }
        }

        self.tracker.track(object, &class, ObjectState::New);
        if let Some(id) = id {
            if let Some(field) = class.identifier_field() {
                self.objects
                    .loaded_mut(object)?
                    .fields
                    .insert(field.to_owned(), id.to_value());
            }
            self.tracker.register_identity(object, id)?;
        }
        self.inserts.push(object);
        debug!(class = %class.name, %object, "scheduled insert");
        Ok(())
    }

    /// Schedule `object` for deletion at the next flush, cascading along
    /// remove-cascading references. A new object is simply forgotten.
    #[instrument(skip_all, fields(object = %object))]
    pub async fn remove(&mut self, object: ObjectId) -> Result<()> {
        let class = self.class(object)?;
        match self.tracker.state(object) {
            None | Some(ObjectState::Detached) => {
                return Err(Error::UnmanagedObject {
                    class: class.name.clone(),
                });
            }
            Some(ObjectState::Removed) => return Ok(()),
            Some(_) => {}
        }
        if class.embedded {
            return Err(Error::Mapping(format!(
                "embedded {} is removed through its owner",
                class.name
            )));
        }
        self.cascade_remove(object).await
    }

    pub(crate) async fn cascade_remove(&mut self, root: ObjectId) -> Result<()> {
        let mut missing = HashSet::new();
        let plan = loop {
            let plan = CascadePlanner::new(self.graph()).plan(root, CascadeOp::Remove)?;
            let pending: Vec<ObjectId> = plan
                .unloaded
                .iter()
                .copied()
                .filter(|o| !missing.contains(o))
                .collect();
            if pending.is_empty() {
                break plan;
            }
            // Cascades continue through lazy handles, so load them first.
            for proxy in pending {
                match self.ensure_loaded(proxy).await {
                    Ok(()) => {}
                    Err(Error::DocNotFound) => {
                        missing.insert(proxy);
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        for step in plan.steps {
            self.schedule_removal(step.object)?;
        }
        Ok(())
    }

    fn schedule_removal(&mut self, object: ObjectId) -> Result<()> {
        let embedded = self.class(object)?.embedded;
        match self.tracker.state(object) {
            Some(ObjectState::New) => {
                self.inserts.retain(|o| *o != object);
                self.tracker.forget(object);
            }
            Some(ObjectState::Managed) => {
                if let Some(entry) = self.tracker.entry_mut(object) {
                    entry.state = ObjectState::Removed;
                }
                if !embedded && !self.removals.contains(&object) {
                    self.removals.push(object);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Stop tracking `object` and whatever detach cascades to. Pending
    /// changes are discarded and its identity is released.
    pub fn detach(&mut self, object: ObjectId) -> Result<()> {
        if self.tracker.state(object).is_none() {
            return Ok(());
        }
        let plan = CascadePlanner::new(self.graph()).plan(object, CascadeOp::Detach)?;
        for step in plan.steps {
            self.tracker.detach(step.object);
            self.inserts.retain(|o| *o != step.object);
            self.removals.retain(|o| *o != step.object);
        }
        Ok(())
    }

    /// Overwrite `object` and whatever refresh cascades to with the stored
    /// state, dropping pending changes.
    #[instrument(skip_all, fields(object = %object))]
    pub async fn refresh(&mut self, object: ObjectId) -> Result<()> {
        if self.tracker.state(object) != Some(ObjectState::Managed) {
            return Err(Error::UnmanagedObject {
                class: self.class(object)?.name.clone(),
            });
        }
        let plan = CascadePlanner::new(self.graph()).plan(object, CascadeOp::Refresh)?;
        for step in plan.steps {
            let class = self.class(step.object)?;
            if class.embedded
                || !self.is_loaded(step.object)
                || self.tracker.state(step.object) != Some(ObjectState::Managed)
            {
                continue;
            }
            let Some(id) = self.graph().identifier(step.object) else {
                continue;
            };
            let raw = self.fetch(&class, &id).await?.ok_or(Error::DocNotFound)?;

            let metadata = self.context.metadata.clone();
            let mut stale =
                embedded_descendants(&metadata, &self.objects, &self.tracker, step.object, Source::Current)?;
            stale.extend(embedded_descendants(
                &metadata,
                &self.objects,
                &self.tracker,
                step.object,
                Source::Snapshot,
            )?);
            for child in stale {
                self.tracker.forget(child);
            }

            let root = metadata.get(&class.root)?.clone();
            self.hydrate_into(Some(step.object), &root, &raw)?
                .ok_or(Error::DocNotFound)?;
            debug!(object = %step.object, "refreshed");
        }
        Ok(())
    }

    /// Lock `object`. An optimistic lock only checks `expected_version`
    /// against the loaded version; pessimistic modes also write the lock
    /// marker, failing when another holder set it first.
    #[instrument(skip_all, fields(object = %object, mode = ?mode))]
    pub async fn lock(&mut self, object: ObjectId, mode: LockMode, expected_version: Option<i64>) -> Result<()> {
        let class = self.class(object)?;
        if class.embedded || self.tracker.state(object) != Some(ObjectState::Managed) {
            return Err(Error::UnmanagedObject {
                class: class.name.clone(),
            });
        }
        self.ensure_loaded(object).await?;
        let id = self.graph().identifier(object).ok_or_else(|| Error::MissingIdentifier {
            class: class.name.clone(),
        })?;

        let version_stored = match &class.version_field {
            Some(field) => Some((field.clone(), class.require_field(field)?.stored_name.clone())),
            None => None,
        };
        if let Some(expected) = expected_version {
            let Some((field, _)) = &version_stored else {
                return Err(Error::Mapping(format!("{} is not versioned", class.name)));
            };
            let current = self
                .tracker
                .entry(object)
                .and_then(|e| e.snapshot())
                .and_then(|s| s.get(field).as_i64());
            if current != Some(expected) {
                return Err(self.conflict_error(&class.name, &id, ConflictKind::Version { expected }));
            }
        }

        if mode == LockMode::Optimistic {
            if version_stored.is_none() {
                return Err(Error::Mapping(format!("{} is not versioned", class.name)));
            }
            return Ok(());
        }

        let lock_field = class
            .lock_field
            .clone()
            .ok_or_else(|| Error::Mapping(format!("{} has no lock field", class.name)))?;
        let held = self.tracker.entry(object).and_then(|e| e.lock());
        let mut predicate = DocumentPersister::new(self.graph()).identity_predicate(object)?;
        predicate = match held {
            Some(held) if held != LockMode::Optimistic => {
                predicate.eq(lock_field.as_str(), JsonValue::from(held.marker()))
            }
            _ => predicate.missing(lock_field.as_str()),
        };
        if let (Some(expected), Some((_, stored))) = (expected_version, &version_stored) {
            predicate = predicate.eq(stored.as_str(), JsonValue::from(expected));
        }
        let write = Write::Fields(vec![FieldOp::Set(
            FieldPath::root(lock_field),
            JsonValue::from(mode.marker()),
        )]);

        let collection = class.collection_name()?;
        let matched = self.context.store.update(collection, &predicate, &write).await?;
        if matched == 0 {
            return Err(self.conflict_error(&class.name, &id, ConflictKind::Locked));
        }
        metrics::record_doc_write(1);
        if let Some(entry) = self.tracker.entry_mut(object) {
            entry.lock = Some(mode);
        }
        debug!(%id, "locked");
        Ok(())
    }

    /// Release a pessimistic lock this session holds.
    #[instrument(skip_all, fields(object = %object))]
    pub async fn unlock(&mut self, object: ObjectId) -> Result<()> {
        let class = self.class(object)?;
        if class.embedded || self.tracker.state(object) != Some(ObjectState::Managed) {
            return Err(Error::UnmanagedObject {
                class: class.name.clone(),
            });
        }
        let lock_field = class
            .lock_field
            .clone()
            .ok_or_else(|| Error::Mapping(format!("{} has no lock field", class.name)))?;
        let id = self.graph().identifier(object).ok_or_else(|| Error::MissingIdentifier {
            class: class.name.clone(),
        })?;

        let held = self.tracker.entry(object).and_then(|e| e.lock());
        let mut predicate = DocumentPersister::new(self.graph()).identity_predicate(object)?;
        // A marker this session did not set is never cleared.
        predicate = match held.filter(|m| *m != LockMode::Optimistic) {
            Some(held) => predicate.eq(lock_field.as_str(), JsonValue::from(held.marker())),
            None => predicate.missing(lock_field.as_str()),
        };
        let write = Write::Fields(vec![FieldOp::Unset(FieldPath::root(lock_field))]);

        let collection = class.collection_name()?;
        let matched = self.context.store.update(collection, &predicate, &write).await?;
        if matched == 0 {
            return Err(self.conflict_error(&class.name, &id, ConflictKind::Locked));
        }
        metrics::record_doc_write(matched);
        if let Some(entry) = self.tracker.entry_mut(object) {
            entry.lock = None;
        }
        debug!(%id, "unlocked");
        Ok(())
    }

    pub(crate) fn conflict_error(&self, class: &str, id: &Identifier, kind: ConflictKind) -> Error {
        metrics::record_doc_conflict();
        warn!(class, %id, %kind, "concurrency conflict");
        Error::ConcurrencyConflict {
            class: class.to_owned(),
            id: id.to_string(),
            kind,
        }
    }
}
