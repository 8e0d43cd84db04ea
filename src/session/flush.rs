use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::{
    ConflictKind, Error, Result,
    cascade::CascadePlanner,
    changeset::{ChangeSet, ChangeSetComputer, FieldChange, embedded_descendants, snapshot_tree},
    commit_order::CommitOrderCalculator,
    graph::Graph,
    hydrator::Source,
    identity::ObjectState,
    metadata::{FieldType, MetadataRegistry},
    metrics,
    object::ObjectId,
    path::FieldPath,
    persister::{CollectionPersister, DocumentPersister},
    value::{Identifier, Value},
};

use super::DocumentSession;

/// Writes issued by one flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
}

impl FlushReport {
    pub fn writes(&self) -> usize {
        self.inserted + self.updated + self.removed
    }

    pub fn is_empty(&self) -> bool {
        self.writes() == 0
    }
}

struct FlushPlan {
    inserts: Vec<ObjectId>,
    updates: Vec<ChangeSet>,
    removals: Vec<ObjectId>,
}

impl DocumentSession {
    /// Write every pending change: inserts in commit order, then the
    /// reference fields inserts had to defer, then updates, then deletes in
    /// reverse commit order.
    ///
    /// Everything that can be rejected without the store is rejected before
    /// the first write. A failing write stops the flush; earlier writes stay
    /// applied and the failed object keeps its pending changes.
    #[instrument(skip_all, fields(tracked = self.tracker.len()))]
    pub async fn flush(&mut self) -> Result<FlushReport> {
        metrics::record_flush();
        let roots = self
            .tracker
            .documents_in(&[ObjectState::Managed, ObjectState::New]);
        self.cascade_persist(&roots, false).await?;
        let orphans = self.remove_orphans().await?;

        let plan = self.plan_flush()?;
        let mut report = FlushReport::default();

        let mut deferred = Vec::new();
        for object in &plan.inserts {
            let fields = self.execute_insert(*object).await?;
            if !fields.is_empty() {
                deferred.push((*object, fields));
            }
            report.inserted += 1;
        }
        for (object, fields) in &deferred {
            self.execute_deferred(*object, fields).await?;
        }
        for change_set in &plan.updates {
            if self.execute_update(change_set).await? {
                report.updated += 1;
            }
        }
        for object in &plan.removals {
            self.execute_delete(*object).await?;
            report.removed += 1;
        }

        info!(
            inserted = report.inserted,
            updated = report.updated,
            removed = report.removed,
            deferred = deferred.len(),
            orphans,
            "flush complete"
        );
        Ok(report)
    }

    async fn remove_orphans(&mut self) -> Result<usize> {
        let orphans = CascadePlanner::new(self.graph()).orphans()?;
        for orphan in &orphans {
            self.cascade_remove(*orphan).await?;
        }
        if !orphans.is_empty() {
            metrics::record_orphans_removed(orphans.len() as u64);
            debug!(count = orphans.len(), "orphans scheduled for removal");
        }
        Ok(orphans.len())
    }

    fn plan_flush(&self) -> Result<FlushPlan> {
        let graph = self.graph();
        let computer = ChangeSetComputer::new(graph);
        let persister = DocumentPersister::new(graph);

        let mut updates = Vec::new();
        for object in self.tracker.documents_in(&[ObjectState::Managed]) {
            if !graph.is_loaded(object) || self.tracker.entry(object).is_some_and(|e| e.is_read_only()) {
                continue;
            }
            let change_set = computer.compute(object)?;
            if change_set.is_empty() {
                continue;
            }
            persister.check_shard_key(&change_set)?;
            check_placement(graph, &change_set, &FieldPath::default())?;
            updates.push(change_set);
        }

        let insert_order = commit_order(graph, &self.inserts, true)?;
        let inserts = ordered(graph, &self.inserts, &insert_order)?;

        // Cyclic removals keep registration order.
        let mut removals = match commit_order(graph, &self.removals, false) {
            Ok(order) => ordered(graph, &self.removals, &order)?,
            Err(Error::CascadeCycle { .. }) => self.removals.clone(),
            Err(err) => return Err(err),
        };
        removals.reverse();

        Ok(FlushPlan {
            inserts,
            updates,
            removals,
        })
    }

    /// Insert one scheduled document. Returns the reference fields that were
    /// left out because their targets have no identifier yet.
    async fn execute_insert(&mut self, object: ObjectId) -> Result<Vec<String>> {
        let class = self.class(object)?;
        if let Some(version_field) = &class.version_field {
            let loaded = self.objects.loaded_mut(object)?;
            if loaded.field(version_field).is_null() {
                loaded.fields.insert(version_field.clone(), Value::Int(1));
            }
        }

        let rendered = DocumentPersister::new(self.graph()).insert_document(object)?;
        let collection = class.collection_name()?;
        let started = Instant::now();
        let id_json = self.context.store.insert(collection, rendered.document).await?;
        self.observe_write(started, collection, "insert");
        metrics::record_doc_write(1);

        if self.tracker.identifier(object).is_none() {
            let id_type = class
                .id_strategy()
                .map(|s| s.field_type())
                .unwrap_or(FieldType::Id);
            let id = Identifier::from_json(&id_json, id_type)?;
            if let Some(field) = class.identifier_field() {
                self.objects
                    .loaded_mut(object)?
                    .fields
                    .insert(field.to_owned(), id.to_value());
            }
            self.tracker.register_identity(object, id)?;
        }
        debug!(%collection, %object, "inserted");

        let metadata = self.context.metadata.clone();
        snapshot_tree(&metadata, &mut self.objects, &mut self.tracker, object)?;
        self.inserts.retain(|o| *o != object);

        // Deferred fields count as never written until their update lands.
        for name in &rendered.deferred {
            let field = class.require_field(name)?;
            if field.kind.is_collection() {
                if let Some(collection) = self.objects.loaded_mut(object)?.collection_mut(name) {
                    collection.reset_baseline();
                }
            } else if let Some(snapshot) = self.tracker.entry_mut(object).and_then(|e| e.snapshot.as_mut()) {
                snapshot.fields.insert(name.clone(), Value::Null);
            }
        }
        Ok(rendered.deferred)
    }

    async fn execute_deferred(&mut self, object: ObjectId, fields: &[String]) -> Result<()> {
        let class = self.class(object)?;
        let (predicate, write) = DocumentPersister::new(self.graph()).deferred_update(object, fields)?;
        let collection = class.collection_name()?;
        let started = Instant::now();
        let matched = self.context.store.update(collection, &predicate, &write).await?;
        self.observe_write(started, collection, "update");
        if matched == 0 {
            return Err(Error::DocNotFound);
        }
        metrics::record_doc_write(1);
        debug!(%collection, %object, fields = fields.len(), "deferred references written");

        let metadata = self.context.metadata.clone();
        snapshot_tree(&metadata, &mut self.objects, &mut self.tracker, object)
    }

    /// Issue the update for `change_set`. Returns `false` when nothing had to
    /// be written.
    async fn execute_update(&mut self, change_set: &ChangeSet) -> Result<bool> {
        let object = change_set.object();
        let Some(prepared) = DocumentPersister::new(self.graph()).update(change_set)? else {
            return Ok(false);
        };
        let class = self.class(object)?;
        let collection = class.collection_name()?;
        let started = Instant::now();
        let matched = self
            .context
            .store
            .update(collection, &prepared.predicate, &prepared.write)
            .await?;
        self.observe_write(started, collection, "update");
        if matched == 0 {
            return Err(self.diagnose_conflict(object, prepared.expected_version).await);
        }
        metrics::record_doc_write(1);

        if let (Some(version_field), Some(version)) = (&class.version_field, prepared.new_version) {
            self.objects
                .loaded_mut(object)?
                .fields
                .insert(version_field.clone(), Value::Int(version));
        }
        debug!(%collection, %object, fields = change_set.len(), "updated");

        let metadata = self.context.metadata.clone();
        snapshot_tree(&metadata, &mut self.objects, &mut self.tracker, object)?;
        Ok(true)
    }

    async fn execute_delete(&mut self, object: ObjectId) -> Result<()> {
        let class = self.class(object)?;
        let predicate = DocumentPersister::new(self.graph()).delete_predicate(object)?;
        let collection = class.collection_name()?;
        let started = Instant::now();
        let matched = self.context.store.delete(collection, &predicate).await?;
        self.observe_write(started, collection, "delete");
        if matched == 0 && class.is_lockable() {
            if let Some(id) = self.graph().identifier(object) {
                if self.fetch(&class, &id).await?.is_some() {
                    return Err(self.conflict_error(&class.name, &id, ConflictKind::Locked));
                }
            }
        }
        metrics::record_doc_write(matched);
        debug!(%collection, %object, matched, "deleted");

        let metadata = self.context.metadata.clone();
        let mut gone = embedded_descendants(&metadata, &self.objects, &self.tracker, object, Source::Current)?;
        gone.extend(embedded_descendants(
            &metadata,
            &self.objects,
            &self.tracker,
            object,
            Source::Snapshot,
        )?);
        for child in gone {
            self.tracker.forget(child);
        }
        self.tracker.forget(object);
        self.removals.retain(|o| *o != object);
        Ok(())
    }

    /// Work out why a conditional update matched nothing.
    async fn diagnose_conflict(&self, object: ObjectId, expected_version: Option<i64>) -> Error {
        let class = match self.class(object) {
            Ok(class) => class,
            Err(err) => return err,
        };
        let Some(id) = self.graph().identifier(object) else {
            return Error::DocNotFound;
        };
        let stored = match self.fetch(&class, &id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return Error::DocNotFound,
            Err(err) => return err,
        };

        if let Some(lock) = &class.lock_field {
            let held = self
                .tracker
                .entry(object)
                .and_then(|e| e.lock())
                .map(|mode| serde_json::Value::from(mode.marker()));
            match stored.get(lock) {
                Some(marker) if !marker.is_null() && Some(marker) != held.as_ref() => {
                    return self.conflict_error(&class.name, &id, ConflictKind::Locked);
                }
                _ => {}
            }
        }
        if class.is_versioned() {
            return self.conflict_error(
                &class.name,
                &id,
                ConflictKind::Version {
                    expected: expected_version.unwrap_or(0),
                },
            );
        }
        Error::DocNotFound
    }

    fn observe_write(&self, started: Instant, collection: &str, op: &'static str) {
        let Some(threshold) = self.context.options.slow_write_threshold else {
            return;
        };
        let elapsed = started.elapsed();
        if elapsed >= threshold {
            warn!(
                target: "rillodm::slow_write",
                collection,
                op,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow document write"
            );
        }
    }
}

/// Reject strategy placements that only surface on a nested path.
fn check_placement(graph: Graph<'_>, change_set: &ChangeSet, base: &FieldPath) -> Result<()> {
    let class = graph.class(change_set.object())?;
    for (name, change) in change_set.changes() {
        let field = class.require_field(name)?;
        let path = base.child(field.stored_name.clone());
        match change {
            FieldChange::Nested(nested) => check_placement(graph, nested, &path)?,
            FieldChange::Collection(diff) => {
                if let Some(association) = field.kind.association() {
                    CollectionPersister::new(&class.name, path.clone(), association)?;
                }
                for (position, nested) in &diff.dirty_elements {
                    check_placement(graph, nested, &path.index(*position))?;
                }
            }
            FieldChange::Value { .. } => {}
        }
    }
    Ok(())
}

/// Class order for `objects`. A class depends on another when one of its
/// objects references a scheduled object of that class whose identifier only
/// the store can assign. With `pending_only`, targets that already have an
/// identifier add no edge.
fn commit_order(graph: Graph<'_>, objects: &[ObjectId], pending_only: bool) -> Result<Vec<String>> {
    let metadata: &MetadataRegistry = graph.metadata;
    let scheduled: HashSet<ObjectId> = objects.iter().copied().collect();
    let mut calculator = CommitOrderCalculator::new();
    for object in objects {
        calculator.add_class(&graph.class(*object)?.name);
    }

    for object in objects {
        let class = graph.class(*object)?;
        let mut sources = vec![*object];
        sources.extend(embedded_descendants(
            metadata,
            graph.objects,
            graph.tracker,
            *object,
            Source::Current,
        )?);
        for source in sources {
            for edge in graph.edges(source)? {
                if !edge.field.kind.is_reference() || !scheduled.contains(&edge.target) {
                    continue;
                }
                let target = graph.class(edge.target)?;
                let store_assigned = target.id_strategy().is_some_and(|s| s.assigned_by_store());
                if !store_assigned || (pending_only && graph.identifier(edge.target).is_some()) {
                    continue;
                }
                calculator.add_dependency(&class.name, &target.name);
            }
        }
    }
    calculator.sort()
}

/// `objects` sorted by the position of their class in `order`, keeping
/// registration order within a class.
fn ordered(graph: Graph<'_>, objects: &[ObjectId], order: &[String]) -> Result<Vec<ObjectId>> {
    let rank: HashMap<&str, usize> = order
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();
    let mut ranked = Vec::with_capacity(objects.len());
    for object in objects {
        let class = graph.objects.class_of(*object)?;
        ranked.push((rank.get(class).copied().unwrap_or(usize::MAX), *object));
    }
    ranked.sort_by_key(|(rank, _)| *rank);
    Ok(ranked.into_iter().map(|(_, object)| object).collect())
}
