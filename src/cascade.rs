//! Propagation of lifecycle operations along associations.
//!
//! Embedded associations are always followed; references only when their
//! cascade set names the operation. A planner keeps one visited set for its
//! whole pass, so cyclic graphs terminate and an object reached from two
//! roots is planned once.

use std::collections::{HashSet, VecDeque};

use crate::{
    Error, Result,
    graph::Graph,
    identity::ObjectState,
    metadata::{CascadeOp, FieldKind},
    object::{ObjectData, ObjectId},
    value::Value,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedStep {
    pub object: ObjectId,
    pub op: CascadeOp,
    /// Owner and field the object was reached through; `None` for roots.
    pub via: Option<(ObjectId, String)>,
    /// Index in the owner's collection when reached through one.
    pub position: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct CascadePlan {
    pub steps: Vec<PlannedStep>,
    /// Reached lazy references whose own associations were not walked.
    pub unloaded: Vec<ObjectId>,
}

impl CascadePlan {
    pub fn objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.steps.iter().map(|s| s.object)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

pub(crate) struct CascadePlanner<'a> {
    graph: Graph<'a>,
    visited: HashSet<ObjectId>,
}

impl<'a> CascadePlanner<'a> {
    pub fn new(graph: Graph<'a>) -> Self {
        Self {
            graph,
            visited: HashSet::new(),
        }
    }

    /// Plan `op` from `root`, skipping anything this planner already visited.
    ///
    /// A persist pass also checks every reference it does not follow: the
    /// target must already be tracked and must not be detached.
    pub fn plan(&mut self, root: ObjectId, op: CascadeOp) -> Result<CascadePlan> {
        let mut plan = CascadePlan::default();
        if !self.visited.insert(root) {
            return Ok(plan);
        }
        let mut queue = VecDeque::from([PlannedStep {
            object: root,
            op,
            via: None,
            position: None,
        }]);

        while let Some(step) = queue.pop_front() {
            let object = step.object;
            if !self.graph.is_loaded(object) {
                plan.unloaded.push(object);
            }
            plan.steps.push(step);

            for edge in self.graph.edges(object)? {
                let follow = match &edge.field.kind {
                    FieldKind::EmbedOne(_) | FieldKind::EmbedMany(_) => true,
                    FieldKind::ReferenceOne(a) | FieldKind::ReferenceMany(a) => a.cascade.contains(op),
                    FieldKind::Scalar(_) => false,
                };
                if op == CascadeOp::Persist && edge.field.kind.is_reference() {
                    self.check_persist_target(object, &edge.field.name, edge.target, follow)?;
                }
                if follow && self.visited.insert(edge.target) {
                    queue.push_back(PlannedStep {
                        object: edge.target,
                        op,
                        via: Some((object, edge.field.name.clone())),
                        position: edge.position,
                    });
                }
            }
        }
        Ok(plan)
    }

    fn check_persist_target(&self, owner: ObjectId, field: &str, target: ObjectId, cascades: bool) -> Result<()> {
        match self.graph.tracker.state(target) {
            Some(ObjectState::Detached) => Err(Error::DetachedObject {
                class: self.graph.class(target)?.name.clone(),
            }),
            None if !cascades => Err(Error::NewObjectThroughRelationship {
                owner: self.graph.class(owner)?.name.clone(),
                field: field.to_owned(),
                class: self.graph.class(target)?.name.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Objects to remove because an orphan-removal association dropped them
    /// and no live object references them any more.
    pub fn orphans(&self) -> Result<Vec<ObjectId>> {
        let tracker = self.graph.tracker;
        let live = tracker.live_objects();
        let mut candidates = Vec::new();

        for &object in &live {
            let Some(ObjectData::Loaded(loaded)) = self.graph.objects.get(object) else {
                continue;
            };
            let Some(snapshot) = tracker.entry(object).and_then(|e| e.snapshot()) else {
                continue;
            };
            let class = self.graph.class(object)?;
            for field in &class.fields {
                match &field.kind {
                    FieldKind::ReferenceOne(a) if a.orphan_removal => {
                        if let Value::Reference(old) = snapshot.get(&field.name) {
                            if loaded.field(&field.name) != &Value::Reference(*old) {
                                candidates.push(*old);
                            }
                        }
                    }
                    FieldKind::ReferenceMany(a) if a.orphan_removal => {
                        if let Some(collection) = loaded.collection(&field.name) {
                            candidates.extend(collection.delete_diff().into_iter().map(|(_, e)| e));
                        }
                    }
                    _ => {}
                }
            }
        }

        if candidates.is_empty() {
            return Ok(candidates);
        }

        let mut referenced = HashSet::new();
        for &object in &live {
            for edge in self.graph.edges(object)? {
                if edge.field.kind.is_reference() {
                    referenced.insert(edge.target);
                }
            }
        }

        let mut seen = HashSet::new();
        candidates.retain(|candidate| {
            tracker.is_live(*candidate) && !referenced.contains(candidate) && seen.insert(*candidate)
        });
        Ok(candidates)
    }
}
