//! Two-phase rebind: persist the managed graph as mementos, and rebuild it.
//!
//! A load runs three strict barriers over the whole memento set:
//! 1. skeletons: every memento becomes a `Constructing` entity, no edges
//! 2. wiring: parent/child, location and member edges by id
//! 3. activation: parents before children; policies and subscriptions go
//!    live only here
//!
//! Problems local to one entity are recovered and listed in the
//! [`RebindReport`]; only manifest-level problems and I/O abort the load.

use crate::entity::EntityId;
use crate::error::RebindError;
use crate::policy::Policy;
use crate::snapshot::recovery::load_latest_snapshot;
use crate::snapshot::store::{LoadedSnapshot, SnapshotStore};
use crate::snapshot::{EntityMemento, RebindState, SnapshotSet};
use crate::state::EntityGraph;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Inert handle to an entity that will exist once the load completes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntityRef(EntityId);

impl EntityRef {
    pub fn id(&self) -> EntityId {
        self.0
    }
}

/// What a factory may see while rebuilding one entity: the ids in the
/// snapshot, nothing more
pub struct ReconstructContext<'a> {
    known: &'a HashSet<EntityId>,
}

impl<'a> ReconstructContext<'a> {
    pub fn lookup(&self, id: EntityId) -> Option<EntityRef> {
        self.known.contains(&id).then_some(EntityRef(id))
    }
}

/// Kind of edge a memento referenced
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Parent,
    Child,
    Location,
    Member,
}

/// Edge whose target was not rebound; the edge was dropped
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DanglingReference {
    pub from: EntityId,
    pub to: EntityId,
    pub relation: Relation,
}

/// Entity that could not be rebuilt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unrebindable {
    pub id: EntityId,
    pub reason: String,
}

/// Outcome of a load that got past manifest validation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebindReport {
    /// Activated entities, in activation order
    pub rebound: Vec<EntityId>,
    pub dangling: Vec<DanglingReference>,
    pub unrebindable: Vec<Unrebindable>,
}

impl RebindReport {
    pub fn is_clean(&self) -> bool {
        self.dangling.is_empty() && self.unrebindable.is_empty()
    }
}

/// Summary of a completed save
#[derive(Clone, Debug)]
pub struct SaveSummary {
    pub path: PathBuf,
    pub entities: usize,
}

/// Saves and restores the graph of one management context
pub struct RebindEngine {
    graph: Arc<EntityGraph>,
    store: SnapshotStore,
    state: Mutex<RebindState>,
    abort_requested: AtomicBool,
}

/// A rebuilt entity waiting for phases 2 and 3
struct Rebuilt {
    memento: EntityMemento,
    policies: Vec<Arc<dyn Policy>>,
}

impl RebindEngine {
    pub fn new(graph: Arc<EntityGraph>, store: SnapshotStore) -> Self {
        Self {
            graph,
            store,
            state: Mutex::new(RebindState::Idle),
            abort_requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> RebindState {
        *self.lock_state()
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Persist one memento per managed entity
    pub fn save(&self) -> Result<SaveSummary, RebindError> {
        self.begin(RebindState::Snapshotting)?;

        let set = SnapshotSet::capture(&self.graph);
        let result = self.store.write(&set).map(|path| SaveSummary {
            path,
            entities: set.entity_count(),
        });

        self.finish(&result);
        result
    }

    /// Rebuild from the newest valid snapshot; `None` on cold start
    pub fn load_latest(&self) -> Result<Option<RebindReport>, RebindError> {
        self.begin(RebindState::Loading)?;

        let result = load_latest_snapshot(&self.store)
            .and_then(|found| found.map(|snapshot| self.run_load(snapshot)).transpose());

        self.finish(&result);
        result
    }

    /// Rebuild from one snapshot directory
    pub fn load_from(&self, path: &Path) -> Result<RebindReport, RebindError> {
        self.begin(RebindState::Loading)?;

        let result = self
            .store
            .load(path)
            .and_then(|snapshot| self.run_load(snapshot));

        self.finish(&result);
        result
    }

    /// Rebuild the entities of a snapshot into the graph
    pub fn load(&self, snapshot: LoadedSnapshot) -> Result<RebindReport, RebindError> {
        self.begin(RebindState::Loading)?;

        let result = self.run_load(snapshot);

        self.finish(&result);
        result
    }

    /// Cancel a running load. Only possible before activation starts;
    /// returns false otherwise.
    pub fn abort(&self) -> bool {
        let state = self.lock_state();
        match *state {
            RebindState::Loading | RebindState::Wiring => {
                self.abort_requested.store(true, Ordering::SeqCst);
                info!(state = %*state, "Rebind abort requested");
                true
            }
            _ => false,
        }
    }

    fn run_load(&self, snapshot: LoadedSnapshot) -> Result<RebindReport, RebindError> {
        let mut report = RebindReport::default();

        let mut readable = Vec::with_capacity(snapshot.mementos.len());
        for (id, outcome) in snapshot.mementos {
            match outcome {
                Ok(memento) => readable.push(memento),
                Err(reason) => report.unrebindable.push(Unrebindable { id, reason }),
            }
        }

        self.validate_types(&readable)?;

        let mut created: Vec<EntityId> = Vec::new();
        let rebuilt = match self.build_skeletons(readable, &mut created, &mut report) {
            Ok(rebuilt) => rebuilt,
            Err(e) => {
                self.discard(&created);
                return Err(e);
            }
        };

        self.set_state(RebindState::Wiring);
        if let Err(e) = self.wire(&rebuilt, &mut report) {
            self.discard(&created);
            return Err(e);
        }

        {
            let mut state = self.lock_state();
            if self.abort_requested.load(Ordering::SeqCst) {
                drop(state);
                self.discard(&created);
                return Err(RebindError::Aborted);
            }
            *state = RebindState::Activating;
        }
        self.activate(&rebuilt, &mut report);

        info!(
            path = %snapshot.path.display(),
            rebound = report.rebound.len(),
            dangling = report.dangling.len(),
            unrebindable = report.unrebindable.len(),
            "Rebind complete"
        );
        Ok(report)
    }

    /// Every type tag must be registered before the graph is touched
    fn validate_types(&self, mementos: &[EntityMemento]) -> Result<(), RebindError> {
        let registry = self.graph.registry();
        for memento in mementos {
            if registry.entity_factory(memento.entity_type.as_str()).is_none() {
                return Err(RebindError::SnapshotCorrupt(format!(
                    "entity {} has unregistered type '{}'",
                    memento.id, memento.entity_type
                )));
            }
            for policy in &memento.policies {
                if registry.policy_factory(&policy.policy_type).is_none() {
                    return Err(RebindError::SnapshotCorrupt(format!(
                        "entity {} has unregistered policy type '{}'",
                        memento.id, policy.policy_type
                    )));
                }
            }
        }
        Ok(())
    }

    /// Phase 1
    fn build_skeletons(
        &self,
        mementos: Vec<EntityMemento>,
        created: &mut Vec<EntityId>,
        report: &mut RebindReport,
    ) -> Result<Vec<Rebuilt>, RebindError> {
        let registry = self.graph.registry();
        let known: HashSet<EntityId> = mementos.iter().map(|m| m.id).collect();
        let ctx = ReconstructContext { known: &known };

        let mut rebuilt = Vec::with_capacity(mementos.len());
        for memento in mementos {
            self.check_abort()?;

            let outcome = registry
                .entity_factory(memento.entity_type.as_str())
                .ok_or_else(|| anyhow::anyhow!("type '{}' not registered", memento.entity_type))
                .and_then(|factory| factory.reconstruct(&ctx, &memento))
                .and_then(|skeleton| {
                    let policies = memento
                        .policies
                        .iter()
                        .map(|descriptor| {
                            registry
                                .policy_factory(&descriptor.policy_type)
                                .ok_or_else(|| {
                                    anyhow::anyhow!(
                                        "policy type '{}' not registered",
                                        descriptor.policy_type
                                    )
                                })?
                                .reconstruct(descriptor)
                        })
                        .collect::<anyhow::Result<Vec<_>>>()?;
                    Ok((skeleton, policies))
                });

            let (skeleton, policies) = match outcome {
                Ok(built) => built,
                Err(e) => {
                    warn!(entity_id = %memento.id, error = %e, "Entity could not be rebuilt");
                    report.unrebindable.push(Unrebindable {
                        id: memento.id,
                        reason: format!("{:#}", e),
                    });
                    continue;
                }
            };

            if skeleton.id != memento.id {
                report.unrebindable.push(Unrebindable {
                    id: memento.id,
                    reason: format!("factory produced entity {}", skeleton.id),
                });
                continue;
            }

            if let Err(e) = self.graph.insert_skeleton(skeleton) {
                warn!(entity_id = %memento.id, error = %e, "Skeleton rejected");
                report.unrebindable.push(Unrebindable {
                    id: memento.id,
                    reason: e.to_string(),
                });
                continue;
            }

            created.push(memento.id);
            rebuilt.push(Rebuilt { memento, policies });
        }

        debug!(skeletons = rebuilt.len(), "Skeletons built");
        Ok(rebuilt)
    }

    /// Phase 2
    fn wire(&self, rebuilt: &[Rebuilt], report: &mut RebindReport) -> Result<(), RebindError> {
        let present: HashSet<EntityId> = rebuilt.iter().map(|r| r.memento.id).collect();

        // Children lists carry the order
        for entry in rebuilt {
            self.check_abort()?;
            let memento = &entry.memento;

            for child in &memento.children {
                if !present.contains(child) {
                    report.dangling.push(DanglingReference {
                        from: memento.id,
                        to: *child,
                        relation: Relation::Child,
                    });
                    continue;
                }
                if let Err(e) = self.graph.restore_child(memento.id, *child) {
                    warn!(parent = %memento.id, child = %child, error = %e, "Child edge not restored");
                }
            }

            for location in &memento.locations {
                if !present.contains(location) {
                    report.dangling.push(DanglingReference {
                        from: memento.id,
                        to: *location,
                        relation: Relation::Location,
                    });
                    continue;
                }
                if let Err(e) = self.graph.add_location(memento.id, *location) {
                    warn!(entity_id = %memento.id, location = %location, error = %e, "Location not restored");
                }
            }

            for member in &memento.members {
                if !present.contains(member) {
                    report.dangling.push(DanglingReference {
                        from: memento.id,
                        to: *member,
                        relation: Relation::Member,
                    });
                    continue;
                }
                if let Err(e) = self.graph.add_member(memento.id, *member) {
                    warn!(group = %memento.id, member = %member, error = %e, "Member not restored");
                }
            }

            for policy in &entry.policies {
                if let Err(e) = self.graph.attach_policy(memento.id, policy.clone()) {
                    warn!(entity_id = %memento.id, error = %e, "Policy not restored");
                }
            }
        }

        // Parent edges the parent's own child list did not mention
        for entry in rebuilt {
            let memento = &entry.memento;
            let Some(parent) = memento.parent else {
                continue;
            };
            if !present.contains(&parent) {
                report.dangling.push(DanglingReference {
                    from: memento.id,
                    to: parent,
                    relation: Relation::Parent,
                });
                continue;
            }
            if matches!(self.graph.parent(memento.id), Ok(None)) {
                if let Err(e) = self.graph.restore_child(parent, memento.id) {
                    warn!(parent = %parent, child = %memento.id, error = %e, "Parent edge not restored");
                }
            }
        }

        Ok(())
    }

    /// Phase 3: breadth-first from the rebuilt roots
    fn activate(&self, rebuilt: &[Rebuilt], report: &mut RebindReport) {
        let present: HashSet<EntityId> = rebuilt.iter().map(|r| r.memento.id).collect();
        let mut queue: VecDeque<EntityId> = rebuilt
            .iter()
            .map(|r| r.memento.id)
            .filter(|id| matches!(self.graph.parent(*id), Ok(None)))
            .collect();
        let mut visited: HashSet<EntityId> = HashSet::new();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            match self.graph.activate(id) {
                Ok(()) => {
                    report.rebound.push(id);
                    let children = self.graph.children(id).unwrap_or_default();
                    queue.extend(children.into_iter().filter(|c| present.contains(c)));
                }
                Err(e) => {
                    warn!(entity_id = %id, error = %e, "Activation failed");
                    report.unrebindable.push(Unrebindable {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Below a failed activation
        for id in present {
            if !visited.contains(&id) {
                report.unrebindable.push(Unrebindable {
                    id,
                    reason: "ancestor was not activated".to_string(),
                });
            }
        }
    }

    fn check_abort(&self) -> Result<(), RebindError> {
        if self.abort_requested.load(Ordering::SeqCst) {
            Err(RebindError::Aborted)
        } else {
            Ok(())
        }
    }

    fn discard(&self, created: &[EntityId]) {
        let discarded = created
            .iter()
            .rev()
            .filter(|id| self.graph.discard(**id))
            .count();
        info!(discarded = discarded, "Rebind unwound");
    }

    fn begin(&self, next: RebindState) -> Result<(), RebindError> {
        let mut state = self.lock_state();
        if state.is_busy() {
            return Err(RebindError::Busy(*state));
        }
        self.abort_requested.store(false, Ordering::SeqCst);
        *state = next;
        Ok(())
    }

    fn set_state(&self, next: RebindState) {
        *self.lock_state() = next;
    }

    fn finish<T>(&self, result: &Result<T, RebindError>) {
        let next = match result {
            Err(RebindError::IoFailure { .. }) => RebindState::Failed,
            _ => RebindState::Idle,
        };
        self.set_state(next);
    }

    fn lock_state(&self) -> MutexGuard<'_, RebindState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
