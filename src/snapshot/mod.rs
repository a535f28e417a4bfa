use crate::entity::{EntityId, EntityType};
use crate::event::sensors::LIFECYCLE;
use crate::event::Sensor;
use crate::policy::PolicyDescriptor;
use crate::state::{AttributeMap, ConfigMap, ConfigValue, Entity, EntityGraph};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;

pub mod config;
pub mod manager;
pub mod rebind;
pub mod recovery;
pub mod store;

pub use config::SnapshotConfig;
pub use manager::SnapshotManager;
pub use rebind::{
    DanglingReference, EntityRef, RebindEngine, RebindReport, ReconstructContext, Relation,
    SaveSummary, Unrebindable,
};
pub use store::{LoadedSnapshot, SnapshotStore};

#[cfg(test)]
mod tests;

/// Manifest schema written by this version
pub const SCHEMA_VERSION: u32 = 1;

/// Serializable snapshot of exactly one entity.
///
/// Other entities are referenced by id only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityMemento {
    pub id: EntityId,

    pub entity_type: EntityType,

    /// Explicit overrides
    #[serde(default)]
    pub config: BTreeMap<String, ConfigValue>,

    /// Values copied down from ancestors
    #[serde(default)]
    pub inherited_config: BTreeMap<String, ConfigValue>,

    /// Attribute values, lifecycle excluded
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,

    pub parent: Option<EntityId>,

    /// In adoption order
    #[serde(default)]
    pub children: Vec<EntityId>,

    #[serde(default)]
    pub locations: Vec<EntityId>,

    #[serde(default)]
    pub members: Vec<EntityId>,

    #[serde(default)]
    pub policies: Vec<PolicyDescriptor>,
}

impl EntityMemento {
    /// Capture raw entity state.
    ///
    /// The lifecycle attribute is left out: a rebound entity starts in
    /// `Constructing` and announces `Managed` again when activated.
    pub fn from_entity(entity: &Entity) -> Self {
        let mut attributes = entity.attributes.values().clone();
        attributes.remove(LIFECYCLE.name());

        Self {
            id: entity.id,
            entity_type: entity.entity_type.clone(),
            config: entity.config.own().clone(),
            inherited_config: entity.config.inherited().clone(),
            attributes,
            parent: entity.parent,
            children: entity.children.clone(),
            locations: entity.locations.iter().copied().collect(),
            members: entity.members.iter().copied().collect(),
            policies: entity.policies.clone(),
        }
    }
}

/// Entity rebuilt from a memento, before any edge is wired
#[derive(Clone, Debug, PartialEq)]
pub struct EntitySkeleton {
    pub id: EntityId,
    pub entity_type: EntityType,
    pub config: ConfigMap,
    pub attributes: AttributeMap,
}

impl EntitySkeleton {
    pub fn from_memento(memento: &EntityMemento) -> Self {
        Self {
            id: memento.id,
            entity_type: memento.entity_type.clone(),
            config: ConfigMap::from_layers(
                memento.config.clone(),
                memento.inherited_config.clone(),
            ),
            attributes: AttributeMap::from_values(memento.attributes.clone()),
        }
    }
}

/// Index of one snapshot. Written last: a snapshot without a readable
/// manifest does not exist.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub entity_ids: Vec<EntityId>,
}

/// Mementos of every managed entity, plus their manifest
#[derive(Clone, Debug)]
pub struct SnapshotSet {
    pub manifest: Manifest,
    pub mementos: Vec<EntityMemento>,
}

impl SnapshotSet {
    /// Capture every managed entity through its type's snapshot hook
    pub fn capture(graph: &EntityGraph) -> Self {
        let registry = graph.registry();
        let mut mementos = Vec::new();

        for id in graph.managed_ids() {
            // Raced with destroy
            let Ok(entity) = graph.entity(id) else {
                continue;
            };
            let memento = match registry.entity_factory(entity.entity_type.as_str()) {
                Some(factory) => factory.snapshot(&entity),
                None => {
                    warn!(
                        entity_id = %id,
                        entity_type = %entity.entity_type,
                        "No factory for entity type, capturing raw state"
                    );
                    EntityMemento::from_entity(&entity)
                }
            };
            mementos.push(memento);
        }

        // Edges may only point at entities this snapshot holds
        let captured: BTreeSet<EntityId> = mementos.iter().map(|m| m.id).collect();
        for memento in &mut mementos {
            if memento.parent.is_some_and(|p| !captured.contains(&p)) {
                memento.parent = None;
            }
            memento.children.retain(|id| captured.contains(id));
            memento.locations.retain(|id| captured.contains(id));
            memento.members.retain(|id| captured.contains(id));
        }

        Self {
            manifest: Manifest {
                schema_version: SCHEMA_VERSION,
                created_at: Utc::now(),
                entity_ids: mementos.iter().map(|m| m.id).collect(),
            },
            mementos,
        }
    }

    pub fn entity_count(&self) -> usize {
        self.mementos.len()
    }
}

/// Rebind engine state machine.
///
/// `Idle -> Snapshotting -> Idle` for a save,
/// `Idle -> Loading -> Wiring -> Activating -> Idle` for a load.
/// `Failed` after an I/O failure; the next operation may start from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebindState {
    Idle,
    Snapshotting,
    Loading,
    Wiring,
    Activating,
    Failed,
}

impl RebindState {
    /// True while a save or load owns the engine
    pub fn is_busy(self) -> bool {
        !matches!(self, RebindState::Idle | RebindState::Failed)
    }
}

impl fmt::Display for RebindState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RebindState::Idle => "idle",
            RebindState::Snapshotting => "snapshotting",
            RebindState::Loading => "loading",
            RebindState::Wiring => "wiring",
            RebindState::Activating => "activating",
            RebindState::Failed => "failed",
        };
        f.write_str(s)
    }
}
