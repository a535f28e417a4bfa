use crate::entity::{Capability, EntityId, EntityType, Lifecycle};
use crate::policy::{Policy, PolicyDescriptor};
use crate::state::attributes::AttributeMap;
use crate::state::config_map::ConfigMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Read-only copy of one entity, as returned by graph queries
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,

    /// Registered type tag (e.g. "application", "item")
    pub entity_type: EntityType,

    pub capabilities: BTreeSet<Capability>,

    pub lifecycle: Lifecycle,

    pub config: ConfigMap,

    pub attributes: AttributeMap,

    pub parent: Option<EntityId>,

    /// In adoption order
    pub children: Vec<EntityId>,

    /// Location references
    pub locations: BTreeSet<EntityId>,

    /// Only non-empty for `Group` entities
    pub members: BTreeSet<EntityId>,

    /// Groups this entity belongs to
    pub member_of: BTreeSet<EntityId>,

    pub policies: Vec<PolicyDescriptor>,

    /// Last mutation timestamp
    pub last_updated: DateTime<Utc>,
}

impl Entity {
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Live state of one entity inside the graph
pub(crate) struct EntityRecord {
    pub(crate) id: EntityId,
    pub(crate) entity_type: EntityType,
    pub(crate) capabilities: BTreeSet<Capability>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) config: ConfigMap,
    pub(crate) attributes: AttributeMap,
    pub(crate) parent: Option<EntityId>,
    pub(crate) children: Vec<EntityId>,
    pub(crate) locations: BTreeSet<EntityId>,
    pub(crate) members: BTreeSet<EntityId>,
    pub(crate) member_of: BTreeSet<EntityId>,
    pub(crate) policies: Vec<Arc<dyn Policy>>,
    pub(crate) last_updated: DateTime<Utc>,
}

impl EntityRecord {
    pub(crate) fn new(
        id: EntityId,
        entity_type: EntityType,
        capabilities: impl IntoIterator<Item = Capability>,
        config: ConfigMap,
        attributes: AttributeMap,
    ) -> Self {
        Self {
            id,
            entity_type,
            capabilities: capabilities.into_iter().collect(),
            lifecycle: Lifecycle::Constructing,
            config,
            attributes,
            parent: None,
            children: Vec::new(),
            locations: BTreeSet::new(),
            members: BTreeSet::new(),
            member_of: BTreeSet::new(),
            policies: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    pub(crate) fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub(crate) fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// Copy without policy descriptors; those are filled in after the
    /// record lock is released.
    pub(crate) fn summary(&self) -> Entity {
        Entity {
            id: self.id,
            entity_type: self.entity_type.clone(),
            capabilities: self.capabilities.clone(),
            lifecycle: self.lifecycle,
            config: self.config.clone(),
            attributes: self.attributes.clone(),
            parent: self.parent,
            children: self.children.clone(),
            locations: self.locations.clone(),
            members: self.members.clone(),
            member_of: self.member_of.clone(),
            policies: Vec::new(),
            last_updated: self.last_updated,
        }
    }
}
