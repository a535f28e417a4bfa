//! Type registry - maps persisted type tags to factories.
//!
//! Populated once at startup. A snapshot that names a tag missing from the
//! registry is rejected as corrupt; nothing is ever loaded dynamically.

use crate::entity::Capability;
use crate::policy::{MembershipPolicyFactory, Policy, PolicyDescriptor};
use crate::snapshot::{EntityMemento, EntitySkeleton, ReconstructContext};
use crate::state::Entity;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Type tags registered by [`TypeRegistry::with_builtin_types`].
pub mod types {
    pub const APPLICATION: &str = "application";
    pub const SERVICE: &str = "service";
    pub const GROUP: &str = "group";
    pub const LOCATION: &str = "location";
    pub const CONTAINER: &str = "container";
    pub const ITEM: &str = "item";
}

/// Per-type behaviour for entity construction and snapshotting.
///
/// The default methods restore and capture raw state, which is all a plain
/// entity type needs. Types with extra invariants override them.
pub trait EntityFactory: Send + Sync {
    /// Unique tag stored in mementos (e.g. "application").
    fn type_tag(&self) -> &str;

    /// Roles entities of this type can play.
    fn capabilities(&self) -> &[Capability];

    /// Rebuild one entity from its memento during rebind phase 1.
    ///
    /// Peers may not exist yet: `ctx` only resolves ids to inert
    /// [`EntityRef`](crate::snapshot::EntityRef) handles. Returning an error
    /// marks this entity unrebindable without affecting the others.
    fn reconstruct(
        &self,
        ctx: &ReconstructContext<'_>,
        memento: &EntityMemento,
    ) -> Result<EntitySkeleton> {
        let _ = ctx;
        Ok(EntitySkeleton::from_memento(memento))
    }

    /// Capture one managed entity.
    fn snapshot(&self, entity: &Entity) -> EntityMemento {
        EntityMemento::from_entity(entity)
    }
}

/// Rebuilds policies from their descriptors.
pub trait PolicyFactory: Send + Sync {
    fn type_tag(&self) -> &str;

    fn reconstruct(&self, descriptor: &PolicyDescriptor) -> Result<Arc<dyn Policy>>;
}

/// Entity type with default construction and snapshot behaviour
pub struct EntityTypeSpec {
    tag: String,
    capabilities: Vec<Capability>,
}

impl EntityTypeSpec {
    pub fn new(tag: impl Into<String>, capabilities: &[Capability]) -> Self {
        Self {
            tag: tag.into(),
            capabilities: capabilities.to_vec(),
        }
    }
}

impl EntityFactory for EntityTypeSpec {
    fn type_tag(&self) -> &str {
        &self.tag
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }
}

/// Explicit tag -> factory map
#[derive(Default)]
pub struct TypeRegistry {
    entity_types: HashMap<String, Arc<dyn EntityFactory>>,
    policy_types: HashMap<String, Arc<dyn PolicyFactory>>,
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the stock entity types and the membership policy
    pub fn with_builtin_types() -> Self {
        use Capability::*;

        let mut registry = Self::new();
        registry
            .register_entity_type(Arc::new(EntityTypeSpec::new(
                types::APPLICATION,
                &[HasConfig, HasChildren],
            )))
            .register_entity_type(Arc::new(EntityTypeSpec::new(
                types::SERVICE,
                &[HasConfig, HasChildren],
            )))
            .register_entity_type(Arc::new(EntityTypeSpec::new(
                types::GROUP,
                &[HasConfig, HasChildren, Group],
            )))
            .register_entity_type(Arc::new(EntityTypeSpec::new(
                types::LOCATION,
                &[HasConfig, HasChildren, Location],
            )))
            .register_entity_type(Arc::new(EntityTypeSpec::new(
                types::CONTAINER,
                &[HasConfig, HasChildren, BalanceableContainer],
            )))
            .register_entity_type(Arc::new(EntityTypeSpec::new(
                types::ITEM,
                &[HasConfig, Movable],
            )))
            .register_policy_type(Arc::new(MembershipPolicyFactory));
        registry
    }

    pub fn register_entity_type(&mut self, factory: Arc<dyn EntityFactory>) -> &mut Self {
        let tag = factory.type_tag().to_string();
        if self.entity_types.insert(tag.clone(), factory).is_some() {
            warn!(type_tag = %tag, "Entity type registered twice, keeping the latest");
        }
        self
    }

    pub fn register_policy_type(&mut self, factory: Arc<dyn PolicyFactory>) -> &mut Self {
        let tag = factory.type_tag().to_string();
        if self.policy_types.insert(tag.clone(), factory).is_some() {
            warn!(policy_type = %tag, "Policy type registered twice, keeping the latest");
        }
        self
    }

    pub fn entity_factory(&self, tag: &str) -> Option<Arc<dyn EntityFactory>> {
        self.entity_types.get(tag).cloned()
    }

    pub fn policy_factory(&self, tag: &str) -> Option<Arc<dyn PolicyFactory>> {
        self.policy_types.get(tag).cloned()
    }

    pub fn entity_type_count(&self) -> usize {
        self.entity_types.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types() {
        let registry = TypeRegistry::with_builtin_types();
        assert_eq!(registry.entity_type_count(), 6);

        let group = registry.entity_factory(types::GROUP).unwrap();
        assert!(group.capabilities().contains(&Capability::Group));

        let item = registry.entity_factory(types::ITEM).unwrap();
        assert!(item.capabilities().contains(&Capability::Movable));
        assert!(!item.capabilities().contains(&Capability::HasChildren));

        assert!(registry.policy_factory(crate::policy::MEMBERSHIP_POLICY).is_some());
    }

    #[test]
    fn test_unknown_tag() {
        let registry = TypeRegistry::with_builtin_types();
        assert!(registry.entity_factory("webserver").is_none());
        assert!(registry.policy_factory("autoscaler").is_none());
    }

    #[test]
    fn test_register_custom_type_replaces() {
        let mut registry = TypeRegistry::new();
        registry.register_entity_type(Arc::new(EntityTypeSpec::new("db", &[Capability::HasConfig])));
        registry.register_entity_type(Arc::new(EntityTypeSpec::new(
            "db",
            &[Capability::HasConfig, Capability::HasChildren],
        )));

        assert_eq!(registry.entity_type_count(), 1);
        let db = registry.entity_factory("db").unwrap();
        assert_eq!(db.capabilities().len(), 2);
    }
}
