use crate::entity::{Capability, EntityId, EntityType, Lifecycle};
use crate::error::{GraphError, GraphResult};
use crate::event::sensors::{CHILD_ADDED, CHILD_REMOVED, LIFECYCLE, MEMBER_ADDED, MEMBER_REMOVED};
use crate::event::{AttributeSensor, EventSensor, Sensor, SensorEvent};
use crate::policy::Policy;
use crate::registry::TypeRegistry;
use crate::snapshot::EntitySkeleton;
use crate::state::attributes::{AttributeChange, AttributeMap};
use crate::state::config_map::{ConfigKey, ConfigMap, ConfigValue};
use crate::state::entity::{Entity, EntityRecord};
use crate::subscription::{EventBus, SensorEventListener, SensorFilter, SourceFilter, SubscriptionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// How `destroy` treats the children of the destroyed entity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestroyMode {
    /// Destroy the whole subtree, deepest entities first
    Recursive,
    /// Hand children to the destroyed entity's parent (or make them roots)
    OrphanChildren,
}

/// Entity graph maintains identity, lifecycle and structural edges.
///
/// Records sit behind their own `RwLock`; structural mutations additionally
/// hold the mutex of every tree they touch. Events are published while the
/// source's record lock is held, which keeps per-source publish order equal
/// to mutation order.
pub struct EntityGraph {
    /// All entities ever created, destroyed ones included as tombstones
    pub(crate) entities: DashMap<EntityId, Arc<RwLock<EntityRecord>>>,

    /// One mutex per tree root
    tree_locks: DashMap<EntityId, Arc<Mutex<()>>>,

    bus: Arc<EventBus>,
    registry: Arc<TypeRegistry>,
}

impl EntityGraph {
    pub fn new(bus: Arc<EventBus>, registry: Arc<TypeRegistry>) -> Self {
        Self {
            entities: DashMap::new(),
            tree_locks: DashMap::new(),
            bus,
            registry,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Create a fresh entity in `Constructing` state
    pub fn create_entity(
        &self,
        entity_type: impl Into<EntityType>,
        config: ConfigMap,
    ) -> GraphResult<EntityId> {
        let entity_type = entity_type.into();
        let factory = self
            .registry
            .entity_factory(entity_type.as_str())
            .ok_or_else(|| GraphError::UnknownType(entity_type.to_string()))?;

        let id = EntityId::generate();
        let mut record = EntityRecord::new(
            id,
            entity_type.clone(),
            factory.capabilities().iter().copied(),
            config,
            AttributeMap::new(),
        );
        record
            .attributes
            .set(LIFECYCLE.name(), json!(Lifecycle::Constructing));

        self.entities.insert(id, Arc::new(RwLock::new(record)));
        debug!(entity_id = %id, entity_type = %entity_type, "Entity created");
        Ok(id)
    }

    /// Insert an entity rebuilt from a memento. Fails if the id was ever used.
    pub(crate) fn insert_skeleton(&self, skeleton: EntitySkeleton) -> GraphResult<()> {
        let factory = self
            .registry
            .entity_factory(skeleton.entity_type.as_str())
            .ok_or_else(|| GraphError::UnknownType(skeleton.entity_type.to_string()))?;

        let mut record = EntityRecord::new(
            skeleton.id,
            skeleton.entity_type,
            factory.capabilities().iter().copied(),
            skeleton.config,
            skeleton.attributes,
        );
        record
            .attributes
            .set(LIFECYCLE.name(), json!(Lifecycle::Constructing));

        match self.entities.entry(skeleton.id) {
            Entry::Occupied(_) => Err(GraphError::AlreadyExists(skeleton.id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(RwLock::new(record)));
                Ok(())
            }
        }
    }

    /// Remove an entity that never became managed. Used to unwind a
    /// cancelled rebind; returns false for anything past `Constructing`.
    pub(crate) fn discard(&self, id: EntityId) -> bool {
        let removed = self
            .entities
            .remove_if(&id, |_, record| {
                read_lock(record).lifecycle == Lifecycle::Constructing
            })
            .is_some();
        if removed {
            self.tree_locks.remove(&id);
            self.bus.prune(id);
        }
        removed
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// Make `child` a child of `parent`, copying the parent's inheritable
    /// config into the child's inherited layer
    pub fn adopt(&self, parent: EntityId, child: EntityId) -> GraphResult<()> {
        self.attach_child(parent, child, true)
    }

    /// Re-create a persisted parent edge. Inherited config was restored
    /// from the memento, so nothing is copied.
    pub(crate) fn restore_child(&self, parent: EntityId, child: EntityId) -> GraphResult<()> {
        self.attach_child(parent, child, false)
    }

    fn attach_child(&self, parent: EntityId, child: EntityId, copy_config: bool) -> GraphResult<()> {
        if parent == child {
            return Err(GraphError::InvalidTopology(format!(
                "{} cannot adopt itself",
                child
            )));
        }

        self.with_trees(&[parent, child], || {
            let (parent_state, can_adopt) =
                self.read(parent, |r| (r.lifecycle, r.has(Capability::HasChildren)))?;
            let (child_state, existing_parent) = self.read(child, |r| (r.lifecycle, r.parent))?;

            if parent_state.is_terminal() || child_state.is_terminal() {
                return Err(GraphError::InvalidTopology(format!(
                    "cannot adopt {} ({}) into {} ({})",
                    child, child_state, parent, parent_state
                )));
            }
            if !can_adopt {
                return Err(GraphError::MissingCapability {
                    entity: parent,
                    capability: Capability::HasChildren.name(),
                });
            }
            if let Some(existing) = existing_parent {
                return Err(GraphError::InvalidTopology(format!(
                    "{} already has parent {}",
                    child, existing
                )));
            }
            if self.ancestors(parent)?.contains(&child) {
                return Err(GraphError::InvalidTopology(format!(
                    "adopting {} into {} would create a cycle",
                    child, parent
                )));
            }

            let inherited = if copy_config {
                Some(self.resolved_inheritable(parent)?)
            } else {
                None
            };

            self.write(child, |r| {
                r.parent = Some(parent);
                if let Some(values) = inherited {
                    r.config.set_inherited(values);
                }
                r.touch();
            })?;
            self.write(parent, |r| {
                if !r.children.contains(&child) {
                    r.children.push(child);
                }
                r.touch();
                self.publish_from(r, CHILD_ADDED.name(), json!(child));
            })?;

            debug!(parent = %parent, child = %child, "Child adopted");
            Ok(())
        })
    }

    /// `Constructing -> Managed`, then activate the entity's policies.
    ///
    /// Idempotent for an already managed entity. The parent must be managed
    /// first.
    pub fn activate(self: &Arc<Self>, id: EntityId) -> GraphResult<()> {
        let policies = self.with_trees(&[id], || {
            let (state, parent) = self.read(id, |r| (r.lifecycle, r.parent))?;
            match state {
                Lifecycle::Managed => return Ok(None),
                Lifecycle::Constructing => {}
                other => {
                    return Err(GraphError::InvalidTopology(format!(
                        "cannot activate {} in state {}",
                        id, other
                    )))
                }
            }

            if let Some(parent) = parent {
                let parent_state = self.lifecycle(parent)?;
                if !parent_state.is_managed() {
                    return Err(GraphError::NotReady {
                        entity: id,
                        parent,
                        parent_state,
                    });
                }
            }

            let policies = self.write(id, |r| {
                r.lifecycle = Lifecycle::Managed;
                self.store_attribute(r, LIFECYCLE.name(), json!(Lifecycle::Managed));
                r.policies.clone()
            })?;
            self.bus.activate_subscriber(id);
            Ok(Some(policies))
        })?;

        let Some(policies) = policies else {
            return Ok(());
        };

        // Tree locks are released: policies are free to mutate the graph
        for policy in policies {
            if let Err(e) = policy.activate(self, id) {
                warn!(
                    entity_id = %id,
                    policy_type = %policy.policy_type(),
                    error = %e,
                    "Policy activation failed"
                );
            }
        }

        info!(entity_id = %id, "Entity managed");
        Ok(())
    }

    /// Tear down an entity; destroyed records stay behind as tombstones
    pub fn destroy(&self, id: EntityId, mode: DestroyMode) -> GraphResult<()> {
        self.with_trees(&[id], || {
            match self.lifecycle(id)? {
                Lifecycle::Stopping | Lifecycle::Destroyed => Ok(()),
                _ => self.destroy_locked(id, mode),
            }
        })
    }

    fn destroy_locked(&self, id: EntityId, mode: DestroyMode) -> GraphResult<()> {
        // Members are released and Stopping announced while the entity can still publish
        let (children, parent, members) = self.write(id, |r| {
            let members = std::mem::take(&mut r.members);
            for member in &members {
                self.publish_from(r, MEMBER_REMOVED.name(), json!(member));
            }
            self.store_attribute(r, LIFECYCLE.name(), json!(Lifecycle::Stopping));
            r.lifecycle = Lifecycle::Stopping;
            r.touch();
            (r.children.clone(), r.parent, members)
        })?;
        for member in members {
            self.write(member, |r| {
                r.member_of.remove(&id);
            })?;
        }

        match mode {
            DestroyMode::Recursive => {
                for child in children.iter().rev() {
                    self.destroy_locked(*child, mode)?;
                }
            }
            DestroyMode::OrphanChildren => {
                for child in &children {
                    self.write(*child, |r| {
                        r.parent = parent;
                        r.touch();
                    })?;
                    if let Some(grandparent) = parent {
                        self.write(grandparent, |r| {
                            r.children.push(*child);
                            self.publish_from(r, CHILD_ADDED.name(), json!(child));
                        })?;
                    }
                }
                self.write(id, |r| r.children.clear())?;
            }
        }

        if let Some(parent) = parent {
            self.write(parent, |r| {
                r.children.retain(|c| *c != id);
                r.touch();
                self.publish_from(r, CHILD_REMOVED.name(), json!(id));
            })?;
        }

        let groups = self.write(id, |r| std::mem::take(&mut r.member_of))?;
        for group in groups {
            // Tombstones never disappear, so a missing group is a real bug
            self.write(group, |r| {
                if r.members.remove(&id) {
                    r.touch();
                    self.publish_from(r, MEMBER_REMOVED.name(), json!(id));
                }
            })?;
        }

        // Drop location references pointing at this entity
        let located_here: Vec<Arc<RwLock<EntityRecord>>> = self
            .entities
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for record in located_here {
            let mut record = write_lock(&record);
            record.locations.remove(&id);
        }

        let policies = self.write(id, |r| {
            r.lifecycle = Lifecycle::Destroyed;
            r.parent = None;
            r.attributes.set(LIFECYCLE.name(), json!(Lifecycle::Destroyed));
            r.touch();
            std::mem::take(&mut r.policies).len()
        })?;

        let pruned = self.bus.prune(id);

        info!(
            entity_id = %id,
            policies = policies,
            subscriptions = pruned,
            "Entity destroyed"
        );
        Ok(())
    }

    pub fn add_location(&self, id: EntityId, location: EntityId) -> GraphResult<bool> {
        let (state, is_location) =
            self.read(location, |r| (r.lifecycle, r.has(Capability::Location)))?;
        if !is_location {
            return Err(GraphError::MissingCapability {
                entity: location,
                capability: Capability::Location.name(),
            });
        }
        if state.is_terminal() {
            return Err(GraphError::InvalidTopology(format!(
                "location {} is {}",
                location, state
            )));
        }
        self.write(id, |r| {
            if r.lifecycle.is_terminal() {
                return Err(GraphError::InvalidTopology(format!("{} is {}", id, r.lifecycle)));
            }
            let added = r.locations.insert(location);
            if added {
                r.touch();
            }
            Ok(added)
        })?
    }

    pub fn remove_location(&self, id: EntityId, location: EntityId) -> GraphResult<bool> {
        self.write(id, |r| r.locations.remove(&location))
    }

    /// Add `member` to a group. Emits `group.members.added` from a managed
    /// group; returns false if it was already a member.
    pub fn add_member(&self, group: EntityId, member: EntityId) -> GraphResult<bool> {
        if group == member {
            return Err(GraphError::InvalidTopology(format!(
                "group {} cannot contain itself",
                group
            )));
        }
        let is_group = self.read(group, |r| r.has(Capability::Group))?;
        if !is_group {
            return Err(GraphError::MissingCapability {
                entity: group,
                capability: Capability::Group.name(),
            });
        }

        self.write(member, |r| {
            if r.lifecycle.is_terminal() {
                return Err(GraphError::InvalidTopology(format!(
                    "member {} is {}",
                    member, r.lifecycle
                )));
            }
            r.member_of.insert(group);
            Ok(())
        })??;

        let added = self.write(group, |r| {
            if r.lifecycle.is_terminal() {
                return Err(GraphError::InvalidTopology(format!(
                    "group {} is {}",
                    group, r.lifecycle
                )));
            }
            let added = r.members.insert(member);
            if added {
                r.touch();
                self.publish_from(r, MEMBER_ADDED.name(), json!(member));
            }
            Ok(added)
        })?;

        let added = match added {
            Ok(added) => added,
            Err(e) => {
                self.write(member, |r| {
                    r.member_of.remove(&group);
                })?;
                return Err(e);
            }
        };

        // Lost a race with destroy(member): undo
        if self.lifecycle(member)?.is_terminal() {
            self.remove_member(group, member)?;
            return Err(GraphError::InvalidTopology(format!(
                "member {} was destroyed",
                member
            )));
        }
        Ok(added)
    }

    /// Remove `member` from a group, emitting `group.members.removed`
    pub fn remove_member(&self, group: EntityId, member: EntityId) -> GraphResult<bool> {
        let removed = self.write(group, |r| {
            let removed = r.members.remove(&member);
            if removed {
                r.touch();
                self.publish_from(r, MEMBER_REMOVED.name(), json!(member));
            }
            removed
        })?;
        if removed {
            self.write(member, |r| {
                r.member_of.remove(&group);
            })?;
        }
        Ok(removed)
    }

    pub fn has_member(&self, group: EntityId, member: EntityId) -> GraphResult<bool> {
        self.read(group, |r| r.members.contains(&member))
    }

    pub fn members(&self, group: EntityId) -> GraphResult<Vec<EntityId>> {
        self.read(group, |r| r.members.iter().copied().collect())
    }

    /// Attach a policy; it is activated right away when the host is managed,
    /// otherwise on the host's activation
    pub fn attach_policy(self: &Arc<Self>, id: EntityId, policy: Arc<dyn Policy>) -> GraphResult<()> {
        let managed = self.write(id, |r| {
            if r.lifecycle.is_terminal() {
                return Err(GraphError::InvalidTopology(format!("{} is {}", id, r.lifecycle)));
            }
            r.policies.push(policy.clone());
            Ok(r.lifecycle.is_managed())
        })??;

        debug!(entity_id = %id, policy_type = %policy.policy_type(), "Policy attached");

        if managed {
            if let Err(e) = policy.activate(self, id) {
                warn!(
                    entity_id = %id,
                    policy_type = %policy.policy_type(),
                    error = %e,
                    "Policy activation failed"
                );
            }
        }
        Ok(())
    }

    pub fn policies(&self, id: EntityId) -> GraphResult<Vec<Arc<dyn Policy>>> {
        self.read(id, |r| r.policies.clone())
    }

    // ------------------------------------------------------------------
    // Attributes and events
    // ------------------------------------------------------------------

    /// Set an attribute. Publishes one event when the value changed and the
    /// entity is managed. Returns the previous value.
    pub fn set_attribute<T>(
        &self,
        id: EntityId,
        sensor: &AttributeSensor<T>,
        value: T,
    ) -> GraphResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let value = to_json(value)?;
        let previous = self.set_attribute_value(id, sensor.name(), value)?;
        Ok(previous.and_then(|v| serde_json::from_value(v).ok()))
    }

    pub fn set_attribute_value(
        &self,
        id: EntityId,
        name: &str,
        value: Value,
    ) -> GraphResult<Option<Value>> {
        self.write(id, |r| self.store_attribute(r, name, value).previous)
    }

    /// Current attribute value; `None` when unset or not of type `T`
    pub fn attribute<T>(&self, id: EntityId, sensor: &AttributeSensor<T>) -> GraphResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        Ok(self
            .attribute_value(id, sensor.name())?
            .and_then(|v| serde_json::from_value(v).ok()))
    }

    pub fn attribute_value(&self, id: EntityId, name: &str) -> GraphResult<Option<Value>> {
        self.read(id, |r| r.attributes.get(name).cloned())
    }

    /// Emit a transient event. Dropped silently unless the entity is managed.
    pub fn emit<T>(&self, id: EntityId, sensor: &EventSensor<T>, value: T) -> GraphResult<()>
    where
        T: Serialize + DeserializeOwned,
    {
        let value = to_json(value)?;
        self.write(id, |r| self.publish_from(r, sensor.name(), value))
    }

    // ------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------

    /// Resolve a config key: own override, inherited layer, live parent
    /// chain (inheritable keys only), default
    pub fn config<T>(&self, id: EntityId, key: &ConfigKey<T>) -> GraphResult<T>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let value = self.config_value(id, key.name(), key.is_inheritable())?;
        Ok(key.decode(value))
    }

    pub fn config_value(
        &self,
        id: EntityId,
        name: &str,
        inheritable: bool,
    ) -> GraphResult<Option<Value>> {
        let (local, mut next) =
            self.read(id, |r| (r.config.local(name).map(|v| v.value.clone()), r.parent))?;
        if local.is_some() || !inheritable {
            return Ok(local);
        }

        let mut hops = 0;
        while let Some(ancestor) = next {
            let (found, parent) = self.read(ancestor, |r| {
                let found = r
                    .config
                    .local(name)
                    .filter(|v| v.inheritable)
                    .map(|v| v.value.clone());
                (found, r.parent)
            })?;
            if found.is_some() {
                return Ok(found);
            }
            next = parent;
            hops += 1;
            if hops > self.entities.len() {
                return Err(GraphError::InvalidTopology(format!(
                    "parent chain of {} does not terminate",
                    id
                )));
            }
        }
        Ok(None)
    }

    /// Set an explicit override. Config writes never publish.
    pub fn set_config<T>(&self, id: EntityId, key: &ConfigKey<T>, value: T) -> GraphResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let value = to_json(value)?;
        let previous = self.write(id, |r| {
            r.touch();
            r.config.set_raw(key.name(), value, key.is_inheritable())
        })?;
        Ok(previous.and_then(|v| serde_json::from_value(v).ok()))
    }

    pub fn set_inherited_config(
        &self,
        id: EntityId,
        values: BTreeMap<String, ConfigValue>,
    ) -> GraphResult<()> {
        self.write(id, |r| {
            r.config.set_inherited(values);
            r.touch();
        })
    }

    pub fn clear_inherited_config(&self, id: EntityId) -> GraphResult<()> {
        self.write(id, |r| {
            r.config.clear_inherited();
            r.touch();
        })
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe on behalf of `subscriber`. Dormant until the subscriber is
    /// managed.
    pub fn subscribe(
        &self,
        subscriber: EntityId,
        source: SourceFilter,
        sensor: SensorFilter,
        handler: Arc<dyn SensorEventListener>,
    ) -> GraphResult<SubscriptionId> {
        let state = self.lifecycle(subscriber)?;
        if state.is_terminal() {
            return Err(GraphError::InvalidTopology(format!(
                "subscriber {} is {}",
                subscriber, state
            )));
        }

        let id = self
            .bus
            .subscribe(subscriber, source, sensor, handler, state.is_managed());

        // The subscriber may have been activated since the state was read
        if !state.is_managed() && self.lifecycle(subscriber)?.is_managed() {
            self.bus.activate_subscriber(subscriber);
        }
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn lifecycle(&self, id: EntityId) -> GraphResult<Lifecycle> {
        self.read(id, |r| r.lifecycle)
    }

    pub fn entity_type(&self, id: EntityId) -> GraphResult<EntityType> {
        self.read(id, |r| r.entity_type.clone())
    }

    pub fn has_capability(&self, id: EntityId, capability: Capability) -> GraphResult<bool> {
        self.read(id, |r| r.has(capability))
    }

    pub fn parent(&self, id: EntityId) -> GraphResult<Option<EntityId>> {
        self.read(id, |r| r.parent)
    }

    pub fn children(&self, id: EntityId) -> GraphResult<Vec<EntityId>> {
        self.read(id, |r| r.children.clone())
    }

    pub fn locations(&self, id: EntityId) -> GraphResult<Vec<EntityId>> {
        self.read(id, |r| r.locations.iter().copied().collect())
    }

    /// Summary copy of one entity
    pub fn entity(&self, id: EntityId) -> GraphResult<Entity> {
        // Descriptors are taken outside the record lock: policies lock their
        // own state and may call back into the graph
        let (mut entity, policies) = self.read(id, |r| (r.summary(), r.policies.clone()))?;
        entity.policies = policies.iter().map(|p| p.descriptor()).collect();
        Ok(entity)
    }

    /// Get all entities, tombstones included
    pub fn get_all_entities(&self) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self
            .ids_where(|_| true)
            .into_iter()
            .filter_map(|id| self.entity(id).ok())
            .collect();
        entities.sort_by_key(|e| e.id);
        entities
    }

    /// Ids of every live (not destroyed) entity
    pub fn ids(&self) -> Vec<EntityId> {
        self.ids_where(|r| r.lifecycle != Lifecycle::Destroyed)
    }

    pub fn managed_ids(&self) -> Vec<EntityId> {
        self.ids_where(|r| r.lifecycle.is_managed())
    }

    /// Live entities whose type has `capability`
    pub fn with_capability(&self, capability: Capability) -> Vec<EntityId> {
        self.ids_where(|r| !r.lifecycle.is_terminal() && r.has(capability))
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Number of records, tombstones included
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn record(&self, id: EntityId) -> GraphResult<Arc<RwLock<EntityRecord>>> {
        self.entities
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(GraphError::NotFound(id))
    }

    fn read<R>(&self, id: EntityId, f: impl FnOnce(&EntityRecord) -> R) -> GraphResult<R> {
        let record = self.record(id)?;
        let guard = read_lock(&record);
        Ok(f(&guard))
    }

    fn write<R>(&self, id: EntityId, f: impl FnOnce(&mut EntityRecord) -> R) -> GraphResult<R> {
        let record = self.record(id)?;
        let mut guard = write_lock(&record);
        Ok(f(&mut guard))
    }

    fn ids_where(&self, predicate: impl Fn(&EntityRecord) -> bool) -> Vec<EntityId> {
        // Clone the handles first so no shard lock is held while reading records
        let records: Vec<(EntityId, Arc<RwLock<EntityRecord>>)> = self
            .entities
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut ids: Vec<EntityId> = records
            .into_iter()
            .filter(|(_, record)| predicate(&read_lock(record)))
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    /// Store an attribute and publish it when it changed
    fn store_attribute(&self, record: &mut EntityRecord, name: &str, value: Value) -> AttributeChange {
        let change = record.attributes.set(name, value.clone());
        if change.changed {
            record.touch();
            self.publish_from(record, name, value);
        }
        change
    }

    fn publish_from(&self, record: &EntityRecord, sensor: &str, value: Value) {
        if record.lifecycle.is_managed() {
            self.bus.publish(SensorEvent::new(record.id, sensor, value));
        }
    }

    /// `id` followed by its ancestors, nearest first
    fn ancestors(&self, id: EntityId) -> GraphResult<Vec<EntityId>> {
        let mut chain = vec![id];
        let mut next = self.parent(id)?;
        while let Some(ancestor) = next {
            if chain.contains(&ancestor) {
                return Err(GraphError::InvalidTopology(format!(
                    "parent chain of {} contains a cycle",
                    id
                )));
            }
            chain.push(ancestor);
            next = self.parent(ancestor)?;
        }
        Ok(chain)
    }

    /// Every inheritable value visible on `id`, nearer ancestors winning
    fn resolved_inheritable(&self, id: EntityId) -> GraphResult<BTreeMap<String, ConfigValue>> {
        let mut resolved = BTreeMap::new();
        for ancestor in self.ancestors(id)?.into_iter().rev() {
            let entries = self.read(ancestor, |r| r.config.inheritable_entries())?;
            resolved.extend(entries);
        }
        Ok(resolved)
    }

    fn roots_of(&self, ids: &[EntityId]) -> GraphResult<Vec<EntityId>> {
        let mut roots = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(root) = self.ancestors(*id)?.last() {
                roots.push(*root);
            }
        }
        roots.sort();
        roots.dedup();
        Ok(roots)
    }

    /// Run `op` inside the exclusive sections of every tree containing one
    /// of `ids`. Locks are taken in root-id order; if a root changed while
    /// waiting, everything is released and acquisition starts over.
    fn with_trees<R>(&self, ids: &[EntityId], op: impl FnOnce() -> GraphResult<R>) -> GraphResult<R> {
        loop {
            let roots = self.roots_of(ids)?;
            let locks: Vec<Arc<Mutex<()>>> = roots
                .iter()
                .map(|root| self.tree_locks.entry(*root).or_default().clone())
                .collect();
            let guards: Vec<MutexGuard<'_, ()>> = locks
                .iter()
                .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner))
                .collect();

            if self.roots_of(ids)? == roots {
                let result = op();
                drop(guards);
                return result;
            }
            debug!(?roots, "Tree roots moved while locking, retrying");
        }
    }
}

fn read_lock(record: &RwLock<EntityRecord>) -> std::sync::RwLockReadGuard<'_, EntityRecord> {
    record.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock(record: &RwLock<EntityRecord>) -> std::sync::RwLockWriteGuard<'_, EntityRecord> {
    record.write().unwrap_or_else(PoisonError::into_inner)
}

fn to_json<T: Serialize>(value: T) -> GraphResult<Value> {
    serde_json::to_value(value).map_err(|e| GraphError::InvalidValue(e.to_string()))
}
