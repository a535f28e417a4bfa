//! Items-in-containers group.
//!
//! Keeps the host group's members equal to
//! `{ item : filter(item) AND container(item) in container group }`,
//! recomputing only the items an event can affect.

use crate::entity::{Capability, EntityId, EntityType, Lifecycle};
use crate::error::GraphResult;
use crate::event::sensors::{CONTAINER, LIFECYCLE, MEMBER_ADDED, MEMBER_REMOVED};
use crate::event::SensorEvent;
use crate::policy::{Policy, PolicyDescriptor};
use crate::registry::PolicyFactory;
use crate::state::EntityGraph;
use crate::subscription::{SensorEventListener, SensorFilter, SourceFilter, SubscriptionId};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tracing::{debug, info, trace, warn};

/// Type tag of [`MembershipPolicy`]
pub const MEMBERSHIP_POLICY: &str = "policy.items_in_containers";

/// Which items may join the group
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemFilter {
    #[default]
    Any,
    TypeIs {
        entity_type: EntityType,
    },
    AttributeEquals {
        sensor: String,
        value: Value,
    },
}

impl ItemFilter {
    pub fn accepts(&self, graph: &EntityGraph, item: EntityId) -> bool {
        match self {
            ItemFilter::Any => true,
            ItemFilter::TypeIs { entity_type } => graph
                .entity_type(item)
                .map_or(false, |t| t == *entity_type),
            ItemFilter::AttributeEquals { sensor, value } => {
                matches!(graph.attribute_value(item, sensor), Ok(Some(current)) if current == *value)
            }
        }
    }

    /// Attribute whose changes can flip the outcome
    fn watched_sensor(&self) -> Option<&str> {
        match self {
            ItemFilter::AttributeEquals { sensor, .. } => Some(sensor),
            _ => None,
        }
    }
}

/// Persisted policy state
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct MembershipState {
    container_group: Option<EntityId>,
    #[serde(default)]
    item_filter: ItemFilter,
}

struct Binding {
    graph: Weak<EntityGraph>,
    host: EntityId,
    subscriptions: Vec<SubscriptionId>,
}

/// container -> items placed in it, and the reverse
#[derive(Default)]
struct Placements {
    container_of: HashMap<EntityId, EntityId>,
    items_in: HashMap<EntityId, BTreeSet<EntityId>>,
}

impl Placements {
    fn place(&mut self, item: EntityId, container: Option<EntityId>) {
        if let Some(previous) = self.container_of.remove(&item) {
            if let Some(items) = self.items_in.get_mut(&previous) {
                items.remove(&item);
                if items.is_empty() {
                    self.items_in.remove(&previous);
                }
            }
        }
        if let Some(container) = container {
            self.container_of.insert(item, container);
            self.items_in.entry(container).or_default().insert(item);
        }
    }

    fn items_in(&self, container: EntityId) -> Vec<EntityId> {
        self.items_in
            .get(&container)
            .map(|items| items.iter().copied().collect())
            .unwrap_or_default()
    }

    fn clear(&mut self) {
        self.container_of.clear();
        self.items_in.clear();
    }
}

struct Inner {
    state: RwLock<MembershipState>,
    binding: Mutex<Option<Binding>>,
    placements: Mutex<Placements>,
    /// Serializes single-item transitions across delivery and rescans
    transitions: Mutex<()>,
}

/// Dynamic group of the items placed in a set of containers.
///
/// Attach to a `Group` entity. Membership converges once the bus is
/// quiescent. Only the transition lock is held while it calls the graph,
/// and the graph never calls back into a policy while holding its own locks.
pub struct MembershipPolicy {
    inner: Arc<Inner>,
}

impl MembershipPolicy {
    /// Policy with no containers yet; see [`MembershipPolicy::set_containers`]
    pub fn new(item_filter: ItemFilter) -> Self {
        Self::from_state(MembershipState {
            container_group: None,
            item_filter,
        })
    }

    pub fn with_containers(container_group: EntityId, item_filter: ItemFilter) -> Self {
        Self::from_state(MembershipState {
            container_group: Some(container_group),
            item_filter,
        })
    }

    fn from_state(state: MembershipState) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(state),
                binding: Mutex::new(None),
                placements: Mutex::new(Placements::default()),
                transitions: Mutex::new(()),
            }),
        }
    }

    pub fn container_group(&self) -> Option<EntityId> {
        self.inner.state().container_group
    }

    pub fn item_filter(&self) -> ItemFilter {
        self.inner.state().item_filter
    }

    /// Switch to another container group and rescan every item once
    pub fn set_containers(&self, container_group: EntityId) -> GraphResult<()> {
        write_guard(&self.inner.state).container_group = Some(container_group);

        let bound = lock(&self.inner.binding)
            .as_ref()
            .and_then(|b| b.graph.upgrade().map(|graph| (graph, b.host)));

        if let Some((graph, host)) = bound {
            if graph.lifecycle(host)?.is_managed() {
                self.inner.bind(&graph, host)?;
            }
        }
        info!(container_group = %container_group, "Membership containers set");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn placed_items(&self) -> usize {
        lock(&self.inner.placements).container_of.len()
    }
}

impl Policy for MembershipPolicy {
    fn policy_type(&self) -> &str {
        MEMBERSHIP_POLICY
    }

    fn descriptor(&self) -> PolicyDescriptor {
        PolicyDescriptor {
            policy_type: MEMBERSHIP_POLICY.to_string(),
            state: serde_json::to_value(self.inner.state()).unwrap_or(Value::Null),
        }
    }

    fn activate(&self, graph: &Arc<EntityGraph>, host: EntityId) -> anyhow::Result<()> {
        self.inner
            .bind(graph, host)
            .with_context(|| format!("Failed to bind membership policy on {}", host))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Inner {
    fn state(&self) -> MembershipState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn bound(&self) -> Option<(Arc<EntityGraph>, EntityId)> {
        let binding = lock(&self.binding);
        let binding = binding.as_ref()?;
        Some((binding.graph.upgrade()?, binding.host))
    }

    /// (Re)subscribe for the current container group and rescan
    fn bind(self: &Arc<Self>, graph: &Arc<EntityGraph>, host: EntityId) -> GraphResult<()> {
        let previous = lock(&self.binding).take();
        if let Some(previous) = previous {
            for id in previous.subscriptions {
                graph.unsubscribe(id);
            }
        }
        lock(&self.placements).clear();

        let state = self.state();
        let subscriptions = match state.container_group {
            Some(containers) => self.subscribe(graph, host, containers, &state.item_filter)?,
            None => Vec::new(),
        };

        *lock(&self.binding) = Some(Binding {
            graph: Arc::downgrade(graph),
            host,
            subscriptions,
        });

        if state.container_group.is_some() {
            self.rescan(graph, host);
        }
        Ok(())
    }

    fn subscribe(
        self: &Arc<Self>,
        graph: &EntityGraph,
        host: EntityId,
        containers: EntityId,
        filter: &ItemFilter,
    ) -> GraphResult<Vec<SubscriptionId>> {
        let weak = Arc::downgrade(self);
        let handler: Arc<dyn SensorEventListener> = Arc::new(move |event: &SensorEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_event(event);
            }
        });

        let mut filters = vec![
            (SourceFilter::Entity(containers), SensorFilter::of(&MEMBER_ADDED)),
            (SourceFilter::Entity(containers), SensorFilter::of(&MEMBER_REMOVED)),
            (SourceFilter::Any, SensorFilter::of(&CONTAINER)),
            (SourceFilter::Any, SensorFilter::of(&LIFECYCLE)),
        ];
        if let Some(sensor) = filter.watched_sensor() {
            filters.push((SourceFilter::Any, SensorFilter::Named(sensor.to_string())));
        }

        let mut ids = Vec::with_capacity(filters.len());
        for (source, sensor) in filters {
            ids.push(graph.subscribe(host, source, sensor, handler.clone())?);
        }
        debug!(host = %host, container_group = %containers, "Membership policy subscribed");
        Ok(ids)
    }

    fn on_event(&self, event: &SensorEvent) {
        let Some((graph, host)) = self.bound() else {
            return;
        };
        let state = self.state();
        let Some(containers) = state.container_group else {
            return;
        };

        if event.is(&MEMBER_ADDED) || event.is(&MEMBER_REMOVED) {
            if event.source != containers {
                return;
            }
            let Some(container) = event.value_as::<EntityId>() else {
                return;
            };
            let items = lock(&self.placements).items_in(container);
            trace!(container = %container, items = items.len(), "Container set changed");
            for item in items {
                self.transition(&graph, host, item);
            }
        } else if event.is(&LIFECYCLE) {
            if event.source == containers {
                // Container group came up or is going away
                self.rescan(&graph, host);
            } else if matches!(graph.has_capability(event.source, Capability::Movable), Ok(true)) {
                self.transition(&graph, host, event.source);
            }
        } else {
            // Container move, or the filter's attribute
            self.transition(&graph, host, event.source);
        }
    }

    /// Re-evaluate every candidate item once
    fn rescan(&self, graph: &EntityGraph, host: EntityId) {
        let mut candidates: BTreeSet<EntityId> =
            graph.with_capability(Capability::Movable).into_iter().collect();
        candidates.extend(graph.members(host).unwrap_or_default());

        debug!(host = %host, candidates = candidates.len(), "Membership rescan");
        for item in candidates {
            self.transition(graph, host, item);
        }
    }

    /// Single-item transition: add, remove or leave alone. Transitions run one
    /// at a time and always see the current container group.
    fn transition(&self, graph: &EntityGraph, host: EntityId, item: EntityId) {
        if item == host {
            return;
        }
        let _serial = lock(&self.transitions);
        let state = self.state();

        let lifecycle = graph.lifecycle(item).ok();
        let container = match lifecycle {
            Some(l) if !l.is_terminal() => graph.attribute(item, &CONTAINER).ok().flatten().flatten(),
            // Gone for good: forget where it was
            _ => None,
        };
        lock(&self.placements).place(item, container);

        let managed = lifecycle == Some(Lifecycle::Managed);
        let accepted = managed && self.accepts(graph, &state, item, container);
        let is_member = graph.has_member(host, item).unwrap_or(false);

        if is_member && !accepted {
            debug!(host = %host, item = %item, "Removing item from group");
            if let Err(e) = graph.remove_member(host, item) {
                warn!(host = %host, item = %item, error = %e, "Failed to remove member");
            }
        } else if !is_member && accepted {
            debug!(host = %host, item = %item, "Adding item to group");
            if let Err(e) = graph.add_member(host, item) {
                warn!(host = %host, item = %item, error = %e, "Failed to add member");
            }
        }
    }

    fn accepts(
        &self,
        graph: &EntityGraph,
        state: &MembershipState,
        item: EntityId,
        container: Option<EntityId>,
    ) -> bool {
        let (Some(containers), Some(container)) = (state.container_group, container) else {
            return false;
        };
        matches!(graph.lifecycle(containers), Ok(Lifecycle::Managed))
            && state.item_filter.accepts(graph, item)
            && graph.has_member(containers, container).unwrap_or(false)
    }
}

/// Rebuilds [`MembershipPolicy`] from its descriptor
pub struct MembershipPolicyFactory;

impl PolicyFactory for MembershipPolicyFactory {
    fn type_tag(&self) -> &str {
        MEMBERSHIP_POLICY
    }

    fn reconstruct(&self, descriptor: &PolicyDescriptor) -> anyhow::Result<Arc<dyn Policy>> {
        let state: MembershipState = serde_json::from_value(descriptor.state.clone())
            .context("Invalid membership policy state")?;
        Ok(Arc::new(MembershipPolicy::from_state(state)))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write_guard<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
