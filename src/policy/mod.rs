// Policies: bus consumers attached to a host entity

use crate::entity::EntityId;
use crate::state::EntityGraph;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;

pub mod membership;

pub use membership::{ItemFilter, MembershipPolicy, MembershipPolicyFactory, MEMBERSHIP_POLICY};


/// Persisted form of a policy instance: its type tag plus whatever state the
/// policy type needs to rebuild itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyDescriptor {
    pub policy_type: String,
    pub state: Value,
}

/// Behaviour attached to an entity.
///
/// # Lifecycle
/// 1. Created directly, or rebuilt from a [`PolicyDescriptor`] by a
///    registered [`PolicyFactory`](crate::registry::PolicyFactory)
/// 2. Attached to a host with `EntityGraph::attach_policy`
/// 3. `activate` is called once the host is managed (immediately when the
///    host already is); this is where a policy subscribes and catches up on
///    current state, since subscriptions never replay history
/// 4. Subscriptions owned by the host are pruned when the host is destroyed
pub trait Policy: Send + Sync + 'static {
    fn policy_type(&self) -> &str;

    /// Snapshot this policy's state for a memento.
    fn descriptor(&self) -> PolicyDescriptor;

    /// Called with the host in `Managed` state.
    fn activate(&self, graph: &Arc<EntityGraph>, host: EntityId) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}
