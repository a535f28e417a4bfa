//! Sensors every entity type shares.

use super::{AttributeSensor, EventSensor};
use crate::entity::{EntityId, Lifecycle};

/// Set to `Managed` on activation.
pub const LIFECYCLE: AttributeSensor<Lifecycle> = AttributeSensor::new("lifecycle");

/// Emitted by a group when a member joins; value is the member id.
pub const MEMBER_ADDED: EventSensor<EntityId> = EventSensor::new("group.members.added");

/// Emitted by a group when a member leaves; value is the member id.
pub const MEMBER_REMOVED: EventSensor<EntityId> = EventSensor::new("group.members.removed");

/// Emitted by a parent when it adopts a child.
pub const CHILD_ADDED: EventSensor<EntityId> = EventSensor::new("entity.children.added");

/// Emitted by a parent when a child is detached or destroyed.
pub const CHILD_REMOVED: EventSensor<EntityId> = EventSensor::new("entity.children.removed");

/// Current container of a `Movable` item (null when unplaced).
pub const CONTAINER: AttributeSensor<Option<EntityId>> = AttributeSensor::new("movable.container");
