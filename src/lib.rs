// Entity ids, types, lifecycle and capabilities
pub mod entity;

// Error taxonomy
pub mod error;

// Sensors and sensor events
pub mod event;

// Entity graph, config and attribute store
pub mod state;

// Event bus with per-subscriber ordered delivery
pub mod subscription;

// Policies attached to entities
pub mod policy;

// Type tag -> factory registry
pub mod registry;

// Mementos, snapshot store and the rebind engine
pub mod snapshot;

// TOML configuration
pub mod config;

// Management context lifecycle
pub mod context;

pub use context::ManagementContext;
pub use entity::{Capability, EntityId, EntityType, Lifecycle};
pub use error::{GraphError, GraphResult, RebindError};
pub use registry::TypeRegistry;
pub use state::{DestroyMode, EntityGraph};
