// Entity graph and the per-entity config and attribute stores

mod attributes;
mod config_map;
mod engine;
mod entity;

pub use attributes::{AttributeChange, AttributeMap};
pub use config_map::{ConfigKey, ConfigMap, ConfigValue};
pub use engine::{DestroyMode, EntityGraph};
pub use entity::Entity;
pub(crate) use entity::EntityRecord;

#[cfg(test)]
mod tests;
