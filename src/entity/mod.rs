use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;


/// Globally unique, immutable entity identifier.
///
/// Fresh ids are UUIDv7 (time-ordered); restored ids come verbatim from a
/// memento. An id is never reassigned, even after the entity is destroyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Allocate a new id
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Entity ID parsing errors
#[derive(Debug, PartialEq)]
pub enum ParseError {
    /// Empty entity ID
    Empty,
    /// Not a hyphenated UUID
    InvalidFormat(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "entity id is empty"),
            ParseError::InvalidFormat(msg) => write!(f, "invalid entity id: {}", msg),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse an entity ID from its textual form
///
/// Only the hyphenated UUID form produced by `Display` is accepted; it is also
/// the file stem used for persisted mementos.
///
/// # Examples
///
/// ```
/// use mantle::entity::{parse_entity_id, EntityId};
///
/// let id = EntityId::generate();
/// assert_eq!(parse_entity_id(&id.to_string()).unwrap(), id);
/// assert!(parse_entity_id("not-an-id").is_err());
/// ```
pub fn parse_entity_id(entity_id: &str) -> Result<EntityId, ParseError> {
    if entity_id.is_empty() {
        return Err(ParseError::Empty);
    }

    // Uuid::parse_str also accepts simple/braced/urn forms; keep one canonical form
    if entity_id.len() != 36 {
        return Err(ParseError::InvalidFormat(format!(
            "'{}' is not a hyphenated UUID",
            entity_id
        )));
    }

    Uuid::parse_str(entity_id)
        .map(EntityId)
        .map_err(|e| ParseError::InvalidFormat(format!("'{}': {}", entity_id, e)))
}

impl FromStr for EntityId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_entity_id(s)
    }
}

/// Type tag of an entity, the key into the type registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// Lifecycle of an entity.
///
/// `Unconstructed -> Constructing -> Managed -> Stopping -> Destroyed`.
/// Only `Managed` entities emit events or are visible to subscriptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Unconstructed,
    Constructing,
    Managed,
    Stopping,
    Destroyed,
}

impl Lifecycle {
    pub fn is_managed(self) -> bool {
        self == Lifecycle::Managed
    }

    /// Stopping or destroyed entities accept no new edges.
    pub fn is_terminal(self) -> bool {
        matches!(self, Lifecycle::Stopping | Lifecycle::Destroyed)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Unconstructed => "unconstructed",
            Lifecycle::Constructing => "constructing",
            Lifecycle::Managed => "managed",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Roles an entity type can play. A type declares a set of these instead of
/// sitting somewhere in a class hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Holds config and passes inheritable config to children.
    HasConfig,
    /// May adopt children.
    HasChildren,
    /// Holds members.
    Group,
    /// Item with a current container (`movable.container`).
    Movable,
    /// Entity that items can be placed in.
    BalanceableContainer,
    /// May be referenced as a location.
    Location,
}

impl Capability {
    pub fn name(self) -> &'static str {
        match self {
            Capability::HasConfig => "has_config",
            Capability::HasChildren => "has_children",
            Capability::Group => "group",
            Capability::Movable => "movable",
            Capability::BalanceableContainer => "balanceable_container",
            Capability::Location => "location",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
