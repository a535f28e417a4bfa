//! Error taxonomy shared by the graph and the rebind engine.
//!
//! Structural errors leave the graph unchanged. Rebind-time problems that
//! affect a single entity (`DanglingReference`, `Unrebindable`) are not errors
//! at all: they are recovered locally and listed in the
//! [`RebindReport`](crate::snapshot::RebindReport).

use crate::entity::{EntityId, Lifecycle};
use crate::snapshot::RebindState;

/// Errors raised by structural graph operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Cycle, duplicate parent, or an edge touching a destroyed entity.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Activation ordering violated; retry once the dependency is managed.
    #[error("entity {entity} not ready: parent {parent} is {parent_state}")]
    NotReady {
        entity: EntityId,
        parent: EntityId,
        parent_state: Lifecycle,
    },

    /// No entity with this id was ever created in this graph.
    #[error("unknown entity {0}")]
    NotFound(EntityId),

    /// The entity's type lacks a capability the operation needs.
    #[error("entity {entity} lacks capability {capability}")]
    MissingCapability {
        entity: EntityId,
        capability: &'static str,
    },

    #[error("entity {0} already exists")]
    AlreadyExists(EntityId),

    #[error("entity type '{0}' is not registered")]
    UnknownType(String),

    /// Value could not be converted to or from its JSON form.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Errors that abort a whole save or load.
#[derive(Debug, thiserror::Error)]
pub enum RebindError {
    /// Manifest missing, version mismatch, or an unregistered type tag.
    /// The graph is left untouched.
    #[error("snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    /// Persistence failure. No partial snapshot is left visible.
    #[error("{context}: {source}")]
    IoFailure {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Another save or load is in progress.
    #[error("rebind engine busy ({0})")]
    Busy(RebindState),

    /// Load was aborted before activation; all skeletons were discarded.
    #[error("rebind aborted before activation")]
    Aborted,
}

impl RebindError {
    pub(crate) fn io(context: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        RebindError::IoFailure {
            context: context.into(),
            source: source.into(),
        }
    }
}

pub type GraphResult<T> = Result<T, GraphError>;
