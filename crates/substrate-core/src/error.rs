use thiserror::Error;

use crate::ids::{EdgeId, EntityId, NodeId};

/// Errors raised by the substrate engine.
///
/// None of these are fatal to an engine instance. Propagation failures abort
/// the tick and retry on the next schedule, lifecycle failures defer the
/// decision, and workspace capacity failures yield an empty frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubstrateError {
    /// A write targeted a record that is closed or never existed.
    #[error("stale reference: {0}")]
    StaleReference(RecordRef),

    /// Not even a single-node cluster fits the workspace capacity.
    #[error("capacity violation: smallest candidate needs {needed} units, capacity is {capacity}")]
    CapacityViolation { needed: u32, capacity: u32 },

    /// A lifecycle decision lacks enough cohort samples to be trusted.
    #[error("insufficient cohort data for {metric}: {samples}/{required} samples")]
    InsufficientCohortData {
        metric: &'static str,
        samples: usize,
        required: usize,
    },

    /// A tick could not complete and nothing was committed.
    #[error("tick aborted: {0}")]
    TickAborted(String),

    /// No node is registered under this external key.
    #[error("unknown node key: {0}")]
    UnknownNode(String),

    /// The entity does not exist or no longer accepts this operation.
    #[error("unknown or retired entity: {0}")]
    UnknownEntity(EntityId),

    /// Caller supplied a value outside its domain.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Identifies the record a stale write pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordRef {
    Node(NodeId),
    Edge(EdgeId),
    Entity(EntityId),
}

impl std::fmt::Display for RecordRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordRef::Node(id) => write!(f, "node {id}"),
            RecordRef::Edge(id) => write!(f, "edge {id}"),
            RecordRef::Entity(id) => write!(f, "entity {id}"),
        }
    }
}

impl SubstrateError {
    /// Stable snake_case name for wire replies.
    pub fn kind(&self) -> &'static str {
        match self {
            SubstrateError::StaleReference(_) => "stale_reference",
            SubstrateError::CapacityViolation { .. } => "capacity_violation",
            SubstrateError::InsufficientCohortData { .. } => "insufficient_cohort_data",
            SubstrateError::TickAborted(_) => "tick_aborted",
            SubstrateError::UnknownNode(_) => "unknown_node",
            SubstrateError::UnknownEntity(_) => "unknown_entity",
            SubstrateError::InvalidInput(_) => "invalid_input",
        }
    }

    /// Errors that are resolved by retrying on the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubstrateError::TickAborted(_))
    }

    /// Errors that mean "decide later", never "decide with a default".
    pub fn is_deferral(&self) -> bool {
        matches!(self, SubstrateError::InsufficientCohortData { .. })
    }
}

pub type Result<T> = std::result::Result<T, SubstrateError>;
