//! Typed errors for the store contracts.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    /// No relation can be keyed without the key property present.
    #[error("entity type {entity_type} is missing key property {property}")]
    MissingKeyProperty {
        entity_type: String,
        property: String,
    },

    #[error("entity {0} not found")]
    EntityNotFound(String),

    /// A backend-specific failure (network, storage, serialization).
    #[error("store failure: {0}")]
    Store(String),

    /// Surfaced after bounded retries are exhausted.
    #[error("write failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<GraphError>,
    },
}

impl GraphError {
    /// Transient failures are eligible for retry; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, GraphError::Store(_))
    }
}
