//! Ontolink Graph: property-graph data model and store contracts
//!
//! This crate defines the shared vocabulary of the discovery pipeline:
//!
//! - Loosely-typed entities: arbitrary type names, tagged property bags,
//!   one or more identity-key property sets.
//! - The [`GraphStore`] contract consumed by the pipeline for both the
//!   candidate graph (type-level) and the data graph (entity-level).
//! - The [`HeuristicsKv`] contract for versioned heuristic statistics.
//! - In-memory engines for both contracts, used by tests and as the
//!   embedded default backend.
//!
//! The query language of any concrete graph backend is an adapter detail:
//! everything here is expressed as typed operations (merge-by-key upserts,
//! property-filtered relation search, bulk pair materialization, bounded
//! traversals), never as query strings.

pub mod entity;
pub mod error;
pub mod ids;
pub mod kv;
pub mod memory;
pub mod relation;
pub mod retry;
pub mod store;
pub mod value;

pub use entity::{Entity, EntityKey};
pub use error::GraphError;
pub use ids::derive_relation_id;
pub use kv::HeuristicsKv;
pub use memory::{InMemoryGraph, InMemoryKv};
pub use relation::{Relation, RelationFilter};
pub use retry::{with_retry, RetryConfig};
pub use store::{GraphStore, NeighborhoodNode, RelatePairsSpec};
pub use value::{PropertyBag, PropertyValue, Scalar};

/// Result alias used throughout the store contracts.
pub type Result<T> = std::result::Result<T, GraphError>;
