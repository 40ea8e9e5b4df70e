//! Ontolink Discovery: fuzzy search and deep property matching
//!
//! One discovery pass over the data graph works in three layers:
//!
//! 1. [`index`] — an in-memory, per-entity-type BM25 inverted index over
//!    every external property value, fronted by a bloom filter so queries
//!    for values provably absent from the corpus are never issued. The
//!    index is built once per cycle behind a strict barrier
//!    ([`index::IndexBuilder`] must be consumed before any search) and
//!    dropped at cycle end.
//! 2. [`matching`] — pure functions: graded value matching (exact /
//!    prefix / suffix / containment), combinatorial identity-key mapping
//!    enumeration with early must-have pruning, and deep-match scoring.
//! 3. [`processor`] — the per-cycle scan: type-homogeneous entity batches,
//!    boosted query construction, sub-entity bypass, top-score filtering,
//!    and flushes into a [`HeuristicSink`].

pub mod bloom;
pub mod index;
pub mod matching;
pub mod processor;
pub mod tokenize;

pub use bloom::BloomFilter;
pub use index::{
    DiversityMode, EntitySummary, FuzzySearchIndex, IndexBuilder, SearchHit, SearchOptions,
    SearchQuery,
};
pub use matching::{
    enumerate_mappings, score_deep_match, value_match, FieldMatch, MappingCombination, MatchType,
    PropertyMapping, MAX_IDENTITY_KEY_ARITY,
};
pub use processor::{
    DeepPropertyMatch, DiscoveryConfig, HeuristicSink, HeuristicsProcessor, ProcessorState,
    ScanStats, TypeMetadata, SUB_ENTITY_MAPPING_PROPERTY, SUB_ENTITY_TARGET_FIELD,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Graph(#[from] ontolink_graph::GraphError),

    #[error("discovery pass already ran for this processor")]
    AlreadyRan,
}
