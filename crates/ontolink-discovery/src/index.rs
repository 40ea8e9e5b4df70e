//! In-memory ranked full-text index over entity property values.
//!
//! One index per discovery cycle. The build is a strict barrier encoded in
//! the types: [`IndexBuilder`] accepts entity batches and is *consumed* by
//! [`IndexBuilder::build`]; only the resulting [`FuzzySearchIndex`] can be
//! searched, and it is immutable. Freeing the index at cycle end bounds
//! memory growth across repeated cycles.
//!
//! Ranking is BM25 over a per-entity-type inverted index. Common property
//! values (a namespace name shared by thousands of entities) would
//! otherwise dominate every result list and starve rarer, more diagnostic
//! matches — diversity re-ranking and per-type caps bound this.

use std::collections::BTreeMap;

use ahash::{HashMap, HashMapExt};
use serde::{Deserialize, Serialize};

use ontolink_graph::{Entity, GraphError};

use crate::bloom::BloomFilter;
use crate::tokenize::document_tokens;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// What a search returns about a matched entity: enough for the deep
/// matcher to enumerate identity-key mappings without another store read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub entity_type: String,
    pub primary_key: String,
    /// One dict per complete identity-key set, primary set first.
    pub identity_keys: Vec<BTreeMap<String, ontolink_graph::PropertyValue>>,
    pub is_sub_entity: bool,
}

/// A weighted-token query. `exclude_type` forbids self-matches against the
/// querying entity's own type.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub tokens: Vec<(String, u32)>,
    pub exclude_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiversityMode {
    Off,
    /// Multiplicatively penalize each repeated entity type in the ranked
    /// list.
    PenalizeRepeats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    pub diversity: DiversityMode,
    /// Factor applied once per prior hit of the same type (0 < p ≤ 1).
    pub diversity_penalty: f64,
    pub max_per_type: usize,
    pub final_k: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            diversity: DiversityMode::PenalizeRepeats,
            diversity_penalty: 0.7,
            max_per_type: 3,
            final_k: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub summary: EntitySummary,
    pub score: f64,
}

#[derive(Debug)]
struct Posting {
    doc: u32,
    tf: u32,
}

#[derive(Debug, Default)]
struct TypeIndex {
    postings: HashMap<String, Vec<Posting>>,
    /// Global summary index per local doc.
    doc_ids: Vec<u32>,
    doc_lens: Vec<u32>,
    total_len: u64,
}

impl TypeIndex {
    fn add_document(&mut self, summary_idx: u32, tokens: &[String]) {
        let local = self.doc_ids.len() as u32;
        self.doc_ids.push(summary_idx);
        self.doc_lens.push(tokens.len() as u32);
        self.total_len += tokens.len() as u64;

        let mut counts: HashMap<&str, u32> = HashMap::new();
        for token in tokens {
            *counts.entry(token.as_str()).or_insert(0) += 1;
        }
        for (token, tf) in counts {
            self.postings
                .entry(token.to_string())
                .or_default()
                .push(Posting { doc: local, tf });
        }
    }

    fn avg_doc_len(&self) -> f64 {
        if self.doc_ids.is_empty() {
            return 0.0;
        }
        self.total_len as f64 / self.doc_ids.len() as f64
    }

    /// BM25 over weighted query tokens: local doc → score.
    fn score(&self, tokens: &[(String, u32)]) -> HashMap<u32, f64> {
        let mut scores: HashMap<u32, f64> = HashMap::new();
        let n = self.doc_ids.len() as f64;
        if n == 0.0 {
            return scores;
        }
        let avg_len = self.avg_doc_len();
        for (token, weight) in tokens {
            let Some(postings) = self.postings.get(token) else {
                continue;
            };
            let df = postings.len() as f64;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
            for posting in postings {
                let dl = self.doc_lens[posting.doc as usize] as f64;
                let tf = posting.tf as f64;
                let term = (tf * (BM25_K1 + 1.0))
                    / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avg_len.max(1.0)));
                *scores.entry(posting.doc).or_insert(0.0) += *weight as f64 * idf * term;
            }
        }
        scores
    }
}

/// Accumulates entity batches for one cycle's index.
pub struct IndexBuilder {
    types: HashMap<String, TypeIndex>,
    summaries: Vec<EntitySummary>,
    bloom: BloomFilter,
}

impl IndexBuilder {
    /// `expected_values` sizes the bloom filter (distinct raw property
    /// values across the corpus; an estimate is fine).
    pub fn new(expected_values: usize) -> Self {
        Self {
            types: HashMap::new(),
            summaries: Vec::new(),
            bloom: BloomFilter::with_capacity(expected_values, 0.01),
        }
    }

    pub fn add_batch(&mut self, entities: &[Entity]) -> Result<(), GraphError> {
        for entity in entities {
            self.add_entity(entity)?;
        }
        Ok(())
    }

    fn add_entity(&mut self, entity: &Entity) -> Result<(), GraphError> {
        let primary_key = entity.primary_key()?;

        let mut identity_keys = Vec::new();
        for key_set in entity.identity_key_sets() {
            let mut dict = BTreeMap::new();
            let mut complete = !key_set.is_empty();
            for field in key_set {
                match entity.properties.get(field) {
                    Some(value) => {
                        dict.insert(field.clone(), value.clone());
                    }
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete && !identity_keys.contains(&dict) {
                identity_keys.push(dict);
            }
        }

        let summary_idx = self.summaries.len() as u32;
        // The bloom answers "could this value be some entity's identity
        // key?" — so only key values (and their word tokens, which keep
        // graded prefix/suffix probes reachable) are inserted.
        for dict in &identity_keys {
            for value in dict.values() {
                for text in value.texts() {
                    for token in document_tokens(&text) {
                        self.bloom.insert(&token);
                    }
                }
            }
        }

        self.summaries.push(EntitySummary {
            entity_type: entity.entity_type.clone(),
            primary_key,
            identity_keys,
            is_sub_entity: entity.is_sub_entity(),
        });

        let mut tokens = Vec::new();
        for value in entity.properties.external.values() {
            for text in value.texts() {
                tokens.extend(document_tokens(&text));
            }
        }
        self.types
            .entry(entity.entity_type.clone())
            .or_default()
            .add_document(summary_idx, &tokens);
        Ok(())
    }

    /// Consume the builder. After this point the index is immutable and
    /// searchable; there is no partial or incremental update path.
    pub fn build(self) -> FuzzySearchIndex {
        FuzzySearchIndex {
            types: self.types,
            summaries: self.summaries,
            bloom: self.bloom,
        }
    }
}

/// The read-only, fully built index for one cycle.
pub struct FuzzySearchIndex {
    types: HashMap<String, TypeIndex>,
    summaries: Vec<EntitySummary>,
    bloom: BloomFilter,
}

impl FuzzySearchIndex {
    /// Bloom membership for a raw property value. No false negatives.
    pub fn contains(&self, value: &str) -> bool {
        self.bloom.contains(value)
    }

    /// Query prefilter: a probe value is worth searching when it, or any
    /// of its word tokens, could be part of some entity's identity key. A
    /// decorated reference like `user-123` still reaches a key of `123`
    /// through its tokens; a value appearing nowhere among keys is
    /// provably not resolvable and the query is skipped.
    pub fn passes_prefilter(&self, value: &str) -> bool {
        document_tokens(value)
            .iter()
            .any(|token| self.bloom.contains(token))
    }

    pub fn document_count(&self) -> usize {
        self.summaries.len()
    }

    /// Rank every query against the index.
    ///
    /// Per query: score all types except `exclude_type`, merge, optionally
    /// diversity re-rank, cap per type, truncate to `final_k`.
    pub fn search_batch(
        &self,
        queries: &[SearchQuery],
        opts: &SearchOptions,
    ) -> Vec<Vec<SearchHit>> {
        queries.iter().map(|q| self.search_one(q, opts)).collect()
    }

    fn search_one(&self, query: &SearchQuery, opts: &SearchOptions) -> Vec<SearchHit> {
        let mut ranked: Vec<(u32, f64)> = Vec::new();
        for (entity_type, index) in &self.types {
            if *entity_type == query.exclude_type {
                continue;
            }
            for (local, score) in index.score(&query.tokens) {
                if score > 0.0 {
                    ranked.push((index.doc_ids[local as usize], score));
                }
            }
        }
        // Deterministic order: score desc, then summary index.
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        if opts.diversity == DiversityMode::PenalizeRepeats {
            let mut seen: HashMap<&str, u32> = HashMap::new();
            let mut reranked: Vec<(u32, f64)> = Vec::with_capacity(ranked.len());
            for (doc, score) in &ranked {
                let entity_type = self.summaries[*doc as usize].entity_type.as_str();
                let repeats = seen.entry(entity_type).or_insert(0);
                let effective = score * opts.diversity_penalty.powi(*repeats as i32);
                *repeats += 1;
                reranked.push((*doc, effective));
            }
            reranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
            ranked = reranked;
        }

        let mut per_type: HashMap<&str, usize> = HashMap::new();
        let mut hits = Vec::new();
        for (doc, score) in ranked {
            let summary = &self.summaries[doc as usize];
            let taken = per_type.entry(summary.entity_type.as_str()).or_insert(0);
            if *taken >= opts.max_per_type {
                continue;
            }
            *taken += 1;
            hits.push(SearchHit {
                summary: summary.clone(),
                score,
            });
            if hits.len() >= opts.final_k {
                break;
            }
        }
        hits
    }
}
