//! The `HeuristicsKv` contract: versioned heuristic statistics storage.
//!
//! Keys are opaque strings namespaced by the caller as
//! `fkey:{version}:{kind}:{relation_id}`. The contract requires atomic
//! per-field increments (safe under concurrent merges without cross-key
//! transactions), bounded lists, prefix scans, and a single global
//! current-version pointer.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::Result;

#[async_trait]
pub trait HeuristicsKv: Send + Sync {
    /// Atomically add `by` to a numeric hash field, creating the hash
    /// and/or field as needed. Returns the new value.
    async fn hash_incr(&self, key: &str, field: &str, by: f64) -> Result<f64>;

    /// Set a hash field to a string value.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// The whole hash, or an empty map if the key is absent.
    async fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>>;

    /// Push onto the tail of a list, trimming the head so at most `cap`
    /// elements remain.
    async fn list_push_capped(&self, key: &str, value: &str, cap: usize) -> Result<()>;

    async fn list_range(&self, key: &str) -> Result<Vec<String>>;

    /// All keys starting with `prefix` (hashes and lists alike).
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete all keys starting with `prefix`; returns the count.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Read a plain string key (the current-version pointer).
    async fn get_str(&self, key: &str) -> Result<Option<String>>;

    /// Write a plain string key. The pointer flip is the cutover point, so
    /// implementations must make this atomic with respect to `get_str`.
    async fn set_str(&self, key: &str, value: &str) -> Result<()>;

    async fn delete_key(&self, key: &str) -> Result<bool>;
}
