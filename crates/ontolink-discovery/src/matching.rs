//! Deep property matching: graded value comparison, combinatorial
//! identity-key mapping enumeration, and match-quality scoring.
//!
//! Everything in this module is a pure function over values already in
//! hand; no store access.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use ontolink_graph::{PropertyValue, Scalar};

/// Identity keys are assumed small; the combinatorial matcher refuses to
/// enumerate anything wider than this.
pub const MAX_IDENTITY_KEY_ARITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchType {
    Exact,
    Prefix,
    Suffix,
    Subset,
    Superset,
    Contains,
    None,
}

impl MatchType {
    /// Fixed value-match quality per grade.
    pub fn quality(&self) -> f64 {
        match self {
            MatchType::Exact => 1.0,
            MatchType::Subset | MatchType::Superset => 0.9,
            MatchType::Contains => 0.85,
            MatchType::Prefix => 0.8,
            MatchType::Suffix => 0.7,
            MatchType::None => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "EXACT",
            MatchType::Prefix => "PREFIX",
            MatchType::Suffix => "SUFFIX",
            MatchType::Subset => "SUBSET",
            MatchType::Superset => "SUPERSET",
            MatchType::Contains => "CONTAINS",
            MatchType::None => "NONE",
        }
    }
}

impl std::str::FromStr for MatchType {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s {
            "EXACT" => MatchType::Exact,
            "PREFIX" => MatchType::Prefix,
            "SUFFIX" => MatchType::Suffix,
            "SUBSET" => MatchType::Subset,
            "SUPERSET" => MatchType::Superset,
            "CONTAINS" => MatchType::Contains,
            _ => MatchType::None,
        })
    }
}

/// One matched property pair inside a candidate relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMapping {
    pub entity_a_property: String,
    pub entity_b_idkey_property: String,
    pub match_type: MatchType,
    pub value_match_quality: f64,
}

/// Graded value comparison. `a` is the value being matched against; a
/// shorter string cannot be matched against a longer field value, so
/// `value_match("user-123", "123")` succeeds while
/// `value_match("123", "user-123")` does not. Infix containment for
/// strings is intentionally excluded as too noisy.
pub fn value_match(a: &PropertyValue, b: &PropertyValue) -> Option<(MatchType, f64)> {
    let grade = match (a, b) {
        (PropertyValue::Scalar(sa), PropertyValue::Scalar(sb)) => scalar_match(sa, sb),
        (PropertyValue::List(la), PropertyValue::List(lb)) => list_match(la, lb),
        (PropertyValue::List(la), PropertyValue::Scalar(sb)) => {
            let needle = sb.as_text();
            if la.iter().any(|s| s.as_text() == needle) {
                MatchType::Contains
            } else {
                MatchType::None
            }
        }
        (PropertyValue::Scalar(sa), PropertyValue::List(lb)) => {
            let needle = sa.as_text();
            if lb.iter().any(|s| s.as_text() == needle) {
                MatchType::Contains
            } else {
                MatchType::None
            }
        }
    };
    if grade == MatchType::None {
        None
    } else {
        Some((grade, grade.quality()))
    }
}

fn scalar_match(a: &Scalar, b: &Scalar) -> MatchType {
    let ta = a.as_text();
    let tb = b.as_text();
    if ta == tb {
        return MatchType::Exact;
    }
    // Graded matching is string territory; numbers and booleans either
    // agree or they don't.
    if !matches!((a, b), (Scalar::Str(_), _) | (_, Scalar::Str(_))) {
        return MatchType::None;
    }
    if ta.len() > tb.len() && !tb.is_empty() {
        if ta.starts_with(&tb) {
            return MatchType::Prefix;
        }
        if ta.ends_with(&tb) {
            return MatchType::Suffix;
        }
    }
    MatchType::None
}

fn list_match(a: &[Scalar], b: &[Scalar]) -> MatchType {
    let set_a: BTreeSet<String> = a.iter().map(Scalar::as_text).collect();
    let set_b: BTreeSet<String> = b.iter().map(Scalar::as_text).collect();
    if set_a == set_b {
        MatchType::Exact
    } else if set_a.is_subset(&set_b) {
        MatchType::Subset
    } else if set_b.is_subset(&set_a) {
        MatchType::Superset
    } else {
        MatchType::None
    }
}

/// One identity-key field resolved to one entity property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMatch {
    pub idkey_field: String,
    pub entity_property: String,
    pub match_type: MatchType,
    pub quality: f64,
}

/// One complete assignment covering every identity-key field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingCombination {
    pub fields: Vec<FieldMatch>,
}

impl MappingCombination {
    pub fn average_quality(&self) -> f64 {
        if self.fields.is_empty() {
            return 0.0;
        }
        self.fields.iter().map(|f| f.quality).sum::<f64>() / self.fields.len() as f64
    }

    /// `entity_a_property -> entity_b_idkey_property`, sorted — the input
    /// to relation-id derivation.
    pub fn property_pairs(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .map(|f| (f.entity_property.clone(), f.idkey_field.clone()))
            .collect()
    }

    pub fn to_property_mappings(&self) -> Vec<PropertyMapping> {
        self.fields
            .iter()
            .map(|f| PropertyMapping {
                entity_a_property: f.entity_property.clone(),
                entity_b_idkey_property: f.idkey_field.clone(),
                match_type: f.match_type,
                value_match_quality: f.quality,
            })
            .collect()
    }
}

/// Enumerate every valid assignment of entity properties to identity-key
/// fields.
///
/// Constraints:
/// - every identity-key field must be covered, each by a distinct entity
///   property;
/// - `must_have_pair` (`(entity_a_property, idkey_field)`, the pair that
///   triggered the search) must be part of every combination — pruned
///   first, before any product is built;
/// - only fields in `flexible_fields` may match with a graded (non-exact)
///   grade; every other field requires an exact match. This prevents
///   accepting an entity pair where a coincidental prefix match on every
///   field would otherwise pass.
pub fn enumerate_mappings(
    identity_key: &BTreeMap<String, PropertyValue>,
    entity_properties: &BTreeMap<String, PropertyValue>,
    must_have_pair: (&str, &str),
    flexible_fields: &BTreeSet<String>,
) -> Vec<MappingCombination> {
    let arity = identity_key.len();
    if arity == 0 || arity > MAX_IDENTITY_KEY_ARITY {
        return Vec::new();
    }
    let (must_prop, must_field) = must_have_pair;
    if !identity_key.contains_key(must_field) {
        return Vec::new();
    }

    // Candidate entity properties per identity-key field.
    let mut per_field: Vec<(&String, Vec<FieldMatch>)> = Vec::with_capacity(arity);
    for (field, field_value) in identity_key {
        let flexible = flexible_fields.contains(field);
        let mut candidates = Vec::new();
        for (prop, prop_value) in entity_properties {
            if field == must_field && prop != must_prop {
                continue;
            }
            let Some((match_type, quality)) = value_match(prop_value, field_value) else {
                continue;
            };
            if !flexible && match_type != MatchType::Exact {
                continue;
            }
            candidates.push(FieldMatch {
                idkey_field: field.clone(),
                entity_property: prop.clone(),
                match_type,
                quality,
            });
        }
        if candidates.is_empty() {
            // Early prune: an uncoverable field (the must-have field
            // included) kills the whole enumeration.
            return Vec::new();
        }
        per_field.push((field, candidates));
    }

    let mut combos = Vec::new();
    let mut chosen: Vec<FieldMatch> = Vec::with_capacity(arity);
    let mut used: BTreeSet<String> = BTreeSet::new();
    expand(&per_field, 0, &mut chosen, &mut used, &mut combos);
    combos
}

fn expand(
    per_field: &[(&String, Vec<FieldMatch>)],
    depth: usize,
    chosen: &mut Vec<FieldMatch>,
    used: &mut BTreeSet<String>,
    out: &mut Vec<MappingCombination>,
) {
    if depth == per_field.len() {
        out.push(MappingCombination {
            fields: chosen.clone(),
        });
        return;
    }
    for candidate in &per_field[depth].1 {
        if used.contains(&candidate.entity_property) {
            continue;
        }
        chosen.push(candidate.clone());
        used.insert(candidate.entity_property.clone());
        expand(per_field, depth + 1, chosen, used, out);
        used.remove(&candidate.entity_property);
        chosen.pop();
    }
}

/// Deep-match quality for one query result.
///
/// `(bm25 × uniqueness × avg_quality) + simplicity_bonus` — an unambiguous
/// single mapping is rewarded, a noisy many-way ambiguity suppressed, and
/// smaller identity keys earn a simplicity bonus.
pub fn score_deep_match(
    bm25_score: f64,
    mapping_count: usize,
    avg_quality: f64,
    identity_key_size: usize,
) -> f64 {
    let uniqueness = match mapping_count {
        0 => return 0.0,
        1 => 2.0,
        2 => 1.2,
        3 => 1.0,
        _ => 0.7,
    };
    let simplicity_bonus = 5.0_f64 - identity_key_size as f64;
    bm25_score * uniqueness * avg_quality + simplicity_bonus.max(0.0)
}
