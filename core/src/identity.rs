//! Identity resolution: raw agent signatures to canonical distributors.
//!
//! Resolution steps (fixed order):
//!   1. normalize the raw short code (or legal name if the code is blank)
//!   2. slugify it into the raw id
//!   3. apply the name override keyed by the raw id, else by the canonical id
//!   4. follow the alias table one hop -> canonical id
//!   5. distributor_id = slugify(canonical id)
//!
//! The registry then folds every resolved row of every raw table into one
//! display identity per distributor_id.

use crate::{
    overrides::OverrideStore,
    text::{collapse_whitespace, normalize_key, slugify, UNKNOWN_DISTRIBUTOR},
    types::DistributorId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDistributor {
    pub distributor_id: DistributorId,
    pub name_sig:       String,
    pub name_legal:     String,
    pub label:          String,
    /// True when a manual name override supplied the names.
    pub pinned:         bool,
}

impl ResolvedDistributor {
    /// The name heuristics look at: legal name when known, else the short name.
    pub fn display_name(&self) -> &str {
        if self.name_legal.is_empty() {
            &self.name_sig
        } else {
            &self.name_legal
        }
    }
}

/// `name_sig` alone when the legal name is blank or identical,
/// otherwise `"{name_sig} — {name_legal}"`.
pub fn compose_label(name_sig: &str, name_legal: &str) -> String {
    if name_legal.is_empty() || name_legal == name_sig {
        name_sig.to_string()
    } else {
        format!("{name_sig} — {name_legal}")
    }
}

/// Deterministic id from a raw short code, falling back to the legal name.
pub fn build_distributor_id(sigagente: &str, nomagente: &str) -> DistributorId {
    let sig = normalize_key(sigagente);
    let base = if sig.is_empty() { normalize_key(nomagente) } else { sig };
    slugify(&base, UNKNOWN_DISTRIBUTOR)
}

pub struct IdentityResolver<'a> {
    overrides: &'a OverrideStore,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(overrides: &'a OverrideStore) -> Self {
        Self { overrides }
    }

    pub fn resolve(&self, raw_sig: &str, raw_name: &str) -> ResolvedDistributor {
        let raw_sig = collapse_whitespace(raw_sig);
        let raw_name = collapse_whitespace(raw_name);

        let raw_id = build_distributor_id(&raw_sig, &raw_name);
        let canonical = self.overrides.canonical_id(&raw_id);
        let distributor_id = slugify(canonical, UNKNOWN_DISTRIBUTOR);

        let fallback_sig = if raw_sig.is_empty() { raw_name.clone() } else { raw_sig };

        let name_override = self
            .overrides
            .name_for(&raw_id)
            .or_else(|| self.overrides.name_for(&distributor_id));
        let (name_sig, name_legal, pinned) = match name_override {
            Some(named) => (
                non_empty_or(&named.sigagente, &fallback_sig),
                non_empty_or(&named.nomagente, &raw_name),
                true,
            ),
            None => (fallback_sig, raw_name, false),
        };
        let name_sig = if name_sig.is_empty() { distributor_id.clone() } else { name_sig };

        ResolvedDistributor {
            label: compose_label(&name_sig, &name_legal),
            distributor_id,
            name_sig,
            name_legal,
            pinned,
        }
    }
}

fn non_empty_or(preferred: &str, fallback: &str) -> String {
    if preferred.is_empty() {
        fallback.to_string()
    } else {
        preferred.to_string()
    }
}

#[derive(Debug, Default)]
struct NameTally {
    sig:    BTreeMap<String, usize>,
    legal:  BTreeMap<String, usize>,
    pinned: bool,
}

/// Most frequent spelling; ties go to the lexicographically smallest.
fn most_frequent(tally: &BTreeMap<String, usize>) -> Option<&str> {
    let mut best: Option<(&str, usize)> = None;
    for (name, count) in tally {
        if best.map_or(true, |(_, c)| *count > c) {
            best = Some((name.as_str(), *count));
        }
    }
    best.map(|(name, _)| name)
}

/// Accumulates every resolved row and yields one identity per id.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    entries: BTreeMap<DistributorId, NameTally>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, resolved: &ResolvedDistributor) {
        let tally = self.entries.entry(resolved.distributor_id.clone()).or_default();
        tally.pinned |= resolved.pinned;
        if !resolved.name_sig.is_empty() {
            *tally.sig.entry(resolved.name_sig.clone()).or_default() += 1;
        }
        if !resolved.name_legal.is_empty() {
            *tally.legal.entry(resolved.name_legal.clone()).or_default() += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One canonical identity per distributor_id, in id order.
    pub fn finalize(&self) -> BTreeMap<DistributorId, ResolvedDistributor> {
        self.entries
            .iter()
            .map(|(id, tally)| {
                let name_sig = most_frequent(&tally.sig).unwrap_or(id.as_str()).to_string();
                let name_legal = most_frequent(&tally.legal).unwrap_or("").to_string();
                let resolved = ResolvedDistributor {
                    distributor_id: id.clone(),
                    label: compose_label(&name_sig, &name_legal),
                    name_sig,
                    name_legal,
                    pinned: tally.pinned,
                };
                (id.clone(), resolved)
            })
            .collect()
    }
}
