//! Entity directory and governance dimensions.
//!
//! The directory is the single place raw rows get their ids: every fact
//! builder looks rows up here, so all tables join on the same keys.

use crate::{
    error::{PipelineError, PipelineResult},
    group::GroupResolver,
    identity::{IdentityRegistry, IdentityResolver, ResolvedDistributor},
    ingest::{AgentRow, RawCorpus},
    overrides::OverrideStore,
    types::{DistributorId, GroupId},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub identity:    ResolvedDistributor,
    pub group_id:    GroupId,
    pub group_label: String,
    pub group_rule:  String,
}

pub struct EntityDirectory<'a> {
    resolver: IdentityResolver<'a>,
    entries:  BTreeMap<DistributorId, DirectoryEntry>,
}

impl<'a> EntityDirectory<'a> {
    /// Resolve one group per consolidated identity.
    pub fn build(overrides: &'a OverrideStore, registry: &IdentityRegistry) -> Self {
        let groups = GroupResolver::new(overrides);
        let entries: BTreeMap<DistributorId, DirectoryEntry> = registry
            .finalize()
            .into_iter()
            .map(|(id, identity)| {
                let assignment = groups.resolve(&identity);
                log::debug!(
                    "stage=identity {id} -> {} via {}",
                    assignment.group_id,
                    assignment.rule
                );
                let entry = DirectoryEntry {
                    identity,
                    group_id: assignment.group_id,
                    group_label: assignment.group_label,
                    group_rule: assignment.rule.to_string(),
                };
                (id, entry)
            })
            .collect();
        Self {
            resolver: IdentityResolver::new(overrides),
            entries,
        }
    }

    /// Directory entry for a raw (sigagente, nomagente) pair.
    /// `None` means the pair was never registered: a resolution defect.
    pub fn lookup(&self, raw_sig: &str, raw_name: &str) -> Option<&DirectoryEntry> {
        let resolved = self.resolver.resolve(raw_sig, raw_name);
        self.entries.get(&resolved.distributor_id)
    }

    pub fn get(&self, distributor_id: &str) -> Option<&DirectoryEntry> {
        self.entries.get(distributor_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn group_label(&self, group_id: &str) -> Option<&str> {
        self.entries
            .values()
            .find(|e| e.group_id == group_id)
            .map(|e| e.group_label.as_str())
    }
}

/// Fold every agent-bearing raw row into one registry. Indicator,
/// connection and service rows all name distributors, so all three count
/// towards the consolidated display names.
pub fn collect_identities(overrides: &OverrideStore, corpus: &RawCorpus) -> IdentityRegistry {
    fn observe_all<T: AgentRow>(rows: &[T], resolver: &IdentityResolver<'_>, registry: &mut IdentityRegistry) {
        for row in rows {
            registry.observe(&resolver.resolve(row.sigagente(), row.nomagente()));
        }
    }

    let resolver = IdentityResolver::new(overrides);
    let mut registry = IdentityRegistry::new();
    observe_all(&corpus.indicators.rows, &resolver, &mut registry);
    observe_all(&corpus.connections.rows, &resolver, &mut registry);
    observe_all(&corpus.services.rows, &resolver, &mut registry);
    log::info!("stage=identity distributors={}", registry.len());
    registry
}

/// One row per (group_id, distributor_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDimensionRow {
    pub group_id:               GroupId,
    pub group_label:            String,
    pub distributor_id:         DistributorId,
    pub distributor_name_sig:   String,
    pub distributor_name_legal: String,
    pub distributor_label:      String,
    pub distributor_count:      usize,
    pub selector_enabled:       bool,
    pub group_rule:             String,
}

/// One object per group, members sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomicGroup {
    pub group_id:          GroupId,
    pub group_label:       String,
    pub distributor_count: usize,
    pub selector_enabled:  bool,
    pub distributor_ids:   Vec<DistributorId>,
    pub distributor_names: Vec<String>,
}

pub fn build_group_dimension(directory: &EntityDirectory<'_>) -> Vec<GroupDimensionRow> {
    let mut members: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for entry in directory.entries() {
        members
            .entry(entry.group_id.as_str())
            .or_default()
            .insert(entry.identity.distributor_id.as_str());
    }

    let mut rows: Vec<GroupDimensionRow> = directory
        .entries()
        .map(|entry| {
            let count = members.get(entry.group_id.as_str()).map_or(0, BTreeSet::len);
            GroupDimensionRow {
                group_id: entry.group_id.clone(),
                group_label: entry.group_label.clone(),
                distributor_id: entry.identity.distributor_id.clone(),
                distributor_name_sig: entry.identity.name_sig.clone(),
                distributor_name_legal: entry.identity.name_legal.clone(),
                distributor_label: entry.identity.label.clone(),
                distributor_count: count,
                selector_enabled: count >= 2,
                group_rule: entry.group_rule.clone(),
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        (&a.group_id, &a.distributor_label, &a.distributor_id)
            .cmp(&(&b.group_id, &b.distributor_label, &b.distributor_id))
    });
    rows.dedup_by(|a, b| a.group_id == b.group_id && a.distributor_id == b.distributor_id);
    rows
}

pub fn to_group_objects(dimension: &[GroupDimensionRow]) -> Vec<EconomicGroup> {
    let mut by_group: BTreeMap<&str, Vec<&GroupDimensionRow>> = BTreeMap::new();
    for row in dimension {
        by_group.entry(row.group_id.as_str()).or_default().push(row);
    }
    by_group
        .into_iter()
        .filter_map(|(group_id, rows)| {
            let first = rows.first()?;
            let ids: BTreeSet<&str> = rows.iter().map(|r| r.distributor_id.as_str()).collect();
            let names: BTreeSet<&str> = rows.iter().map(|r| r.distributor_label.as_str()).collect();
            Some(EconomicGroup {
                group_id: group_id.to_string(),
                group_label: first.group_label.clone(),
                distributor_count: first.distributor_count,
                selector_enabled: first.selector_enabled,
                distributor_ids: ids.into_iter().map(str::to_string).collect(),
                distributor_names: names.into_iter().map(str::to_string).collect(),
            })
        })
        .collect()
}

/// Every (group_id, distributor_id) key of a fact table must exist in the
/// dimension.
pub fn check_referential_completeness<'k>(
    dimension: &[GroupDimensionRow],
    table: &str,
    keys: impl IntoIterator<Item = (&'k str, &'k str)>,
) -> PipelineResult<()> {
    let known: BTreeSet<(&str, &str)> = dimension
        .iter()
        .map(|r| (r.group_id.as_str(), r.distributor_id.as_str()))
        .collect();
    let missing: BTreeSet<String> = keys
        .into_iter()
        .filter(|key| !known.contains(key))
        .map(|(g, d)| format!("{g}/{d}"))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::ReferentialGap {
            table: table.to_string(),
            ids: missing.into_iter().collect(),
        })
    }
}

/// Label composition audit: rows whose label breaks the composition rule.
pub fn audit_labels(dimension: &[GroupDimensionRow]) -> Vec<String> {
    dimension
        .iter()
        .filter(|r| {
            r.distributor_label
                != crate::identity::compose_label(&r.distributor_name_sig, &r.distributor_name_legal)
        })
        .map(|r| r.distributor_id.clone())
        .collect()
}

/// Brands the first-token fallback must never swallow.
const MISGROUP_PREFIXES: &[&str] = &["neoenergia", "cpfl", "enel"];

/// Short names of branded distributors that fell into the `companhia`
/// group, i.e. the fallback took the first word of a "Companhia ..." legal
/// name. Sorted, without repeats.
pub fn audit_misgrouped(dimension: &[GroupDimensionRow]) -> Vec<String> {
    let offenders: BTreeSet<&str> = dimension
        .iter()
        .filter(|r| r.group_id.eq_ignore_ascii_case("companhia"))
        .filter(|r| {
            let sig = r.distributor_name_sig.to_lowercase();
            MISGROUP_PREFIXES.iter().any(|p| sig.starts_with(p))
        })
        .map(|r| r.distributor_name_sig.as_str())
        .collect();
    offenders.into_iter().map(str::to_string).collect()
}
