//! Manually maintained override document.
//!
//! Four optional maps, all keyed by slug:
//!   - distributor_to_group        distributor_id -> group_id
//!   - group_labels                group_id -> display label
//!   - distributor_name_overrides  distributor_id -> { sigagente, nomagente }
//!   - distributor_aliases         alternate id -> canonical id
//!
//! RULE: the store is loaded once per run and passed by reference.
//! It is never global, so tests can swap override sets freely.

use crate::{
    error::{PipelineError, PipelineResult},
    text::{collapse_whitespace, slugify, OTHERS_GROUP, UNKNOWN_DISTRIBUTOR},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameOverride {
    #[serde(default)]
    pub sigagente: String,
    #[serde(default)]
    pub nomagente: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OverridesFile {
    #[serde(default)]
    distributor_to_group: BTreeMap<String, String>,
    #[serde(default)]
    group_labels: BTreeMap<String, String>,
    #[serde(default)]
    distributor_name_overrides: BTreeMap<String, NameOverride>,
    #[serde(default)]
    distributor_aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct OverrideStore {
    pub distributor_to_group: BTreeMap<String, String>,
    pub group_labels:         BTreeMap<String, String>,
    pub name_overrides:       BTreeMap<String, NameOverride>,
    pub aliases:              BTreeMap<String, String>,
}

impl OverrideStore {
    /// An empty store: heuristics only.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the override document. A missing file yields an empty store.
    pub fn load(path: &Path) -> PipelineResult<Self> {
        if !path.exists() {
            log::info!("overrides: no document at {}, using heuristics only", path.display());
            return Ok(Self::empty());
        }
        let content = std::fs::read_to_string(path)?;
        let store = Self::from_json(&content).map_err(|reason| PipelineError::InvalidOverrides {
            path: path.display().to_string(),
            reason,
        })?;
        log::info!(
            "overrides: {} group assignments, {} labels, {} name overrides, {} aliases",
            store.distributor_to_group.len(),
            store.group_labels.len(),
            store.name_overrides.len(),
            store.aliases.len(),
        );
        Ok(store)
    }

    /// Parse and normalize an override document.
    /// Keys and ids are slugified; blank entries are dropped.
    pub fn from_json(content: &str) -> Result<Self, String> {
        let value: serde_json::Value =
            serde_json::from_str(content).map_err(|e| e.to_string())?;
        if !value.is_object() {
            return Err("payload must be a JSON object".into());
        }
        let file: OverridesFile = serde_json::from_value(value).map_err(|e| {
            format!("sections must be objects of the documented shape ({e})")
        })?;

        let distributor_to_group = file
            .distributor_to_group
            .iter()
            .filter(|(k, v)| !k.trim().is_empty() && !v.trim().is_empty())
            .map(|(k, v)| (slugify(k, UNKNOWN_DISTRIBUTOR), slugify(v, OTHERS_GROUP)))
            .collect();

        let group_labels = file
            .group_labels
            .iter()
            .filter(|(k, v)| !k.trim().is_empty() && !v.trim().is_empty())
            .map(|(k, v)| (slugify(k, OTHERS_GROUP), v.trim().to_string()))
            .collect();

        let name_overrides = file
            .distributor_name_overrides
            .iter()
            .filter(|(k, _)| !k.trim().is_empty())
            .map(|(k, v)| {
                (
                    slugify(k, UNKNOWN_DISTRIBUTOR),
                    NameOverride {
                        sigagente: collapse_whitespace(&v.sigagente),
                        nomagente: collapse_whitespace(&v.nomagente),
                    },
                )
            })
            .collect();

        let aliases = file
            .distributor_aliases
            .iter()
            .filter(|(k, v)| !k.trim().is_empty() && !v.trim().is_empty())
            .map(|(k, v)| (slugify(k, UNKNOWN_DISTRIBUTOR), slugify(v, UNKNOWN_DISTRIBUTOR)))
            .collect();

        Ok(Self {
            distributor_to_group,
            group_labels,
            name_overrides,
            aliases,
        })
    }

    /// Follow the alias table exactly one hop.
    pub fn canonical_id<'a>(&'a self, id: &'a str) -> &'a str {
        self.aliases.get(id).map(String::as_str).unwrap_or(id)
    }

    pub fn group_for(&self, distributor_id: &str) -> Option<&str> {
        self.distributor_to_group.get(distributor_id).map(String::as_str)
    }

    pub fn label_for(&self, group_id: &str) -> Option<&str> {
        self.group_labels.get(group_id).map(String::as_str)
    }

    pub fn name_for(&self, distributor_id: &str) -> Option<&NameOverride> {
        self.name_overrides.get(distributor_id)
    }
}
