//! Economic-group resolution.
//!
//! PRECEDENCE (fixed, documented, never reordered):
//!   1. Manual override        distributor_id -> group_id
//!   2. Canonical-id prefix    id == token or id starts with "{token}_"
//!   3. Display-name marker    name contains / starts with a brand token
//!   4. First-token fallback   first word of the name, or "outros"
//!
//! Id-prefix runs before name markers: the canonical id is the more
//! specific signal when both would match different groups.

use crate::{
    identity::ResolvedDistributor,
    overrides::OverrideStore,
    text::{normalize_key, slugify, title_word, OTHERS_GROUP},
    types::GroupId,
};

/// Conglomerates recognized from the canonical id.
pub const ID_PREFIX_GROUPS: &[&str] = &["neoenergia", "equatorial", "cpfl", "enel", "energisa"];

/// Markers matched anywhere in the normalized display name.
const NAME_CONTAINS: &[(&str, &str)] = &[("NEOENERGIA", "neoenergia"), ("EQUATORIAL", "equatorial")];

/// Brand tokens matched at the start of the normalized display name.
const NAME_STARTS: &[(&str, &str)] = &[("CPFL", "cpfl"), ("ENEL", "enel"), ("ENERGISA", "energisa")];

/// The contract every group rule must fulfill.
pub trait GroupRule: Send + Sync {
    /// Unique stable name, recorded next to each assignment.
    fn name(&self) -> &'static str;

    /// A group id if this rule decides the distributor, else `None`.
    fn resolve(&self, distributor: &ResolvedDistributor) -> Option<GroupId>;
}

pub struct OverrideRule<'a> {
    overrides: &'a OverrideStore,
}

impl<'a> OverrideRule<'a> {
    pub fn new(overrides: &'a OverrideStore) -> Self {
        Self { overrides }
    }
}

impl GroupRule for OverrideRule<'_> {
    fn name(&self) -> &'static str {
        "override"
    }

    fn resolve(&self, distributor: &ResolvedDistributor) -> Option<GroupId> {
        self.overrides
            .group_for(&distributor.distributor_id)
            .map(str::to_string)
    }
}

pub struct IdPrefixRule;

impl GroupRule for IdPrefixRule {
    fn name(&self) -> &'static str {
        "id_prefix"
    }

    fn resolve(&self, distributor: &ResolvedDistributor) -> Option<GroupId> {
        let id = distributor.distributor_id.as_str();
        ID_PREFIX_GROUPS
            .iter()
            .find(|token| {
                id == **token
                    || id.strip_prefix(**token).is_some_and(|rest| rest.starts_with('_'))
            })
            .map(|token| token.to_string())
    }
}

pub struct NameMarkerRule;

impl GroupRule for NameMarkerRule {
    fn name(&self) -> &'static str {
        "name_marker"
    }

    fn resolve(&self, distributor: &ResolvedDistributor) -> Option<GroupId> {
        let name = normalize_key(distributor.display_name());
        if let Some((_, group)) = NAME_CONTAINS.iter().find(|(marker, _)| name.contains(marker)) {
            return Some(group.to_string());
        }
        NAME_STARTS
            .iter()
            .find(|(token, _)| {
                name.strip_prefix(token)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with(' '))
            })
            .map(|(_, group)| group.to_string())
    }
}

pub struct FirstTokenRule;

impl GroupRule for FirstTokenRule {
    fn name(&self) -> &'static str {
        "first_token"
    }

    fn resolve(&self, distributor: &ResolvedDistributor) -> Option<GroupId> {
        let name = normalize_key(distributor.display_name());
        let token = name.split(' ').next().unwrap_or("");
        Some(slugify(token, OTHERS_GROUP))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAssignment {
    pub group_id:    GroupId,
    pub group_label: String,
    pub rule:        &'static str,
}

/// Ordered rule chain; the first rule returning `Some` wins.
pub struct GroupResolver<'a> {
    overrides: &'a OverrideStore,
    rules:     Vec<Box<dyn GroupRule + 'a>>,
}

impl<'a> GroupResolver<'a> {
    /// The documented chain: override, id prefix, name marker, first token.
    pub fn new(overrides: &'a OverrideStore) -> Self {
        let mut resolver = Self { overrides, rules: Vec::new() };
        resolver.register(Box::new(OverrideRule { overrides }));
        resolver.register(Box::new(IdPrefixRule));
        resolver.register(Box::new(NameMarkerRule));
        resolver.register(Box::new(FirstTokenRule));
        resolver
    }

    /// An empty chain, for tests that assemble their own order.
    pub fn with_rules(overrides: &'a OverrideStore, rules: Vec<Box<dyn GroupRule + 'a>>) -> Self {
        Self { overrides, rules }
    }

    pub fn register(&mut self, rule: Box<dyn GroupRule + 'a>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn resolve(&self, distributor: &ResolvedDistributor) -> GroupAssignment {
        let (group_id, rule) = self
            .rules
            .iter()
            .find_map(|rule| rule.resolve(distributor).map(|g| (g, rule.name())))
            .unwrap_or_else(|| (OTHERS_GROUP.to_string(), "default"));
        GroupAssignment {
            group_label: self.label(&group_id),
            group_id,
            rule,
        }
    }

    pub fn label(&self, group_id: &str) -> String {
        match self.overrides.label_for(group_id) {
            Some(label) => label.to_string(),
            None => default_group_label(group_id),
        }
    }
}

/// "Grupo " + words; words of up to four letters are upper-cased.
pub fn default_group_label(group_id: &str) -> String {
    let words: Vec<String> = group_id
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            if w.chars().count() <= 4 {
                w.to_uppercase()
            } else {
                title_word(w)
            }
        })
        .collect();
    format!("Grupo {}", words.join(" "))
}
