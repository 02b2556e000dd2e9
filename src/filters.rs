//! Allow/deny filtering of kinds.
//!
//! A kind is admitted when it matches any allow rule (or no allow rules are
//! configured) and matches no deny rule. Selector tokens are lowercased; `*`
//! matches everything; the core group matches the literal token `core`.

use serde::{Deserialize, Serialize};

use crate::config::Config;

/// One allow or deny selector over (apiGroups, resources).
///
/// An empty selector set matches any value. A rule with both sets empty is
/// dropped during config normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRule {
    #[serde(rename = "apiGroups")]
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
}

/// Whether the (group, plural) kind identity passes the configured filters.
pub fn allows_resource(cfg: &Config, group: &str, plural: &str) -> bool {
    let mut allowed = matches_any_rule(&cfg.allow_rules, group, plural);
    if cfg.allow_rules.is_empty() {
        allowed = true;
    }
    if matches_any_rule(&cfg.deny_rules, group, plural) {
        return false;
    }
    allowed
}

fn matches_any_rule(rules: &[FilterRule], group: &str, plural: &str) -> bool {
    rules.iter().any(|rule| rule_matches(rule, group, plural))
}

fn rule_matches(rule: &FilterRule, group: &str, plural: &str) -> bool {
    if !rule.api_groups.is_empty() && !match_group(&rule.api_groups, group) {
        return false;
    }
    if !rule.resources.is_empty() && !match_value(&rule.resources, plural) {
        return false;
    }
    true
}

fn match_group(groups: &[String], group: &str) -> bool {
    let group = group.trim().to_lowercase();
    let group = if group.is_empty() { "core" } else { &group };
    match_value(groups, group)
}

fn match_value(values: &[String], value: &str) -> bool {
    let value = value.trim().to_lowercase();
    values
        .iter()
        .any(|candidate| candidate == "*" || *candidate == value)
}
