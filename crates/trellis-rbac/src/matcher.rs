//! Policy-rule evaluation.
//!
//! # Purpose
//! Answers "does this rule set allow verb V on resource R" the way the
//! cluster's RBAC authorizer does, so the reconciler can decide which
//! namespace-access grants a template implies without asking the API server.
//!
//! # Key invariants
//! - `*` in verbs, API groups or resources matches anything.
//! - A resource pattern `*/sub` matches any `x/sub`.
//! - A rule that lists resource names only matches queries for one of those
//!   names; a query without a name never matches such a rule.
//! - Non-resource rules never match resource queries.
use k8s_openapi::api::rbac::v1::PolicyRule;

const WILDCARD: &str = "*";

/// A single authorization question against a rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleQuery<'a> {
    pub verb: &'a str,
    pub api_group: &'a str,
    pub resource: &'a str,
    pub resource_name: Option<&'a str>,
}

impl<'a> RuleQuery<'a> {
    pub fn new(verb: &'a str, api_group: &'a str, resource: &'a str) -> Self {
        Self {
            verb,
            api_group,
            resource,
            resource_name: None,
        }
    }

    pub fn named(mut self, resource_name: &'a str) -> Self {
        self.resource_name = Some(resource_name);
        self
    }
}

pub fn rules_allow(rules: &[PolicyRule], query: &RuleQuery<'_>) -> bool {
    rules.iter().any(|rule| rule_allows(rule, query))
}

pub fn rule_allows(rule: &PolicyRule, query: &RuleQuery<'_>) -> bool {
    let groups = rule.api_groups.as_deref().unwrap_or_default();
    let resources = rule.resources.as_deref().unwrap_or_default();
    if !rule.verbs.iter().any(|verb| verb == WILDCARD || verb == query.verb) {
        return false;
    }
    if !groups
        .iter()
        .any(|group| group == WILDCARD || group == query.api_group)
    {
        return false;
    }
    if !resources
        .iter()
        .any(|resource| resource_matches(resource, query.resource))
    {
        return false;
    }
    match rule.resource_names.as_deref() {
        None | Some([]) => true,
        Some(names) => query
            .resource_name
            .is_some_and(|wanted| names.iter().any(|name| name == wanted)),
    }
}

fn resource_matches(pattern: &str, resource: &str) -> bool {
    if pattern == WILDCARD || pattern == resource {
        return true;
    }
    // `*/scale` grants the scale subresource of every resource.
    match (pattern.strip_prefix("*/"), resource.split_once('/')) {
        (Some(sub), Some((_, wanted))) => sub == wanted,
        _ => false,
    }
}
