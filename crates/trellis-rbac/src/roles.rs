//! Derived ClusterRole builders and convergence.
//!
//! # Purpose
//! Builds the ClusterRoles a RoleTemplate materializes into and decides
//! whether a live ClusterRole already matches the desired one.
//!
//! # How it fits
//! The materializer builds desired roles here, fetches the live object, calls
//! [`converge_cluster_role`] and writes only when it reports a change.
//!
//! # Key invariants
//! - Every derived role carries `AGGREGATION_LABEL = <its own name>` and the
//!   owner annotation naming the template.
//! - An aggregating role's selectors are the template's own role (under the
//!   given name transform) plus the aggregator of every inherited template
//!   (under the same transform). Selecting inherited aggregators rather than
//!   inherited base roles is what makes inheritance transitive.
//! - The rules of an aggregating role belong to the cluster's aggregation
//!   controller and are never compared or written.
use crate::labels::{AGGREGATION_LABEL, CLUSTER_ROLE_OWNER_ANNOTATION};
use crate::naming::aggregated_cluster_role_name_for;
use k8s_openapi::api::rbac::v1::{AggregationRule, ClusterRole, PolicyRule};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;

/// ClusterRole named `name`, owned by `owner`, holding `rules` verbatim.
pub fn build_cluster_role(name: &str, owner: &str, rules: Vec<PolicyRule>) -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                AGGREGATION_LABEL.to_string(),
                name.to_string(),
            )])),
            annotations: Some(BTreeMap::from([(
                CLUSTER_ROLE_OWNER_ANNOTATION.to_string(),
                owner.to_string(),
            )])),
            ..ObjectMeta::default()
        },
        rules: Some(rules),
        aggregation_rule: None,
    }
}

/// Aggregating ClusterRole for the template `template` under `name_for`.
///
/// With `name_for = cluster_role_name_for` this is `<rt>-aggregator`; with
/// `promoted_cluster_role_name_for` it is `<rt>-promoted-aggregator`.
pub fn build_aggregating_cluster_role(
    template: &str,
    inherited: &[String],
    name_for: fn(&str) -> String,
) -> ClusterRole {
    let own_name = name_for(template);
    let mut selectors = vec![aggregation_selector(own_name.clone())];
    selectors.extend(
        inherited
            .iter()
            .map(|name| aggregation_selector(aggregated_cluster_role_name_for(&name_for(name)))),
    );

    let aggregator_name = aggregated_cluster_role_name_for(&own_name);
    let mut role = build_cluster_role(&aggregator_name, template, Vec::new());
    role.rules = None;
    role.aggregation_rule = Some(AggregationRule {
        cluster_role_selectors: Some(selectors),
    });
    role
}

fn aggregation_selector(value: String) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(AGGREGATION_LABEL.to_string(), value)])),
        match_expressions: None,
    }
}

/// Bring `current` in line with `wanted` in place; returns `true` when
/// anything changed and `current` must be written back.
///
/// Compared fields: rules (plain roles) or aggregation rule (aggregating
/// roles), the owner annotation and the aggregation label. Other labels and
/// annotations on the live object are left alone.
pub fn converge_cluster_role(current: &mut ClusterRole, wanted: &ClusterRole) -> bool {
    let mut changed = false;

    match &wanted.aggregation_rule {
        None => {
            if current.aggregation_rule.is_some() {
                current.aggregation_rule = None;
                changed = true;
            }
            let wanted_rules = wanted.rules.as_deref().unwrap_or_default();
            if !rules_eq(current.rules.as_deref().unwrap_or_default(), wanted_rules) {
                current.rules = Some(wanted_rules.to_vec());
                changed = true;
            }
        }
        Some(rule) => {
            if current.aggregation_rule.as_ref() != Some(rule) {
                current.aggregation_rule = Some(rule.clone());
                changed = true;
            }
        }
    }

    for (key, map) in [
        (CLUSTER_ROLE_OWNER_ANNOTATION, Map::Annotations),
        (AGGREGATION_LABEL, Map::Labels),
    ] {
        let want = map.get(&wanted.metadata).get(key).cloned();
        let live = map.get_mut(&mut current.metadata);
        if live.get(key) != want.as_ref() {
            match want {
                Some(value) => live.insert(key.to_string(), value),
                None => live.remove(key),
            };
            changed = true;
        }
    }

    changed
}

#[derive(Clone, Copy)]
enum Map {
    Labels,
    Annotations,
}

impl Map {
    fn get(self, meta: &ObjectMeta) -> BTreeMap<String, String> {
        match self {
            Map::Labels => meta.labels.clone().unwrap_or_default(),
            Map::Annotations => meta.annotations.clone().unwrap_or_default(),
        }
    }

    fn get_mut(self, meta: &mut ObjectMeta) -> &mut BTreeMap<String, String> {
        match self {
            Map::Labels => meta.labels.get_or_insert_with(BTreeMap::new),
            Map::Annotations => meta.annotations.get_or_insert_with(BTreeMap::new),
        }
    }
}

/// Rule-list equality that treats an absent list and an empty list alike.
pub fn rules_eq(a: &[PolicyRule], b: &[PolicyRule]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| rule_eq(x, y))
}

fn rule_eq(a: &PolicyRule, b: &PolicyRule) -> bool {
    fn list(value: &Option<Vec<String>>) -> &[String] {
        value.as_deref().unwrap_or_default()
    }
    a.verbs == b.verbs
        && list(&a.api_groups) == list(&b.api_groups)
        && list(&a.resources) == list(&b.resources)
        && list(&a.resource_names) == list(&b.resource_names)
        && list(&a.non_resource_urls) == list(&b.non_resource_urls)
}
