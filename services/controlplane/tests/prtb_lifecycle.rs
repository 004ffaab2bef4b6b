mod common;

use common::{Harness, PROJECT, prtb, remote_condition, rule, template};
use controlplane::handlers::{CREATE_NS_ROLE, psa_role_name, readonly_role_name};
use controlplane::status::SUMMARY_COMPLETED;
use controlplane::status::conditions::RECONCILE_BINDINGS;
use controlplane::status::reasons::BINDINGS_EXISTS;
use controlplane::store::StoreResultExt;
use kube::ResourceExt;
use trellis_rbac::{RoleContext, prtb_owner_label};

async fn member_harness(rules: Vec<k8s_openapi::api::rbac::v1::PolicyRule>) -> Harness {
    let harness = Harness::new();
    harness
        .add_template(template("member", RoleContext::Project, rules, &[]))
        .await;
    for ns in ["ns-a", "ns-b"] {
        harness.add_namespace(ns).await;
    }
    harness
}

fn role_names<T>(bindings: &[T], role: impl Fn(&T) -> String) -> Vec<String> {
    let mut names: Vec<String> = bindings.iter().map(role).collect();
    names.sort();
    names
}

#[tokio::test]
async fn prtb_binds_every_project_namespace() {
    let harness = member_harness(vec![rule(&["get"], "", "pods")]).await;
    let stored = harness.apply_prtb(prtb("prtb-1", "alice", "member")).await;

    let bindings = harness.prtb_role_bindings("prtb-1").await;
    let namespaces: Vec<String> = bindings
        .iter()
        .map(|rb| rb.namespace().unwrap_or_default())
        .collect();
    assert_eq!(namespaces, vec!["ns-a", "ns-b"]);
    assert!(bindings.iter().all(|rb| rb.role_ref.name == "member-aggregator"));

    let status = stored.status.expect("status written");
    assert_eq!(remote_condition(&status, RECONCILE_BINDINGS).reason, BINDINGS_EXISTS);
    assert_eq!(status.summary.as_deref(), Some(SUMMARY_COMPLETED));
}

#[tokio::test]
async fn new_namespaces_are_bound_on_the_next_reconcile() {
    let harness = member_harness(vec![rule(&["get"], "", "pods")]).await;
    let stored = harness.apply_prtb(prtb("prtb-1", "alice", "member")).await;
    harness.add_namespace("ns-c").await;

    harness.reconciler.on_change_prtb(&stored).await.expect("reconcile");
    assert_eq!(harness.prtb_role_bindings("prtb-1").await.len(), 3);
}

#[tokio::test]
async fn equal_bindings_are_shared_between_prtbs() {
    let harness = member_harness(vec![rule(&["get"], "", "pods")]).await;
    harness.apply_prtb(prtb("prtb-1", "alice", "member")).await;
    harness.apply_prtb(prtb("prtb-2", "alice", "member")).await;

    let shared = harness.prtb_role_bindings("prtb-1").await;
    assert_eq!(shared.len(), 2);
    assert!(
        shared
            .iter()
            .all(|rb| rb.labels().contains_key(&prtb_owner_label("prtb-2")))
    );

    let first = harness.prtb("prtb-1").await;
    harness.reconciler.on_remove_prtb(&first).await.expect("remove prtb-1");
    assert!(harness.prtb_role_bindings("prtb-1").await.is_empty());
    assert_eq!(harness.prtb_role_bindings("prtb-2").await.len(), 2);

    let second = harness.prtb("prtb-2").await;
    harness.reconciler.on_remove_prtb(&second).await.expect("remove prtb-2");
    let remaining = harness
        .stores
        .role_bindings
        .list(None, &controlplane::store::Selector::exists(prtb_owner_label("prtb-2")))
        .await
        .expect("list");
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn read_only_templates_get_namespace_read_access() {
    let harness = member_harness(vec![rule(&["get"], "", "pods")]).await;
    harness.apply_prtb(prtb("prtb-1", "alice", "member")).await;

    let bindings = harness.prtb_cluster_role_bindings("prtb-1").await;
    assert_eq!(
        role_names(&bindings, |crb| crb.role_ref.name.clone()),
        vec![readonly_role_name(PROJECT)]
    );
}

#[tokio::test]
async fn namespace_creators_get_create_and_edit_access() {
    let harness = member_harness(vec![rule(&["create"], "", "namespaces")]).await;
    harness.apply_prtb(prtb("prtb-1", "alice", "member")).await;

    let bindings = harness.prtb_cluster_role_bindings("prtb-1").await;
    let names = role_names(&bindings, |crb| crb.role_ref.name.clone());
    assert!(names.contains(&CREATE_NS_ROLE.to_string()));
    assert!(names.contains(&format!("{PROJECT}-namespaces-edit")));
    assert!(!names.contains(&readonly_role_name(PROJECT)));
}

#[tokio::test]
async fn psa_updaters_get_the_project_psa_role() {
    let harness = member_harness(vec![rule(&["updatepsa"], "management.cattle.io", "projects")]).await;
    harness.apply_prtb(prtb("prtb-1", "alice", "member")).await;

    let bindings = harness.prtb_cluster_role_bindings("prtb-1").await;
    let names = role_names(&bindings, |crb| crb.role_ref.name.clone());
    assert!(names.contains(&psa_role_name(PROJECT)));
    assert!(
        harness
            .stores
            .cluster_roles
            .get(None, &psa_role_name(PROJECT))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn psa_role_goes_away_with_the_last_grant() {
    let harness = member_harness(vec![rule(&["updatepsa"], "management.cattle.io", "projects")]).await;
    harness.apply_prtb(prtb("prtb-1", "alice", "member")).await;
    harness.apply_prtb(prtb("prtb-2", "bob", "member")).await;
    let psa = psa_role_name(PROJECT);

    let first = harness.prtb("prtb-1").await;
    harness.reconciler.on_remove_prtb(&first).await.expect("remove prtb-1");
    assert!(harness.stores.cluster_roles.get(None, &psa).await.is_ok());

    let last = harness.prtb("prtb-2").await;
    harness.reconciler.on_remove_prtb(&last).await.expect("remove prtb-2");
    assert!(harness.prtb_cluster_role_bindings("prtb-2").await.is_empty());
    assert!(
        harness
            .stores
            .cluster_roles
            .get(None, &psa)
            .await
            .optional()
            .expect("get")
            .is_none()
    );
}

#[tokio::test]
async fn reconciling_a_prtb_again_writes_nothing() {
    let harness = member_harness(vec![
        rule(&["get"], "", "pods"),
        rule(&["create"], "", "namespaces"),
    ])
    .await;
    let stored = harness.apply_prtb(prtb("prtb-1", "alice", "member")).await;

    let before = harness.memory.writes().await;
    harness
        .reconciler
        .on_change_prtb(&stored)
        .await
        .expect("second reconcile");
    assert_eq!(harness.memory.writes().await, before);
    assert_eq!(harness.prtb_role_bindings("prtb-1").await.len(), 2);
}
