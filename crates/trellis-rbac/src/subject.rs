use crate::bindings::RBAC_API_GROUP;
use crate::{RbacError, RbacResult};
use k8s_openapi::api::rbac::v1::Subject;

/// Subject fields of a CRTB or PRTB. Exactly one must be set.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubjectSource<'a> {
    /// Name of the binding, used in error messages.
    pub binding: &'a str,
    pub user_name: Option<&'a str>,
    pub group_principal_name: Option<&'a str>,
    pub group_name: Option<&'a str>,
    /// `namespace:name` of a service account (project bindings only).
    pub service_account: Option<&'a str>,
}

pub fn build_subject(source: &SubjectSource<'_>) -> RbacResult<Subject> {
    fn present(value: Option<&str>) -> Option<&str> {
        value.filter(|v| !v.is_empty())
    }

    let candidates = [
        present(source.user_name).map(|name| ("User", name)),
        present(source.group_principal_name).map(|name| ("Group", name)),
        present(source.group_name).map(|name| ("Group", name)),
        present(source.service_account).map(|name| ("ServiceAccount", name)),
    ];
    let mut chosen = candidates.into_iter().flatten();
    let Some((kind, name)) = chosen.next() else {
        return Err(RbacError::NoSubject(source.binding.to_string()));
    };
    if chosen.next().is_some() {
        return Err(RbacError::AmbiguousSubject(source.binding.to_string()));
    }

    if kind == "ServiceAccount" {
        let Some((namespace, account)) = name
            .split_once(':')
            .filter(|(ns, account)| !ns.is_empty() && !account.is_empty())
        else {
            return Err(RbacError::InvalidServiceAccount(name.to_string()));
        };
        return Ok(Subject {
            api_group: None,
            kind: kind.to_string(),
            name: account.to_string(),
            namespace: Some(namespace.to_string()),
        });
    }

    Ok(Subject {
        api_group: Some(RBAC_API_GROUP.to_string()),
        kind: kind.to_string(),
        name: name.to_string(),
        namespace: None,
    })
}

/// Subject-list equality that ignores the empty-vs-absent distinctions the
/// API server introduces on read.
pub fn subjects_eq(a: &[Subject], b: &[Subject]) -> bool {
    fn opt(value: &Option<String>) -> &str {
        value.as_deref().unwrap_or_default()
    }
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.kind == y.kind
                && x.name == y.name
                && opt(&x.api_group) == opt(&y.api_group)
                && opt(&x.namespace) == opt(&y.namespace)
        })
}
