use crate::{RbacError, RbacResult};

/// Project reference in `cluster:project` form, e.g. `c-abc123:p-xyz789`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectId {
    pub cluster: String,
    pub project: String,
}

impl ProjectId {
    pub fn parse(value: &str) -> RbacResult<Self> {
        match value.split_once(':') {
            Some((cluster, project)) if !cluster.is_empty() && !project.is_empty() => Ok(Self {
                cluster: cluster.to_string(),
                project: project.to_string(),
            }),
            _ => Err(RbacError::InvalidProjectId(value.to_string())),
        }
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.cluster, self.project)
    }
}
