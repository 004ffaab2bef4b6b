use crate::{RbacError, RbacResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Scope a RoleTemplate is bound at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RoleContext {
    #[default]
    Cluster,
    Project,
}

impl RoleContext {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleContext::Cluster => "cluster",
            RoleContext::Project => "project",
        }
    }
}

impl std::fmt::Display for RoleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RoleContext {
    type Err = RbacError;

    fn from_str(value: &str) -> RbacResult<Self> {
        match value {
            "cluster" => Ok(RoleContext::Cluster),
            "project" => Ok(RoleContext::Project),
            other => Err(RbacError::UnknownContext(other.to_string())),
        }
    }
}
