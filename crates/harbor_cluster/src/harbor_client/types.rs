use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::api::v1alpha1::ComponentHealth;

/// Payload of `GET /api/v2.0/health`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OverallHealthStatus {
    pub status: String,
    #[serde(default)]
    pub components: Vec<ComponentHealth>,
}

impl OverallHealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub project_id: i64,
    pub name: String,
    #[serde(default)]
    pub metadata: ProjectMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cve_allowlist: Option<CveAllowlist>,
}

impl Project {
    pub fn is_public(&self) -> bool {
        self.metadata.public.as_deref() == Some("true")
    }
}

/// Project metadata; the API encodes booleans as strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CveAllowlist {
    #[serde(default)]
    pub items: Vec<CveAllowlistItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CveAllowlistItem {
    pub cve_id: String,
}

/// Body of project create and update calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectReq {
    pub project_name: String,
    pub metadata: ProjectMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cve_allowlist: Option<CveAllowlist>,
}

impl ProjectReq {
    pub fn new(name: &str, public: bool) -> Self {
        Self {
            project_name: name.to_string(),
            metadata: ProjectMetadata {
                public: Some(public.to_string()),
            },
            ..Default::default()
        }
    }

    pub fn with_cve_allowlist(mut self, cves: &[String]) -> Self {
        self.cve_allowlist = Some(CveAllowlist {
            items: cves
                .iter()
                .map(|cve| CveAllowlistItem { cve_id: cve.clone() })
                .collect(),
        });
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RobotAccess {
    pub resource: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RobotPermission {
    pub kind: String,
    pub namespace: String,
    pub access: Vec<RobotAccess>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RobotCreate {
    pub name: String,
    pub description: String,
    /// Days until expiry; -1 never expires.
    pub duration: i64,
    pub level: String,
    pub permissions: Vec<RobotPermission>,
}

impl RobotCreate {
    /// Project-level robot allowed to pull from `project`.
    pub fn pull_only(name: &str, project: &str) -> Self {
        Self {
            name: name.to_string(),
            description: format!("pull access to {project}"),
            duration: -1,
            level: "project".to_string(),
            permissions: vec![RobotPermission {
                kind: "project".to_string(),
                namespace: project.to_string(),
                access: vec![RobotAccess {
                    resource: "repository".to_string(),
                    action: "pull".to_string(),
                }],
            }],
        }
    }
}

/// Only returned once; the secret cannot be read back later.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RobotCreated {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Robot {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub expires_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectMember {
    pub id: i64,
    #[serde(default)]
    pub project_id: i64,
    pub entity_name: String,
    /// `u` for users, `g` for groups.
    #[serde(default)]
    pub entity_type: String,
    pub role_id: i64,
    #[serde(default)]
    pub role_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberUser {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberGroup {
    pub group_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectMemberReq {
    pub role_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_user: Option<MemberUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_group: Option<MemberGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleRequest {
    pub role_id: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Quota {
    pub id: i64,
    #[serde(default)]
    pub hard: BTreeMap<String, i64>,
    #[serde(default)]
    pub used: BTreeMap<String, i64>,
}

impl Quota {
    pub fn storage_limit(&self) -> Option<i64> {
        self.hard.get("storage").copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotaUpdateReq {
    pub hard: BTreeMap<String, i64>,
}

impl QuotaUpdateReq {
    pub fn storage(limit: i64) -> Self {
        Self {
            hard: BTreeMap::from([("storage".to_string(), limit)]),
        }
    }
}
