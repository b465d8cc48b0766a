use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::{conditions_schema, Condition, StatusPhase};

pub static PLATFORM_PROJECT_FINALIZER: &str = "platformproject.goharbor.io/finalizer";

/// A project on a remote Harbor, kept in line with this spec.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "PlatformProject", group = "goharbor.io", version = "v1alpha1", namespaced)]
#[kube(status = "PlatformProjectStatus", shortname = "hp")]
#[kube(
    printcolumn = r#"{"name":"Project", "type":"string", "jsonPath":".spec.projectName"}"#,
    printcolumn = r#"{"name":"ID", "type":"integer", "jsonPath":".status.projectId"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlatformProjectSpec {
    pub server_configuration: String,
    pub project_name: String,
    #[serde(default)]
    pub public: bool,
    /// Storage quota in bytes; -1 for unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_limit: Option<i64>,
    /// CVE IDs ignored when enforcing vulnerability policies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cve_allow_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<ProjectMemberSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMemberSpec {
    /// User or group name.
    pub name: String,
    #[serde(default)]
    pub kind: MemberKind,
    /// One of projectAdmin, developer, guest or maintainer.
    pub role: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    #[default]
    User,
    Group,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformProjectStatus {
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub status: StatusPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_id: Option<i64>,
    /// Fingerprint of the last reconciled membership.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members_hash: Option<String>,
}
