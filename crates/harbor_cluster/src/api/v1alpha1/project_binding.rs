use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::ComponentStatus;

pub static PROJECT_BINDING_FINALIZER: &str = "projectbinding.goharbor.io/finalizer";

/// Robot ID resolved for the binding.
pub const ROBOT_ID_ANNOTATION: &str = "goharbor.io/robot-id";
/// Name of the pull secret materialized for the binding.
pub const PULL_SECRET_ANNOTATION: &str = "goharbor.io/pull-secret";

/// Pull credential of one service account towards one Harbor project.
///
/// Created by the namespace controller; users are not expected to write these.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "ProjectBinding", group = "goharbor.io", version = "v1alpha1", namespaced)]
#[kube(status = "ComponentStatus", shortname = "pb")]
#[kube(
    printcolumn = r#"{"name":"Server", "type":"string", "jsonPath":".spec.serverConfiguration"}"#,
    printcolumn = r#"{"name":"Project", "type":"string", "jsonPath":".spec.projectName"}"#,
    printcolumn = r#"{"name":"ServiceAccount", "type":"string", "jsonPath":".spec.serviceAccount"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectBindingSpec {
    pub server_configuration: String,
    pub service_account: String,
    pub project_name: String,
}

impl ProjectBinding {
    pub fn robot_id(&self) -> Option<i64> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ROBOT_ID_ANNOTATION))
            .and_then(|v| v.parse().ok())
    }

    pub fn pull_secret(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(PULL_SECRET_ANNOTATION))
            .map(String::as_str)
    }
}
