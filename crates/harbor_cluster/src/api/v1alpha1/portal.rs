use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::{default_version, ComponentSpec, ComponentStatus};

/// Static web UI.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "Portal", group = "goharbor.io", version = "v1alpha1", namespaced)]
#[kube(status = "ComponentStatus", shortname = "portal")]
#[kube(
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Applied", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Applied\")].status"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PortalSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
    #[serde(default = "default_version")]
    pub version: String,
}
