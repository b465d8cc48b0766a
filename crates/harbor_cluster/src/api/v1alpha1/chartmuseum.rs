use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::{default_version, ComponentSpec, ComponentStatus};

/// Helm chart repository.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "ChartMuseum", group = "goharbor.io", version = "v1alpha1", namespaced)]
#[kube(status = "ComponentStatus", shortname = "chartmuseum")]
#[kube(
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.publicURL"}"#,
    printcolumn = r#"{"name":"Applied", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Applied\")].status"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ChartMuseumSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(rename = "publicURL")]
    pub public_url: String,
    /// Secret whose keys become `STORAGE_*` variables; local storage when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_secret: Option<String>,
    /// Redis secret (keys addr and optional password) enabling the chart cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_secret: Option<String>,
    /// Secret with `username` and `password` protecting the API.
    pub basic_auth_secret: String,
}
