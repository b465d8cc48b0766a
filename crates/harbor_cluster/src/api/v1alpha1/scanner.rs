use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::{default_version, ComponentSpec, ComponentStatus, LogLevel};

/// Clair vulnerability scanner and the adapter exposing it to Harbor.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "Scanner", group = "goharbor.io", version = "v1alpha1", namespaced)]
#[kube(status = "ComponentStatus", shortname = "scanner")]
#[kube(
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Applied", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Applied\")].status"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScannerSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
    #[serde(default = "default_version")]
    pub version: String,
    pub database_secret: String,
    /// Updaters enabled in clair, e.g. `ubuntu`, `debian`, `alpine`.
    #[serde(default = "default_vulnerability_sources")]
    pub vulnerability_sources: Vec<String>,
    /// Interval between vulnerability database updates, in hours.
    #[serde(default = "default_update_interval")]
    pub update_interval: u32,
    pub adapter: ScannerAdapterSpec,
    #[serde(default)]
    pub log_level: LogLevel,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScannerAdapterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Redis secret (keys url, namespace) used as the adapter's job broker.
    pub redis_secret: String,
}

fn default_vulnerability_sources() -> Vec<String> {
    ["ubuntu", "debian", "alpine", "rhel"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_update_interval() -> u32 {
    12
}
