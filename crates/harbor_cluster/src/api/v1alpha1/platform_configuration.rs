use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::{conditions_schema, Condition, SecretKeyRef, StatusPhase};

use super::preserve_unknown_fields;

/// System settings pushed to a remote Harbor through `/api/v2.0/configurations`.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "PlatformConfiguration", group = "goharbor.io", version = "v1alpha1", namespaced)]
#[kube(status = "PlatformConfigurationStatus", shortname = "hc")]
#[kube(
    printcolumn = r#"{"name":"Server", "type":"string", "jsonPath":".spec.serverConfiguration"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfigurationSpec {
    pub server_configuration: String,
    /// Settings payload, e.g. `{"auth_mode": "oidc_auth", "oidc_name": "corp"}`.
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub settings: serde_json::Map<String, serde_json::Value>,
    /// Sensitive settings read from Secrets in the same namespace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_settings: Vec<SecretSetting>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretSetting {
    /// Setting name, e.g. `oidc_client_secret`.
    pub field: String,
    pub secret_key_ref: SecretKeyRef,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfigurationStatus {
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
    /// Fingerprint of the last payload accepted by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_checksum: Option<String>,
}
