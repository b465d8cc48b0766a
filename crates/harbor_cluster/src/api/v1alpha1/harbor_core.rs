use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::{default_version, ComponentSpec, ComponentStatus, LogLevel};

/// Harbor core: API backend, token service and UI backend.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "Core", group = "goharbor.io", version = "v1alpha1", namespaced)]
#[kube(status = "ComponentStatus", shortname = "core")]
#[kube(
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.publicURL"}"#,
    printcolumn = r#"{"name":"Applied", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Applied\")].status"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CoreSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
    #[serde(default = "default_version")]
    pub version: String,
    /// Externally reachable URL, exported as `EXT_ENDPOINT`.
    #[serde(rename = "publicURL")]
    pub public_url: String,
    /// Secret with keys host, port, database, username, password and ssl.
    pub database_secret: String,
    /// Secret holding the initial admin password under `password`.
    pub admin_password_secret: String,
    /// Secret shared with the other components to authenticate against core (`secret` key).
    pub core_secret: String,
    pub jobservice_secret: String,
    /// Secret holding the symmetric key used to encrypt stored credentials.
    pub encryption_key_secret: String,
    pub csrf_key_secret: String,
    /// TLS secret whose private key signs registry tokens.
    pub token_certificate_secret: String,
    /// Redis secret (keys url, namespace) for the session store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_secret: Option<String>,
    /// Scanner database secret, only needed when the scanner is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanner_database_secret: Option<String>,
    #[serde(rename = "registryURL")]
    pub registry_url: String,
    #[serde(rename = "registryControllerURL")]
    pub registry_controller_url: String,
    #[serde(rename = "jobServiceURL")]
    pub job_service_url: String,
    #[serde(rename = "portalURL")]
    pub portal_url: String,
    #[serde(default, rename = "chartRepositoryURL", skip_serializing_if = "Option::is_none")]
    pub chart_repository_url: Option<String>,
    #[serde(default, rename = "clairAdapterURL", skip_serializing_if = "Option::is_none")]
    pub clair_adapter_url: Option<String>,
    #[serde(default, rename = "notaryURL", skip_serializing_if = "Option::is_none")]
    pub notary_url: Option<String>,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Lifetime of the configuration cache, in seconds.
    #[serde(default = "default_config_expiration")]
    pub config_expiration: u64,
    /// Lifetime of issued registry tokens, in minutes.
    #[serde(default = "default_token_expiration")]
    pub token_expiration: u32,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_true")]
    pub sync_quota: bool,
    #[serde(default)]
    pub sync_registry: bool,
}

fn default_config_expiration() -> u64 {
    5
}

fn default_token_expiration() -> u32 {
    30
}

fn default_true() -> bool {
    true
}
