use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::cert_manager::IssuerRef;
use crate::api::{default_version, ComponentSpec, ComponentStatus, LogLevel};

/// Docker distribution registry, optionally with its controller as a sidecar.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "Registry", group = "goharbor.io", version = "v1alpha1", namespaced)]
#[kube(status = "ComponentStatus", shortname = "registry")]
#[kube(
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.publicURL"}"#,
    printcolumn = r#"{"name":"Applied", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Applied\")].status"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(rename = "publicURL")]
    pub public_url: String,
    /// ConfigMap carrying `REGISTRY_HTTP_HOST` and `REGISTRY_AUTH_TOKEN_REALM`.
    pub urls_config_map: String,
    /// Secret holding a `storage` YAML fragment; local emptyDir storage when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_secret: Option<String>,
    /// Redis secret (keys addr and optional password) for the blob descriptor cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_secret: Option<String>,
    /// Secret with the `secret` key used to sign upload state.
    pub http_secret: String,
    /// Secret whose `tls.crt` verifies tokens issued by core.
    pub token_certificate_secret: String,
    /// When set, the token certificate is requested from this issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_issuer_ref: Option<IssuerRef>,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Runs the registry controller API next to the registry in the same pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<RegistrySidecarSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySidecarSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub core_secret: String,
    pub jobservice_secret: String,
}
