use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::{default_version, ComponentSpec, ComponentStatus, LogLevel};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "NotaryServer", group = "goharbor.io", version = "v1alpha1", namespaced)]
#[kube(status = "ComponentStatus", shortname = "notaryserver")]
#[kube(
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.publicURL"}"#,
    printcolumn = r#"{"name":"Applied", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Applied\")].status"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NotaryServerSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(rename = "publicURL")]
    pub public_url: String,
    pub database_secret: String,
    /// TLS secret used to reach the signer.
    pub certificate_secret: String,
    /// Secret whose `tls.crt` verifies tokens issued by core.
    pub token_secret: String,
    /// Realm of the token service, usually `{core}/service/token`.
    #[serde(rename = "tokenServiceURL")]
    pub token_service_url: String,
    #[serde(rename = "signerURL")]
    pub signer_url: String,
    #[serde(default)]
    pub log_level: LogLevel,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "NotarySigner", group = "goharbor.io", version = "v1alpha1", namespaced)]
#[kube(status = "ComponentStatus", shortname = "notarysigner")]
#[kube(
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Applied", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Applied\")].status"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NotarySignerSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
    #[serde(default = "default_version")]
    pub version: String,
    pub database_secret: String,
    /// TLS secret served to notary servers.
    pub certificate_secret: String,
    /// Secret with the `passphrase` key encrypting signing keys.
    pub passphrase_secret: String,
    #[serde(default)]
    pub log_level: LogLevel,
}
