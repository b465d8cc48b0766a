use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::cert_manager::IssuerRef;
use crate::api::{
    conditions_schema, default_version, ComponentSpec, Condition, LogLevel, StatusPhase,
};

use super::jobservice::{default_webhook_retry, default_worker_count};

/// Generate the Kubernetes wrapper struct `Platform` from our Spec and Status struct
///
/// A Platform is a whole Harbor installation. The operator splits it into one
/// child resource per enabled component and never writes back into the spec.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "Platform", group = "goharbor.io", version = "v1alpha1", namespaced)]
#[kube(status = "PlatformStatus", shortname = "harbor")]
#[kube(
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.publicURL"}"#,
    printcolumn = r#"{"name":"Applied", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Applied\")].status"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSpec {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(rename = "publicURL")]
    pub public_url: String,
    /// TLS secret served by the ingresses; plain HTTP when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
    /// Secret holding the initial admin password under `password`.
    pub admin_password_secret: String,
    /// Issuer of the token signing certificate.
    pub certificate_issuer_ref: IssuerRef,
    /// Secret with keys host, port, database, username, password and ssl.
    /// Shared by core, clair and notary.
    pub database_secret: String,
    /// Secret with keys url and namespace. The url has the form
    /// `host:port[,weight,password,db]`; caches split it at startup.
    pub redis_secret: String,
    /// Priority class applied to every pod of the platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
    /// Suspends reconciliation while set.
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub components: PlatformComponents,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformComponents {
    #[serde(default)]
    pub core: PlatformCoreSpec,
    #[serde(default)]
    pub registry: PlatformRegistrySpec,
    #[serde(default)]
    pub job_service: PlatformJobServiceSpec,
    #[serde(default)]
    pub portal: ComponentSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_museum: Option<PlatformChartMuseumSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clair: Option<PlatformClairSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notary: Option<PlatformNotarySpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformCoreSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
    /// Token lifetime in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiration: Option<u32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformRegistrySpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_secret: Option<String>,
    /// Uses the platform redis as blob descriptor cache.
    #[serde(default)]
    pub cache: bool,
    /// Image of the registry controller sidecar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_image: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformJobServiceSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
    #[serde(default = "default_worker_count")]
    pub worker_count: u32,
    #[serde(default = "default_webhook_retry")]
    pub webhook_job_max_retry: u32,
}

impl Default for PlatformJobServiceSpec {
    fn default() -> Self {
        Self {
            component: ComponentSpec::default(),
            worker_count: default_worker_count(),
            webhook_job_max_retry: default_webhook_retry(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformChartMuseumSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_secret: Option<String>,
    /// Uses the platform redis as chart cache.
    #[serde(default)]
    pub cache: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformClairSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vulnerability_sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_image: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformNotarySpec {
    /// Host serving the notary API.
    #[serde(rename = "publicURL")]
    pub public_url: String,
    #[serde(default)]
    pub server: ComponentSpec,
    #[serde(default)]
    pub signer: ComponentSpec,
}

/// The status object of `Platform`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStatus {
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
    /// Health of each service as reported by the core health endpoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentHealth>,
}

/// One entry of the `/api/v2.0/health` payload.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
pub struct ComponentHealth {
    pub name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Platform {
    /// Names of the optional components enabled in the spec.
    pub fn enabled_optional_components(&self) -> Vec<&'static str> {
        let components = &self.spec.components;
        let mut enabled = Vec::new();
        if components.chart_museum.is_some() {
            enabled.push("chartmuseum");
        }
        if components.clair.is_some() {
            enabled.push("clair");
        }
        if components.notary.is_some() {
            enabled.push("notary");
        }
        enabled
    }
}
