use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::{default_version, ComponentSpec, ComponentStatus, LogLevel};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "JobService", group = "goharbor.io", version = "v1alpha1", namespaced)]
#[kube(status = "ComponentStatus", shortname = "jobservice")]
#[kube(
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Applied", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Applied\")].status"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct JobServiceSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
    #[serde(default = "default_version")]
    pub version: String,
    /// Redis secret (keys url, namespace) backing the job queue.
    pub redis_secret: String,
    #[serde(rename = "coreURL")]
    pub core_url: String,
    #[serde(rename = "registryControllerURL")]
    pub registry_controller_url: String,
    pub core_secret: String,
    pub jobservice_secret: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: u32,
    /// Max retries of webhook notification jobs.
    #[serde(default = "default_webhook_retry")]
    pub webhook_job_max_retry: u32,
    #[serde(default)]
    pub log_level: LogLevel,
}

pub fn default_worker_count() -> u32 {
    10
}

pub fn default_webhook_retry() -> u32 {
    3
}
