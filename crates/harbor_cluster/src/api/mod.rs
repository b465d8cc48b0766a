use core::fmt;
use std::collections::BTreeMap;
use std::fmt::Display;

use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod cert_manager;
pub mod v1alpha1;

pub const GROUP: &str = "goharbor.io";
pub const API_VERSION: &str = "goharbor.io/v1alpha1";

pub const CLASS_ANNOTATION: &str = "goharbor.io/operator-class";
pub const DEPENDENCY_CHECKSUM_ANNOTATION: &str = "goharbor.io/dependency-checksum";

pub const PLATFORM_NAME_LABEL: &str = "goharbor.io/platform-name";
pub const PLATFORM_NAMESPACE_LABEL: &str = "goharbor.io/platform-namespace";
pub const COMPONENT_LABEL: &str = "goharbor.io/component";

// Namespace annotations driving pull-secret provisioning and image rewriting.
pub const HARBOR_ANNOTATION: &str = "goharbor.io/harbor";
pub const PROJECT_ANNOTATION: &str = "goharbor.io/project";
pub const ROBOT_ANNOTATION: &str = "goharbor.io/robot";
pub const SERVICE_ACCOUNT_ANNOTATION: &str = "goharbor.io/service-account";
pub const REWRITING_RULES_ANNOTATION: &str = "goharbor.io/rewriting-rules";

pub const APPLIED_CONDITION: &str = "Applied";
pub const READY_CONDITION: &str = "Ready";

/// Coarse status written next to the conditions of every kind.
#[derive(Default, Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StatusPhase {
    #[default]
    Unknown,
    Ready,
    Fail,
}

impl Display for StatusPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StatusPhase::Unknown => write!(f, "unknown"),
            StatusPhase::Ready => write!(f, "ready"),
            StatusPhase::Fail => write!(f, "fail"),
        }
    }
}

/// Status condition. Unlike the upstream meta/v1 condition it tracks when the
/// condition was last asserted in addition to when it last flipped.
#[derive(Default, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: reason.to_string(),
            message: message.into(),
            ..Default::default()
        }
    }
}

pub fn conditions_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "array",
        "x-kubernetes-list-type": "map",
        "x-kubernetes-list-map-keys": ["type"],
        "items": {
            "type": "object",
            "properties": {
                "lastTransitionTime": { "format": "date-time", "type": "string" },
                "lastUpdateTime": { "format": "date-time", "type": "string" },
                "message": { "type": "string" },
                "observedGeneration": { "type": "integer", "format": "int64", "default": 0 },
                "reason": { "type": "string" },
                "status": { "type": "string" },
                "type": { "type": "string" }
            },
            "required": [
                "status",
                "type"
            ],
        },
    }))
    .expect("static conditions schema is valid")
}

/// Status shared by every component kind.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

/// Deployment knobs every component accepts.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Image reference; computed from the version when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Fatal,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Fatal => write!(f, "fatal"),
        }
    }
}

/// Reference to a key of a Secret living in the same namespace.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

pub fn default_version() -> String {
    "2.3.0".to_string()
}

pub fn is_valid_url(value: &str) -> bool {
    url_pattern().is_match(value)
}

fn url_pattern() -> &'static regex::Regex {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"^https?://[^\s/$.?#].[^\s]*$").expect("static url pattern compiles")
    })
}

pub fn is_valid_version(value: &str) -> bool {
    semver::Version::parse(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation() {
        assert!(is_valid_url("http://the.dns"));
        assert!(is_valid_url("https://harbor.example.com:8443/path"));
        assert!(!is_valid_url("ftp://harbor.example.com"));
        assert!(!is_valid_url("harbor.example.com"));
    }

    #[test]
    fn version_validation() {
        assert!(is_valid_version("1.10.0"));
        assert!(!is_valid_version("invalid-semver"));
        assert!(!is_valid_version("1.10"));
    }
}
