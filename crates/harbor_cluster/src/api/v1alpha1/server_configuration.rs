use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::ComponentStatus;

/// A remote Harbor instance the operator talks to on behalf of namespaces.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(kind = "ServerConfiguration", group = "goharbor.io", version = "v1alpha1")]
#[kube(status = "ComponentStatus", shortname = "hsc")]
#[kube(
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.serverURL"}"#,
    printcolumn = r#"{"name":"Default", "type":"boolean", "jsonPath":".spec.default"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfigurationSpec {
    #[serde(rename = "serverURL")]
    pub server_url: String,
    /// Skips TLS verification towards the server.
    #[serde(default)]
    pub insecure: bool,
    pub access_credential: AccessCredential,
    /// The default configuration serves namespaces that do not name one.
    #[serde(default)]
    pub default: bool,
    /// Namespaces this configuration may serve; all namespaces when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
    /// Image rewrite rules in the `registryRegex=>project` form.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<String>,
}

/// Points at a Secret with `accessKey` and `accessSecret`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessCredential {
    pub namespace: String,
    pub access_secret_ref: String,
}

impl ServerConfiguration {
    /// Host (and port) of the server without its scheme.
    pub fn server_host(&self) -> &str {
        let url = self.spec.server_url.trim_end_matches('/');
        url.split_once("://").map(|(_, host)| host).unwrap_or(url)
    }

    /// Whether a namespace with `labels` may be served by this configuration.
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        self.spec
            .namespace_selector
            .as_ref()
            .map_or(true, |selector| selector_matches(selector, labels))
    }
}

/// Label selector semantics of the API server; an empty selector matches everything.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(key, value)| labels.get(key) == Some(value));
    labels_match
        && selector
            .match_expressions
            .iter()
            .flatten()
            .all(|requirement| requirement_matches(requirement, labels))
}

fn requirement_matches(requirement: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&requirement.key);
    let values = requirement.values.as_deref().unwrap_or_default();
    match requirement.operator.as_str() {
        "In" => value.is_some_and(|v| values.contains(v)),
        "NotIn" => value.map_or(true, |v| !values.contains(v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        _ => false,
    }
}
