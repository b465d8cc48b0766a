//! Pod image rewriting towards the Harbor servers configured for a namespace.

use std::collections::BTreeMap;
use std::sync::Arc;

use harbor_cluster::api::v1alpha1::ServerConfiguration;
use harbor_cluster::api::REWRITING_RULES_ANNOTATION;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
use kube::{
    api::{Api, DynamicObject},
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    runtime::reflector::Store,
    Client, ResourceExt,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::WebhookError;
use crate::image::ImageRef;
use crate::rules::{parse_rules, rewrite, BoundRule, RegexCache};

/// Keys of the rule-set ConfigMap named by a namespace.
pub const REWRITING_KEY: &str = "rewriting";
pub const RULES_KEY: &str = "rules";
pub const SERVER_KEY: &str = "hsc";

const CONTAINER_LISTS: [&str; 2] = ["initContainers", "containers"];

/// What to do with the pods of a namespace.
#[derive(Debug, PartialEq)]
pub enum Decision {
    Unchanged,
    Deny(String),
    Rewrite(Vec<BoundRule>),
}

fn bind(rules: &str, config: &ServerConfiguration) -> Result<Vec<BoundRule>, WebhookError> {
    Ok(parse_rules(rules)?
        .into_iter()
        .map(|rule| BoundRule {
            rule,
            server: config.server_host().to_string(),
        })
        .collect())
}

/// Rules in effect for a namespace labelled `labels`.
///
/// Rules of the namespace rule set come first, followed by those of the default
/// configuration when it selects the namespace.
pub fn assemble(
    labels: &BTreeMap<String, String>,
    rule_set: Option<&ConfigMap>,
    configs: &[Arc<ServerConfiguration>],
) -> Result<Decision, WebhookError> {
    let mut rules = Vec::new();

    if let Some(rule_set) = rule_set {
        let data = rule_set.data.clone().unwrap_or_default();
        match data.get(REWRITING_KEY).map(|v| v.trim()) {
            Some("off") => return Ok(Decision::Unchanged),
            None | Some("") | Some("on") => {}
            Some(other) => {
                return Err(WebhookError::BadRequest(format!(
                    "{REWRITING_KEY} of {} must be on or off, not '{other}'",
                    rule_set.name_any()
                )))
            }
        }
        let server = data.get(SERVER_KEY).map(|v| v.trim()).filter(|v| !v.is_empty()).ok_or_else(|| {
            WebhookError::BadRequest(format!("{} does not name a server configuration", rule_set.name_any()))
        })?;
        let config = configs
            .iter()
            .find(|c| c.name_any() == server)
            .ok_or_else(|| WebhookError::Remote(format!("server configuration {server} not found")))?;
        if !config.selects(labels) {
            return Ok(Decision::Deny(format!(
                "server configuration {server} does not select this namespace"
            )));
        }
        rules.extend(bind(data.get(RULES_KEY).map(String::as_str).unwrap_or_default(), config)?);
    }

    if let Some(default) = configs.iter().find(|c| c.spec.default) {
        if default.selects(labels) {
            rules.extend(bind(&default.spec.rules.join("\n"), default)?);
        }
    }

    Ok(if rules.is_empty() {
        Decision::Unchanged
    } else {
        Decision::Rewrite(rules)
    })
}

/// Rewrites the container images of a pod spec in place; returns how many changed.
///
/// Containers with malformed images are skipped.
pub fn rewrite_images(spec: &mut Value, rules: &[BoundRule], cache: &RegexCache) -> Result<usize, WebhookError> {
    let mut changed = 0;
    for list in CONTAINER_LISTS {
        let Some(containers) = spec.get_mut(list).and_then(Value::as_array_mut) else {
            continue;
        };
        for container in containers {
            let Some(image) = container.get("image").and_then(Value::as_str) else {
                continue;
            };
            let parsed = match ImageRef::parse(image) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Skipping container {}: {}", container["name"], e);
                    continue;
                }
            };
            if let Some(target) = rewrite(&parsed, rules, cache)? {
                debug!("Rewriting {} to {}", image, target);
                container["image"] = Value::String(target);
                changed += 1;
            }
        }
    }
    Ok(changed)
}

/// Mutates pods according to the rules of their namespace.
#[derive(Clone)]
pub struct ImageRewriter {
    client: Client,
    configs: Store<ServerConfiguration>,
    cache: Arc<RegexCache>,
}

impl ImageRewriter {
    pub fn new(client: Client, configs: Store<ServerConfiguration>) -> Self {
        Self {
            client,
            configs,
            cache: Arc::default(),
        }
    }

    async fn rule_set(&self, ns: &Namespace) -> Result<Option<ConfigMap>, WebhookError> {
        let Some(name) = ns.annotations().get(REWRITING_RULES_ANNOTATION) else {
            return Ok(None);
        };
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &ns.name_any());
        Ok(Some(api.get(name).await?))
    }

    async fn respond(&self, request: &AdmissionRequest<DynamicObject>) -> Result<AdmissionResponse, WebhookError> {
        let response = AdmissionResponse::from(request);
        if !matches!(request.operation, Operation::Create | Operation::Update) {
            return Ok(response);
        }
        let Some(object) = request.object.as_ref() else {
            return Ok(response);
        };
        let pod: Pod = serde_json::to_value(object)
            .and_then(serde_json::from_value)
            .map_err(|e| WebhookError::BadRequest(format!("not a pod: {e}")))?;

        let namespace = request
            .namespace
            .clone()
            .or_else(|| pod.namespace())
            .ok_or_else(|| WebhookError::BadRequest("pod without namespace".to_string()))?;
        let ns = Api::<Namespace>::all(self.client.clone()).get(&namespace).await?;
        let rule_set = self.rule_set(&ns).await?;

        let rules = match assemble(ns.labels(), rule_set.as_ref(), &self.configs.state())? {
            Decision::Unchanged => return Ok(response),
            Decision::Deny(reason) => return Ok(response.deny(reason)),
            Decision::Rewrite(rules) => rules,
        };

        let before = object.data.get("spec").cloned().unwrap_or_default();
        let mut after = before.clone();
        let changed = rewrite_images(&mut after, &rules, &self.cache)?;
        if changed == 0 {
            return Ok(response);
        }
        info!("Rewrote {} image(s) of pod {}/{}", changed, namespace, request.name);
        let patch = json_patch::diff(&json!({ "spec": before }), &json!({ "spec": after }));
        response
            .with_patch(patch)
            .map_err(|e| WebhookError::Remote(format!("serializing patch: {e}")))
    }

    pub async fn mutate(
        &self,
        review: AdmissionReview<DynamicObject>,
    ) -> Result<AdmissionReview<DynamicObject>, WebhookError> {
        let request: AdmissionRequest<DynamicObject> = review
            .try_into()
            .map_err(|e| WebhookError::BadRequest(format!("{e}")))?;
        Ok(self.respond(&request).await?.into_review())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_cluster::api::v1alpha1::ServerConfigurationSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;

    fn server(name: &str, default: bool, rules: &[&str], selector: Option<(&str, &str)>) -> Arc<ServerConfiguration> {
        Arc::new(ServerConfiguration::new(
            name,
            ServerConfigurationSpec {
                server_url: format!("https://{name}.example.com"),
                default,
                rules: rules.iter().map(|r| r.to_string()).collect(),
                namespace_selector: selector.map(|(k, v)| LabelSelector {
                    match_labels: Some(BTreeMap::from([(k.to_string(), v.to_string())])),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ))
    }

    fn rule_set(entries: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("rules-cm".to_string()),
                ..Default::default()
            },
            data: Some(entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ..Default::default()
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn rules_of(decision: Decision) -> Vec<BoundRule> {
        match decision {
            Decision::Rewrite(rules) => rules,
            other => panic!("expected rules, got {other:?}"),
        }
    }

    #[test]
    fn rule_set_rules_precede_default_rules() {
        let configs = vec![
            server("prod", false, &[], Some(("team", "a"))),
            server("global", true, &["*=>proxy"], None),
        ];
        let cm = rule_set(&[("rewriting", "on"), ("hsc", "prod"), ("rules", "docker.io=>mirror")]);
        let rules = rules_of(assemble(&labels(&[("team", "a")]), Some(&cm), &configs).unwrap());
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].server, "prod.example.com");
        assert_eq!(rules[0].rule.project, "mirror");
        assert_eq!(rules[1].server, "global.example.com");
    }

    #[test]
    fn rewriting_off_leaves_pods_alone() {
        let configs = vec![server("global", true, &["*=>proxy"], None)];
        let cm = rule_set(&[("rewriting", "off")]);
        assert_eq!(assemble(&labels(&[]), Some(&cm), &configs).unwrap(), Decision::Unchanged);
    }

    #[test]
    fn unselected_namespace_is_denied() {
        let configs = vec![server("prod", false, &[], Some(("team", "a")))];
        let cm = rule_set(&[("hsc", "prod"), ("rules", "docker.io=>mirror")]);
        let decision = assemble(&labels(&[("team", "b")]), Some(&cm), &configs).unwrap();
        assert!(matches!(decision, Decision::Deny(_)));
    }

    #[test]
    fn rule_set_errors_map_to_status_classes() {
        let configs = vec![server("prod", false, &[], None)];
        let missing_server = rule_set(&[("rules", "docker.io=>mirror")]);
        assert!(matches!(
            assemble(&labels(&[]), Some(&missing_server), &configs),
            Err(WebhookError::BadRequest(_))
        ));
        let unknown_server = rule_set(&[("hsc", "staging"), ("rules", "docker.io=>mirror")]);
        assert!(matches!(
            assemble(&labels(&[]), Some(&unknown_server), &configs),
            Err(WebhookError::Remote(_))
        ));
        let bad_rules = rule_set(&[("hsc", "prod"), ("rules", "docker.io")]);
        assert!(matches!(
            assemble(&labels(&[]), Some(&bad_rules), &configs),
            Err(WebhookError::BadRequest(_))
        ));
    }

    #[test]
    fn no_rules_means_no_change() {
        let configs = vec![server("global", true, &[], None)];
        assert_eq!(assemble(&labels(&[]), None, &configs).unwrap(), Decision::Unchanged);
        assert_eq!(assemble(&labels(&[]), None, &[]).unwrap(), Decision::Unchanged);
    }

    #[test]
    fn images_are_rewritten_and_malformed_ones_skipped() {
        let configs = vec![server("harbor", true, &["docker.io=>mirror"], None)];
        let rules = rules_of(assemble(&labels(&[]), None, &configs).unwrap());
        let mut spec = json!({
            "initContainers": [{"name": "init", "image": "busybox:1.32.0"}],
            "containers": [
                {"name": "app", "image": "nginx:1.25"},
                {"name": "broken", "image": "Not An Image"},
                {"name": "quay", "image": "quay.io/foo:1"},
            ],
        });
        let changed = rewrite_images(&mut spec, &rules, &RegexCache::default()).unwrap();
        assert_eq!(changed, 2);
        assert_eq!(spec["initContainers"][0]["image"], "harbor.example.com/mirror/library/busybox:1.32.0");
        assert_eq!(spec["containers"][0]["image"], "harbor.example.com/mirror/library/nginx:1.25");
        assert_eq!(spec["containers"][1]["image"], "Not An Image");
        assert_eq!(spec["containers"][2]["image"], "quay.io/foo:1");
    }

    #[test]
    fn patch_only_touches_images() {
        let before = json!({"containers": [{"name": "app", "image": "nginx", "ports": [{"containerPort": 80}]}]});
        let mut after = before.clone();
        let configs = vec![server("harbor", true, &["*=>proxy"], None)];
        let rules = rules_of(assemble(&labels(&[]), None, &configs).unwrap());
        rewrite_images(&mut after, &rules, &RegexCache::default()).unwrap();

        let patch = json_patch::diff(&json!({ "spec": before }), &json!({ "spec": after }));
        let ops = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            ops,
            json!([{
                "op": "replace",
                "path": "/spec/containers/0/image",
                "value": "harbor.example.com/proxy/library/nginx",
            }])
        );
    }
}
