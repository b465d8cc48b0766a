//! Defaulting and validation of the Harbor custom resources.

use harbor_cluster::api::is_valid_url;
use harbor_cluster::api::v1alpha1::{
    ChartMuseum, Core, JobService, NotaryServer, NotarySigner, Platform, Portal, Registry, RegistryController,
    Scanner, ServerConfiguration,
};
use harbor_cluster::api::ComponentSpec;
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
};
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::WebhookError;
use crate::rules::parse_rule;

const DEFAULT_REPLICAS: i32 = 1;

type Review = AdmissionReview<DynamicObject>;

fn typed<K: DeserializeOwned>(object: &DynamicObject) -> Result<K, WebhookError> {
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(|e| WebhookError::BadRequest(format!("malformed object: {e}")))
}

fn request_of(review: Review) -> Result<AdmissionRequest<DynamicObject>, WebhookError> {
    review
        .try_into()
        .map_err(|e| WebhookError::BadRequest(format!("{e}")))
}

/// The object of a create or update request, if any.
fn admitted(request: &AdmissionRequest<DynamicObject>) -> Option<&DynamicObject> {
    matches!(request.operation, Operation::Create | Operation::Update)
        .then_some(request.object.as_ref())
        .flatten()
}

fn default_replicas(component: &mut ComponentSpec) {
    component.replicas.get_or_insert(DEFAULT_REPLICAS);
}

/// Fills in the replica counts of every declared component.
///
/// Version, job service and log level defaults come from deserialization.
pub fn apply_platform_defaults(platform: &mut Platform) {
    let components = &mut platform.spec.components;
    default_replicas(&mut components.core.component);
    default_replicas(&mut components.registry.component);
    default_replicas(&mut components.job_service.component);
    default_replicas(&mut components.portal);
    if let Some(chart_museum) = components.chart_museum.as_mut() {
        default_replicas(&mut chart_museum.component);
    }
    if let Some(clair) = components.clair.as_mut() {
        default_replicas(&mut clair.component);
    }
    if let Some(notary) = components.notary.as_mut() {
        default_replicas(&mut notary.server);
        default_replicas(&mut notary.signer);
    }
}

pub fn platform_problems(platform: &Platform) -> Vec<String> {
    let spec = &platform.spec;
    let mut problems = Vec::new();
    if let Err(e) = semver::Version::parse(&spec.version) {
        problems.push(format!("version '{}' is not a semantic version: {e}", spec.version));
    }
    if !is_valid_url(&spec.public_url) {
        problems.push(format!("publicURL '{}' is not an http(s) URL", spec.public_url));
    }
    if let Some(notary) = &spec.components.notary {
        if !is_valid_url(&notary.public_url) {
            problems.push(format!("notary publicURL '{}' is not an http(s) URL", notary.public_url));
        }
    }
    problems
}

pub fn server_configuration_problems(config: &ServerConfiguration) -> Vec<String> {
    let mut problems = Vec::new();
    if !is_valid_url(&config.spec.server_url) {
        problems.push(format!("serverURL '{}' is not an http(s) URL", config.spec.server_url));
    }
    for line in &config.spec.rules {
        match parse_rule(line) {
            Ok(rule) if !rule.is_wildcard() => {
                if let Err(e) = Regex::new(&rule.registry) {
                    problems.push(format!("rule '{line}': invalid registry pattern: {e}"));
                }
            }
            Ok(_) => {}
            Err(e) => problems.push(e.to_string()),
        }
    }
    problems
}

fn verdict(response: AdmissionResponse, problems: Vec<String>) -> AdmissionResponse {
    if problems.is_empty() {
        response
    } else {
        let reason = problems.join("; ");
        warn!("Rejecting {}: {}", response.uid, reason);
        response.deny(reason)
    }
}

/// Patch bringing the spec of `object` to its typed, defaulted form; `None` when nothing changes.
fn defaults<K: DeserializeOwned + Serialize>(
    object: &DynamicObject,
    adjust: impl FnOnce(&mut K),
) -> Result<Option<json_patch::Patch>, WebhookError> {
    let mut resource: K = typed(object)?;
    adjust(&mut resource);
    let before = object.data.get("spec").cloned().unwrap_or(Value::Null);
    let after = serde_json::to_value(&resource)
        .map_err(|e| WebhookError::Remote(e.to_string()))?
        .get("spec")
        .cloned()
        .unwrap_or(Value::Null);
    let patch = json_patch::diff(&json!({ "spec": before }), &json!({ "spec": after }));
    Ok((!patch.0.is_empty()).then_some(patch))
}

fn patched(response: AdmissionResponse, patch: Option<json_patch::Patch>) -> Result<Review, WebhookError> {
    let response = match patch {
        Some(patch) => {
            debug!("Defaulting {} with {} operation(s)", response.uid, patch.0.len());
            response
                .with_patch(patch)
                .map_err(|e| WebhookError::Remote(format!("serializing patch: {e}")))?
        }
        None => response,
    };
    Ok(response.into_review())
}

pub fn mutate_platform(review: Review) -> Result<Review, WebhookError> {
    let request = request_of(review)?;
    let response = AdmissionResponse::from(&request);
    let patch = match admitted(&request) {
        Some(object) => defaults::<Platform>(object, apply_platform_defaults)?,
        None => None,
    };
    patched(response, patch)
}

/// Defaults the spec of any single-component kind.
pub fn mutate_component(review: Review) -> Result<Review, WebhookError> {
    let request = request_of(review)?;
    let response = AdmissionResponse::from(&request);
    let Some(object) = admitted(&request) else {
        return patched(response, None);
    };
    let patch = match request.kind.kind.as_str() {
        "Core" => defaults::<Core>(object, |c| default_replicas(&mut c.spec.component))?,
        "Registry" => defaults::<Registry>(object, |r| default_replicas(&mut r.spec.component))?,
        "RegistryController" => {
            defaults::<RegistryController>(object, |r| default_replicas(&mut r.spec.component))?
        }
        "JobService" => defaults::<JobService>(object, |j| default_replicas(&mut j.spec.component))?,
        "Portal" => defaults::<Portal>(object, |p| default_replicas(&mut p.spec.component))?,
        "ChartMuseum" => defaults::<ChartMuseum>(object, |c| default_replicas(&mut c.spec.component))?,
        "Scanner" => defaults::<Scanner>(object, |s| default_replicas(&mut s.spec.component))?,
        "NotaryServer" => defaults::<NotaryServer>(object, |n| default_replicas(&mut n.spec.component))?,
        "NotarySigner" => defaults::<NotarySigner>(object, |n| default_replicas(&mut n.spec.component))?,
        other => {
            debug!("No defaults for kind {}", other);
            None
        }
    };
    patched(response, patch)
}

pub fn validate_platform(review: Review) -> Result<Review, WebhookError> {
    let request = request_of(review)?;
    let response = AdmissionResponse::from(&request);
    let problems = match admitted(&request) {
        Some(object) => platform_problems(&typed(object)?),
        None => Vec::new(),
    };
    Ok(verdict(response, problems).into_review())
}

pub fn validate_server_configuration(review: Review) -> Result<Review, WebhookError> {
    let request = request_of(review)?;
    let response = AdmissionResponse::from(&request);
    let problems = match admitted(&request) {
        Some(object) => server_configuration_problems(&typed(object)?),
        None => Vec::new(),
    };
    Ok(verdict(response, problems).into_review())
}
