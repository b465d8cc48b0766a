//! Pure renderers turning a component spec into the Kubernetes objects it needs.
//!
//! Nothing here talks to the API server. The [`crate::apply::Applier`] owns
//! ordering, ownership and dependency checksums.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, ConfigMapKeySelector, ConfigMapVolumeSource, Container,
    ContainerPort, EmptyDirVolumeSource, EnvFromSource, EnvVar, EnvVarSource, HTTPGetAction,
    KeyToPath, LocalObjectReference, PodSpec, PodTemplateSpec, Probe, Secret, SecretEnvSource,
    SecretKeySelector, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};

use crate::api::cert_manager::Certificate;
use crate::api::{ComponentSpec, ComponentStatus, COMPONENT_LABEL, GROUP};
use crate::images::{ImageStore, CONFIG_INIT_IMAGE};
use crate::util::errors::{Result, StdError};

pub mod chartmuseum;
pub mod harbor_core;
pub mod ingress;
pub mod jobservice;
pub mod notary;
pub mod platform;
pub mod portal;
pub mod registry;
pub mod registry_controller;
pub mod scanner;
pub mod templates;

use templates::Template;

pub const TEMPLATE_VOLUME: &str = "template";
pub const CONFIG_VOLUME: &str = "config";
const TEMPLATE_DIR: &str = "/templates";
const CONFIG_DIR: &str = "/config";

/// A rendered object, typed by kind.
#[derive(Clone, Debug, PartialEq)]
pub enum Manifest {
    Service(Service),
    ConfigMap(ConfigMap),
    Secret(Secret),
    Certificate(Certificate),
    Ingress(Ingress),
    Deployment(Deployment),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ManifestKind {
    Service,
    ConfigMap,
    Secret,
    Certificate,
    Ingress,
    Deployment,
}

impl ManifestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestKind::Service => "Service",
            ManifestKind::ConfigMap => "ConfigMap",
            ManifestKind::Secret => "Secret",
            ManifestKind::Certificate => "Certificate",
            ManifestKind::Ingress => "Ingress",
            ManifestKind::Deployment => "Deployment",
        }
    }
}

impl std::fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Manifest {
    pub fn kind(&self) -> ManifestKind {
        match self {
            Manifest::Service(_) => ManifestKind::Service,
            Manifest::ConfigMap(_) => ManifestKind::ConfigMap,
            Manifest::Secret(_) => ManifestKind::Secret,
            Manifest::Certificate(_) => ManifestKind::Certificate,
            Manifest::Ingress(_) => ManifestKind::Ingress,
            Manifest::Deployment(_) => ManifestKind::Deployment,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Manifest::Service(o) => &o.metadata,
            Manifest::ConfigMap(o) => &o.metadata,
            Manifest::Secret(o) => &o.metadata,
            Manifest::Certificate(o) => &o.metadata,
            Manifest::Ingress(o) => &o.metadata,
            Manifest::Deployment(o) => &o.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Manifest::Service(o) => &mut o.metadata,
            Manifest::ConfigMap(o) => &mut o.metadata,
            Manifest::Secret(o) => &mut o.metadata,
            Manifest::Certificate(o) => &mut o.metadata,
            Manifest::Ingress(o) => &mut o.metadata,
            Manifest::Deployment(o) => &mut o.metadata,
        }
    }

    pub fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }
}

macro_rules! impl_from_manifest {
    ($($kind:ident),*) => {
        $(impl From<$kind> for Manifest {
            fn from(o: $kind) -> Self {
                Manifest::$kind(o)
            }
        })*
    };
}

impl_from_manifest!(Service, ConfigMap, Secret, Certificate, Ingress, Deployment);

/// A ConfigMap or Secret a Deployment reads through a volume or its environment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyKey {
    pub kind: ManifestKind,
    pub name: String,
}

impl DependencyKey {
    pub fn config_map(name: impl Into<String>) -> Self {
        Self {
            kind: ManifestKind::ConfigMap,
            name: name.into(),
        }
    }

    pub fn secret(name: impl Into<String>) -> Self {
        Self {
            kind: ManifestKind::Secret,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// How the applier treats an object that already exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Policy {
    /// Overwrite every field the renderer owns.
    #[default]
    Converge,
    /// Never touch an existing object (generated secrets).
    CreateOnly,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DesiredObject {
    pub manifest: Manifest,
    pub dependencies: Vec<DependencyKey>,
    pub policy: Policy,
}

impl DesiredObject {
    /// Wraps a manifest; Deployments get their dependencies from the pod template.
    pub fn new(manifest: impl Into<Manifest>) -> Self {
        let manifest = manifest.into();
        let dependencies = match &manifest {
            Manifest::Deployment(deployment) => deployment
                .spec
                .as_ref()
                .and_then(|spec| spec.template.spec.as_ref())
                .map(dependencies_of)
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        Self {
            manifest,
            dependencies,
            policy: Policy::Converge,
        }
    }

    pub fn create_only(manifest: impl Into<Manifest>) -> Self {
        Self {
            policy: Policy::CreateOnly,
            ..Self::new(manifest)
        }
    }

    pub fn kind(&self) -> ManifestKind {
        self.manifest.kind()
    }

    pub fn name(&self) -> String {
        self.manifest.name()
    }

    /// The key other objects use to depend on this one, for ConfigMaps and Secrets.
    pub fn dependency_key(&self) -> Option<DependencyKey> {
        match self.kind() {
            ManifestKind::ConfigMap | ManifestKind::Secret => Some(DependencyKey {
                kind: self.kind(),
                name: self.name(),
            }),
            _ => None,
        }
    }
}

/// Inputs shared by every renderer.
pub struct RenderContext<'a> {
    pub images: &'a ImageStore,
}

/// A custom resource the generic component reconciler can drive.
pub trait Component:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Lowercase component name used in object names, labels and metrics.
    const COMPONENT: &'static str;

    fn render(&self, ctx: &RenderContext) -> Result<Vec<DesiredObject>>;

    fn component_status(&self) -> Option<&ComponentStatus>;

    /// Name of an owned object: `{cr-name}-{suffix}` as a valid DNS label.
    fn normalize_name(&self, suffix: &str) -> String {
        normalize(&format!("{}-{}", self.name_any(), suffix))
    }

    /// Labels selecting the pods of this CR.
    fn selector_labels(&self) -> BTreeMap<String, String> {
        selector_labels(
            Self::COMPONENT,
            &self.name_any(),
            &self.namespace().unwrap_or_default(),
        )
    }

    /// Metadata of an owned object named after `suffix`.
    fn owned_meta(&self, suffix: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.normalize_name(suffix)),
            namespace: self.namespace(),
            labels: Some(self.selector_labels()),
            ..Default::default()
        }
    }
}

pub fn normalize(name: &str) -> String {
    name.to_lowercase().replace(['_', '.'], "-")
}

pub fn selector_labels(component: &str, name: &str, namespace: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (format!("{GROUP}/{component}-name"), name.to_string()),
        (format!("{GROUP}/{component}-namespace"), namespace.to_string()),
        (COMPONENT_LABEL.to_string(), component.to_string()),
    ])
}

pub fn env(name: &str, value: impl ToString) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

pub fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn config_map_env(name: &str, config_map: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            config_map_key_ref: Some(ConfigMapKeySelector {
                name: config_map.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn env_from_secret(secret: &str, prefix: Option<&str>, optional: bool) -> EnvFromSource {
    EnvFromSource {
        prefix: prefix.map(String::from),
        secret_ref: Some(SecretEnvSource {
            name: secret.to_string(),
            optional: Some(optional),
        }),
        ..Default::default()
    }
}

pub fn env_from_config_map(config_map: &str) -> EnvFromSource {
    EnvFromSource {
        config_map_ref: Some(ConfigMapEnvSource {
            name: config_map.to_string(),
            optional: Some(false),
        }),
        ..Default::default()
    }
}

/// Env variables exposing every key of a database secret as `{prefix}{KEY}`.
pub fn database_env(prefix: &str, secret: &str) -> Vec<EnvVar> {
    ["host", "port", "database", "username", "password", "ssl"]
        .iter()
        .map(|key| secret_env(&format!("{prefix}{}", key.to_uppercase()), secret, key))
        .collect()
}

pub fn http_probe(path: &str, port: i32, initial_delay: Option<i32>) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: initial_delay,
        ..Default::default()
    }
}

pub fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

pub fn mount(volume: &str, path: &str, sub_path: Option<&str>) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        sub_path: sub_path.map(String::from),
        ..Default::default()
    }
}

pub fn read_only_mount(volume: &str, path: &str, sub_path: Option<&str>) -> VolumeMount {
    VolumeMount {
        read_only: Some(true),
        ..mount(volume, path, sub_path)
    }
}

pub fn empty_dir_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

pub fn config_map_volume(name: &str, config_map: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn secret_volume(name: &str, secret: &str, items: &[(&str, &str)]) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            items: (!items.is_empty()).then(|| {
                items
                    .iter()
                    .map(|(key, path)| KeyToPath {
                        key: key.to_string(),
                        path: path.to_string(),
                        ..Default::default()
                    })
                    .collect()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Container with the settings shared by every rendered workload.
pub fn base_container(name: &str, image: &str, spec: Option<&ComponentSpec>) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("Always".to_string()),
        resources: spec.and_then(|s| s.resources.clone()),
        ..Default::default()
    }
}

/// Shell lines splitting a redis URL of the form `host:port[,weight,password,db]`
/// into `REDIS_ADDR`, `REDIS_PASSWORD` and `REDIS_DB`.
///
/// `source` is any shell word expanding to the URL.
pub fn split_redis_url(source: &str) -> Vec<String> {
    vec![
        format!("REDIS_URL={source}"),
        "REDIS_ADDR=${REDIS_URL%%,*}".to_string(),
        r#"REDIS_PASSWORD=$(printf '%s' "$REDIS_URL" | cut -s -d, -f3)"#.to_string(),
        r#"REDIS_DB=$(printf '%s' "$REDIS_URL" | cut -s -d, -f4)"#.to_string(),
    ]
}

/// Shell line rewriting `$name` so sed takes it as a literal replacement.
fn sed_escape(name: &str) -> String {
    format!(r#"{name}=$(printf '%s' "${{{name}}}" | sed -e 's/[\\|&]/\\&/g')"#)
}

/// Config init container rendering `templates` into the shared config volume.
///
/// `env` must provide exactly the placeholders left in the templates; any
/// mismatch is a rendering bug and reported as such.
pub fn config_init_container(
    images: &ImageStore,
    templates: &[(&Template, &str)],
    env: Vec<EnvVar>,
    extra_script: &[String],
    extra_mounts: Vec<VolumeMount>,
) -> Result<Container> {
    let provided: BTreeSet<&str> = env.iter().map(|e| e.name.as_str()).collect();
    let mut wanted = BTreeSet::new();
    for (_, content) in templates {
        wanted.extend(Template::placeholders(content));
    }
    let wanted_refs: BTreeSet<&str> = wanted.iter().map(String::as_str).collect();
    if provided != wanted_refs {
        return Err(StdError::InvalidArgument(format!(
            "init container env {provided:?} does not match template placeholders {wanted_refs:?}"
        ))
        .into());
    }

    let substitutions: Vec<String> = env
        .iter()
        .map(|e| format!("-e \"s|{{{{{name}}}}}|${{{name}}}|g\"", name = e.name))
        .collect();
    // Values land in a sed replacement: the delimiter, `&` and `\` must be literal
    let mut script: Vec<String> = env.iter().map(|e| sed_escape(&e.name)).collect();
    script.extend(templates.iter().map(|(template, _)| {
        format!(
            "sed {} {TEMPLATE_DIR}/{file} > {CONFIG_DIR}/{file}",
            substitutions.join(" "),
            file = template.file
        )
    }));
    script.extend(extra_script.iter().cloned());

    let mut volume_mounts = vec![
        read_only_mount(TEMPLATE_VOLUME, TEMPLATE_DIR, None),
        mount(CONFIG_VOLUME, CONFIG_DIR, None),
    ];
    volume_mounts.extend(extra_mounts);

    Ok(Container {
        name: "config".to_string(),
        image: Some(images.mirror(CONFIG_INIT_IMAGE)),
        image_pull_policy: Some("Always".to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string()]),
        args: Some(vec![format!("set -e\n{}", script.join("\n"))]),
        env: Some(env),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    })
}

/// Pod spec with the scheduling knobs of `spec` passed through.
pub fn pod_spec(
    spec: &ComponentSpec,
    containers: Vec<Container>,
    init_containers: Vec<Container>,
    volumes: Vec<Volume>,
) -> PodSpec {
    PodSpec {
        automount_service_account_token: Some(false),
        containers,
        init_containers: (!init_containers.is_empty()).then_some(init_containers),
        volumes: (!volumes.is_empty()).then_some(volumes),
        node_selector: spec.node_selector.clone(),
        tolerations: (!spec.tolerations.is_empty()).then(|| spec.tolerations.clone()),
        priority_class_name: spec.priority_class_name.clone(),
        service_account_name: spec.service_account_name.clone(),
        image_pull_secrets: (!spec.image_pull_secrets.is_empty()).then(|| {
            spec.image_pull_secrets
                .iter()
                .map(|name| LocalObjectReference { name: name.clone() })
                .collect()
        }),
        ..Default::default()
    }
}

pub fn deployment(
    meta: ObjectMeta,
    labels: BTreeMap<String, String>,
    replicas: Option<i32>,
    pod: PodSpec,
) -> Deployment {
    Deployment {
        metadata: meta,
        spec: Some(DeploymentSpec {
            replicas: Some(replicas.unwrap_or(1)),
            revision_history_limit: Some(0),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP service; `ports` are `(name, port, target port)`.
pub fn service(meta: ObjectMeta, selector: BTreeMap<String, String>, ports: &[(&str, i32, i32)]) -> Service {
    Service {
        metadata: meta,
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(
                ports
                    .iter()
                    .map(|(name, port, target)| ServicePort {
                        name: Some(name.to_string()),
                        port: *port,
                        target_port: Some(IntOrString::Int(*target)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn config_map(meta: ObjectMeta, data: BTreeMap<String, String>) -> ConfigMap {
    ConfigMap {
        metadata: meta,
        data: Some(data),
        ..Default::default()
    }
}

/// ConfigMaps and Secrets referenced anywhere in `pod`, sorted and deduplicated.
pub fn dependencies_of(pod: &PodSpec) -> Vec<DependencyKey> {
    let mut keys = BTreeSet::new();

    for volume in pod.volumes.iter().flatten() {
        if let Some(cm) = &volume.config_map {
            keys.insert(DependencyKey::config_map(&cm.name));
        }
        if let Some(name) = volume.secret.as_ref().and_then(|s| s.secret_name.as_ref()) {
            keys.insert(DependencyKey::secret(name));
        }
    }

    let containers = pod.containers.iter().chain(pod.init_containers.iter().flatten());
    for container in containers {
        for source in container.env_from.iter().flatten() {
            if let Some(cm) = &source.config_map_ref {
                keys.insert(DependencyKey::config_map(&cm.name));
            }
            if let Some(secret) = &source.secret_ref {
                keys.insert(DependencyKey::secret(&secret.name));
            }
        }
        for var in container.env.iter().flatten() {
            let Some(source) = &var.value_from else { continue };
            if let Some(cm) = &source.config_map_key_ref {
                keys.insert(DependencyKey::config_map(&cm.name));
            }
            if let Some(secret) = &source.secret_key_ref {
                keys.insert(DependencyKey::secret(&secret.name));
            }
        }
    }

    keys.into_iter().collect()
}

/// Probe path of the core API depending on the API generation of `version`.
pub fn api_prefix(version: &str) -> &'static str {
    match semver::Version::parse(version) {
        Ok(v) if v.major < 2 => "/api",
        _ => "/api/v2.0",
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use k8s_openapi::api::core::v1::Container;

    pub fn deployments(objects: &[DesiredObject]) -> Vec<&Deployment> {
        objects
            .iter()
            .filter_map(|o| match &o.manifest {
                Manifest::Deployment(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    pub fn pod(deployment: &Deployment) -> &PodSpec {
        deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .expect("deployment has a pod template")
    }

    pub fn container<'a>(pod: &'a PodSpec, name: &str) -> &'a Container {
        pod.containers
            .iter()
            .chain(pod.init_containers.iter().flatten())
            .find(|c| c.name == name)
            .unwrap_or_else(|| panic!("container {name} not found"))
    }

    pub fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .iter()
            .flatten()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    pub fn env_names(container: &Container) -> Vec<String> {
        container.env.iter().flatten().map(|e| e.name.clone()).collect()
    }

    /// Invariants every rendered workload honors.
    pub fn assert_workload_invariants(cr_name: &str, objects: &[DesiredObject]) {
        for object in objects {
            assert!(
                object.name().starts_with(&format!("{cr_name}-")),
                "{} is not prefixed with {cr_name}",
                object.name()
            );
        }
        for deployment in deployments(objects) {
            let spec = deployment.spec.as_ref().expect("deployment spec");
            assert_eq!(spec.revision_history_limit, Some(0));
            let pod = pod(deployment);
            assert_eq!(pod.automount_service_account_token, Some(false));
            for c in pod.containers.iter().chain(pod.init_containers.iter().flatten()) {
                assert_eq!(c.image_pull_policy.as_deref(), Some("Always"), "{}", c.name);
            }
            for c in &pod.containers {
                assert!(c.liveness_probe.is_some(), "{} has no liveness probe", c.name);
                assert!(c.readiness_probe.is_some(), "{} has no readiness probe", c.name);
            }
            assert_eq!(
                spec.selector.match_labels.as_ref(),
                spec.template.metadata.as_ref().and_then(|m| m.labels.as_ref())
            );
        }
    }
}
