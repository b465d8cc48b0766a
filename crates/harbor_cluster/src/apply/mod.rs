//! Converges rendered objects against the cluster.
//!
//! ConfigMaps, Secrets, Services, Ingresses and Certificates are applied
//! concurrently first; Deployments follow once the digests of everything they
//! read are known.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use futures::future::join_all;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::api::cert_manager::Certificate;
use crate::api::DEPENDENCY_CHECKSUM_ANNOTATION;
use crate::render::{DependencyKey, DesiredObject, Manifest, ManifestKind, Policy};
use crate::util::errors::{Error, Result, StdError};

pub mod checksum;
pub mod merge;

pub const FIELD_MANAGER: &str = "harbor-operator";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct ApplyReport {
    pub tallies: BTreeMap<ManifestKind, Tally>,
    /// `Kind/name` of every object that failed, with the error.
    pub errors: Vec<(String, Error)>,
    /// Every applied Deployment reports as many available replicas as desired.
    pub deployments_ready: bool,
}

impl Default for ApplyReport {
    fn default() -> Self {
        Self {
            tallies: BTreeMap::new(),
            errors: Vec::new(),
            deployments_ready: true,
        }
    }
}

impl ApplyReport {
    fn record(&mut self, kind: ManifestKind, name: String, result: Result<Outcome>) {
        let tally = self.tallies.entry(kind).or_default();
        match result {
            Ok(Outcome::Created) => tally.created += 1,
            Ok(Outcome::Updated) => tally.updated += 1,
            Ok(Outcome::Unchanged) => tally.unchanged += 1,
            Err(error) => {
                tally.failed += 1;
                warn!(%kind, name, %error, "failed to apply object");
                self.errors.push((format!("{kind}/{name}"), error));
            }
        }
    }

    fn skip(&mut self, kind: ManifestKind) {
        self.tallies.entry(kind).or_default().failed += 1;
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.tallies.values().all(|t| t.failed == 0)
    }

    pub fn first_error(&self) -> Option<&(String, Error)> {
        self.errors.first()
    }

    /// Whether retrying the same pass may succeed.
    pub fn is_transient(&self) -> bool {
        self.errors.iter().any(|(_, e)| e.is_transient())
    }

    pub fn changed(&self) -> usize {
        self.tallies.values().map(|t| t.created + t.updated).sum()
    }

    pub fn summary(&self) -> String {
        self.tallies
            .iter()
            .map(|(kind, t)| {
                format!(
                    "{kind}: {} created, {} updated, {} unchanged, {} failed",
                    t.created, t.updated, t.unchanged, t.failed
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Clone)]
pub struct Applier {
    client: Client,
}

impl Applier {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Applies `objects` on behalf of `owner`, which becomes their controller.
    pub async fn apply<K>(&self, owner: &K, objects: Vec<DesiredObject>) -> ApplyReport
    where
        K: Resource<DynamicType = ()>,
    {
        let mut report = ApplyReport::default();
        let Some(owner_ref) = owner.controller_owner_ref(&()) else {
            report.errors.push((
                owner.name_any(),
                StdError::MetadataMissing("owner has no uid".to_string()).into(),
            ));
            return report;
        };
        let namespace = owner.namespace().unwrap_or_default();

        let (deployments, others): (Vec<_>, Vec<_>) = objects
            .into_iter()
            .map(|mut object| {
                let meta = object.manifest.meta_mut();
                meta.owner_references = Some(vec![owner_ref.clone()]);
                meta.namespace.get_or_insert_with(|| namespace.clone());
                object
            })
            .partition(|object| object.kind() == ManifestKind::Deployment);

        let results = join_all(others.into_iter().map(|object| async move {
            let kind = object.kind();
            let name = object.name();
            let key = object.dependency_key();
            (kind, name, key, self.apply_manifest(object).await)
        }))
        .await;

        let mut digests = BTreeMap::new();
        let mut failed = BTreeSet::new();
        for (kind, name, key, result) in results {
            match result {
                Ok((outcome, digest)) => {
                    if let (Some(key), Some(digest)) = (key, digest) {
                        digests.insert(key, digest);
                    }
                    report.record(kind, name, Ok(outcome));
                }
                Err(error) => {
                    failed.extend(key);
                    report.record(kind, name, Err(error));
                }
            }
        }

        let digests = &digests;
        let failed = &failed;
        let results = join_all(deployments.into_iter().map(|object| async move {
            let name = object.name();
            if let Some(dependency) = object.dependencies.iter().find(|d| failed.contains(*d)) {
                warn!(deployment = name, %dependency, "skipping deployment, a dependency failed");
                return (name, None);
            }
            let result = self.apply_deployment(object, digests).await;
            (name, Some(result))
        }))
        .await;

        for (name, result) in results {
            match result {
                None => {
                    report.deployments_ready = false;
                    report.skip(ManifestKind::Deployment);
                }
                Some(Ok((outcome, available))) => {
                    report.deployments_ready &= available;
                    report.record(ManifestKind::Deployment, name, Ok(outcome));
                }
                Some(Err(error)) => {
                    report.deployments_ready = false;
                    report.record(ManifestKind::Deployment, name, Err(error));
                }
            }
        }

        debug!(summary = report.summary(), "apply finished");
        report
    }

    /// Applies a non-Deployment object, returning the digest Deployments pin for it.
    async fn apply_manifest(&self, object: DesiredObject) -> Result<(Outcome, Option<String>)> {
        let namespace = object.manifest.meta().namespace.clone().unwrap_or_default();
        let policy = object.policy;
        match object.manifest {
            Manifest::ConfigMap(desired) => {
                let rendered = checksum::config_map_digest(&desired);
                let (outcome, live) = apply_object(&self.api(&namespace), desired, policy).await?;
                let digest = match policy {
                    Policy::Converge => rendered,
                    Policy::CreateOnly => checksum::config_map_digest(&live),
                };
                Ok((outcome, Some(digest)))
            }
            Manifest::Secret(desired) => {
                let rendered = checksum::secret_digest(&desired);
                let (outcome, live) = apply_object(&self.api(&namespace), desired, policy).await?;
                let digest = match policy {
                    Policy::Converge => rendered,
                    Policy::CreateOnly => checksum::secret_digest(&live),
                };
                Ok((outcome, Some(digest)))
            }
            Manifest::Service(desired) => {
                let (outcome, _) = apply_object::<Service>(&self.api(&namespace), desired, policy).await?;
                Ok((outcome, None))
            }
            Manifest::Ingress(desired) => {
                let (outcome, _) = apply_object::<Ingress>(&self.api(&namespace), desired, policy).await?;
                Ok((outcome, None))
            }
            Manifest::Certificate(desired) => {
                let (outcome, _) =
                    apply_object::<Certificate>(&self.api(&namespace), desired, policy).await?;
                Ok((outcome, None))
            }
            Manifest::Deployment(desired) => {
                let (outcome, _) =
                    apply_object::<Deployment>(&self.api(&namespace), desired, policy).await?;
                Ok((outcome, None))
            }
        }
    }

    /// Pins the dependency checksum into the pod template, then applies.
    async fn apply_deployment(
        &self,
        object: DesiredObject,
        digests: &BTreeMap<DependencyKey, String>,
    ) -> Result<(Outcome, bool)> {
        let namespace = object.manifest.meta().namespace.clone().unwrap_or_default();
        let name = object.name();
        let policy = object.policy;

        let mut pinned = BTreeMap::new();
        for key in &object.dependencies {
            let digest = match digests.get(key) {
                Some(digest) => digest.clone(),
                None => self.live_digest(&namespace, key).await?,
            };
            pinned.insert(key.clone(), digest);
        }

        let Manifest::Deployment(mut desired) = object.manifest else {
            return Err(StdError::InvalidArgument(format!("{name} is not a Deployment")).into());
        };
        if let Some(spec) = desired.spec.as_mut() {
            spec.template
                .metadata
                .get_or_insert_with(Default::default)
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(
                    DEPENDENCY_CHECKSUM_ANNOTATION.to_string(),
                    checksum::combine(&pinned),
                );
        }

        let (outcome, live) = apply_object(&self.api(&namespace), desired, policy).await?;
        Ok((outcome, is_available(&live)))
    }

    /// Digest of a dependency the current pass does not render.
    async fn live_digest(&self, namespace: &str, key: &DependencyKey) -> Result<String> {
        let digest = match key.kind {
            ManifestKind::ConfigMap => self
                .api::<ConfigMap>(namespace)
                .get_opt(&key.name)
                .await?
                .map(|cm| checksum::config_map_digest(&cm)),
            ManifestKind::Secret => self
                .api::<Secret>(namespace)
                .get_opt(&key.name)
                .await?
                .map(|secret| checksum::secret_digest(&secret)),
            other => {
                return Err(StdError::InvalidArgument(format!("{other} cannot be a dependency")).into())
            }
        };
        Ok(digest.unwrap_or_else(|| checksum::ABSENT.to_string()))
    }
}

pub fn is_available(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let available = deployment
        .status
        .as_ref()
        .and_then(|status| status.available_replicas)
        .unwrap_or(0);
    available >= desired
}

/// Create-or-update of a single object.
///
/// Existing objects whose live state already contains every rendered field
/// are left alone, so a converged cluster sees no writes.
pub async fn apply_object<K>(api: &Api<K>, desired: K, policy: Policy) -> Result<(Outcome, K)>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = desired.name_any();
    let kind = K::kind(&());

    match api.get_opt(&name).await? {
        None => {
            info!("Creating {} '{}'", kind, name);
            let created = api.create(&PostParams::default(), &desired).await?;
            Ok((Outcome::Created, created))
        }
        Some(live) if policy == Policy::CreateOnly => Ok((Outcome::Unchanged, live)),
        Some(live) => {
            if merge::contains(&serde_json::to_value(&live)?, &serde_json::to_value(&desired)?) {
                return Ok((Outcome::Unchanged, live));
            }
            info!("Updating {} '{}'", kind, name);
            let patched = api
                .patch(
                    &name,
                    &PatchParams::apply(FIELD_MANAGER).force(),
                    &Patch::Apply(&desired),
                )
                .await?;
            Ok((Outcome::Updated, patched))
        }
    }
}
