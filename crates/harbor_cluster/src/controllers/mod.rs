//! Reconcilers, one per kind, sharing a [`Context`] and the exported [`State`].

use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{future::ready, Stream, TryStreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::Controller,
        events::{Event, EventType, Recorder, Reporter},
        reflector::{self, Store},
        watcher, WatchStreamExt,
    },
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::*;

use crate::api::cert_manager::Certificate;
use crate::api::{Condition, CLASS_ANNOTATION};
use crate::images::ImageStore;
use crate::render::ManifestKind;
use crate::util::config::OperatorConfig;
use crate::util::errors::Result;
use crate::util::metrics::Metrics;
use crate::util::retry::RequeueBackoff;
use crate::util::status::set_status_condition;

pub mod component_controller;
pub mod namespace_controller;
pub mod platform_configuration_controller;
pub mod platform_controller;
pub mod platform_project_controller;
pub mod project_binding_controller;
pub mod server_configuration_controller;

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    metrics: Metrics,
    config: OperatorConfig,
    images: Arc<ImageStore>,
}

impl State {
    pub fn new(config: OperatorConfig) -> Result<Self> {
        let registry = prometheus::Registry::default();
        let metrics = Metrics::default().register(&registry).map_err(|e| {
            crate::util::errors::StdError::InvalidArgument(format!("metrics registration: {e}"))
        })?;
        let images = ImageStore::with_defaults(config.image_registry.clone())?;
        Ok(Self {
            diagnostics: Arc::default(),
            registry,
            metrics,
            config,
            images: Arc::new(images),
        })
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            diagnostics: self.diagnostics.clone(),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
            images: self.images.clone(),
            backoff: Arc::default(),
        })
    }
}

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    pub config: OperatorConfig,
    pub images: Arc<ImageStore>,
    /// Consecutive failures per object, for requeue delays
    pub backoff: Arc<RequeueBackoff>,
}

impl Context {
    /// Publishes an event on `obj`; failures are only logged.
    pub async fn publish_event<K>(&self, obj: &K, type_: EventType, reason: &str, action: &str, note: String)
    where
        K: Resource<DynamicType = ()>,
    {
        let recorder = self.diagnostics.read().await.recorder(self.client.clone());
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(note),
            action: action.into(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&event, &obj.object_ref(&())).await {
            warn!("failed to publish event {} for {}: {}", reason, obj.name_any(), e);
        }
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "harbor-operator".into(),
        }
    }
}

impl Diagnostics {
    fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

/// Whether `obj` belongs to the operator instance running with `class`.
///
/// An empty class matches objects without the annotation or with an empty one.
pub fn matches_class<K: Resource>(obj: &K, class: &str) -> bool {
    let annotated = obj
        .meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(CLASS_ANNOTATION))
        .map(String::as_str)
        .unwrap_or_default();
    annotated == class
}

/// Key identifying `obj` in logs and requeue bookkeeping.
pub fn object_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}/{}", K::kind(&()), ns, obj.name_any()),
        None => format!("{}/{}", K::kind(&()), obj.name_any()),
    }
}

/// Watch stream of `api` that drops objects of other classes before they are queued.
pub fn class_filtered<K>(
    api: Api<K>,
    class: String,
) -> (Store<K>, impl Stream<Item = Result<K, watcher::Error>> + Send + 'static)
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = watcher(api, watcher::Config::default().any_semantic())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .try_filter(move |obj| ready(matches_class(obj, &class)));
    (reader, stream)
}

/// Adds an owner watch per kind in `kinds`.
pub fn owns_kinds<K>(controller: Controller<K>, client: &Client, kinds: &[ManifestKind]) -> Controller<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let config = watcher::Config::default;
    kinds.iter().fold(controller, |controller, kind| match kind {
        ManifestKind::Service => controller.owns(Api::<Service>::all(client.clone()), config()),
        ManifestKind::ConfigMap => controller.owns(Api::<ConfigMap>::all(client.clone()), config()),
        ManifestKind::Secret => controller.owns(Api::<Secret>::all(client.clone()), config()),
        ManifestKind::Certificate => controller.owns(Api::<Certificate>::all(client.clone()), config()),
        ManifestKind::Ingress => controller.owns(Api::<Ingress>::all(client.clone()), config()),
        ManifestKind::Deployment => controller.owns(Api::<Deployment>::all(client.clone()), config()),
    })
}

/// Exits when the CRD of `K` is not installed.
pub async fn ensure_crd<K>(client: &Client)
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
{
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("CRD {} is not queryable; {e:?}. Is the CRD installed?", K::kind(&()));
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }
}

/// Merges `updates` into `conditions`, stamping the observed generation.
pub fn merge_conditions(conditions: &[Condition], generation: Option<i64>, updates: Vec<Condition>) -> Vec<Condition> {
    updates.into_iter().fold(conditions.to_vec(), |current, mut update| {
        update.observed_generation = generation;
        set_status_condition(&current, update).0
    })
}

/// Namespaced API of the same kind as `obj`.
pub fn namespaced_api<K>(client: &Client, obj: &K) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    Api::namespaced(client.clone(), &obj.namespace().unwrap_or_default())
}
