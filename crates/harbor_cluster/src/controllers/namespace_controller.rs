//! Turns namespace annotations into [`ProjectBinding`]s, provisioning remote projects on request.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::{future::ready, StreamExt};
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        watcher,
    },
    Resource, ResourceExt,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::time::Duration;
use tracing::*;

use super::{matches_class, Context};
use crate::api::v1alpha1::*;
use crate::api::{
    CLASS_ANNOTATION, HARBOR_ANNOTATION, PROJECT_ANNOTATION, ROBOT_ANNOTATION, SERVICE_ACCOUNT_ANNOTATION,
};
use crate::apply::{apply_object, Outcome};
use crate::harbor_client::{HarborClient, ProjectReq};
use crate::render::{normalize, Policy};
use crate::util::errors::{Error, Result};

const CONTROLLER: &str = "namespace";
const DEFAULT_SERVICE_ACCOUNT: &str = "default";
/// Project annotation value requesting a generated project.
pub const AUTO_PROJECT: &str = "*";
const NOT_READY_REQUEUE: Duration = Duration::from_secs(60);

fn annotation<'a>(ns: &'a Namespace, key: &str) -> Option<&'a str> {
    ns.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// The configuration named by the namespace, or else the default one.
pub fn resolve_server<'a>(
    explicit: Option<&str>,
    configs: &'a [ServerConfiguration],
) -> Option<&'a ServerConfiguration> {
    match explicit {
        Some(name) => configs.iter().find(|c| c.name_any() == name),
        None => configs.iter().find(|c| c.spec.default),
    }
}

pub fn binding_name(server: &str, service_account: &str) -> String {
    normalize(&format!("{server}-{service_account}"))
}

/// Project name generated for a namespace asking for `*`.
///
/// Stable for the lifetime of the namespace: a retry after a failed annotation
/// resolves to the project the earlier attempt created.
fn generated_project_name(ns: &Namespace) -> String {
    let seed = ns.uid().unwrap_or_else(|| ns.name_any());
    let digest = hex::encode(Sha256::digest(seed.as_bytes()));
    normalize(&format!("{}-{}", ns.name_any(), &digest[..6]))
}

/// Binding of `service_account` in `ns` to `project` on `config`.
fn desired_binding(ns: &Namespace, config: &ServerConfiguration, service_account: &str, project: &str) -> ProjectBinding {
    let config_name = config.name_any();
    let annotations = config
        .annotations()
        .get(CLASS_ANNOTATION)
        .map(|class| BTreeMap::from([(CLASS_ANNOTATION.to_string(), class.clone())]));
    ProjectBinding {
        metadata: ObjectMeta {
            name: Some(binding_name(&config_name, service_account)),
            namespace: Some(ns.name_any()),
            annotations,
            owner_references: ns.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        spec: ProjectBindingSpec {
            server_configuration: config_name,
            service_account: service_account.to_string(),
            project_name: project.to_string(),
        },
        status: None,
    }
}

async fn annotate(ctx: &Context, ns: &Namespace, annotations: BTreeMap<&str, String>) -> Result<()> {
    let api: Api<Namespace> = Api::all(ctx.client.clone());
    api.patch(
        &ns.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "metadata": { "annotations": annotations } })),
    )
    .await?;
    Ok(())
}

pub async fn reconcile(ns: Arc<Namespace>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let Some(project) = annotation(&ns, PROJECT_ANNOTATION) else {
        return Ok(Action::await_change());
    };
    let name = ns.name_any();

    let configs = Api::<ServerConfiguration>::all(ctx.client.clone())
        .list(&Default::default())
        .await?
        .items;
    let explicit = annotation(&ns, HARBOR_ANNOTATION);
    let Some(config) = resolve_server(explicit, &configs) else {
        info!("No server configuration for namespace {} ({:?})", name, explicit);
        return Ok(Action::requeue(NOT_READY_REQUEUE));
    };
    if !matches_class(config, &ctx.config.class_name) {
        return Ok(Action::await_change());
    }
    if !config.selects(ns.labels()) {
        warn!("Server configuration {} does not select namespace {}", config.name_any(), name);
        return Ok(Action::await_change());
    }

    let service_account = annotation(&ns, SERVICE_ACCOUNT_ANNOTATION).unwrap_or(DEFAULT_SERVICE_ACCOUNT);
    let accounts: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), &name);
    if accounts.get_opt(service_account).await?.is_none() {
        info!("Waiting for service account {}/{}", name, service_account);
        return Ok(Action::requeue(NOT_READY_REQUEUE));
    }

    let project = if project == AUTO_PROJECT {
        let harbor = HarborClient::from_server_configuration(&ctx.client, config).await?;
        let generated = generated_project_name(&ns);
        let id = harbor.create_project(&ProjectReq::new(&generated, false)).await?;
        info!("Provisioned project {} ({}) for namespace {}", generated, id, name);
        annotate(&ctx, &ns, BTreeMap::from([(PROJECT_ANNOTATION, generated.clone())])).await?;
        generated
    } else {
        project.to_string()
    };

    let bindings: Api<ProjectBinding> = Api::namespaced(ctx.client.clone(), &name);
    let desired = desired_binding(&ns, config, service_account, &project);
    let (outcome, binding) = apply_object(&bindings, desired, Policy::Converge).await?;
    if outcome != Outcome::Unchanged {
        info!("Bound {}/{} to project {}", name, service_account, project);
    }

    if let Some(robot) = binding.robot_id().map(|id| id.to_string()) {
        if annotation(&ns, ROBOT_ANNOTATION) != Some(robot.as_str()) {
            annotate(&ctx, &ns, BTreeMap::from([(ROBOT_ANNOTATION, robot)])).await?;
        }
    }
    Ok(Action::requeue(ctx.config.requeue_period))
}

fn error_policy(ns: Arc<Namespace>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(CONTROLLER, ns.as_ref(), error);
    let delay = error
        .requeue_after()
        .unwrap_or_else(|| ctx.backoff.next_delay(&format!("Namespace/{}", ns.name_any())));
    Action::requeue(delay)
}

/// Watches namespaces and the bindings created for them.
pub async fn run(client: Client, ctx: Arc<Context>) {
    Controller::new(Api::<Namespace>::all(client.clone()), watcher::Config::default())
        .with_config(controller::Config::default().concurrency(ctx.config.concurrency))
        .owns(Api::<ProjectBinding>::all(client.clone()), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            if let Err(e) = res {
                debug!("namespace controller: {}", e);
            }
            ready(())
        })
        .await;
}
