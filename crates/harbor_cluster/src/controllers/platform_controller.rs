use std::sync::Arc;

use chrono::Utc;
use futures::{future::ready, future::BoxFuture, FutureExt, StreamExt};
use kube::{
    api::{Api, DeleteParams},
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        events::EventType,
        watcher,
    },
    Resource, ResourceExt,
};
use tokio::time::Duration;
use tracing::*;

use super::{
    class_filtered, ensure_crd, matches_class, merge_conditions, namespaced_api, object_key, owns_kinds, Context,
};
use crate::api::v1alpha1::*;
use crate::api::{Condition, StatusPhase, APPLIED_CONDITION, READY_CONDITION};
use crate::apply::{apply_object, Applier, Outcome};
use crate::harbor_client::OverallHealthStatus;
use crate::render::{api_prefix, normalize, platform, Component, ManifestKind, Policy};
use crate::util::errors::{ignore_not_found, Error, Result, StdError};
use crate::util::status::{is_status_condition_true, patch_status};

const CONTROLLER: &str = "platform";
const NOT_READY_REQUEUE: Duration = Duration::from_secs(30);

/// Result of applying one child resource.
#[derive(Debug)]
struct ChildOutcome {
    component: &'static str,
    result: Result<(Outcome, bool)>,
}

async fn apply_child<K: Component>(client: Client, child: K) -> ChildOutcome {
    let api = namespaced_api::<K>(&client, &child);
    let span = info_span!("component", component = K::COMPONENT, name = %child.name_any());
    let result = apply_object(&api, child, Policy::Converge)
        .instrument(span)
        .await
        .map(|(outcome, live)| {
            let ready = live
                .component_status()
                .map(|s| is_status_condition_true(&s.conditions, READY_CONDITION))
                .unwrap_or(false);
            (outcome, ready)
        });
    ChildOutcome {
        component: K::COMPONENT,
        result,
    }
}

/// Deletes the child of a disabled component, if present.
async fn delete_child<K: Component>(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    if ignore_not_found(api.delete(name, &DeleteParams::default()).await)?.is_some() {
        info!("Deleted disabled {} '{}'", K::COMPONENT, name);
    }
    Ok(())
}

/// Health of the platform as reported by core, fetched through the API server proxy.
async fn core_health(client: &Client, platform: &Platform) -> Result<OverallHealthStatus> {
    let service = normalize(&format!("{}-core", platform.name_any()));
    let path = format!(
        "/api/v1/namespaces/{}/services/{service}:http/proxy{}/health",
        platform.namespace().unwrap_or_default(),
        api_prefix(&platform.spec.version),
    );
    let request = http::Request::get(path)
        .body(Vec::new())
        .map_err(|e| StdError::HttpError(e.to_string()))?;
    Ok(client.request::<OverallHealthStatus>(request).await?)
}

/// Ready condition from the reported health and the children still converging.
fn readiness(health: Option<&OverallHealthStatus>, pending: &[&str]) -> Condition {
    match health {
        None => Condition::new(READY_CONDITION, false, "CoreUnreachable", "health endpoint not reachable"),
        Some(health) if !health.is_healthy() => {
            let unhealthy: Vec<&str> = health
                .components
                .iter()
                .filter(|c| c.status != "healthy")
                .map(|c| c.name.as_str())
                .collect();
            Condition::new(
                READY_CONDITION,
                false,
                "Unhealthy",
                format!("unhealthy components: {}", unhealthy.join(", ")),
            )
        }
        Some(_) if !pending.is_empty() => Condition::new(
            READY_CONDITION,
            false,
            "ComponentsNotReady",
            format!("waiting for {}", pending.join(", ")),
        ),
        Some(_) => Condition::new(READY_CONDITION, true, "Healthy", "every component is healthy"),
    }
}

async fn write_status(
    ctx: &Context,
    platform: &Platform,
    phase: StatusPhase,
    conditions: Vec<Condition>,
    components: Option<Vec<ComponentHealth>>,
) -> Result<()> {
    let previous = platform.status.clone().unwrap_or_default();
    let conditions = merge_conditions(&previous.conditions, platform.meta().generation, conditions);
    let (reason, message) = conditions
        .iter()
        .find(|c| c.status != "True")
        .or_else(|| conditions.iter().find(|c| c.type_ == READY_CONDITION))
        .map(|c| (c.reason.clone(), c.message.clone()))
        .unwrap_or_default();
    let status = PlatformStatus {
        conditions,
        observed_generation: platform.meta().generation,
        status: phase,
        reason,
        message,
        components: components.unwrap_or(previous.components),
    };
    patch_status(
        &namespaced_api::<Platform>(&ctx.client, platform),
        &platform.name_any(),
        platform.status.as_ref(),
        &status,
    )
    .await
}

pub async fn reconcile(platform: Arc<Platform>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();

    if !matches_class(platform.as_ref(), &ctx.config.class_name) {
        return Ok(Action::await_change());
    }
    let key = object_key(platform.as_ref());
    let namespace = platform.namespace().unwrap_or_default();
    let name = platform.name_any();

    if platform.spec.paused {
        info!("{} is paused", key);
        write_status(
            &ctx,
            &platform,
            platform.status.as_ref().map(|s| s.status.clone()).unwrap_or_default(),
            vec![Condition::new(APPLIED_CONDITION, false, "Paused", "reconciliation is paused")],
            None,
        )
        .await?;
        return Ok(Action::await_change());
    }
    info!("Reconciling {}", key);

    let plan = platform::render(&platform);
    let mut report = Applier::new(ctx.client.clone()).apply(platform.as_ref(), plan.objects).await;
    if let Some((object, error)) = report.first_error() {
        let reason = error.reason("Apply");
        let message = format!("{object}: {error}");
        write_status(
            &ctx,
            &platform,
            StatusPhase::Fail,
            vec![
                Condition::new(APPLIED_CONDITION, false, &reason, message.clone()),
                Condition::new(READY_CONDITION, false, "NotApplied", ""),
            ],
            None,
        )
        .await?;
        ctx.publish_event(platform.as_ref(), EventType::Warning, "ApplyFailed", "Applying", message)
            .await;
        return match report.errors.drain(..).find(|(_, e)| e.is_transient()) {
            Some((_, error)) => Err(error),
            None => Ok(Action::await_change()),
        };
    }

    let children = plan.children;
    let client = &ctx.client;
    let mut applies: Vec<BoxFuture<'static, ChildOutcome>> = vec![
        apply_child(client.clone(), children.core).boxed(),
        apply_child(client.clone(), children.registry).boxed(),
        apply_child(client.clone(), children.job_service).boxed(),
        apply_child(client.clone(), children.portal).boxed(),
    ];
    match children.chart_museum {
        Some(child) => applies.push(apply_child(client.clone(), child).boxed()),
        None => delete_child::<ChartMuseum>(client, &namespace, &name).await?,
    }
    match children.scanner {
        Some(child) => applies.push(apply_child(client.clone(), child).boxed()),
        None => delete_child::<Scanner>(client, &namespace, &name).await?,
    }
    match (children.notary_server, children.notary_signer) {
        (Some(server), Some(signer)) => {
            applies.push(apply_child(client.clone(), server).boxed());
            applies.push(apply_child(client.clone(), signer).boxed());
        }
        _ => {
            delete_child::<NotaryServer>(client, &namespace, &name).await?;
            delete_child::<NotarySigner>(client, &namespace, &name).await?;
        }
    }

    let mut pending = Vec::new();
    let mut failure: Option<(&'static str, Error)> = None;
    for child in futures::future::join_all(applies).await {
        match child.result {
            Ok((_, true)) => {}
            Ok((_, false)) => pending.push(child.component),
            Err(error) => {
                warn!("Applying {} child of {} failed: {}", child.component, key, error);
                if failure.is_none() {
                    failure = Some((child.component, error));
                }
            }
        }
    }

    if let Some((component, error)) = failure {
        let reason = error.reason("ApplyComponent");
        write_status(
            &ctx,
            &platform,
            StatusPhase::Fail,
            vec![
                Condition::new(APPLIED_CONDITION, false, &reason, format!("{component}: {error}")),
                Condition::new(READY_CONDITION, false, "NotApplied", ""),
            ],
            None,
        )
        .await?;
        return if error.is_transient() {
            Err(error)
        } else {
            Ok(Action::await_change())
        };
    }

    let health = match core_health(client, &platform).await {
        Ok(health) => Some(health),
        Err(e) => {
            debug!("Health of {} not available: {}", key, e);
            None
        }
    };
    let ready = readiness(health.as_ref(), &pending);
    let is_ready = ready.status == "True";
    write_status(
        &ctx,
        &platform,
        if is_ready { StatusPhase::Ready } else { StatusPhase::Unknown },
        vec![
            Condition::new(APPLIED_CONDITION, true, "Applied", report.summary()),
            ready,
        ],
        health.map(|h| h.components),
    )
    .await?;

    ctx.backoff.reset(&key);
    if is_ready {
        Ok(Action::requeue(ctx.config.requeue_period))
    } else {
        Ok(Action::requeue(NOT_READY_REQUEUE.min(ctx.config.requeue_period)))
    }
}

fn error_policy(platform: Arc<Platform>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(CONTROLLER, platform.as_ref(), error);
    let delay = error
        .requeue_after()
        .unwrap_or_else(|| ctx.backoff.next_delay(&object_key(platform.as_ref())));
    Action::requeue(delay)
}

/// Kinds the platform renders next to its component children.
pub(crate) const PLATFORM_OWNED_KINDS: [ManifestKind; 4] = [
    ManifestKind::ConfigMap,
    ManifestKind::Secret,
    ManifestKind::Certificate,
    ManifestKind::Ingress,
];

/// Initialize the platform controller (given the crds are installed)
pub async fn run(client: Client, ctx: Arc<Context>) {
    ensure_crd::<Platform>(&client).await;

    let (reader, stream) = class_filtered(Api::<Platform>::all(client.clone()), ctx.config.class_name.clone());
    let controller = Controller::for_stream(stream, reader)
        .with_config(controller::Config::default().concurrency(ctx.config.concurrency))
        .owns(Api::<Core>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Registry>::all(client.clone()), watcher::Config::default())
        .owns(Api::<JobService>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Portal>::all(client.clone()), watcher::Config::default())
        .owns(Api::<ChartMuseum>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Scanner>::all(client.clone()), watcher::Config::default())
        .owns(Api::<NotaryServer>::all(client.clone()), watcher::Config::default())
        .owns(Api::<NotarySigner>::all(client.clone()), watcher::Config::default());
    owns_kinds(controller, &client, &PLATFORM_OWNED_KINDS)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            if let Err(e) = res {
                debug!("platform controller: {}", e);
            }
            ready(())
        })
        .await;
}
