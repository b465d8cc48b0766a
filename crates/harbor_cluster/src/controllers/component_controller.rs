//! Generic reconciler driving every [`Component`] kind through render and apply.

use std::sync::Arc;

use chrono::Utc;
use futures::{future::ready, StreamExt};
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        events::EventType,
    },
    ResourceExt,
};
use tracing::*;

use super::{
    class_filtered, ensure_crd, matches_class, merge_conditions, namespaced_api, object_key, owns_kinds, Context,
};
use crate::api::{ComponentStatus, Condition, StatusPhase, APPLIED_CONDITION, READY_CONDITION};
use crate::apply::{ApplyReport, Applier};
use crate::render::{Component, ManifestKind, RenderContext};
use crate::util::errors::{Error, Result};
use crate::util::status::patch_status;

/// What a finished apply pass means for the CR.
#[derive(Debug, PartialEq)]
pub(crate) struct Verdict {
    pub phase: StatusPhase,
    pub reason: String,
    pub message: String,
    pub conditions: Vec<Condition>,
}

/// Lifts an apply report into conditions and the coarse status.
pub(crate) fn verdict(report: &ApplyReport) -> Verdict {
    if let Some((object, error)) = report.first_error() {
        let reason = error.reason("Apply");
        let message = format!("{object}: {error}");
        return Verdict {
            phase: StatusPhase::Fail,
            conditions: vec![
                Condition::new(APPLIED_CONDITION, false, &reason, message.clone()),
                Condition::new(READY_CONDITION, false, "NotApplied", ""),
            ],
            reason,
            message,
        };
    }
    if !report.is_success() {
        let message = report.summary();
        return Verdict {
            phase: StatusPhase::Fail,
            conditions: vec![
                Condition::new(APPLIED_CONDITION, false, "ApplyError", message.clone()),
                Condition::new(READY_CONDITION, false, "NotApplied", ""),
            ],
            reason: "ApplyError".to_string(),
            message,
        };
    }

    let summary = report.summary();
    if report.deployments_ready {
        Verdict {
            phase: StatusPhase::Ready,
            conditions: vec![
                Condition::new(APPLIED_CONDITION, true, "Applied", summary.clone()),
                Condition::new(READY_CONDITION, true, "Available", "every deployment is available"),
            ],
            reason: "Available".to_string(),
            message: summary,
        }
    } else {
        Verdict {
            phase: StatusPhase::Unknown,
            conditions: vec![
                Condition::new(APPLIED_CONDITION, true, "Applied", summary.clone()),
                Condition::new(READY_CONDITION, false, "Progressing", "waiting for deployments"),
            ],
            reason: "Progressing".to_string(),
            message: summary,
        }
    }
}

async fn write_status<K: Component>(
    ctx: &Context,
    obj: &K,
    phase: StatusPhase,
    reason: String,
    message: String,
    conditions: Vec<Condition>,
) -> Result<()> {
    let current = obj.component_status();
    let previous = current.cloned().unwrap_or_default();
    let status = ComponentStatus {
        conditions: merge_conditions(&previous.conditions, obj.meta().generation, conditions),
        observed_generation: obj.meta().generation,
        status: phase,
        reason,
        message,
        replicas: previous.replicas,
    };
    patch_status(&namespaced_api::<K>(&ctx.client, obj), &obj.name_any(), current, &status).await
}

pub async fn reconcile<K: Component>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(K::COMPONENT);
    ctx.diagnostics.write().await.last_event = Utc::now();

    if !matches_class(obj.as_ref(), &ctx.config.class_name) {
        debug!("Skipping {} of another class", object_key(obj.as_ref()));
        return Ok(Action::await_change());
    }
    let key = object_key(obj.as_ref());
    info!("Reconciling {}", key);

    let objects = match obj.render(&RenderContext { images: &ctx.images }) {
        Ok(objects) => objects,
        Err(error) => {
            // Render errors stay until the spec changes.
            warn!("Rendering {} failed: {}", key, error);
            ctx.metrics.reconcile_failure(K::COMPONENT, obj.as_ref(), &error);
            let reason = error.reason("Render");
            write_status(
                &ctx,
                obj.as_ref(),
                StatusPhase::Fail,
                reason.clone(),
                error.to_string(),
                vec![
                    Condition::new(APPLIED_CONDITION, false, &reason, error.to_string()),
                    Condition::new(READY_CONDITION, false, "NotApplied", ""),
                ],
            )
            .await?;
            return Ok(Action::await_change());
        }
    };

    let mut report = Applier::new(ctx.client.clone()).apply(obj.as_ref(), objects).await;
    let Verdict {
        phase,
        reason,
        message,
        conditions,
    } = verdict(&report);
    write_status(&ctx, obj.as_ref(), phase, reason, message.clone(), conditions).await?;

    if report.is_transient() {
        if let Some((_, error)) = report.errors.drain(..).find(|(_, e)| e.is_transient()) {
            return Err(error);
        }
    }
    if !report.is_success() {
        ctx.publish_event(obj.as_ref(), EventType::Warning, "ApplyFailed", "Applying", message)
            .await;
        if let Some((_, error)) = report.first_error() {
            ctx.metrics.reconcile_failure(K::COMPONENT, obj.as_ref(), error);
        }
        return Ok(Action::await_change());
    }

    ctx.backoff.reset(&key);
    if report.changed() > 0 {
        ctx.publish_event(obj.as_ref(), EventType::Normal, "Applied", "Applying", message)
            .await;
    }
    Ok(Action::requeue(ctx.config.requeue_period))
}

pub fn error_policy<K: Component>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(K::COMPONENT, obj.as_ref(), error);
    let delay = error
        .requeue_after()
        .unwrap_or_else(|| ctx.backoff.next_delay(&object_key(obj.as_ref())));
    Action::requeue(delay)
}

/// Every kind a component may render; each one is watched for drift.
pub(crate) const OWNED_KINDS: [ManifestKind; 6] = [
    ManifestKind::Service,
    ManifestKind::ConfigMap,
    ManifestKind::Secret,
    ManifestKind::Certificate,
    ManifestKind::Ingress,
    ManifestKind::Deployment,
];

/// Runs the controller of component kind `K` until shutdown.
pub async fn run<K: Component>(client: Client, ctx: Arc<Context>) {
    ensure_crd::<K>(&client).await;

    let (reader, stream) = class_filtered(Api::<K>::all(client.clone()), ctx.config.class_name.clone());
    let controller = Controller::for_stream(stream, reader)
        .with_config(controller::Config::default().concurrency(ctx.config.concurrency));
    owns_kinds(controller, &client, &OWNED_KINDS)
        .shutdown_on_signal()
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(|res| {
            if let Err(e) = res {
                debug!("{} controller: {}", K::COMPONENT, e);
            }
            ready(())
        })
        .await;
}
