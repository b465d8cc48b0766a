use std::sync::Arc;

use chrono::Utc;
use futures::{future::ready, StreamExt};
use kube::{
    api::Api,
    client::Client,
    runtime::controller::{self, Action, Controller},
    Resource, ResourceExt,
};
use tokio::time::Duration;
use tracing::*;

use super::{class_filtered, ensure_crd, matches_class, merge_conditions, object_key, Context};
use crate::api::v1alpha1::ServerConfiguration;
use crate::api::{ComponentStatus, Condition, StatusPhase, READY_CONDITION};
use crate::harbor_client::{HarborClient, OverallHealthStatus};
use crate::util::errors::{Error, Result};
use crate::util::status::patch_status;

const CONTROLLER: &str = "serverconfiguration";
const HEALTH_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Phase and Ready condition for the outcome of a health check.
fn health_verdict(health: &Result<OverallHealthStatus>) -> (StatusPhase, Condition) {
    match health {
        Ok(health) if health.is_healthy() => (
            StatusPhase::Ready,
            Condition::new(READY_CONDITION, true, "Healthy", "server reports healthy"),
        ),
        Ok(health) => {
            let failing: Vec<String> = health
                .components
                .iter()
                .filter(|c| c.status != "healthy")
                .map(|c| match &c.error {
                    Some(error) => format!("{}: {}", c.name, error),
                    None => c.name.clone(),
                })
                .collect();
            (
                StatusPhase::Fail,
                Condition::new(READY_CONDITION, false, "Unhealthy", failing.join("; ")),
            )
        }
        Err(error) => (
            StatusPhase::Fail,
            Condition::new(READY_CONDITION, false, "Unhealthy", error.to_string()),
        ),
    }
}

pub async fn reconcile(config: Arc<ServerConfiguration>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();

    if !matches_class(config.as_ref(), &ctx.config.class_name) {
        return Ok(Action::await_change());
    }
    let key = object_key(config.as_ref());
    debug!("Checking health of {} at {}", key, config.spec.server_url);

    let health = match HarborClient::from_server_configuration(&ctx.client, &config).await {
        Ok(client) => client.check_health().await,
        Err(e) => Err(e),
    };
    if let Err(e) = &health {
        warn!("{} is unreachable: {}", key, e);
    }
    let (phase, condition) = health_verdict(&health);

    let previous = config.status.clone().unwrap_or_default();
    let status = ComponentStatus {
        conditions: merge_conditions(&previous.conditions, config.meta().generation, vec![condition.clone()]),
        observed_generation: config.meta().generation,
        status: phase,
        reason: condition.reason,
        message: condition.message,
        replicas: None,
    };
    let api: Api<ServerConfiguration> = Api::all(ctx.client.clone());
    patch_status(&api, &config.name_any(), config.status.as_ref(), &status).await?;

    Ok(Action::requeue(HEALTH_PERIOD))
}

fn error_policy(config: Arc<ServerConfiguration>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(CONTROLLER, config.as_ref(), error);
    let delay = error
        .requeue_after()
        .unwrap_or_else(|| ctx.backoff.next_delay(&object_key(config.as_ref())));
    Action::requeue(delay)
}

/// Initialize the server configuration controller (given the crds are installed)
pub async fn run(client: Client, ctx: Arc<Context>) {
    ensure_crd::<ServerConfiguration>(&client).await;

    let (reader, stream) = class_filtered(
        Api::<ServerConfiguration>::all(client.clone()),
        ctx.config.class_name.clone(),
    );
    Controller::for_stream(stream, reader)
        .with_config(controller::Config::default().concurrency(ctx.config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            if let Err(e) = res {
                debug!("server configuration controller: {}", e);
            }
            ready(())
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::ComponentHealth;
    use crate::util::errors::StdError;

    #[test]
    fn healthy_server_is_ready() {
        let health = Ok(OverallHealthStatus {
            status: "healthy".to_string(),
            components: vec![],
        });
        let (phase, condition) = health_verdict(&health);
        assert_eq!(phase, StatusPhase::Ready);
        assert_eq!(condition.status, "True");
    }

    #[test]
    fn failing_components_are_listed_with_their_errors() {
        let health = Ok(OverallHealthStatus {
            status: "unhealthy".to_string(),
            components: vec![
                ComponentHealth {
                    name: "core".to_string(),
                    status: "healthy".to_string(),
                    error: None,
                },
                ComponentHealth {
                    name: "database".to_string(),
                    status: "unhealthy".to_string(),
                    error: Some("connection refused".to_string()),
                },
            ],
        });
        let (phase, condition) = health_verdict(&health);
        assert_eq!(phase, StatusPhase::Fail);
        assert_eq!(condition.reason, "Unhealthy");
        assert_eq!(condition.message, "database: connection refused");
    }

    #[test]
    fn unreachable_server_fails() {
        let health = Err(StdError::HttpError("timed out".to_string()).into());
        let (phase, condition) = health_verdict(&health);
        assert_eq!(phase, StatusPhase::Fail);
        assert!(condition.message.contains("timed out"));
    }
}
