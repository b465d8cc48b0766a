use std::sync::Arc;

use chrono::Utc;
use futures::{future::ready, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        events::EventType,
    },
    Resource, ResourceExt,
};
use serde_json::{Map, Value};
use tracing::*;

use super::{class_filtered, ensure_crd, matches_class, merge_conditions, namespaced_api, object_key, Context};
use crate::api::v1alpha1::*;
use crate::api::{Condition, StatusPhase, APPLIED_CONDITION};
use crate::apply::checksum::fingerprint;
use crate::harbor_client::HarborClient;
use crate::util::errors::{Error, Result, StdError};
use crate::util::status::patch_status;

const CONTROLLER: &str = "platformconfiguration";

/// Settings with every secret reference replaced by the value `secret_value` looks up.
fn payload<F>(spec: &PlatformConfigurationSpec, secret_value: F) -> Result<Map<String, Value>>
where
    F: Fn(&str, &str) -> Option<String>,
{
    let mut settings = spec.settings.clone();
    for setting in &spec.secret_settings {
        let reference = &setting.secret_key_ref;
        let value = secret_value(&reference.name, &reference.key).ok_or_else(|| {
            StdError::NotFound(format!("key {} in secret {}", reference.key, reference.name))
        })?;
        settings.insert(setting.field.clone(), Value::String(value));
    }
    Ok(settings)
}

async fn resolve(ctx: &Context, config: &PlatformConfiguration) -> Result<Map<String, Value>> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &config.namespace().unwrap_or_default());
    let mut fetched = Vec::new();
    for setting in &config.spec.secret_settings {
        if let Some(secret) = secrets.get_opt(&setting.secret_key_ref.name).await? {
            fetched.push(secret);
        }
    }
    payload(&config.spec, |name, key| {
        fetched
            .iter()
            .find(|s| s.name_any() == name)
            .and_then(|s| s.data.as_ref())
            .and_then(|data| data.get(key))
            .map(|value| String::from_utf8_lossy(&value.0).into_owned())
    })
}

async fn write_status(
    ctx: &Context,
    config: &PlatformConfiguration,
    phase: StatusPhase,
    checksum: Option<String>,
    condition: Condition,
) -> Result<()> {
    let previous = config.status.clone().unwrap_or_default();
    let status = PlatformConfigurationStatus {
        conditions: merge_conditions(&previous.conditions, config.meta().generation, vec![condition.clone()]),
        observed_generation: config.meta().generation,
        status: phase,
        reason: condition.reason,
        message: condition.message,
        last_applied_checksum: checksum.or(previous.last_applied_checksum),
    };
    patch_status(&namespaced_api(&ctx.client, config), &config.name_any(), config.status.as_ref(), &status).await
}

async fn push(ctx: &Context, config: &PlatformConfiguration) -> Result<Option<String>> {
    let settings = resolve(ctx, config).await?;
    let checksum = fingerprint(&settings)?;
    let applied = config.status.as_ref().and_then(|s| s.last_applied_checksum.as_deref());
    if applied == Some(checksum.as_str()) {
        return Ok(None);
    }

    let server = Api::<ServerConfiguration>::all(ctx.client.clone())
        .get_opt(&config.spec.server_configuration)
        .await?
        .ok_or_else(|| StdError::NotFound(format!("server configuration {}", config.spec.server_configuration)))?;
    let harbor = HarborClient::from_server_configuration(&ctx.client, &server).await?;
    harbor.apply_configuration(&settings).await?;
    Ok(Some(checksum))
}

pub async fn reconcile(config: Arc<PlatformConfiguration>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();

    if !matches_class(config.as_ref(), &ctx.config.class_name) {
        return Ok(Action::await_change());
    }
    let key = object_key(config.as_ref());
    info!("Reconciling {}", key);

    match push(&ctx, &config).await {
        Ok(None) => {
            debug!("{} already applied", key);
        }
        Ok(Some(checksum)) => {
            write_status(
                &ctx,
                &config,
                StatusPhase::Ready,
                Some(checksum),
                Condition::new(APPLIED_CONDITION, true, "Applied", "settings accepted by the server"),
            )
            .await?;
            ctx.publish_event(
                config.as_ref(),
                EventType::Normal,
                "ConfigurationApplied",
                "Applying",
                format!("settings pushed to {}", config.spec.server_configuration),
            )
            .await;
        }
        Err(error) => {
            let message = match error.inner() {
                StdError::RemoteError { body, .. } => body.clone(),
                other => other.to_string(),
            };
            write_status(
                &ctx,
                &config,
                StatusPhase::Fail,
                None,
                Condition::new(APPLIED_CONDITION, false, &error.reason("ApplyConfiguration"), message),
            )
            .await?;
            return Err(error);
        }
    }
    Ok(Action::requeue(ctx.config.requeue_period))
}

fn error_policy(config: Arc<PlatformConfiguration>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(CONTROLLER, config.as_ref(), error);
    let delay = error
        .requeue_after()
        .unwrap_or_else(|| ctx.backoff.next_delay(&object_key(config.as_ref())));
    Action::requeue(delay)
}

/// Initialize the platform configuration controller (given the crds are installed)
pub async fn run(client: Client, ctx: Arc<Context>) {
    ensure_crd::<PlatformConfiguration>(&client).await;

    let (reader, stream) = class_filtered(
        Api::<PlatformConfiguration>::all(client.clone()),
        ctx.config.class_name.clone(),
    );
    Controller::for_stream(stream, reader)
        .with_config(controller::Config::default().concurrency(ctx.config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            if let Err(e) = res {
                debug!("platform configuration controller: {}", e);
            }
            ready(())
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SecretKeyRef;
    use serde_json::json;

    fn spec() -> PlatformConfigurationSpec {
        PlatformConfigurationSpec {
            server_configuration: "prod".to_string(),
            settings: json!({"auth_mode": "oidc_auth", "oidc_verify_cert": true})
                .as_object()
                .cloned()
                .unwrap(),
            secret_settings: vec![SecretSetting {
                field: "oidc_client_secret".to_string(),
                secret_key_ref: SecretKeyRef {
                    name: "oidc".to_string(),
                    key: "secret".to_string(),
                },
            }],
        }
    }

    #[test]
    fn secret_settings_are_merged_into_the_payload() {
        let settings = payload(&spec(), |name, key| {
            (name == "oidc" && key == "secret").then(|| "hunter2".to_string())
        })
        .unwrap();
        assert_eq!(
            Value::Object(settings),
            json!({
                "auth_mode": "oidc_auth",
                "oidc_verify_cert": true,
                "oidc_client_secret": "hunter2",
            })
        );
    }

    #[test]
    fn missing_secret_key_is_not_found() {
        let error = payload(&spec(), |_, _| None).unwrap_err();
        assert!(matches!(error.inner(), StdError::NotFound(_)));
    }

    #[test]
    fn checksum_moves_with_secret_values() {
        let first = payload(&spec(), |_, _| Some("a".to_string())).unwrap();
        let second = payload(&spec(), |_, _| Some("b".to_string())).unwrap();
        assert_ne!(fingerprint(&first).unwrap(), fingerprint(&second).unwrap());
    }
}
