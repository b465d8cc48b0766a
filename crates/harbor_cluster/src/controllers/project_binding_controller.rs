//! Materializes the pull credential of a [`ProjectBinding`] and attaches it to its service account.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use futures::{future::ready, StreamExt};
use k8s_openapi::api::core::v1::{LocalObjectReference, Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        events::EventType,
        finalizer::{finalizer, Event as Finalizer},
        watcher,
    },
    Resource, ResourceExt,
};
use serde_json::json;
use tokio::time::Duration;
use tracing::*;

use super::{class_filtered, ensure_crd, matches_class, merge_conditions, namespaced_api, object_key, Context};
use crate::api::v1alpha1::*;
use crate::api::{ComponentStatus, Condition, StatusPhase, READY_CONDITION};
use crate::apply::{apply_object, Outcome};
use crate::harbor_client::{HarborClient, RobotCreate};
use crate::render::{normalize, Policy};
use crate::util::errors::{ignore_not_found, Error, Result, StdError};
use crate::util::status::patch_status;

const CONTROLLER: &str = "projectbinding";
const DOCKER_CONFIG_JSON: &str = ".dockerconfigjson";
const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
const NOT_READY_REQUEUE: Duration = Duration::from_secs(60);

/// `.dockerconfigjson` payload granting `username` access to `registry`.
pub fn docker_config_json(registry: &str, username: &str, password: &str) -> Result<Vec<u8>> {
    let auth = STANDARD.encode(format!("{username}:{password}"));
    Ok(serde_json::to_vec(&json!({
        "auths": {
            registry: {
                "username": username,
                "password": password,
                "email": "",
                "auth": auth,
            }
        }
    }))?)
}

/// `imagePullSecrets` of `sa` with `secret` appended, or `None` when already attached.
fn with_pull_secret(sa: &ServiceAccount, secret: &str) -> Option<Vec<LocalObjectReference>> {
    let mut secrets = sa.image_pull_secrets.clone().unwrap_or_default();
    if secrets.iter().any(|s| s.name == secret) {
        return None;
    }
    secrets.push(LocalObjectReference {
        name: secret.to_string(),
    });
    Some(secrets)
}

/// `imagePullSecrets` of `sa` without `secret`, or `None` when it was not attached.
fn without_pull_secret(sa: &ServiceAccount, secret: &str) -> Option<Vec<LocalObjectReference>> {
    let secrets = sa.image_pull_secrets.clone().unwrap_or_default();
    let kept: Vec<_> = secrets.iter().filter(|s| s.name != secret).cloned().collect();
    (kept.len() != secrets.len()).then_some(kept)
}

async fn set_pull_secrets(api: &Api<ServiceAccount>, sa: &str, secrets: Vec<LocalObjectReference>) -> Result<()> {
    api.patch(
        sa,
        &PatchParams::default(),
        &Patch::Merge(json!({ "imagePullSecrets": secrets })),
    )
    .await?;
    Ok(())
}

async fn write_status(ctx: &Context, binding: &ProjectBinding, phase: StatusPhase, condition: Condition) -> Result<()> {
    let previous = binding.status.clone().unwrap_or_default();
    let status = ComponentStatus {
        conditions: merge_conditions(&previous.conditions, binding.meta().generation, vec![condition.clone()]),
        observed_generation: binding.meta().generation,
        status: phase,
        reason: condition.reason,
        message: condition.message,
        replicas: None,
    };
    patch_status(&namespaced_api(&ctx.client, binding), &binding.name_any(), binding.status.as_ref(), &status).await
}

/// Records why the binding cannot be served yet and checks back later.
async fn not_ready(ctx: &Context, binding: &ProjectBinding, reason: &str, message: String) -> Result<Action> {
    info!("{} not ready: {}", object_key(binding), message);
    write_status(
        ctx,
        binding,
        StatusPhase::Fail,
        Condition::new(READY_CONDITION, false, reason, message),
    )
    .await?;
    Ok(Action::requeue(NOT_READY_REQUEUE))
}

async fn server_configuration(ctx: &Context, name: &str) -> Result<Option<ServerConfiguration>> {
    Ok(Api::<ServerConfiguration>::all(ctx.client.clone()).get_opt(name).await?)
}

async fn apply(binding: Arc<ProjectBinding>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = binding.namespace().unwrap_or_default();
    let spec = &binding.spec;

    let Some(config) = server_configuration(&ctx, &spec.server_configuration).await? else {
        let message = format!("server configuration {} not found", spec.server_configuration);
        return not_ready(&ctx, &binding, "ServerConfigurationNotFound", message).await;
    };
    let config_phase = config.status.as_ref().map(|s| s.status.clone()).unwrap_or_default();
    if config_phase != StatusPhase::Ready {
        let message = format!("server configuration {} is {}", spec.server_configuration, config_phase);
        return not_ready(&ctx, &binding, "ServerConfigurationNotReady", message).await;
    }

    let accounts: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(account) = accounts.get_opt(&spec.service_account).await? else {
        let message = format!("service account {namespace}/{} not found", spec.service_account);
        return not_ready(&ctx, &binding, "ServiceAccountNotFound", message).await;
    };

    let harbor = HarborClient::from_server_configuration(&ctx.client, &config).await?;
    if harbor.get_project(&spec.project_name).await?.is_none() {
        let message = format!("project {} not found on {}", spec.project_name, config.spec.server_url);
        return not_ready(&ctx, &binding, "ProjectNotFound", message).await;
    }

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let existing = match binding.pull_secret() {
        Some(name) => secrets.get_opt(name).await?,
        None => None,
    };
    let secret_name = match existing {
        Some(secret) => secret.name_any(),
        None => materialize(&ctx, &binding, &harbor, &config, &secrets).await?,
    };

    if let Some(pull_secrets) = with_pull_secret(&account, &secret_name) {
        info!("Attaching {} to service account {}/{}", secret_name, namespace, spec.service_account);
        set_pull_secrets(&accounts, &spec.service_account, pull_secrets).await?;
    }

    write_status(
        &ctx,
        &binding,
        StatusPhase::Ready,
        Condition::new(READY_CONDITION, true, "Bound", format!("pull secret {secret_name} attached")),
    )
    .await?;
    Ok(Action::requeue(ctx.config.requeue_period))
}

/// Creates a robot and stores its one-time credential in a pull secret.
///
/// Returns the name of the secret.
async fn materialize(
    ctx: &Context,
    binding: &ProjectBinding,
    harbor: &HarborClient,
    config: &ServerConfiguration,
    secrets: &Api<Secret>,
) -> Result<String> {
    let namespace = binding.namespace().unwrap_or_default();
    let spec = &binding.spec;

    if let Some(stale) = binding.robot_id() {
        // The credential of a previous robot cannot be read back.
        if let Err(e) = harbor.delete_robot(stale).await {
            warn!("Deleting stale robot {} failed: {}", stale, e);
        }
    }
    let robot_name = normalize(&format!("{namespace}-{}", spec.service_account));
    let robot = harbor
        .create_robot(&RobotCreate::pull_only(&robot_name, &spec.project_name))
        .await?;

    let secret_name = normalize(&format!("{}-pull-secret", binding.name_any()));
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: Some(namespace.clone()),
            owner_references: binding.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            DOCKER_CONFIG_JSON.to_string(),
            ByteString(docker_config_json(config.server_host(), &robot.name, &robot.secret)?),
        )])),
        ..Default::default()
    };
    let (outcome, _) = apply_object(secrets, secret, Policy::Converge).await?;
    if outcome == Outcome::Created {
        ctx.publish_event(
            binding,
            EventType::Normal,
            "PullSecretCreated",
            "Binding",
            format!("robot {} stored in {}", robot.name, secret_name),
        )
        .await;
    }

    let bindings: Api<ProjectBinding> = namespaced_api(&ctx.client, binding);
    bindings
        .patch(
            &binding.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({
                "metadata": {
                    "annotations": {
                        ROBOT_ID_ANNOTATION: robot.id.to_string(),
                        PULL_SECRET_ANNOTATION: secret_name,
                    }
                }
            })),
        )
        .await?;
    Ok(secret_name)
}

async fn cleanup(binding: Arc<ProjectBinding>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = binding.namespace().unwrap_or_default();
    let spec = &binding.spec;
    info!("Cleaning up {}", object_key(binding.as_ref()));

    if let Some(config) = server_configuration(&ctx, &spec.server_configuration).await? {
        match HarborClient::from_server_configuration(&ctx.client, &config).await {
            Ok(harbor) => delete_remote(&harbor, &binding).await,
            Err(e) => warn!("Skipping remote cleanup of {}: {}", spec.project_name, e),
        }
    }

    if let Some(secret) = binding.pull_secret() {
        let accounts: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), &namespace);
        if let Some(account) = accounts.get_opt(&spec.service_account).await? {
            if let Some(pull_secrets) = without_pull_secret(&account, secret) {
                set_pull_secrets(&accounts, &spec.service_account, pull_secrets).await?;
            }
        }
        let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
        ignore_not_found(secrets.delete(secret, &DeleteParams::default()).await)?;
    }
    Ok(Action::await_change())
}

/// Best-effort removal of the robot and the project; failures are only logged.
async fn delete_remote(harbor: &HarborClient, binding: &ProjectBinding) {
    let project_name = &binding.spec.project_name;
    if let Some(robot) = binding.robot_id() {
        if let Err(e) = harbor.delete_robot(robot).await {
            warn!("Deleting robot {} failed: {}", robot, e);
        }
    }
    let project = match harbor.get_project(project_name).await {
        Ok(Some(project)) => project,
        Ok(None) => return,
        Err(e) => {
            warn!("Resolving project {} failed: {}", project_name, e);
            return;
        }
    };
    match harbor.delete_project(project.project_id).await {
        Ok(_) => info!("Deleted project {}", project_name),
        Err(e) => warn!("Deleting project {} failed: {}", project_name, e),
    }
}

pub async fn reconcile(binding: Arc<ProjectBinding>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();

    if !matches_class(binding.as_ref(), &ctx.config.class_name) {
        return Ok(Action::await_change());
    }
    let api: Api<ProjectBinding> = namespaced_api(&ctx.client, binding.as_ref());
    info!("Reconciling {}", object_key(binding.as_ref()));
    finalizer(&api, PROJECT_BINDING_FINALIZER, binding, |event| async {
        match event {
            Finalizer::Apply(binding) => apply(binding, ctx.clone()).await,
            Finalizer::Cleanup(binding) => cleanup(binding, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::StdError(StdError::FinalizerError(Box::new(e))))
}

fn error_policy(binding: Arc<ProjectBinding>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(CONTROLLER, binding.as_ref(), error);
    let delay = error
        .requeue_after()
        .unwrap_or_else(|| ctx.backoff.next_delay(&object_key(binding.as_ref())));
    Action::requeue(delay)
}

/// Initialize the project binding controller (given the crds are installed)
pub async fn run(client: Client, ctx: Arc<Context>) {
    ensure_crd::<ProjectBinding>(&client).await;

    let (reader, stream) = class_filtered(Api::<ProjectBinding>::all(client.clone()), ctx.config.class_name.clone());
    Controller::for_stream(stream, reader)
        .with_config(controller::Config::default().concurrency(ctx.config.concurrency))
        .owns(Api::<Secret>::all(client.clone()), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            if let Err(e) = res {
                debug!("project binding controller: {}", e);
            }
            ready(())
        })
        .await;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::extract::Path;
    use axum::http::{header::LOCATION, HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};
    use serde_json::Value;

    use crate::apply::tests::FakeApiServer;
    use crate::controllers::State;
    use crate::harbor_client::client::tests::serve;
    use crate::harbor_client::client::{ACCESS_KEY, ACCESS_SECRET};
    use crate::util::config::OperatorConfig;

    /// Remote calls seen by the fake Harbor, as `METHOD path`.
    pub type Calls = Arc<Mutex<Vec<String>>>;

    pub fn context(server: &FakeApiServer) -> Arc<Context> {
        State::new(OperatorConfig::default()).unwrap().to_context(server.client())
    }

    pub fn path_of<K: Resource<DynamicType = ()>>(namespace: Option<&str>, name: &str) -> String {
        format!("{}/{name}", K::url_path(&(), namespace))
    }

    /// Installs a ready ServerConfiguration `prod` pointing at `server_url`, with its credential.
    pub fn install_server_configuration(server: &FakeApiServer, server_url: &str) -> ServerConfiguration {
        let mut config = ServerConfiguration::new(
            "prod",
            ServerConfigurationSpec {
                server_url: server_url.to_string(),
                access_credential: AccessCredential {
                    namespace: "harbor-system".to_string(),
                    access_secret_ref: "prod-credential".to_string(),
                },
                default: true,
                ..Default::default()
            },
        );
        config.status = Some(ComponentStatus {
            status: StatusPhase::Ready,
            ..Default::default()
        });
        server.insert(
            &path_of::<ServerConfiguration>(None, "prod"),
            serde_json::to_value(&config).unwrap(),
        );
        server.insert(
            &path_of::<Secret>(Some("harbor-system"), "prod-credential"),
            json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": "prod-credential", "namespace": "harbor-system"},
                "data": {
                    ACCESS_KEY: STANDARD.encode("admin"),
                    ACCESS_SECRET: STANDARD.encode("Harbor12345"),
                }
            }),
        );
        config
    }

    pub fn install_service_account(server: &FakeApiServer, namespace: &str, pull_secrets: &[&str]) {
        let secrets: Vec<Value> = pull_secrets.iter().map(|name| json!({ "name": name })).collect();
        server.insert(
            &path_of::<ServiceAccount>(Some(namespace), "default"),
            json!({
                "apiVersion": "v1",
                "kind": "ServiceAccount",
                "metadata": {"name": "default", "namespace": namespace},
                "imagePullSecrets": secrets,
            }),
        );
    }

    /// Harbor with project `team-a` (ID 7) whose project deletion answers `delete_status`.
    async fn harbor(calls: Calls, delete_status: StatusCode) -> String {
        let project_calls = calls.clone();
        let robot_calls = calls.clone();
        let router = Router::new()
            .route(
                "/api/v2.0/projects/:name",
                get(|Path(name): Path<String>| async move {
                    if name != "team-a" {
                        return StatusCode::NOT_FOUND.into_response();
                    }
                    Json(json!({"project_id": 7, "name": name})).into_response()
                })
                .delete(move |Path(id): Path<String>| {
                    let calls = project_calls.clone();
                    async move {
                        calls.lock().unwrap().push(format!("DELETE /projects/{id}"));
                        delete_status
                    }
                }),
            )
            .route(
                "/api/v2.0/robots",
                post(move |Json(body): Json<RobotCreate>| {
                    let calls = calls.clone();
                    async move {
                        calls.lock().unwrap().push(format!("POST /robots {}", body.name));
                        let mut headers = HeaderMap::new();
                        headers.insert(LOCATION, "/api/v2.0/robots/17".parse().unwrap());
                        (
                            StatusCode::CREATED,
                            headers,
                            Json(json!({"name": "robot$team-a-default", "secret": "s3cr3t"})),
                        )
                    }
                }),
            )
            .route(
                "/api/v2.0/robots/:id",
                delete(move |Path(id): Path<String>| {
                    let calls = robot_calls.clone();
                    async move {
                        calls.lock().unwrap().push(format!("DELETE /robots/{id}"));
                        StatusCode::OK
                    }
                }),
            );
        serve(router).await
    }

    fn binding() -> ProjectBinding {
        let mut binding = ProjectBinding::new(
            "prod-default",
            ProjectBindingSpec {
                server_configuration: "prod".to_string(),
                service_account: "default".to_string(),
                project_name: "team-a".to_string(),
            },
        );
        binding.metadata.namespace = Some("team-a".to_string());
        binding.metadata.uid = Some("binding-uid".to_string());
        binding
    }

    fn pull_secret_names(server: &FakeApiServer) -> Vec<String> {
        let account: ServiceAccount =
            serde_json::from_value(server.get(&path_of::<ServiceAccount>(Some("team-a"), "default")).unwrap())
                .unwrap();
        account
            .image_pull_secrets
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.name)
            .collect()
    }

    async fn bound(server: &FakeApiServer, calls: Calls, delete_status: StatusCode) -> (Arc<Context>, ProjectBinding) {
        let url = harbor(calls, delete_status).await;
        install_server_configuration(server, &url);
        install_service_account(server, "team-a", &["other"]);
        let binding_path = path_of::<ProjectBinding>(Some("team-a"), "prod-default");
        server.insert(&binding_path, serde_json::to_value(binding()).unwrap());

        let ctx = context(server);
        apply(Arc::new(binding()), ctx.clone()).await.unwrap();
        let live = serde_json::from_value(server.get(&binding_path).unwrap()).unwrap();
        (ctx, live)
    }

    #[tokio::test]
    async fn binding_then_unbinding_leaves_no_credential_behind() {
        let server = FakeApiServer::default();
        let calls = Calls::default();
        let (ctx, live) = bound(&server, calls.clone(), StatusCode::OK).await;

        let secret_path = path_of::<Secret>(Some("team-a"), "prod-default-pull-secret");
        let secret: Secret = serde_json::from_value(server.get(&secret_path).unwrap()).unwrap();
        assert_eq!(secret.type_.as_deref(), Some(DOCKER_CONFIG_JSON_TYPE));
        assert_eq!(pull_secret_names(&server), vec!["other", "prod-default-pull-secret"]);
        assert_eq!(live.robot_id(), Some(17));
        assert_eq!(live.pull_secret(), Some("prod-default-pull-secret"));
        assert_eq!(live.status.as_ref().unwrap().status, StatusPhase::Ready);

        cleanup(Arc::new(live), ctx).await.unwrap();
        assert!(server.get(&secret_path).is_none());
        assert_eq!(pull_secret_names(&server), vec!["other"]);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "POST /robots team-a-default".to_string(),
                "DELETE /robots/17".to_string(),
                "DELETE /projects/7".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn cleanup_completes_when_project_deletion_fails() {
        let server = FakeApiServer::default();
        let calls = Calls::default();
        let (ctx, live) = bound(&server, calls.clone(), StatusCode::INTERNAL_SERVER_ERROR).await;

        let action = cleanup(Arc::new(live), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(calls.lock().unwrap().contains(&"DELETE /projects/7".to_string()));
        assert!(server
            .get(&path_of::<Secret>(Some("team-a"), "prod-default-pull-secret"))
            .is_none());
        assert_eq!(pull_secret_names(&server), vec!["other"]);
    }

    #[tokio::test]
    async fn missing_service_account_is_reported_not_ready() {
        let server = FakeApiServer::default();
        let url = harbor(Calls::default(), StatusCode::OK).await;
        install_server_configuration(&server, &url);
        let binding_path = path_of::<ProjectBinding>(Some("team-a"), "prod-default");
        server.insert(&binding_path, serde_json::to_value(binding()).unwrap());

        let action = apply(Arc::new(binding()), context(&server)).await.unwrap();
        assert_eq!(action, Action::requeue(NOT_READY_REQUEUE));
        let live: ProjectBinding = serde_json::from_value(server.get(&binding_path).unwrap()).unwrap();
        let status = live.status.unwrap();
        assert_eq!(status.status, StatusPhase::Fail);
        assert_eq!(status.reason, "ServiceAccountNotFound");
    }

    fn account(secrets: &[&str]) -> ServiceAccount {
        ServiceAccount {
            image_pull_secrets: Some(
                secrets
                    .iter()
                    .map(|name| LocalObjectReference {
                        name: name.to_string(),
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn docker_config_carries_basic_auth() {
        let payload = docker_config_json("harbor.example.com", "robot$ns-default", "s3cret").unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        let entry = &value["auths"]["harbor.example.com"];
        assert_eq!(entry["username"], "robot$ns-default");
        assert_eq!(entry["password"], "s3cret");
        let auth = STANDARD.decode(entry["auth"].as_str().unwrap()).unwrap();
        assert_eq!(auth, b"robot$ns-default:s3cret");
    }

    #[test]
    fn pull_secret_is_attached_once() {
        let sa = account(&["other"]);
        let attached = with_pull_secret(&sa, "binding-pull-secret").unwrap();
        assert_eq!(attached.len(), 2);
        assert_eq!(attached[1].name, "binding-pull-secret");

        let sa = account(&["other", "binding-pull-secret"]);
        assert!(with_pull_secret(&sa, "binding-pull-secret").is_none());
    }

    #[test]
    fn detaching_keeps_other_secrets() {
        let sa = account(&["other", "binding-pull-secret"]);
        let kept = without_pull_secret(&sa, "binding-pull-secret").unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "other");

        assert!(without_pull_secret(&account(&["other"]), "binding-pull-secret").is_none());
        assert!(without_pull_secret(&ServiceAccount::default(), "binding-pull-secret").is_none());
    }
}
