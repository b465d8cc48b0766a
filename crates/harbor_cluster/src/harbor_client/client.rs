use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use reqwest::{header, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, info};

use super::types::*;
use crate::api::v1alpha1::ServerConfiguration;
use crate::util::errors::{Error, Result, StdError};
use crate::util::retry::{retry_with_backoff, RetryConfig};

pub const ACCESS_KEY: &str = "accessKey";
pub const ACCESS_SECRET: &str = "accessSecret";

const API_BASE: &str = "/api/v2.0";
const MEMBERS_PAGE_SIZE: usize = 25;
const TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the v2.0 API of a remote Harbor.
#[derive(Clone)]
pub struct HarborClient {
    base_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
    retry: RetryConfig,
}

fn http_error(e: reqwest::Error) -> Error {
    Error::StdError(StdError::HttpError(format!("Harbor request failed: {e}")))
}

/// Numeric ID at the end of a `Location` header such as `/api/v2.0/projects/42`.
fn location_id(response: &Response) -> Result<i64> {
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| StdError::MetadataMissing("Location header".to_string()))?;
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| StdError::DecodingError(format!("no ID in Location '{location}'")).into())
}

/// Turns a non-2xx response into a `RemoteError` carrying the body.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    error!("Harbor returned {}: {}", status, body);
    Err(StdError::RemoteError {
        status: status.as_u16(),
        body,
    }
    .into())
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| StdError::DecodingError(format!("Harbor response: {e}")).into())
}

impl HarborClient {
    pub fn new(server_url: &str, username: &str, password: &str, insecure: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(TIMEOUT)
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(http_error)?;
        Ok(Self {
            base_url: server_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            client,
            retry: RetryConfig::default(),
        })
    }

    /// Builds a client from the credential Secret a ServerConfiguration points to.
    pub async fn from_server_configuration(
        kube: &kube::Client,
        config: &ServerConfiguration,
    ) -> Result<Self> {
        let credential = &config.spec.access_credential;
        let secrets: Api<Secret> = Api::namespaced(kube.clone(), &credential.namespace);
        let secret = secrets.get_opt(&credential.access_secret_ref).await?.ok_or_else(|| {
            StdError::NotFound(format!(
                "credential secret {}/{}",
                credential.namespace, credential.access_secret_ref
            ))
        })?;
        let read = |key: &str| -> Result<String> {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|value| String::from_utf8_lossy(&value.0).into_owned())
                .ok_or_else(|| {
                    StdError::MetadataMissing(format!(
                        "key {key} in secret {}/{}",
                        credential.namespace, credential.access_secret_ref
                    ))
                    .into()
                })
        };
        Self::new(
            &config.spec.server_url,
            &read(ACCESS_KEY)?,
            &read(ACCESS_SECRET)?,
            config.spec.insecure,
        )
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{API_BASE}{path}", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        request.send().await.map_err(http_error)
    }

    /// GET with retries on transient failures; 404 is `None`.
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        retry_with_backoff(&self.retry, path, Error::is_transient, || async {
            let response = self.send(self.request(Method::GET, path)).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            decode(check(response).await?).await.map(Some)
        })
        .await
    }

    async fn write<B: Serialize + ?Sized>(&self, method: Method, path: &str, body: &B) -> Result<Response> {
        check(self.send(self.request(method, path).json(body)).await?).await
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let response = self.send(self.request(Method::DELETE, path)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response).await?;
        Ok(true)
    }

    pub async fn check_health(&self) -> Result<OverallHealthStatus> {
        self.get_optional("/health")
            .await?
            .ok_or_else(|| StdError::NotFound(format!("{}{API_BASE}/health", self.base_url)).into())
    }

    pub async fn get_project(&self, name: &str) -> Result<Option<Project>> {
        self.get_optional(&format!("/projects/{name}")).await
    }

    pub async fn head_project(&self, name: &str) -> Result<bool> {
        let path = format!("/projects?project_name={name}");
        retry_with_backoff(&self.retry, &path, Error::is_transient, || async {
            let response = self.send(self.request(Method::HEAD, &path)).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(false);
            }
            check(response).await.map(|_| true)
        })
        .await
    }

    /// Creates the project and returns its ID; an existing project with the
    /// same name is returned instead.
    pub async fn create_project(&self, request: &ProjectReq) -> Result<i64> {
        let response = self
            .send(self.request(Method::POST, "/projects").json(request))
            .await?;
        if response.status() == StatusCode::CONFLICT {
            info!("Project '{}' already exists", request.project_name);
            return self
                .get_project(&request.project_name)
                .await?
                .map(|p| p.project_id)
                .ok_or_else(|| StdError::NotFound(format!("project {}", request.project_name)).into());
        }
        let response = check(response).await?;
        let id = location_id(&response)?;
        info!("Created project '{}' with ID {}", request.project_name, id);
        Ok(id)
    }

    pub async fn update_project(&self, project_id: i64, request: &ProjectReq) -> Result<()> {
        self.write(Method::PUT, &format!("/projects/{project_id}"), request)
            .await?;
        Ok(())
    }

    /// Returns false when the project was already gone.
    pub async fn delete_project(&self, project_id: i64) -> Result<bool> {
        self.delete(&format!("/projects/{project_id}")).await
    }

    pub async fn create_robot(&self, request: &RobotCreate) -> Result<RobotCreated> {
        let response = self.write(Method::POST, "/robots", request).await?;
        let id = location_id(&response).ok();
        let mut created: RobotCreated = decode(response).await?;
        if let Some(id) = id {
            created.id = id;
        }
        debug!("Created robot '{}' with ID {}", created.name, created.id);
        Ok(created)
    }

    pub async fn get_robot(&self, robot_id: i64) -> Result<Option<Robot>> {
        self.get_optional(&format!("/robots/{robot_id}")).await
    }

    pub async fn delete_robot(&self, robot_id: i64) -> Result<bool> {
        self.delete(&format!("/robots/{robot_id}")).await
    }

    /// Every member of the project, following pagination until the total
    /// announced in `X-Total-Count` is reached.
    pub async fn list_project_members(&self, project_id: i64) -> Result<Vec<ProjectMember>> {
        let mut members = Vec::new();
        let mut page = 1;
        loop {
            let path = format!("/projects/{project_id}/members?page={page}&page_size={MEMBERS_PAGE_SIZE}");
            let (batch, total) = retry_with_backoff(&self.retry, &path, Error::is_transient, || async {
                let response = check(self.send(self.request(Method::GET, &path)).await?).await?;
                let total = response
                    .headers()
                    .get("X-Total-Count")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<usize>().ok());
                let batch: Vec<ProjectMember> = decode(response).await?;
                Ok((batch, total))
            })
            .await?;

            let fetched = batch.len();
            members.extend(batch);
            match total {
                Some(total) if members.len() < total && fetched > 0 => page += 1,
                None if fetched == MEMBERS_PAGE_SIZE => page += 1,
                _ => return Ok(members),
            }
        }
    }

    pub async fn create_project_member(&self, project_id: i64, request: &ProjectMemberReq) -> Result<i64> {
        let response = self
            .write(Method::POST, &format!("/projects/{project_id}/members"), request)
            .await?;
        location_id(&response)
    }

    pub async fn update_project_member(&self, project_id: i64, member_id: i64, role_id: i64) -> Result<()> {
        self.write(
            Method::PUT,
            &format!("/projects/{project_id}/members/{member_id}"),
            &RoleRequest { role_id },
        )
        .await?;
        Ok(())
    }

    pub async fn delete_project_member(&self, project_id: i64, member_id: i64) -> Result<bool> {
        self.delete(&format!("/projects/{project_id}/members/{member_id}"))
            .await
    }

    pub async fn get_quota_by_project_id(&self, project_id: i64) -> Result<Option<Quota>> {
        let quotas: Option<Vec<Quota>> = self
            .get_optional(&format!("/quotas?reference=project&reference_id={project_id}"))
            .await?;
        Ok(quotas.and_then(|q| q.into_iter().next()))
    }

    pub async fn update_project_quota(&self, quota_id: i64, storage_limit: i64) -> Result<()> {
        self.write(
            Method::PUT,
            &format!("/quotas/{quota_id}"),
            &QuotaUpdateReq::storage(storage_limit),
        )
        .await?;
        Ok(())
    }

    /// Pushes system settings. Only a 200 counts as applied; anything else
    /// fails with the response body.
    pub async fn apply_configuration(&self, settings: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        let response = self
            .send(self.request(Method::PUT, "/configurations").json(settings))
            .await?;
        let status = response.status();
        if status == StatusCode::OK {
            return Ok(());
        }
        Err(StdError::RemoteError {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        }
        .into())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use serde_json::json;

    /// Serves `router` on an ephemeral port and returns its base URL.
    pub async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    pub fn client(base_url: &str) -> HarborClient {
        HarborClient::new(base_url, "admin", "Harbor12345", false)
            .unwrap()
            .with_retry(RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            })
    }

    fn member(id: i64) -> ProjectMember {
        ProjectMember {
            id,
            project_id: 7,
            entity_name: format!("user{id:02}"),
            entity_type: "u".to_string(),
            role_id: 2,
            role_name: "developer".to_string(),
        }
    }

    #[tokio::test]
    async fn health_is_decoded() {
        let router = Router::new().route(
            "/api/v2.0/health",
            get(|| async {
                Json(json!({
                    "status": "unhealthy",
                    "components": [
                        {"name": "core", "status": "healthy"},
                        {"name": "registry", "status": "unhealthy", "error": "timeout"}
                    ]
                }))
            }),
        );
        let health = client(&serve(router).await).check_health().await.unwrap();
        assert!(!health.is_healthy());
        assert_eq!(health.components[1].error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn missing_project_is_none_and_server_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/api/v2.0/projects/:name",
            get(move |Path(name): Path<String>| {
                let counter = counter.clone();
                async move {
                    if name == "missing" {
                        return (AxumStatus::NOT_FOUND, Json(json!({"errors": []}))).into_response();
                    }
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        return (AxumStatus::SERVICE_UNAVAILABLE, "busy").into_response();
                    }
                    Json(json!({"project_id": 3, "name": name, "metadata": {"public": "true"}}))
                        .into_response()
                }
            }),
        );
        let client = client(&serve(router).await);

        assert_eq!(client.get_project("missing").await.unwrap(), None);
        let project = client.get_project("library").await.unwrap().unwrap();
        assert_eq!(project.project_id, 3);
        assert!(project.is_public());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn create_project_reads_location_and_resolves_conflicts() {
        let router = Router::new()
            .route(
                "/api/v2.0/projects",
                post(|Json(body): Json<ProjectReq>| async move {
                    if body.project_name == "taken" {
                        return AxumStatus::CONFLICT.into_response();
                    }
                    let mut headers = HeaderMap::new();
                    headers.insert(header::LOCATION, "/api/v2.0/projects/42".parse().unwrap());
                    (AxumStatus::CREATED, headers).into_response()
                }),
            )
            .route(
                "/api/v2.0/projects/:name",
                get(|Path(name): Path<String>| async move {
                    Json(json!({"project_id": 9, "name": name}))
                }),
            );
        let client = client(&serve(router).await);

        assert_eq!(client.create_project(&ProjectReq::new("fresh", false)).await.unwrap(), 42);
        assert_eq!(client.create_project(&ProjectReq::new("taken", false)).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn members_are_paginated_until_total_count() {
        let pages = Arc::new(AtomicUsize::new(0));
        let counter = pages.clone();
        let router = Router::new().route(
            "/api/v2.0/projects/7/members",
            get(move |Query(query): Query<HashMap<String, String>>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let page: i64 = query["page"].parse().unwrap();
                    let size: i64 = query["page_size"].parse().unwrap();
                    let start = (page - 1) * size;
                    let batch: Vec<ProjectMember> = (start..(start + size).min(30)).map(member).collect();
                    let mut headers = HeaderMap::new();
                    headers.insert("X-Total-Count", "30".parse().unwrap());
                    (headers, Json(batch))
                }
            }),
        );
        let members = client(&serve(router).await)
            .list_project_members(7)
            .await
            .unwrap();
        assert_eq!(members.len(), 30);
        assert_eq!(members[29].entity_name, "user29");
        assert_eq!(pages.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn robot_id_comes_from_location() {
        let router = Router::new().route(
            "/api/v2.0/robots",
            post(|Json(body): Json<RobotCreate>| async move {
                assert_eq!(body.permissions[0].namespace, "team-a");
                let mut headers = HeaderMap::new();
                headers.insert(header::LOCATION, "/api/v2.0/robots/17".parse().unwrap());
                (
                    AxumStatus::CREATED,
                    headers,
                    Json(json!({"name": "robot$team-a+pull", "secret": "s3cr3t"})),
                )
            }),
        );
        let robot = client(&serve(router).await)
            .create_robot(&RobotCreate::pull_only("pull", "team-a"))
            .await
            .unwrap();
        assert_eq!(robot.id, 17);
        assert_eq!(robot.secret, "s3cr3t");
    }

    #[tokio::test]
    async fn configuration_errors_carry_the_body() {
        let router = Router::new().route(
            "/api/v2.0/configurations",
            put(|Json(body): Json<serde_json::Value>| async move {
                if body.get("auth_mode").is_some() {
                    (AxumStatus::BAD_REQUEST, "auth mode cannot be changed").into_response()
                } else {
                    AxumStatus::OK.into_response()
                }
            }),
        );
        let client = client(&serve(router).await);

        let mut settings = serde_json::Map::new();
        settings.insert("read_only".to_string(), json!(true));
        client.apply_configuration(&settings).await.unwrap();

        settings.insert("auth_mode".to_string(), json!("oidc_auth"));
        match client.apply_configuration(&settings).await.unwrap_err().inner() {
            StdError::RemoteError { status, body } => {
                assert_eq!(*status, 400);
                assert_eq!(body, "auth mode cannot be changed");
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
