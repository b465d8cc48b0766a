use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use futures::{future::ready, StreamExt};
use kube::{
    api::DynamicObject,
    core::admission::AdmissionReview,
    runtime::{reflector, watcher, WatchStreamExt},
    Api, Client,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use harbor_cluster::api::v1alpha1::ServerConfiguration;
use harbor_cluster::util::telemetry;

mod cert_reloader;
mod error;
mod image;
mod mutator;
mod rules;
mod validator;

use cert_reloader::CertPaths;
use error::WebhookError;
use mutator::ImageRewriter;

type Review = AdmissionReview<DynamicObject>;

struct Settings {
    cert_dir: String,
    addr: SocketAddr,
    health_addr: SocketAddr,
}

impl Settings {
    fn from_env() -> anyhow::Result<Self> {
        let var = |name: &str, default: &str| std::env::var(name).unwrap_or_else(|_| default.to_string());
        Ok(Self {
            cert_dir: var("WEBHOOK_CERT_DIR", "/etc/certs"),
            addr: var("WEBHOOK_ADDR", "0.0.0.0:8443")
                .parse()
                .context("WEBHOOK_ADDR")?,
            health_addr: var("WEBHOOK_HEALTH_ADDR", "0.0.0.0:8080")
                .parse()
                .context("WEBHOOK_HEALTH_ADDR")?,
        })
    }
}

struct AppState {
    rewriter: ImageRewriter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider()).ok();
    telemetry::init().await;

    let settings = Settings::from_env()?;
    let client = Client::try_default().await?;

    // Rule lookups read server configurations from this cache
    let (configs, writer) = reflector::store();
    let api: Api<ServerConfiguration> = Api::all(client.clone());
    tokio::spawn(
        reflector(writer, watcher(api, watcher::Config::default()))
            .default_backoff()
            .applied_objects()
            .for_each(|res| {
                if let Err(e) = res {
                    warn!("ServerConfiguration watch failed: {}", e);
                }
                ready(())
            }),
    );

    let state = Arc::new(AppState {
        rewriter: ImageRewriter::new(client, configs),
    });
    let app = Router::new()
        .route("/mutate-image-path", post(mutate_image_path))
        .route("/mutate-platform", post(mutate_platform))
        .route("/mutate-component", post(mutate_component))
        .route("/validate-platform", post(validate_platform))
        .route("/validate-serverconfiguration", post(validate_server_configuration))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let health = tokio::net::TcpListener::bind(settings.health_addr).await?;
    info!("Health server listening on {}", settings.health_addr);
    tokio::spawn(async move {
        let app = Router::new().route("/health", get(|| async { "healthy" }));
        if let Err(e) = axum::serve(health, app).await {
            warn!("Health server stopped: {}", e);
        }
    });

    let paths = CertPaths::new(&settings.cert_dir);
    let tls = paths.load().await.context("loading serving certificate")?;
    tokio::spawn({
        let tls = tls.clone();
        async move {
            if let Err(e) = cert_reloader::reload_on_change(paths, tls).await {
                warn!("Certificate reloading disabled: {}", e);
            }
        }
    });

    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle.graceful_shutdown(Some(Duration::from_secs(5)));
            }
        }
    });

    info!("Admission webhook listening on {}", settings.addr);
    axum_server::bind_rustls(settings.addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

async fn mutate_image_path(
    State(state): State<Arc<AppState>>,
    Json(review): Json<Review>,
) -> Result<Json<Review>, WebhookError> {
    state.rewriter.mutate(review).await.map(Json)
}

async fn mutate_platform(Json(review): Json<Review>) -> Result<Json<Review>, WebhookError> {
    validator::mutate_platform(review).map(Json)
}

async fn mutate_component(Json(review): Json<Review>) -> Result<Json<Review>, WebhookError> {
    validator::mutate_component(review).map(Json)
}

async fn validate_platform(Json(review): Json<Review>) -> Result<Json<Review>, WebhookError> {
    validator::validate_platform(review).map(Json)
}

async fn validate_server_configuration(Json(review): Json<Review>) -> Result<Json<Review>, WebhookError> {
    validator::validate_server_configuration(review).map(Json)
}
