use actix_web::{get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder};
use kube::Client;
use prometheus::{Encoder, TextEncoder};

use harbor_cluster::api::v1alpha1::{
    ChartMuseum, Core, JobService, NotaryServer, NotarySigner, Portal, Registry, RegistryController, Scanner,
};
use harbor_cluster::controllers::{
    component_controller, namespace_controller, platform_configuration_controller, platform_controller,
    platform_project_controller, project_binding_controller, server_configuration_controller, State,
};
use harbor_cluster::util::{config::OperatorConfig, telemetry};

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await;

    let config = OperatorConfig::from_env()?;
    tracing::info!(class = %config.class_name, concurrency = config.concurrency, "starting harbor operator");
    let metrics_addr = config.metrics_addr.clone();

    // Initialize Kubernetes controller state
    let state = State::new(config)?;
    let client = Client::try_default().await?;
    let ctx = state.to_context(client.clone());

    let components = async {
        tokio::join!(
            component_controller::run::<Core>(client.clone(), ctx.clone()),
            component_controller::run::<Registry>(client.clone(), ctx.clone()),
            component_controller::run::<RegistryController>(client.clone(), ctx.clone()),
            component_controller::run::<JobService>(client.clone(), ctx.clone()),
            component_controller::run::<Portal>(client.clone(), ctx.clone()),
            component_controller::run::<ChartMuseum>(client.clone(), ctx.clone()),
            component_controller::run::<Scanner>(client.clone(), ctx.clone()),
            component_controller::run::<NotaryServer>(client.clone(), ctx.clone()),
            component_controller::run::<NotarySigner>(client.clone(), ctx.clone()),
        );
    };
    let remote = async {
        tokio::join!(
            server_configuration_controller::run(client.clone(), ctx.clone()),
            namespace_controller::run(client.clone(), ctx.clone()),
            project_binding_controller::run(client.clone(), ctx.clone()),
            platform_project_controller::run(client.clone(), ctx.clone()),
            platform_configuration_controller::run(client.clone(), ctx.clone()),
        );
    };
    let platform = platform_controller::run(client.clone(), ctx.clone());

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(metrics_addr)?
    .shutdown_timeout(5);

    // Controllers and the server all shut down gracefully, so poll until every one is done
    tokio::join!(platform, components, remote, server.run()).3?;
    Ok(())
}
