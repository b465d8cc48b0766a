use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, Volume};

use super::*;
use crate::api::v1alpha1::{NotaryServer, NotarySigner};
use crate::images;

pub const SERVER_PORT: i32 = 4443;
pub const SIGNER_PORT: i32 = 7899;
pub const SIGNER_HTTP_PORT: i32 = 4444;

const KEY_ALGORITHM: &str = "ecdsa";
const DEFAULT_ALIAS: &str = "defaultalias";

const CERTIFICATE_VOLUME: &str = "certificates";
const TOKEN_VOLUME: &str = "token-certificate";
const MIGRATIONS_VOLUME: &str = "migrations";
const MIGRATIONS_DIR: &str = "/migrations";

const DATABASE_URL: &str =
    "postgres://$(DB_USERNAME):$(DB_PASSWORD)@$(DB_HOST):$(DB_PORT)/$(DB_DATABASE)?sslmode=$(DB_SSL)";

/// Init containers bringing the notary schema up to date.
///
/// The schema files ship in the notary image and are copied to a shared
/// volume for the migrate tool.
fn migration_containers(
    images: &ImageStore,
    notary_image: &str,
    flavor: &str,
    database_secret: &str,
    version: &str,
) -> Result<Vec<Container>> {
    let migrations = mount(MIGRATIONS_VOLUME, "/shared", None);
    let copy = Container {
        command: Some(vec!["sh".to_string(), "-c".to_string()]),
        args: Some(vec![format!("cp -r {MIGRATIONS_DIR}/. /shared/")]),
        volume_mounts: Some(vec![migrations]),
        ..base_container("copy-migrations", notary_image, None)
    };

    let migrate_image = images.get_image(images::NOTARY_MIGRATE, version)?;
    let migrate = Container {
        env: Some(database_env("DB_", database_secret)),
        args: Some(vec![
            format!("-path={MIGRATIONS_DIR}/{flavor}/postgresql"),
            format!("-database={DATABASE_URL}"),
            "up".to_string(),
        ]),
        volume_mounts: Some(vec![read_only_mount(MIGRATIONS_VOLUME, MIGRATIONS_DIR, None)]),
        ..base_container("init-db", &migrate_image, None)
    };

    Ok(vec![copy, migrate])
}

fn notary_volumes(config_map: &str, certificate_secret: &str) -> Vec<Volume> {
    vec![
        config_map_volume(TEMPLATE_VOLUME, config_map),
        empty_dir_volume(CONFIG_VOLUME),
        empty_dir_volume(MIGRATIONS_VOLUME),
        secret_volume(CERTIFICATE_VOLUME, certificate_secret, &[]),
    ]
}

/// Splits `https://host:port` into host and port, defaulting to the signer port.
fn signer_address(url: &str) -> (String, String) {
    let authority = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url)
        .trim_end_matches('/');
    match authority.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.to_string()),
        None => (authority.to_string(), SIGNER_PORT.to_string()),
    }
}

impl Component for NotaryServer {
    const COMPONENT: &'static str = "notary-server";

    fn component_status(&self) -> Option<&ComponentStatus> {
        self.status.as_ref()
    }

    fn render(&self, ctx: &RenderContext) -> Result<Vec<DesiredObject>> {
        let spec = &self.spec;
        let name = self.normalize_name(Self::COMPONENT);
        let labels = self.selector_labels();
        let image = ctx
            .images
            .resolve(spec.component.image.as_deref(), images::NOTARY_SERVER, &spec.version)?;

        let mut init = migration_containers(
            ctx.images,
            &image,
            "server",
            &spec.database_secret,
            &spec.version,
        )?;
        init.push(config_init_container(
            ctx.images,
            &[(&templates::NOTARY_SERVER, templates::NOTARY_SERVER.content)],
            self.config_env(),
            &[],
            vec![],
        )?);

        let server = Container {
            ports: Some(vec![container_port("https", SERVER_PORT)]),
            liveness_probe: Some(http_probe("/_notary_server/health", SERVER_PORT, Some(10))),
            readiness_probe: Some(http_probe("/_notary_server/health", SERVER_PORT, None)),
            volume_mounts: Some(vec![
                read_only_mount(
                    CONFIG_VOLUME,
                    &format!("/etc/notary/{}", templates::NOTARY_SERVER.file),
                    Some(templates::NOTARY_SERVER.file),
                ),
                read_only_mount(CERTIFICATE_VOLUME, "/etc/notary/certificates", None),
                read_only_mount(TOKEN_VOLUME, "/etc/notary/token", None),
            ]),
            ..base_container("notary-server", &image, Some(&spec.component))
        };

        let mut volumes = notary_volumes(&name, &spec.certificate_secret);
        volumes.push(secret_volume(TOKEN_VOLUME, &spec.token_secret, &[]));

        Ok(vec![
            DesiredObject::new(config_map(
                self.owned_meta(Self::COMPONENT),
                BTreeMap::from([(
                    templates::NOTARY_SERVER.file.to_string(),
                    templates::NOTARY_SERVER.content.to_string(),
                )]),
            )),
            DesiredObject::new(service(
                self.owned_meta(Self::COMPONENT),
                labels.clone(),
                &[("https", SERVER_PORT, SERVER_PORT)],
            )),
            DesiredObject::new(deployment(
                self.owned_meta(Self::COMPONENT),
                labels,
                spec.component.replicas,
                pod_spec(&spec.component, vec![server], init, volumes),
            )),
        ])
    }
}

impl NotaryServer {
    fn config_env(&self) -> Vec<EnvVar> {
        let spec = &self.spec;
        let (signer_host, signer_port) = signer_address(&spec.signer_url);
        let mut vars = vec![
            env("PORT", SERVER_PORT),
            env("SIGNER_HOST", signer_host),
            env("SIGNER_PORT", signer_port),
            env("KEY_ALGORITHM", KEY_ALGORITHM),
            env("LOG_LEVEL", spec.log_level),
            env("TOKEN_SERVICE_URL", &spec.token_service_url),
        ];
        vars.extend(database_env("DB_", &spec.database_secret));
        vars
    }
}

impl Component for NotarySigner {
    const COMPONENT: &'static str = "notary-signer";

    fn component_status(&self) -> Option<&ComponentStatus> {
        self.status.as_ref()
    }

    fn render(&self, ctx: &RenderContext) -> Result<Vec<DesiredObject>> {
        let spec = &self.spec;
        let name = self.normalize_name(Self::COMPONENT);
        let labels = self.selector_labels();
        let image = ctx
            .images
            .resolve(spec.component.image.as_deref(), images::NOTARY_SIGNER, &spec.version)?;
        let config = templates::NOTARY_SIGNER.fill(&[("DEFAULT_ALIAS", DEFAULT_ALIAS.to_string())]);

        let mut config_env = vec![
            env("PORT", SIGNER_PORT),
            env("HTTP_PORT", SIGNER_HTTP_PORT),
            env("LOG_LEVEL", spec.log_level),
        ];
        config_env.extend(database_env("DB_", &spec.database_secret));

        let mut init = migration_containers(
            ctx.images,
            &image,
            "signer",
            &spec.database_secret,
            &spec.version,
        )?;
        init.push(config_init_container(
            ctx.images,
            &[(&templates::NOTARY_SIGNER, config.as_str())],
            config_env,
            &[],
            vec![],
        )?);

        let signer = Container {
            ports: Some(vec![
                container_port("grpc", SIGNER_PORT),
                container_port("http", SIGNER_HTTP_PORT),
            ]),
            env: Some(vec![secret_env(
                &format!("NOTARY_SIGNER_{}", DEFAULT_ALIAS.to_uppercase()),
                &spec.passphrase_secret,
                "passphrase",
            )]),
            liveness_probe: Some(http_probe("/health", SIGNER_HTTP_PORT, Some(10))),
            readiness_probe: Some(http_probe("/health", SIGNER_HTTP_PORT, None)),
            volume_mounts: Some(vec![
                read_only_mount(
                    CONFIG_VOLUME,
                    &format!("/etc/notary/{}", templates::NOTARY_SIGNER.file),
                    Some(templates::NOTARY_SIGNER.file),
                ),
                read_only_mount(CERTIFICATE_VOLUME, "/etc/notary/certificates", None),
            ]),
            ..base_container("notary-signer", &image, Some(&spec.component))
        };

        Ok(vec![
            DesiredObject::new(config_map(
                self.owned_meta(Self::COMPONENT),
                BTreeMap::from([(templates::NOTARY_SIGNER.file.to_string(), config)]),
            )),
            DesiredObject::new(service(
                self.owned_meta(Self::COMPONENT),
                labels.clone(),
                &[("grpc", SIGNER_PORT, SIGNER_PORT)],
            )),
            DesiredObject::new(deployment(
                self.owned_meta(Self::COMPONENT),
                labels,
                spec.component.replicas,
                pod_spec(
                    &spec.component,
                    vec![signer],
                    init,
                    notary_volumes(&name, &spec.certificate_secret),
                ),
            )),
        ])
    }
}
