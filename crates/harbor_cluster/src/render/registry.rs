use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, Volume, VolumeMount};

use super::*;
use crate::api::cert_manager::CertificateSpec;
use crate::api::v1alpha1::Registry;
use crate::api::LogLevel;
use crate::images;

pub const HTTP_PORT: i32 = 5000;
pub const METRICS_PORT: i32 = 5001;
pub const CONTROLLER_PORT: i32 = 8080;

const STORAGE_VOLUME: &str = "storage";
const STORAGE_SECRET_VOLUME: &str = "storage-config";
const CACHE_SECRET_VOLUME: &str = "cache-config";
const ROOT_CERT_VOLUME: &str = "token-service-certificate";

const STORAGE_DIR: &str = "/storage";
const STORAGE_SECRET_DIR: &str = "/etc/registry/storage";
const CACHE_SECRET_DIR: &str = "/etc/registry/redis";

/// Registry configuration shared by the registry and its controller.
///
/// Both processes read the same `config.yml`; the storage section is appended
/// by the init container, either from a secret or as local filesystem storage.
/// With a cache secret the init container also appends the redis section,
/// split out of the secret's `url` key.
pub(crate) struct RegistryConfig<'a> {
    pub log_level: LogLevel,
    pub urls_config_map: &'a str,
    pub storage_secret: Option<&'a str>,
    pub cache_secret: Option<&'a str>,
    /// Secret verifying tokens; only the registry itself needs it.
    pub token_certificate_secret: Option<&'a str>,
    pub with_controller: bool,
}

impl RegistryConfig<'_> {
    fn files(&self) -> Vec<(Template, String)> {
        let mut files = vec![(templates::REGISTRY, templates::REGISTRY.content.to_string())];
        if self.with_controller {
            files.push((
                templates::REGISTRY_CONTROLLER,
                templates::REGISTRY_CONTROLLER.fill(&[("PORT", CONTROLLER_PORT.to_string())]),
            ));
        }
        files
    }

    pub fn config_map_data(&self) -> BTreeMap<String, String> {
        self.files()
            .into_iter()
            .map(|(template, content)| (template.file.to_string(), content))
            .collect()
    }

    pub fn init_container(&self, images: &ImageStore) -> Result<Container> {
        let files = self.files();
        let pairs: Vec<(&Template, &str)> = files.iter().map(|(t, c)| (t, c.as_str())).collect();

        let env = vec![
            env("PORT", HTTP_PORT),
            env("METRICS_PORT", METRICS_PORT),
            env("LOG_LEVEL", self.log_level),
            config_map_env("REGISTRY_AUTH_TOKEN_REALM", self.urls_config_map, "REGISTRY_AUTH_TOKEN_REALM"),
            config_map_env("CORE_URL", self.urls_config_map, "CORE_URL"),
        ];

        let target = format!("/config/{}", templates::REGISTRY.file);
        let (mut script, mut mounts) = match self.storage_secret {
            Some(_) => (
                vec![format!("cat {STORAGE_SECRET_DIR}/storage >> {target}")],
                vec![read_only_mount(STORAGE_SECRET_VOLUME, STORAGE_SECRET_DIR, None)],
            ),
            None => (
                vec![format!(
                    "printf 'storage:\\n  filesystem:\\n    rootdirectory: {STORAGE_DIR}\\n  delete:\\n    enabled: true\\n' >> {target}"
                )],
                vec![],
            ),
        };
        if self.cache_secret.is_some() {
            script.extend(split_redis_url(&format!("$(cat {CACHE_SECRET_DIR}/url)")));
            script.push(format!(
                r#"printf 'redis:\n  addr: %s\n  password: "%s"\n  db: %s\n' "$REDIS_ADDR" "$REDIS_PASSWORD" "${{REDIS_DB:-0}}" >> {target}"#
            ));
            mounts.push(read_only_mount(CACHE_SECRET_VOLUME, CACHE_SECRET_DIR, None));
        }

        config_init_container(images, &pairs, env, &script, mounts)
    }

    pub fn volumes(&self, config_map: &str) -> Vec<Volume> {
        let mut volumes = vec![
            config_map_volume(TEMPLATE_VOLUME, config_map),
            empty_dir_volume(CONFIG_VOLUME),
        ];
        if let Some(secret) = self.token_certificate_secret {
            volumes.push(secret_volume(ROOT_CERT_VOLUME, secret, &[("tls.crt", "root.crt")]));
        }
        match self.storage_secret {
            Some(secret) => volumes.push(secret_volume(STORAGE_SECRET_VOLUME, secret, &[])),
            None => volumes.push(empty_dir_volume(STORAGE_VOLUME)),
        }
        if let Some(secret) = self.cache_secret {
            volumes.push(secret_volume(CACHE_SECRET_VOLUME, secret, &[("url", "url")]));
        }
        volumes
    }

    /// Mounts giving a container the registry configuration and storage.
    pub fn registry_mounts(&self) -> Vec<VolumeMount> {
        let mut mounts = vec![read_only_mount(
            CONFIG_VOLUME,
            "/etc/registry/config.yml",
            Some(templates::REGISTRY.file),
        )];
        if self.token_certificate_secret.is_some() {
            mounts.push(read_only_mount(ROOT_CERT_VOLUME, "/etc/registry/root.crt", Some("root.crt")));
        }
        if self.storage_secret.is_none() {
            mounts.push(mount(STORAGE_VOLUME, STORAGE_DIR, None));
        }
        mounts
    }

    pub fn controller_container(
        &self,
        image: &str,
        spec: Option<&ComponentSpec>,
        core_secret: &str,
        jobservice_secret: &str,
    ) -> Container {
        let mut mounts = self.registry_mounts();
        mounts.push(read_only_mount(
            CONFIG_VOLUME,
            "/etc/registryctl/config.yml",
            Some(templates::REGISTRY_CONTROLLER.file),
        ));
        Container {
            ports: Some(vec![container_port("registryctl", CONTROLLER_PORT)]),
            env: Some(vec![
                secret_env("CORE_SECRET", core_secret, "secret"),
                secret_env("JOBSERVICE_SECRET", jobservice_secret, "secret"),
            ]),
            liveness_probe: Some(http_probe("/api/health", CONTROLLER_PORT, Some(10))),
            readiness_probe: Some(http_probe("/api/health", CONTROLLER_PORT, None)),
            volume_mounts: Some(mounts),
            ..base_container("registryctl", image, spec)
        }
    }
}

impl Component for Registry {
    const COMPONENT: &'static str = "registry";

    fn component_status(&self) -> Option<&ComponentStatus> {
        self.status.as_ref()
    }

    fn render(&self, ctx: &RenderContext) -> Result<Vec<DesiredObject>> {
        let config = self.config();
        let name = self.normalize_name(Self::COMPONENT);
        let labels = self.selector_labels();

        let mut objects = vec![DesiredObject::new(config_map(
            self.owned_meta(Self::COMPONENT),
            config.config_map_data(),
        ))];

        if let Some(issuer) = &self.spec.certificate_issuer_ref {
            objects.push(DesiredObject::new(Certificate {
                metadata: self.owned_meta("registry-token"),
                spec: CertificateSpec {
                    secret_name: self.spec.token_certificate_secret.clone(),
                    common_name: Some("harbor-token-issuer".to_string()),
                    issuer_ref: issuer.clone(),
                    ..Default::default()
                },
            }));
        }

        let mut ports = vec![("http", 80, HTTP_PORT)];
        if self.spec.controller.is_some() {
            ports.push(("registryctl", CONTROLLER_PORT, CONTROLLER_PORT));
        }
        objects.push(DesiredObject::new(service(
            self.owned_meta(Self::COMPONENT),
            labels.clone(),
            &ports,
        )));

        objects.push(DesiredObject::new(deployment(
            self.owned_meta(Self::COMPONENT),
            labels,
            self.spec.component.replicas,
            self.pod(ctx, &config, &name)?,
        )));
        Ok(objects)
    }
}

impl Registry {
    fn config(&self) -> RegistryConfig<'_> {
        RegistryConfig {
            log_level: self.spec.log_level,
            urls_config_map: &self.spec.urls_config_map,
            storage_secret: self.spec.storage_secret.as_deref(),
            cache_secret: self.spec.cache_secret.as_deref(),
            token_certificate_secret: Some(&self.spec.token_certificate_secret),
            with_controller: self.spec.controller.is_some(),
        }
    }

    fn env(&self) -> Vec<EnvVar> {
        let spec = &self.spec;
        let mut vars = vec![
            config_map_env("REGISTRY_HTTP_HOST", &spec.urls_config_map, "REGISTRY_HTTP_HOST"),
            secret_env("REGISTRY_HTTP_SECRET", &spec.http_secret, "secret"),
        ];
        if spec.cache_secret.is_some() {
            vars.push(env("REGISTRY_STORAGE_CACHE_BLOBDESCRIPTOR", "redis"));
        }
        vars
    }

    fn pod(&self, ctx: &RenderContext, config: &RegistryConfig, name: &str) -> Result<PodSpec> {
        let spec = &self.spec;
        let image = ctx
            .images
            .resolve(spec.component.image.as_deref(), images::REGISTRY, &spec.version)?;

        let registry = Container {
            ports: Some(vec![
                container_port("http", HTTP_PORT),
                container_port("metrics", METRICS_PORT),
            ]),
            env: Some(self.env()),
            liveness_probe: Some(http_probe("/", HTTP_PORT, Some(10))),
            readiness_probe: Some(http_probe("/", HTTP_PORT, None)),
            volume_mounts: Some(config.registry_mounts()),
            ..base_container("registry", &image, Some(&spec.component))
        };

        let mut containers = vec![registry];
        if let Some(sidecar) = &spec.controller {
            let image = ctx.images.resolve(
                sidecar.image.as_deref(),
                images::REGISTRY_CONTROLLER,
                &spec.version,
            )?;
            containers.push(config.controller_container(
                &image,
                Some(&spec.component),
                &sidecar.core_secret,
                &sidecar.jobservice_secret,
            ));
        }

        Ok(pod_spec(
            &spec.component,
            containers,
            vec![config.init_container(ctx.images)?],
            config.volumes(name),
        ))
    }
}
