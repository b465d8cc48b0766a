use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::EnvVar;

use super::*;
use crate::api::v1alpha1::Core;
use crate::images;

pub const HTTP_PORT: i32 = 8080;

const KEY_VOLUME: &str = "secret-key";
const TOKEN_CERTIFICATE_VOLUME: &str = "token-service-private-key";
const TOKEN_DIR_VOLUME: &str = "psc";

impl Component for Core {
    const COMPONENT: &'static str = "core";

    fn component_status(&self) -> Option<&ComponentStatus> {
        self.status.as_ref()
    }

    fn render(&self, ctx: &RenderContext) -> Result<Vec<DesiredObject>> {
        let name = self.normalize_name(Self::COMPONENT);
        let labels = self.selector_labels();

        let config_map = config_map(
            self.owned_meta(Self::COMPONENT),
            BTreeMap::from([(templates::CORE.file.to_string(), templates::CORE.content.to_string())]),
        );

        let service = service(
            self.owned_meta(Self::COMPONENT),
            labels.clone(),
            &[("http", 80, HTTP_PORT)],
        );

        let deployment = deployment(
            self.owned_meta(Self::COMPONENT),
            labels,
            self.spec.component.replicas,
            self.pod(ctx, &name)?,
        );

        Ok(vec![
            DesiredObject::new(config_map),
            DesiredObject::new(service),
            DesiredObject::new(deployment),
        ])
    }
}

impl Core {
    /// In-cluster URL of the core service.
    pub fn service_url(&self) -> String {
        format!("http://{}", self.normalize_name(Self::COMPONENT))
    }

    fn env(&self) -> Vec<EnvVar> {
        let spec = &self.spec;
        let core_url = self.service_url();

        let mut vars = vec![
            env("PORT", HTTP_PORT),
            env("LOG_LEVEL", spec.log_level),
            env("CONFIG_PATH", "/etc/core/app.conf"),
            env("KEY_PATH", "/etc/core/key"),
            env("TOKEN_PRIVATE_KEY_PATH", "/etc/core/private_key.pem"),
            env("DATABASE_TYPE", "postgresql"),
            env("EXT_ENDPOINT", &spec.public_url),
            env("CORE_URL", &core_url),
            env("CORE_LOCAL_URL", format!("http://127.0.0.1:{HTTP_PORT}")),
            env("TOKEN_SERVICE_URL", format!("{core_url}/service/token")),
            env("CFG_EXPIRATION", spec.config_expiration),
            env("TOKEN_EXPIRATION", spec.token_expiration),
            env("READ_ONLY", spec.read_only),
            env("SYNC_QUOTA", spec.sync_quota),
            env("SYNC_REGISTRY", spec.sync_registry),
            env("REGISTRY_URL", &spec.registry_url),
            env("REGISTRY_CONTROLLER_URL", &spec.registry_controller_url),
            env("JOBSERVICE_URL", &spec.job_service_url),
            env("PORTAL_URL", &spec.portal_url),
        ];

        let neighbors = [
            ("CHART_REPOSITORY_URL", "WITH_CHARTMUSEUM", &spec.chart_repository_url),
            ("CLAIR_ADAPTER_URL", "WITH_CLAIR", &spec.clair_adapter_url),
            ("NOTARY_URL", "WITH_NOTARY", &spec.notary_url),
        ];
        for (url_var, flag_var, url) in neighbors {
            if let Some(url) = url {
                vars.push(env(url_var, url));
            }
            vars.push(env(flag_var, url.is_some()));
        }
        vars.push(env("WITH_TRIVY", false));

        vars.extend([
            secret_env("CORE_SECRET", &spec.core_secret, "secret"),
            secret_env("JOBSERVICE_SECRET", &spec.jobservice_secret, "secret"),
            secret_env("HARBOR_ADMIN_PASSWORD", &spec.admin_password_secret, "password"),
            secret_env("CSRF_KEY", &spec.csrf_key_secret, "secret"),
        ]);
        vars
    }

    fn pod(&self, ctx: &RenderContext, name: &str) -> Result<PodSpec> {
        let spec = &self.spec;
        let image = ctx
            .images
            .resolve(spec.component.image.as_deref(), images::CORE, &spec.version)?;

        let init = config_init_container(
            ctx.images,
            &[(&templates::CORE, templates::CORE.content)],
            vec![env("PORT", HTTP_PORT)],
            &[],
            vec![],
        )?;

        let mut env_from = vec![env_from_secret(&spec.database_secret, Some("POSTGRESQL_"), false)];
        if let Some(secret) = &spec.scanner_database_secret {
            env_from.push(env_from_secret(secret, Some("CLAIR_DB_"), true));
        }
        if let Some(secret) = &spec.redis_secret {
            env_from.push(env_from_secret(secret, Some("REDIS_"), true));
        }

        let api = api_prefix(&spec.version);
        let core = Container {
            ports: Some(vec![container_port("http", HTTP_PORT)]),
            env: Some(self.env()),
            env_from: Some(env_from),
            liveness_probe: Some(http_probe(&format!("{api}/ping"), HTTP_PORT, Some(20))),
            readiness_probe: Some(http_probe(&format!("{api}/ping"), HTTP_PORT, None)),
            volume_mounts: Some(vec![
                read_only_mount(CONFIG_VOLUME, "/etc/core/app.conf", Some(templates::CORE.file)),
                read_only_mount(KEY_VOLUME, "/etc/core/key", Some("key")),
                read_only_mount(TOKEN_CERTIFICATE_VOLUME, "/etc/core/private_key.pem", Some("tls.key")),
                mount(TOKEN_DIR_VOLUME, "/etc/core/token", None),
            ]),
            ..base_container("core", &image, Some(&spec.component))
        };

        Ok(pod_spec(
            &spec.component,
            vec![core],
            vec![init],
            vec![
                config_map_volume(TEMPLATE_VOLUME, name),
                empty_dir_volume(CONFIG_VOLUME),
                secret_volume(KEY_VOLUME, &spec.encryption_key_secret, &[("secret", "key")]),
                secret_volume(TOKEN_CERTIFICATE_VOLUME, &spec.token_certificate_secret, &[]),
                empty_dir_volume(TOKEN_DIR_VOLUME),
            ],
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::v1alpha1::CoreSpec;
    use crate::images::ImageStore;
    use crate::render::test_support::*;

    pub fn core() -> Core {
        let mut core = Core::new(
            "harbor",
            CoreSpec {
                version: "2.3.0".to_string(),
                public_url: "https://harbor.example.com".to_string(),
                database_secret: "harbor-database".to_string(),
                admin_password_secret: "admin-secret".to_string(),
                core_secret: "harbor-core-secret".to_string(),
                jobservice_secret: "harbor-jobservice-secret".to_string(),
                encryption_key_secret: "harbor-encryption-key".to_string(),
                csrf_key_secret: "harbor-csrf-key".to_string(),
                token_certificate_secret: "harbor-token".to_string(),
                registry_url: "http://harbor-registry".to_string(),
                registry_controller_url: "http://harbor-registry:8080".to_string(),
                job_service_url: "http://harbor-jobservice".to_string(),
                portal_url: "http://harbor-portal".to_string(),
                config_expiration: 5,
                token_expiration: 30,
                sync_quota: true,
                ..Default::default()
            },
        );
        core.metadata.namespace = Some("registry".to_string());
        core
    }

    #[test]
    fn renders_config_service_and_deployment() {
        let images = ImageStore::with_defaults(None).unwrap();
        let objects = core().render(&RenderContext { images: &images }).unwrap();

        let kinds: Vec<ManifestKind> = objects.iter().map(|o| o.kind()).collect();
        assert_eq!(
            kinds,
            vec![ManifestKind::ConfigMap, ManifestKind::Service, ManifestKind::Deployment]
        );
        assert!(objects.iter().all(|o| o.name() == "harbor-core"));
        assert_workload_invariants("harbor", &objects);
    }

    #[test]
    fn core_env_lists_endpoints_and_neighbors() {
        let images = ImageStore::with_defaults(None).unwrap();
        let mut cr = core();
        cr.spec.notary_url = Some("http://harbor-notary-server:4443".to_string());
        let objects = cr.render(&RenderContext { images: &images }).unwrap();
        let deployment = deployments(&objects)[0];
        let main = container(pod(deployment), "core");

        assert_eq!(env_value(main, "EXT_ENDPOINT"), Some("https://harbor.example.com"));
        assert_eq!(env_value(main, "CORE_URL"), Some("http://harbor-core"));
        assert_eq!(env_value(main, "CORE_LOCAL_URL"), Some("http://127.0.0.1:8080"));
        assert_eq!(
            env_value(main, "TOKEN_SERVICE_URL"),
            Some("http://harbor-core/service/token")
        );
        assert_eq!(env_value(main, "CFG_EXPIRATION"), Some("5"));
        assert_eq!(env_value(main, "READ_ONLY"), Some("false"));
        assert_eq!(env_value(main, "SYNC_QUOTA"), Some("true"));
        assert_eq!(env_value(main, "WITH_NOTARY"), Some("true"));
        assert_eq!(env_value(main, "WITH_CHARTMUSEUM"), Some("false"));
        assert_eq!(env_value(main, "WITH_CLAIR"), Some("false"));
        assert!(env_value(main, "CHART_REPOSITORY_URL").is_none());
        assert_eq!(main.image.as_deref(), Some("goharbor/harbor-core:v2.3.0"));

        let admin = main
            .env
            .iter()
            .flatten()
            .find(|e| e.name == "HARBOR_ADMIN_PASSWORD")
            .and_then(|e| e.value_from.as_ref())
            .and_then(|s| s.secret_key_ref.as_ref())
            .unwrap();
        assert_eq!(admin.name, "admin-secret");
        assert_eq!(admin.optional, Some(false));
    }

    #[test]
    fn optional_env_from_secrets_only_when_set() {
        let images = ImageStore::with_defaults(None).unwrap();
        let mut cr = core();
        let objects = cr.render(&RenderContext { images: &images }).unwrap();
        let main = container(pod(deployments(&objects)[0]), "core");
        assert_eq!(main.env_from.as_ref().unwrap().len(), 1);

        cr.spec.redis_secret = Some("harbor-redis".to_string());
        cr.spec.scanner_database_secret = Some("clair-db".to_string());
        let objects = cr.render(&RenderContext { images: &images }).unwrap();
        let main = container(pod(deployments(&objects)[0]), "core");
        let sources = main.env_from.as_ref().unwrap();
        assert_eq!(sources.len(), 3);
        assert_eq!(sources[0].secret_ref.as_ref().unwrap().optional, Some(false));
        assert_eq!(sources[1].secret_ref.as_ref().unwrap().optional, Some(true));
        assert_eq!(sources[2].secret_ref.as_ref().unwrap().optional, Some(true));
    }

    #[test]
    fn core_depends_on_its_config_and_secrets() {
        let images = ImageStore::with_defaults(None).unwrap();
        let objects = core().render(&RenderContext { images: &images }).unwrap();
        let deployment = objects.iter().find(|o| o.kind() == ManifestKind::Deployment).unwrap();
        assert!(deployment.dependencies.contains(&DependencyKey::config_map("harbor-core")));
        assert!(deployment.dependencies.contains(&DependencyKey::secret("harbor-token")));
        assert!(deployment.dependencies.contains(&DependencyKey::secret("harbor-database")));
        assert!(deployment.dependencies.contains(&DependencyKey::secret("admin-secret")));
    }

    #[test]
    fn unsupported_version_fails_rendering() {
        let images = ImageStore::with_defaults(None).unwrap();
        let mut cr = core();
        cr.spec.version = "9.0.0".to_string();
        let err = cr.render(&RenderContext { images: &images }).unwrap_err();
        assert!(matches!(err.inner(), StdError::UnsupportedVersion { .. }));
    }
}
