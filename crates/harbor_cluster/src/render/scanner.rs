use std::collections::BTreeMap;

use super::*;
use crate::api::v1alpha1::Scanner;
use crate::images;

pub const API_PORT: i32 = 6060;
pub const HEALTH_PORT: i32 = 6061;
pub const ADAPTER_PORT: i32 = 8080;

impl Component for Scanner {
    const COMPONENT: &'static str = "clair";

    fn component_status(&self) -> Option<&ComponentStatus> {
        self.status.as_ref()
    }

    fn render(&self, ctx: &RenderContext) -> Result<Vec<DesiredObject>> {
        let spec = &self.spec;
        let name = self.normalize_name(Self::COMPONENT);
        let adapter_config = self.normalize_name("clair-adapter");
        let labels = self.selector_labels();
        let clair_config = self.clair_config();

        let init = config_init_container(
            ctx.images,
            &[(&templates::CLAIR, clair_config.as_str())],
            [
                vec![
                    env("PORT", API_PORT),
                    env("HEALTH_PORT", HEALTH_PORT),
                    env("UPDATE_INTERVAL", spec.update_interval),
                ],
                database_env("DB_", &spec.database_secret),
            ]
            .concat(),
            &[],
            vec![],
        )?;

        let clair_image = ctx
            .images
            .resolve(spec.component.image.as_deref(), images::CLAIR, &spec.version)?;
        let clair = Container {
            args: Some(vec![
                "-config".to_string(),
                format!("/etc/clair/{}", templates::CLAIR.file),
                "-log-level".to_string(),
                spec.log_level.to_string(),
            ]),
            ports: Some(vec![
                container_port("api", API_PORT),
                container_port("health", HEALTH_PORT),
            ]),
            liveness_probe: Some(http_probe("/health", HEALTH_PORT, Some(30))),
            readiness_probe: Some(http_probe("/health", HEALTH_PORT, None)),
            volume_mounts: Some(vec![read_only_mount(
                CONFIG_VOLUME,
                &format!("/etc/clair/{}", templates::CLAIR.file),
                Some(templates::CLAIR.file),
            )]),
            ..base_container("clair", &clair_image, Some(&spec.component))
        };

        let adapter_image = ctx.images.resolve(
            spec.adapter.image.as_deref(),
            images::CLAIR_ADAPTER,
            &spec.version,
        )?;
        let mut adapter_env = database_env("CLAIR_DB_", &spec.database_secret);
        adapter_env.extend([
            env(
                "SCANNER_CLAIR_DATABASE_URL",
                "postgres://$(CLAIR_DB_USERNAME):$(CLAIR_DB_PASSWORD)@$(CLAIR_DB_HOST):$(CLAIR_DB_PORT)/$(CLAIR_DB_DATABASE)?sslmode=$(CLAIR_DB_SSL)",
            ),
            secret_env("SCANNER_STORE_REDIS_URL", &spec.adapter.redis_secret, "url"),
            secret_env("SCANNER_STORE_REDIS_NAMESPACE", &spec.adapter.redis_secret, "namespace"),
        ]);
        let adapter = Container {
            ports: Some(vec![container_port("adapter", ADAPTER_PORT)]),
            env: Some(adapter_env),
            env_from: Some(vec![env_from_config_map(&adapter_config)]),
            liveness_probe: Some(http_probe("/probe/healthy", ADAPTER_PORT, Some(300))),
            readiness_probe: Some(http_probe("/probe/ready", ADAPTER_PORT, None)),
            ..base_container("clair-adapter", &adapter_image, Some(&spec.component))
        };

        let pod = pod_spec(
            &spec.component,
            vec![clair, adapter],
            vec![init],
            vec![
                config_map_volume(TEMPLATE_VOLUME, &name),
                empty_dir_volume(CONFIG_VOLUME),
            ],
        );

        Ok(vec![
            DesiredObject::new(config_map(
                self.owned_meta(Self::COMPONENT),
                BTreeMap::from([(templates::CLAIR.file.to_string(), clair_config)]),
            )),
            DesiredObject::new(config_map(
                self.owned_meta("clair-adapter"),
                self.adapter_settings(),
            )),
            DesiredObject::new(service(
                self.owned_meta(Self::COMPONENT),
                labels.clone(),
                &[("api", API_PORT, API_PORT), ("adapter", ADAPTER_PORT, ADAPTER_PORT)],
            )),
            DesiredObject::new(deployment(
                self.owned_meta(Self::COMPONENT),
                labels,
                spec.component.replicas,
                pod,
            )),
        ])
    }
}

impl Scanner {
    /// Clair template with the enabled updaters inlined.
    fn clair_config(&self) -> String {
        let updaters = self
            .spec
            .vulnerability_sources
            .iter()
            .map(|source| format!("    - {source}"))
            .collect::<Vec<_>>()
            .join("\n");
        templates::CLAIR.fill(&[("UPDATERS", updaters)])
    }

    fn adapter_settings(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("SCANNER_LOG_LEVEL".to_string(), self.spec.log_level.to_string()),
            ("SCANNER_API_SERVER_ADDR".to_string(), format!(":{ADAPTER_PORT}")),
            ("SCANNER_CLAIR_URL".to_string(), format!("http://127.0.0.1:{API_PORT}")),
            ("SCANNER_STORE_REDIS_POOL_MAX_ACTIVE".to_string(), "5".to_string()),
            ("SCANNER_STORE_REDIS_POOL_MAX_IDLE".to_string(), "5".to_string()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::{ScannerAdapterSpec, ScannerSpec};
    use crate::render::test_support::*;

    fn scanner() -> Scanner {
        let mut cr = Scanner::new(
            "harbor",
            ScannerSpec {
                version: "2.3.0".to_string(),
                database_secret: "clair-db".to_string(),
                vulnerability_sources: vec!["ubuntu".to_string(), "alpine".to_string()],
                update_interval: 6,
                adapter: ScannerAdapterSpec {
                    image: None,
                    redis_secret: "harbor-redis".to_string(),
                },
                ..Default::default()
            },
        );
        cr.metadata.namespace = Some("registry".to_string());
        cr
    }

    #[test]
    fn updaters_are_inlined_into_config() {
        let config = scanner().clair_config();
        assert!(config.contains("    enabledupdaters:\n    - ubuntu\n    - alpine"));
        assert!(!config.contains("{{UPDATERS}}"));
    }

    #[test]
    fn renders_clair_and_adapter() {
        let images = ImageStore::with_defaults(None).unwrap();
        let objects = scanner().render(&RenderContext { images: &images }).unwrap();
        assert_workload_invariants("harbor", &objects);

        let names: Vec<String> = objects.iter().map(|o| o.name()).collect();
        assert!(names.contains(&"harbor-clair-adapter".to_string()));

        let pod = pod(deployments(&objects)[0]);
        assert_eq!(container(pod, "config").env.as_ref().unwrap().len(), 9);
        assert_eq!(env_value(container(pod, "config"), "UPDATE_INTERVAL"), Some("6"));

        let adapter = container(pod, "clair-adapter");
        assert_eq!(
            adapter.image.as_deref(),
            Some("goharbor/clair-adapter-photon:v2.3.0")
        );
        assert_eq!(
            adapter.liveness_probe.as_ref().unwrap().initial_delay_seconds,
            Some(300)
        );

        let deployment = objects.iter().find(|o| o.kind() == ManifestKind::Deployment).unwrap();
        assert!(deployment
            .dependencies
            .contains(&DependencyKey::config_map("harbor-clair-adapter")));
        assert!(deployment.dependencies.contains(&DependencyKey::secret("clair-db")));
    }
}
