use std::collections::BTreeMap;

use super::*;
use crate::api::v1alpha1::JobService;
use crate::images;

pub const HTTP_PORT: i32 = 8080;

const LOGS_DIR: &str = "/var/log/jobs";
const LOGS_VOLUME: &str = "job-logs";

impl Component for JobService {
    const COMPONENT: &'static str = "jobservice";

    fn component_status(&self) -> Option<&ComponentStatus> {
        self.status.as_ref()
    }

    fn render(&self, ctx: &RenderContext) -> Result<Vec<DesiredObject>> {
        let spec = &self.spec;
        let name = self.normalize_name(Self::COMPONENT);
        let labels = self.selector_labels();

        let image = ctx
            .images
            .resolve(spec.component.image.as_deref(), images::JOB_SERVICE, &spec.version)?;

        let init = config_init_container(
            ctx.images,
            &[(&templates::JOB_SERVICE, templates::JOB_SERVICE.content)],
            vec![
                env("PORT", HTTP_PORT),
                env("WORKER_COUNT", spec.worker_count),
                env("LOG_LEVEL", spec.log_level),
                env("LOGS_DIR", LOGS_DIR),
                secret_env("REDIS_URL", &spec.redis_secret, "url"),
                secret_env("REDIS_NAMESPACE", &spec.redis_secret, "namespace"),
            ],
            &[],
            vec![],
        )?;

        let jobservice = Container {
            ports: Some(vec![container_port("http", HTTP_PORT)]),
            env: Some(vec![
                env("CORE_URL", &spec.core_url),
                env("REGISTRY_CONTROLLER_URL", &spec.registry_controller_url),
                env("JOBSERVICE_WEBHOOK_JOB_MAX_RETRY", spec.webhook_job_max_retry),
                secret_env("CORE_SECRET", &spec.core_secret, "secret"),
                secret_env("JOBSERVICE_SECRET", &spec.jobservice_secret, "secret"),
            ]),
            liveness_probe: Some(http_probe("/api/v1/stats", HTTP_PORT, Some(20))),
            readiness_probe: Some(http_probe("/api/v1/stats", HTTP_PORT, None)),
            volume_mounts: Some(vec![
                read_only_mount(CONFIG_VOLUME, "/etc/jobservice/config.yml", Some(templates::JOB_SERVICE.file)),
                mount(LOGS_VOLUME, LOGS_DIR, None),
            ]),
            ..base_container("jobservice", &image, Some(&spec.component))
        };

        let pod = pod_spec(
            &spec.component,
            vec![jobservice],
            vec![init],
            vec![
                config_map_volume(TEMPLATE_VOLUME, &name),
                empty_dir_volume(CONFIG_VOLUME),
                empty_dir_volume(LOGS_VOLUME),
            ],
        );

        Ok(vec![
            DesiredObject::new(config_map(
                self.owned_meta(Self::COMPONENT),
                BTreeMap::from([(
                    templates::JOB_SERVICE.file.to_string(),
                    templates::JOB_SERVICE.content.to_string(),
                )]),
            )),
            DesiredObject::new(service(
                self.owned_meta(Self::COMPONENT),
                labels.clone(),
                &[("http", 80, HTTP_PORT)],
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::JobServiceSpec;
    use crate::render::test_support::*;

    #[test]
    fn jobservice_reads_redis_from_secret() {
        let mut cr = JobService::new(
            "harbor",
            JobServiceSpec {
                version: "2.3.0".to_string(),
                redis_secret: "harbor-redis".to_string(),
                core_url: "http://harbor-core".to_string(),
                registry_controller_url: "http://harbor-registry:8080".to_string(),
                core_secret: "harbor-core-secret".to_string(),
                jobservice_secret: "harbor-jobservice-secret".to_string(),
                worker_count: 4,
                webhook_job_max_retry: 3,
                ..Default::default()
            },
        );
        cr.metadata.namespace = Some("registry".to_string());
        let images = ImageStore::with_defaults(None).unwrap();
        let objects = cr.render(&RenderContext { images: &images }).unwrap();
        assert_workload_invariants("harbor", &objects);

        let pod = pod(deployments(&objects)[0]);
        let init = container(pod, "config");
        assert_eq!(env_value(init, "WORKER_COUNT"), Some("4"));
        assert_eq!(env_value(init, "LOGS_DIR"), Some("/var/log/jobs"));

        let main = container(pod, "jobservice");
        assert_eq!(env_value(main, "CORE_URL"), Some("http://harbor-core"));
        assert_eq!(env_value(main, "JOBSERVICE_WEBHOOK_JOB_MAX_RETRY"), Some("3"));

        let deployment = objects.iter().find(|o| o.kind() == ManifestKind::Deployment).unwrap();
        assert!(deployment.dependencies.contains(&DependencyKey::secret("harbor-redis")));
        assert!(deployment
            .dependencies
            .contains(&DependencyKey::config_map("harbor-jobservice")));
    }
}
