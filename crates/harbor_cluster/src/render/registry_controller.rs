use super::registry::{RegistryConfig, CONTROLLER_PORT};
use super::*;
use crate::api::v1alpha1::RegistryController;
use crate::images;

impl Component for RegistryController {
    const COMPONENT: &'static str = "registryctl";

    fn component_status(&self) -> Option<&ComponentStatus> {
        self.status.as_ref()
    }

    fn render(&self, ctx: &RenderContext) -> Result<Vec<DesiredObject>> {
        let spec = &self.spec;
        let config = RegistryConfig {
            log_level: spec.log_level,
            urls_config_map: &spec.urls_config_map,
            storage_secret: spec.storage_secret.as_deref(),
            cache_secret: None,
            token_certificate_secret: None,
            with_controller: true,
        };
        let name = self.normalize_name(Self::COMPONENT);
        let labels = self.selector_labels();

        let image = ctx
            .images
            .resolve(spec.component.image.as_deref(), images::REGISTRY_CONTROLLER, &spec.version)?;
        let pod = pod_spec(
            &spec.component,
            vec![config.controller_container(
                &image,
                Some(&spec.component),
                &spec.core_secret,
                &spec.jobservice_secret,
            )],
            vec![config.init_container(ctx.images)?],
            config.volumes(&name),
        );

        Ok(vec![
            DesiredObject::new(config_map(self.owned_meta(Self::COMPONENT), config.config_map_data())),
            DesiredObject::new(service(
                self.owned_meta(Self::COMPONENT),
                labels.clone(),
                &[("http", 80, CONTROLLER_PORT)],
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
    use crate::api::v1alpha1::RegistryControllerSpec;
    use crate::render::test_support::*;

    #[test]
    fn standalone_controller_renders_both_configs() {
        let mut cr = RegistryController::new(
            "harbor",
            RegistryControllerSpec {
                version: "2.3.0".to_string(),
                urls_config_map: "harbor-urls".to_string(),
                core_secret: "harbor-core-secret".to_string(),
                jobservice_secret: "harbor-jobservice-secret".to_string(),
                ..Default::default()
            },
        );
        cr.metadata.namespace = Some("registry".to_string());
        let images = ImageStore::with_defaults(None).unwrap();
        let objects = cr.render(&RenderContext { images: &images }).unwrap();

        assert_workload_invariants("harbor", &objects);
        assert!(objects.iter().all(|o| o.name() == "harbor-registryctl"));

        let pod = pod(deployments(&objects)[0]);
        let ctl = container(pod, "registryctl");
        let paths: Vec<&str> = ctl
            .volume_mounts
            .iter()
            .flatten()
            .map(|m| m.mount_path.as_str())
            .collect();
        assert!(paths.contains(&"/etc/registry/config.yml"));
        assert!(paths.contains(&"/etc/registryctl/config.yml"));
        assert!(!paths.contains(&"/etc/registry/root.crt"));
    }
}
