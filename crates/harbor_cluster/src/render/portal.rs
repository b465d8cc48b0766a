use super::*;
use crate::api::v1alpha1::Portal;
use crate::images;

pub const HTTP_PORT: i32 = 8080;

impl Component for Portal {
    const COMPONENT: &'static str = "portal";

    fn component_status(&self) -> Option<&ComponentStatus> {
        self.status.as_ref()
    }

    fn render(&self, ctx: &RenderContext) -> Result<Vec<DesiredObject>> {
        let spec = &self.spec;
        let labels = self.selector_labels();
        let image = ctx
            .images
            .resolve(spec.component.image.as_deref(), images::PORTAL, &spec.version)?;

        let portal = Container {
            ports: Some(vec![container_port("http", HTTP_PORT)]),
            liveness_probe: Some(http_probe("/", HTTP_PORT, Some(10))),
            readiness_probe: Some(http_probe("/", HTTP_PORT, None)),
            ..base_container("portal", &image, Some(&spec.component))
        };

        Ok(vec![
            DesiredObject::new(service(
                self.owned_meta(Self::COMPONENT),
                labels.clone(),
                &[("http", 80, HTTP_PORT)],
            )),
            DesiredObject::new(deployment(
                self.owned_meta(Self::COMPONENT),
                labels,
                spec.component.replicas,
                pod_spec(&spec.component, vec![portal], vec![], vec![]),
            )),
        ])
    }
}
