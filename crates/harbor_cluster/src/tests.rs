#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::Service;
    use kube::api::{Api, ObjectMeta, Patch, PatchParams};
    use kube::Client;

    use crate::api::v1alpha1::{Portal, PortalSpec};
    use crate::controllers::{component_controller, State};
    use crate::util::config::OperatorConfig;

    #[tokio::test]
    #[ignore = "uses k8s current-context"]
    async fn integration_portal_reconcile_sets_status() {
        let client = Client::try_default().await.unwrap();
        let ctx = State::new(OperatorConfig::default()).unwrap().to_context(client.clone());

        let portal = Portal {
            metadata: ObjectMeta {
                name: Some("test-portal".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: PortalSpec {
                version: "2.3.0".to_string(),
                ..Default::default()
            },
            status: None,
        };
        let portals: Api<Portal> = Api::namespaced(client.clone(), "default");
        let ssapply = PatchParams::apply("ctrltest").force();
        portals
            .patch("test-portal", &ssapply, &Patch::Apply(&portal))
            .await
            .unwrap();

        let live = portals.get("test-portal").await.unwrap();
        component_controller::reconcile(Arc::new(live), ctx).await.unwrap();

        let output = portals.get("test-portal").await.unwrap();
        assert!(output.status.is_some());

        let deployments: Api<Deployment> = Api::namespaced(client.clone(), "default");
        let deployment = deployments.get("test-portal-portal").await.unwrap();
        assert_eq!(deployment.spec.unwrap().revision_history_limit, Some(0));
        let services: Api<Service> = Api::namespaced(client.clone(), "default");
        assert!(services.get("test-portal-portal").await.is_ok());

        portals.delete("test-portal", &Default::default()).await.unwrap();
    }
}
