use kube::CustomResourceExt as _;
use harbor_cluster::api::v1alpha1::{
    ChartMuseum, Core, JobService, NotaryServer, NotarySigner, Platform, PlatformConfiguration, PlatformProject,
    Portal, ProjectBinding, Registry, RegistryController, Scanner, ServerConfiguration,
};

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        Platform::crd(),
        Core::crd(),
        Registry::crd(),
        RegistryController::crd(),
        JobService::crd(),
        Portal::crd(),
        ChartMuseum::crd(),
        Scanner::crd(),
        NotaryServer::crd(),
        NotarySigner::crd(),
        ServerConfiguration::crd(),
        ProjectBinding::crd(),
        PlatformProject::crd(),
        PlatformConfiguration::crd(),
    ];
    for (i, crd) in crds.iter().enumerate() {
        if i > 0 {
            println!("---");
        }
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
