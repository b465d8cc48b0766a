//! Splits a [`Platform`] into its shared objects and one child resource per component.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use rand::distributions::{Alphanumeric, DistString};

use super::ingress::{self, CoreBackends, IngressParams};
use super::notary::SIGNER_PORT;
use super::*;
use crate::api::cert_manager::CertificateSpec;
use crate::api::v1alpha1::*;
use crate::api::{CLASS_ANNOTATION, PLATFORM_NAMESPACE_LABEL, PLATFORM_NAME_LABEL};

const CONFIG_EXPIRATION: u64 = 5;
const TOKEN_EXPIRATION: u32 = 30;
const SCANNER_UPDATE_INTERVAL: u32 = 12;

/// Child resources of a platform. Optional components are `None` when disabled.
#[derive(Clone, Debug)]
pub struct Children {
    pub core: Core,
    pub registry: Registry,
    pub job_service: JobService,
    pub portal: Portal,
    pub chart_museum: Option<ChartMuseum>,
    pub scanner: Option<Scanner>,
    pub notary_server: Option<NotaryServer>,
    pub notary_signer: Option<NotarySigner>,
}

/// Everything a platform reconciliation applies.
#[derive(Clone, Debug)]
pub struct PlatformPlan {
    pub objects: Vec<DesiredObject>,
    pub children: Children,
}

/// Names of the objects shared between the children.
struct Names {
    urls: String,
    core_secret: String,
    jobservice_secret: String,
    registry_http_secret: String,
    encryption_key: String,
    csrf_key: String,
    token_certificate: String,
    chartmuseum_auth: String,
    notary_certificate: String,
    notary_passphrase: String,
}

impl Names {
    fn new(platform: &str) -> Self {
        let name = |suffix: &str| normalize(&format!("{platform}-{suffix}"));
        Self {
            urls: name("urls"),
            core_secret: name("core-secret"),
            jobservice_secret: name("jobservice-secret"),
            registry_http_secret: name("registry-http"),
            encryption_key: name("encryption-key"),
            csrf_key: name("csrf-key"),
            token_certificate: name("token"),
            chartmuseum_auth: name("chartmuseum-auth"),
            notary_certificate: name("notary"),
            notary_passphrase: name("notary-passphrase"),
        }
    }
}

pub fn render(platform: &Platform) -> PlatformPlan {
    let names = Names::new(&platform.name_any());
    let mut objects = vec![DesiredObject::new(urls_config_map(platform, &names))];
    objects.extend(generated_secrets(platform, &names));
    objects.extend(certificates(platform, &names));
    objects.extend(ingresses(platform));
    PlatformPlan {
        objects,
        children: children(platform, &names),
    }
}

/// Random alphanumeric value for generated secrets.
pub fn random_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

fn platform_labels(platform: &Platform) -> BTreeMap<String, String> {
    BTreeMap::from([
        (PLATFORM_NAME_LABEL.to_string(), platform.name_any()),
        (
            PLATFORM_NAMESPACE_LABEL.to_string(),
            platform.namespace().unwrap_or_default(),
        ),
    ])
}

fn platform_meta(platform: &Platform, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: platform.namespace(),
        labels: Some(platform_labels(platform)),
        ..Default::default()
    }
}

/// Metadata of a child resource: same name and namespace as the platform,
/// owned by it and carrying its operator class.
fn child_meta(platform: &Platform) -> ObjectMeta {
    let annotations = platform
        .annotations()
        .get(CLASS_ANNOTATION)
        .map(|class| BTreeMap::from([(CLASS_ANNOTATION.to_string(), class.clone())]));
    ObjectMeta {
        annotations,
        owner_references: platform.controller_owner_ref(&()).map(|owner| vec![owner]),
        ..platform_meta(platform, &platform.name_any())
    }
}

fn service_url(platform: &Platform, component: &str) -> String {
    format!("http://{}", normalize(&format!("{}-{component}", platform.name_any())))
}

fn urls_config_map(platform: &Platform, names: &Names) -> ConfigMap {
    let public = platform.spec.public_url.trim_end_matches('/');
    config_map(
        platform_meta(platform, &names.urls),
        BTreeMap::from([
            ("REGISTRY_HTTP_HOST".to_string(), public.to_string()),
            (
                "REGISTRY_AUTH_TOKEN_REALM".to_string(),
                format!("{public}/service/token"),
            ),
            ("CORE_URL".to_string(), service_url(platform, "core")),
        ]),
    )
}

fn secret(platform: &Platform, name: &str, data: &[(&str, String)]) -> DesiredObject {
    DesiredObject::create_only(Secret {
        metadata: platform_meta(platform, name),
        data: Some(
            data.iter()
                .map(|(key, value)| (key.to_string(), ByteString(value.as_bytes().to_vec())))
                .collect(),
        ),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

/// Secrets filled with random values once and never rotated by the operator.
fn generated_secrets(platform: &Platform, names: &Names) -> Vec<DesiredObject> {
    let mut secrets = vec![
        secret(platform, &names.core_secret, &[("secret", random_string(16))]),
        secret(platform, &names.jobservice_secret, &[("secret", random_string(16))]),
        secret(platform, &names.registry_http_secret, &[("secret", random_string(16))]),
        secret(platform, &names.encryption_key, &[("secret", random_string(16))]),
        secret(platform, &names.csrf_key, &[("secret", random_string(32))]),
    ];
    let components = &platform.spec.components;
    if components.chart_museum.is_some() {
        secrets.push(secret(
            platform,
            &names.chartmuseum_auth,
            &[
                ("username", "chart_controller".to_string()),
                ("password", random_string(16)),
            ],
        ));
    }
    if components.notary.is_some() {
        secrets.push(secret(
            platform,
            &names.notary_passphrase,
            &[("passphrase", random_string(32))],
        ));
    }
    secrets
}

fn certificates(platform: &Platform, names: &Names) -> Vec<DesiredObject> {
    let issuer = &platform.spec.certificate_issuer_ref;
    let mut certificates = vec![DesiredObject::new(Certificate {
        metadata: platform_meta(platform, &names.token_certificate),
        spec: CertificateSpec {
            secret_name: names.token_certificate.clone(),
            common_name: Some("harbor-token-issuer".to_string()),
            issuer_ref: issuer.clone(),
            ..Default::default()
        },
    })];

    if platform.spec.components.notary.is_some() {
        let signer = normalize(&format!("{}-notary-signer", platform.name_any()));
        let namespace = platform.namespace().unwrap_or_default();
        certificates.push(DesiredObject::new(Certificate {
            metadata: platform_meta(platform, &names.notary_certificate),
            spec: CertificateSpec {
                secret_name: names.notary_certificate.clone(),
                common_name: Some(signer.clone()),
                dns_names: vec![
                    signer.clone(),
                    format!("{signer}.{namespace}"),
                    format!("{signer}.{namespace}.svc"),
                ],
                issuer_ref: issuer.clone(),
                ..Default::default()
            },
        }));
    }
    certificates
}

fn ingresses(platform: &Platform) -> Vec<DesiredObject> {
    let spec = &platform.spec;
    let name = |suffix: &str| normalize(&format!("{}-{suffix}", platform.name_any()));
    let core = name("core");
    let portal = name("portal");
    let registry = name("registry");

    let mut ingresses = vec![DesiredObject::new(ingress::core_ingress(
        platform_meta(platform, &core),
        &IngressParams {
            public_url: &spec.public_url,
            tls_secret: spec.tls_secret_name.as_deref(),
            class_name: spec.ingress_class_name.as_deref(),
        },
        &CoreBackends {
            core: &core,
            portal: &portal,
            registry: &registry,
            with_chartmuseum: spec.components.chart_museum.is_some(),
        },
    ))];

    if let Some(notary) = &spec.components.notary {
        ingresses.push(DesiredObject::new(ingress::notary_ingress(
            platform_meta(platform, &name("notary")),
            &IngressParams {
                public_url: &notary.public_url,
                tls_secret: spec.tls_secret_name.as_deref(),
                class_name: spec.ingress_class_name.as_deref(),
            },
            &name("notary-server"),
        )));
    }
    ingresses
}

/// Component settings with the platform priority class applied when unset.
fn with_priority(platform: &Platform, component: &ComponentSpec) -> ComponentSpec {
    let mut component = component.clone();
    if component.priority_class_name.is_none() {
        component.priority_class_name = platform.spec.priority.clone();
    }
    component
}

fn children(platform: &Platform, names: &Names) -> Children {
    let spec = &platform.spec;
    let components = &spec.components;
    let meta = child_meta(platform);
    let public_url = spec.public_url.trim_end_matches('/').to_string();
    let registry_url = service_url(platform, "registry");
    let registry_controller_url = format!("{registry_url}:{}", super::registry::CONTROLLER_PORT);

    let core = Core {
        metadata: meta.clone(),
        spec: CoreSpec {
            component: with_priority(platform, &components.core.component),
            version: spec.version.clone(),
            public_url: public_url.clone(),
            database_secret: spec.database_secret.clone(),
            admin_password_secret: spec.admin_password_secret.clone(),
            core_secret: names.core_secret.clone(),
            jobservice_secret: names.jobservice_secret.clone(),
            encryption_key_secret: names.encryption_key.clone(),
            csrf_key_secret: names.csrf_key.clone(),
            token_certificate_secret: names.token_certificate.clone(),
            redis_secret: Some(spec.redis_secret.clone()),
            scanner_database_secret: components.clair.as_ref().map(|_| spec.database_secret.clone()),
            registry_url: registry_url.clone(),
            registry_controller_url: registry_controller_url.clone(),
            job_service_url: service_url(platform, "jobservice"),
            portal_url: service_url(platform, "portal"),
            chart_repository_url: components
                .chart_museum
                .as_ref()
                .map(|_| service_url(platform, "chartmuseum")),
            clair_adapter_url: components.clair.as_ref().map(|_| {
                format!("{}:{}", service_url(platform, "clair"), super::scanner::ADAPTER_PORT)
            }),
            notary_url: components.notary.as_ref().map(|_| {
                format!(
                    "{}:{}",
                    service_url(platform, "notary-server"),
                    super::notary::SERVER_PORT
                )
            }),
            log_level: spec.log_level,
            config_expiration: CONFIG_EXPIRATION,
            token_expiration: components.core.token_expiration.unwrap_or(TOKEN_EXPIRATION),
            read_only: false,
            sync_quota: true,
            sync_registry: false,
        },
        status: None,
    };

    let registry = Registry {
        metadata: meta.clone(),
        spec: RegistrySpec {
            component: with_priority(platform, &components.registry.component),
            version: spec.version.clone(),
            public_url: public_url.clone(),
            urls_config_map: names.urls.clone(),
            storage_secret: components.registry.storage_secret.clone(),
            cache_secret: components.registry.cache.then(|| spec.redis_secret.clone()),
            http_secret: names.registry_http_secret.clone(),
            token_certificate_secret: names.token_certificate.clone(),
            certificate_issuer_ref: None,
            log_level: spec.log_level,
            controller: Some(RegistrySidecarSpec {
                image: components.registry.controller_image.clone(),
                core_secret: names.core_secret.clone(),
                jobservice_secret: names.jobservice_secret.clone(),
            }),
        },
        status: None,
    };

    let job_service = JobService {
        metadata: meta.clone(),
        spec: JobServiceSpec {
            component: with_priority(platform, &components.job_service.component),
            version: spec.version.clone(),
            redis_secret: spec.redis_secret.clone(),
            core_url: service_url(platform, "core"),
            registry_controller_url,
            core_secret: names.core_secret.clone(),
            jobservice_secret: names.jobservice_secret.clone(),
            worker_count: components.job_service.worker_count,
            webhook_job_max_retry: components.job_service.webhook_job_max_retry,
            log_level: spec.log_level,
        },
        status: None,
    };

    let portal = Portal {
        metadata: meta.clone(),
        spec: PortalSpec {
            component: with_priority(platform, &components.portal),
            version: spec.version.clone(),
        },
        status: None,
    };

    let chart_museum = components.chart_museum.as_ref().map(|chart| ChartMuseum {
        metadata: meta.clone(),
        spec: ChartMuseumSpec {
            component: with_priority(platform, &chart.component),
            version: spec.version.clone(),
            public_url: public_url.clone(),
            storage_secret: chart.storage_secret.clone(),
            cache_secret: chart.cache.then(|| spec.redis_secret.clone()),
            basic_auth_secret: names.chartmuseum_auth.clone(),
        },
        status: None,
    });

    let scanner = components.clair.as_ref().map(|clair| {
        let mut scanner_spec = ScannerSpec {
            component: with_priority(platform, &clair.component),
            version: spec.version.clone(),
            database_secret: spec.database_secret.clone(),
            vulnerability_sources: clair.vulnerability_sources.clone(),
            update_interval: SCANNER_UPDATE_INTERVAL,
            adapter: ScannerAdapterSpec {
                image: clair.adapter_image.clone(),
                redis_secret: spec.redis_secret.clone(),
            },
            log_level: spec.log_level,
        };
        if scanner_spec.vulnerability_sources.is_empty() {
            scanner_spec.vulnerability_sources = ["ubuntu", "debian", "alpine", "rhel"]
                .into_iter()
                .map(String::from)
                .collect();
        }
        Scanner {
            metadata: meta.clone(),
            spec: scanner_spec,
            status: None,
        }
    });

    let notary_server = components.notary.as_ref().map(|notary| NotaryServer {
        metadata: meta.clone(),
        spec: NotaryServerSpec {
            component: with_priority(platform, &notary.server),
            version: spec.version.clone(),
            public_url: notary.public_url.clone(),
            database_secret: spec.database_secret.clone(),
            certificate_secret: names.notary_certificate.clone(),
            token_secret: names.token_certificate.clone(),
            token_service_url: format!("{public_url}/service/token"),
            signer_url: format!(
                "https://{}:{SIGNER_PORT}",
                normalize(&format!("{}-notary-signer", platform.name_any()))
            ),
            log_level: spec.log_level,
        },
        status: None,
    });

    let notary_signer = components.notary.as_ref().map(|notary| NotarySigner {
        metadata: meta.clone(),
        spec: NotarySignerSpec {
            component: with_priority(platform, &notary.signer),
            version: spec.version.clone(),
            database_secret: spec.database_secret.clone(),
            certificate_secret: names.notary_certificate.clone(),
            passphrase_secret: names.notary_passphrase.clone(),
            log_level: spec.log_level,
        },
        status: None,
    });

    Children {
        core,
        registry,
        job_service,
        portal,
        chart_museum,
        scanner,
        notary_server,
        notary_signer,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use crate::api::cert_manager::IssuerRef;
    use crate::images::ImageStore;

    pub fn platform() -> Platform {
        let mut platform = Platform::new(
            "mini",
            PlatformSpec {
                version: "2.3.0".to_string(),
                public_url: "https://harbor.example.com/".to_string(),
                admin_password_secret: "admin".to_string(),
                certificate_issuer_ref: IssuerRef {
                    name: "selfsigned".to_string(),
                    kind: "Issuer".to_string(),
                    group: None,
                },
                database_secret: "harbor-db".to_string(),
                redis_secret: "harbor-redis".to_string(),
                priority: Some("harbor-critical".to_string()),
                ..Default::default()
            },
        );
        platform.metadata.namespace = Some("registry".to_string());
        platform.metadata.uid = Some("0a6c3c0e-0000-4000-8000-000000000001".to_string());
        platform
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(CLASS_ANNOTATION.to_string(), "blue".to_string());
        platform
    }

    fn full_platform() -> Platform {
        let mut p = platform();
        p.spec.components.chart_museum = Some(PlatformChartMuseumSpec::default());
        p.spec.components.clair = Some(PlatformClairSpec::default());
        p.spec.components.notary = Some(PlatformNotarySpec {
            public_url: "https://notary.example.com".to_string(),
            ..Default::default()
        });
        p
    }

    fn names_of(objects: &[DesiredObject], kind: ManifestKind) -> Vec<String> {
        objects
            .iter()
            .filter(|o| o.kind() == kind)
            .map(|o| o.name())
            .collect()
    }

    #[test]
    fn minimal_platform_has_mandatory_children_only() {
        let plan = render(&platform());
        assert!(plan.children.chart_museum.is_none());
        assert!(plan.children.scanner.is_none());
        assert!(plan.children.notary_server.is_none());
        assert!(plan.children.notary_signer.is_none());

        assert_eq!(
            names_of(&plan.objects, ManifestKind::Secret),
            vec![
                "mini-core-secret",
                "mini-jobservice-secret",
                "mini-registry-http",
                "mini-encryption-key",
                "mini-csrf-key"
            ]
        );
        assert_eq!(names_of(&plan.objects, ManifestKind::Certificate), vec!["mini-token"]);
        assert_eq!(names_of(&plan.objects, ManifestKind::Ingress), vec!["mini-core"]);
        assert!(plan
            .objects
            .iter()
            .filter(|o| o.kind() == ManifestKind::Secret)
            .all(|o| o.policy == Policy::CreateOnly));
    }

    #[test]
    fn full_platform_enables_optional_children() {
        let plan = render(&full_platform());
        let children = &plan.children;
        assert!(children.chart_museum.is_some());
        assert_eq!(
            children.scanner.as_ref().unwrap().spec.vulnerability_sources.len(),
            4
        );
        assert_eq!(
            children.notary_server.as_ref().unwrap().spec.signer_url,
            "https://mini-notary-signer:7899"
        );
        assert_eq!(children.core.spec.notary_url.as_deref(), Some("http://mini-notary-server:4443"));
        assert_eq!(children.core.spec.clair_adapter_url.as_deref(), Some("http://mini-clair:8080"));
        assert_eq!(
            names_of(&plan.objects, ManifestKind::Certificate),
            vec!["mini-token", "mini-notary"]
        );
        assert_eq!(
            names_of(&plan.objects, ManifestKind::Ingress),
            vec!["mini-core", "mini-notary"]
        );
    }

    #[test]
    fn children_inherit_identity_priority_and_class() {
        let plan = render(&platform());
        let core = &plan.children.core;
        assert_eq!(core.metadata.name.as_deref(), Some("mini"));
        assert_eq!(core.metadata.namespace.as_deref(), Some("registry"));
        assert_eq!(
            core.annotations().get(CLASS_ANNOTATION).map(String::as_str),
            Some("blue")
        );
        let owner = &core.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Platform");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(
            core.spec.component.priority_class_name.as_deref(),
            Some("harbor-critical")
        );
        assert_eq!(core.spec.public_url, "https://harbor.example.com");
        assert_eq!(core.spec.token_expiration, 30);
    }

    #[test]
    fn explicit_component_priority_wins() {
        let mut p = platform();
        p.spec.components.portal.priority_class_name = Some("low".to_string());
        let plan = render(&p);
        assert_eq!(
            plan.children.portal.spec.component.priority_class_name.as_deref(),
            Some("low")
        );
    }

    #[test]
    fn urls_config_map_points_at_public_url_and_core() {
        let plan = render(&platform());
        let Manifest::ConfigMap(cm) = &plan.objects[0].manifest else {
            panic!("urls config map comes first");
        };
        let data = cm.data.as_ref().unwrap();
        assert_eq!(data["REGISTRY_HTTP_HOST"], "https://harbor.example.com");
        assert_eq!(
            data["REGISTRY_AUTH_TOKEN_REALM"],
            "https://harbor.example.com/service/token"
        );
        assert_eq!(data["CORE_URL"], "http://mini-core");
    }

    #[test]
    fn children_render_with_default_images() {
        let images = ImageStore::with_defaults(None).unwrap();
        let ctx = RenderContext { images: &images };
        let children = render(&full_platform()).children;
        assert!(children.core.render(&ctx).is_ok());
        assert!(children.registry.render(&ctx).is_ok());
        assert!(children.job_service.render(&ctx).is_ok());
        assert!(children.portal.render(&ctx).is_ok());
        assert!(children.chart_museum.unwrap().render(&ctx).is_ok());
        assert!(children.scanner.unwrap().render(&ctx).is_ok());
        assert!(children.notary_server.unwrap().render(&ctx).is_ok());
        assert!(children.notary_signer.unwrap().render(&ctx).is_ok());
    }

    #[test]
    fn redis_secret_is_read_through_url_and_namespace_only() {
        let mut p = full_platform();
        p.spec.components.registry.cache = true;
        p.spec.components.chart_museum = Some(PlatformChartMuseumSpec {
            cache: true,
            ..Default::default()
        });
        let images = ImageStore::with_defaults(None).unwrap();
        let ctx = RenderContext { images: &images };
        let children = render(&p).children;

        let mut objects = children.registry.render(&ctx).unwrap();
        objects.extend(children.chart_museum.unwrap().render(&ctx).unwrap());
        objects.extend(children.job_service.render(&ctx).unwrap());
        objects.extend(children.scanner.unwrap().render(&ctx).unwrap());

        let mut keys = BTreeSet::new();
        for object in &objects {
            let Manifest::Deployment(deployment) = &object.manifest else {
                continue;
            };
            let pod = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
            let containers = pod.containers.iter().chain(pod.init_containers.iter().flatten());
            for var in containers.flat_map(|c| c.env.iter().flatten()) {
                if let Some(selector) = var.value_from.as_ref().and_then(|v| v.secret_key_ref.as_ref()) {
                    if selector.name == "harbor-redis" {
                        keys.insert(selector.key.clone());
                    }
                }
            }
            for volume in pod.volumes.iter().flatten() {
                let Some(secret) = &volume.secret else { continue };
                if secret.secret_name.as_deref() == Some("harbor-redis") {
                    let items = secret.items.as_ref().expect("redis volume projects explicit keys");
                    keys.extend(items.iter().map(|i| i.key.clone()));
                }
            }
        }
        assert_eq!(
            keys,
            BTreeSet::from(["namespace".to_string(), "url".to_string()])
        );
    }

    #[test]
    fn generated_values_are_alphanumeric() {
        let value = random_string(32);
        assert_eq!(value.len(), 32);
        assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
