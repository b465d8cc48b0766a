//! Ingress objects exposing core, portal, registry and notary on the public URLs.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressServiceBackend,
    IngressSpec, IngressTLS, ServiceBackendPort,
};

use super::*;

/// Host part of a public URL, without scheme, port or path.
pub fn url_host(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = rest.split('/').next().unwrap_or_default();
    authority
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(authority)
        .to_string()
}

pub struct IngressParams<'a> {
    pub public_url: &'a str,
    pub tls_secret: Option<&'a str>,
    pub class_name: Option<&'a str>,
}

fn path(prefix: &str, service: &str, port: &str) -> HTTPIngressPath {
    HTTPIngressPath {
        path: Some(prefix.to_string()),
        path_type: "Prefix".to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: service.to_string(),
                port: Some(ServiceBackendPort {
                    name: Some(port.to_string()),
                    number: None,
                }),
            }),
            ..Default::default()
        },
    }
}

fn ingress(mut meta: ObjectMeta, params: &IngressParams, paths: Vec<HTTPIngressPath>) -> Ingress {
    let host = url_host(params.public_url);
    let mut annotations = BTreeMap::from([(
        "nginx.ingress.kubernetes.io/proxy-body-size".to_string(),
        "0".to_string(),
    )]);
    if params.tls_secret.is_some() {
        annotations.insert(
            "nginx.ingress.kubernetes.io/ssl-redirect".to_string(),
            "true".to_string(),
        );
    }
    meta.annotations = Some(annotations);

    Ingress {
        metadata: meta,
        spec: Some(IngressSpec {
            ingress_class_name: params.class_name.map(String::from),
            tls: params.tls_secret.map(|secret| {
                vec![IngressTLS {
                    hosts: Some(vec![host.clone()]),
                    secret_name: Some(secret.to_string()),
                }]
            }),
            rules: Some(vec![IngressRule {
                host: Some(host),
                http: Some(HTTPIngressRuleValue { paths }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Services backing the main ingress.
pub struct CoreBackends<'a> {
    pub core: &'a str,
    pub portal: &'a str,
    pub registry: &'a str,
    pub with_chartmuseum: bool,
}

/// Routes the API, token service and registry v2 API to their services and
/// everything else to the portal.
pub fn core_ingress(meta: ObjectMeta, params: &IngressParams, backends: &CoreBackends) -> Ingress {
    let mut paths = vec![
        path("/api/", backends.core, "http"),
        path("/service/", backends.core, "http"),
        path("/v2", backends.registry, "http"),
        path("/c/", backends.core, "http"),
    ];
    if backends.with_chartmuseum {
        paths.push(path("/chartrepo/", backends.core, "http"));
    }
    paths.push(path("/", backends.portal, "http"));
    ingress(meta, params, paths)
}

pub fn notary_ingress(meta: ObjectMeta, params: &IngressParams, notary_service: &str) -> Ingress {
    ingress(meta, params, vec![path("/", notary_service, "https")])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ObjectMeta {
        ObjectMeta {
            name: Some("harbor-core".to_string()),
            namespace: Some("registry".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn host_is_extracted_from_url() {
        assert_eq!(url_host("https://harbor.example.com"), "harbor.example.com");
        assert_eq!(url_host("http://harbor.example.com:8080/path"), "harbor.example.com");
        assert_eq!(url_host("harbor.local"), "harbor.local");
    }

    #[test]
    fn core_ingress_routes_by_prefix() {
        let params = IngressParams {
            public_url: "https://harbor.example.com",
            tls_secret: Some("harbor-tls"),
            class_name: Some("nginx"),
        };
        let backends = CoreBackends {
            core: "harbor-core",
            portal: "harbor-portal",
            registry: "harbor-registry",
            with_chartmuseum: false,
        };
        let ingress = core_ingress(meta(), &params, &backends);
        let spec = ingress.spec.unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
        assert_eq!(spec.tls.unwrap()[0].secret_name.as_deref(), Some("harbor-tls"));

        let rule = &spec.rules.unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("harbor.example.com"));
        let routes: Vec<(String, String)> = rule
            .http
            .as_ref()
            .unwrap()
            .paths
            .iter()
            .map(|p| {
                (
                    p.path.clone().unwrap(),
                    p.backend.service.as_ref().unwrap().name.clone(),
                )
            })
            .collect();
        assert!(routes.contains(&("/v2".to_string(), "harbor-registry".to_string())));
        assert!(routes.contains(&("/api/".to_string(), "harbor-core".to_string())));
        assert_eq!(routes.last().unwrap(), &("/".to_string(), "harbor-portal".to_string()));
        assert!(!routes.iter().any(|(p, _)| p == "/chartrepo/"));
    }

    #[test]
    fn plain_http_has_no_tls_section() {
        let params = IngressParams {
            public_url: "http://notary.example.com",
            tls_secret: None,
            class_name: None,
        };
        let ingress = notary_ingress(meta(), &params, "harbor-notary-server");
        let spec = ingress.spec.unwrap();
        assert!(spec.tls.is_none());
        assert!(spec.ingress_class_name.is_none());
        let annotations = ingress.metadata.annotations.unwrap();
        assert!(!annotations.contains_key("nginx.ingress.kubernetes.io/ssl-redirect"));
    }

    #[test]
    fn notary_ingress_routes_everything_to_the_server() {
        let params = IngressParams {
            public_url: "https://notary.example.com",
            tls_secret: Some("notary-tls"),
            class_name: None,
        };
        let ingress = notary_ingress(meta(), &params, "harbor-notary-server");
        assert_json_diff::assert_json_include!(
            actual: serde_json::to_value(&ingress).unwrap(),
            expected: serde_json::json!({
                "spec": {
                    "tls": [{"hosts": ["notary.example.com"], "secretName": "notary-tls"}],
                    "rules": [{
                        "host": "notary.example.com",
                        "http": {"paths": [{
                            "path": "/",
                            "pathType": "Prefix",
                            "backend": {"service": {"name": "harbor-notary-server", "port": {"name": "https"}}}
                        }]}
                    }]
                }
            })
        );
    }
}
