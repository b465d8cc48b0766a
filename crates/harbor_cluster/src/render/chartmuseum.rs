use k8s_openapi::api::core::v1::{EnvFromSource, EnvVar, Volume, VolumeMount};

use super::*;
use crate::api::v1alpha1::ChartMuseum;
use crate::images;

pub const HTTP_PORT: i32 = 9999;

const STORAGE_VOLUME: &str = "chartmuseum-storage";
const LOCAL_STORAGE_DIR: &str = "/mnt/chartmuseum";
const ENTRYPOINT: &str = "/home/chart/entrypoint.sh";

impl Component for ChartMuseum {
    const COMPONENT: &'static str = "chartmuseum";

    fn component_status(&self) -> Option<&ComponentStatus> {
        self.status.as_ref()
    }

    fn render(&self, ctx: &RenderContext) -> Result<Vec<DesiredObject>> {
        let spec = &self.spec;
        let labels = self.selector_labels();
        let image = ctx
            .images
            .resolve(spec.component.image.as_deref(), images::CHART_MUSEUM, &spec.version)?;

        let (env, env_from, mounts, volumes) = self.storage();
        let chartmuseum = Container {
            command: spec.cache_secret.is_some().then(|| vec!["sh".to_string(), "-c".to_string()]),
            args: spec.cache_secret.is_some().then(|| vec![cache_entrypoint()]),
            ports: Some(vec![container_port("http", HTTP_PORT)]),
            env: Some(env),
            env_from: (!env_from.is_empty()).then_some(env_from),
            liveness_probe: Some(http_probe("/health", HTTP_PORT, Some(10))),
            readiness_probe: Some(http_probe("/health", HTTP_PORT, None)),
            volume_mounts: (!mounts.is_empty()).then_some(mounts),
            ..base_container("chartmuseum", &image, Some(&spec.component))
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
                pod_spec(&spec.component, vec![chartmuseum], vec![], volumes),
            )),
        ])
    }
}

/// Startup script exporting the cache settings split out of `CACHE_REDIS_URL`.
fn cache_entrypoint() -> String {
    let mut script = split_redis_url(r#""${CACHE_REDIS_URL}""#);
    script.push(
        r#"export CACHE_REDIS_ADDR="$REDIS_ADDR" CACHE_REDIS_PASSWORD="$REDIS_PASSWORD" CACHE_REDIS_DB="${REDIS_DB:-0}""#
            .to_string(),
    );
    script.push(format!("exec {ENTRYPOINT}"));
    script.join("\n")
}

impl ChartMuseum {
    fn storage(&self) -> (Vec<EnvVar>, Vec<EnvFromSource>, Vec<VolumeMount>, Vec<Volume>) {
        let spec = &self.spec;
        let mut vars = vec![
            env("PORT", HTTP_PORT),
            env("CHART_URL", format!("{}/chartrepo", spec.public_url.trim_end_matches('/'))),
            env("DEPTH", 1),
            env("ALLOW_OVERWRITE", true),
            env("DISABLE_API", false),
            env("AUTH_ANONYMOUS_GET", false),
            secret_env("BASIC_AUTH_USER", &spec.basic_auth_secret, "username"),
            secret_env("BASIC_AUTH_PASS", &spec.basic_auth_secret, "password"),
        ];
        let mut env_from = Vec::new();
        let mut mounts = Vec::new();
        let mut volumes = Vec::new();

        match &spec.storage_secret {
            Some(secret) => env_from.push(env_from_secret(secret, Some("STORAGE_"), false)),
            None => {
                vars.push(env("STORAGE", "local"));
                vars.push(env("STORAGE_LOCAL_ROOTDIR", LOCAL_STORAGE_DIR));
                mounts.push(mount(STORAGE_VOLUME, LOCAL_STORAGE_DIR, None));
                volumes.push(empty_dir_volume(STORAGE_VOLUME));
            }
        }

        if let Some(cache) = &spec.cache_secret {
            vars.extend([
                env("CACHE", "redis"),
                secret_env("CACHE_REDIS_URL", cache, "url"),
            ]);
        }

        (vars, env_from, mounts, volumes)
    }
}
