//! Default container images per component and version.

use std::collections::HashMap;
use std::sync::RwLock;

use semver::{Version, VersionReq};
use tracing::debug;

use crate::util::errors::{Result, StdError};

pub const CORE: &str = "core";
pub const REGISTRY: &str = "registry";
pub const REGISTRY_CONTROLLER: &str = "registryctl";
pub const JOB_SERVICE: &str = "jobservice";
pub const PORTAL: &str = "portal";
pub const CHART_MUSEUM: &str = "chartmuseum";
pub const CLAIR: &str = "clair";
pub const CLAIR_ADAPTER: &str = "clair-adapter";
pub const NOTARY_SERVER: &str = "notary-server";
pub const NOTARY_SIGNER: &str = "notary-signer";
pub const NOTARY_MIGRATE: &str = "notary-migrate";

/// Image of the init containers materializing configuration templates.
pub const CONFIG_INIT_IMAGE: &str = "busybox:1.32.0";

const VERSION_PLACEHOLDER: &str = "{{version}}";

#[derive(Clone, Debug)]
struct ImageEntry {
    range: VersionReq,
    template: String,
}

/// Ordered `(version range, image template)` entries per component.
///
/// Entries are registered at startup and read by every render afterwards.
#[derive(Debug, Default)]
pub struct ImageStore {
    entries: RwLock<HashMap<String, Vec<ImageEntry>>>,
    /// Registry replacing the implicit `docker.io` of default images.
    registry: Option<String>,
}

impl ImageStore {
    pub fn new(registry: Option<String>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            registry: registry.map(|r| r.trim_end_matches('/').to_string()),
        }
    }

    /// Store pre-filled with the images of the supported Harbor releases.
    pub fn with_defaults(registry: Option<String>) -> Result<Self> {
        let store = Self::new(registry);
        let defaults: &[(&str, &str, &str)] = &[
            (CORE, ">=1.10.0, <3.0.0", "goharbor/harbor-core:v{{version}}"),
            (REGISTRY, "~1.10", "goharbor/registry-photon:v2.7.1-patch-2819-2553-v{{version}}"),
            (REGISTRY, ">=2.0.0, <3.0.0", "goharbor/registry-photon:v{{version}}"),
            (REGISTRY_CONTROLLER, ">=1.10.0, <3.0.0", "goharbor/harbor-registryctl:v{{version}}"),
            (JOB_SERVICE, ">=1.10.0, <3.0.0", "goharbor/harbor-jobservice:v{{version}}"),
            (PORTAL, ">=1.10.0, <3.0.0", "goharbor/harbor-portal:v{{version}}"),
            (CHART_MUSEUM, "~1.10", "goharbor/chartmuseum-photon:v0.9.0-v{{version}}"),
            (CHART_MUSEUM, ">=2.0.0, <3.0.0", "goharbor/chartmuseum-photon:v{{version}}"),
            (CLAIR, "~1.10", "goharbor/clair-photon:v2.1.1-v{{version}}"),
            (CLAIR, ">=2.0.0, <3.0.0", "goharbor/clair-photon:v{{version}}"),
            (CLAIR_ADAPTER, "~1.10", "goharbor/clair-adapter-photon:v1.0.1-v{{version}}"),
            (CLAIR_ADAPTER, ">=2.0.0, <3.0.0", "goharbor/clair-adapter-photon:v{{version}}"),
            (NOTARY_SERVER, "~1.10", "goharbor/notary-server-photon:v0.6.1-v{{version}}"),
            (NOTARY_SERVER, ">=2.0.0, <3.0.0", "goharbor/notary-server-photon:v{{version}}"),
            (NOTARY_SIGNER, "~1.10", "goharbor/notary-signer-photon:v0.6.1-v{{version}}"),
            (NOTARY_SIGNER, ">=2.0.0, <3.0.0", "goharbor/notary-signer-photon:v{{version}}"),
            (NOTARY_MIGRATE, ">=1.10.0, <3.0.0", "migrate/migrate:v4.11.0"),
        ];
        for (component, range, template) in defaults {
            store.register(component, range, template)?;
        }
        Ok(store)
    }

    /// Appends an entry; earlier entries win when ranges overlap.
    pub fn register(&self, component: &str, range: &str, template: &str) -> Result<()> {
        let range = VersionReq::parse(range)
            .map_err(|e| StdError::InvalidArgument(format!("version range {range:?}: {e}")))?;
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .entry(component.to_string())
            .or_default()
            .push(ImageEntry {
                range,
                template: template.to_string(),
            });
        Ok(())
    }

    /// Full image reference of `component` at `version`.
    pub fn get_image(&self, component: &str, version: &str) -> Result<String> {
        let parsed = Version::parse(version)
            .map_err(|e| StdError::InvalidArgument(format!("version {version:?}: {e}")))?;
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = entries
            .get(component)
            .and_then(|list| list.iter().find(|entry| entry.range.matches(&parsed)))
            .ok_or_else(|| StdError::UnsupportedVersion {
                component: component.to_string(),
                version: version.to_string(),
            })?;

        let image = self.mirror(&entry.template.replace(VERSION_PLACEHOLDER, version));
        debug!(component, version, %image, "resolved default image");
        Ok(image)
    }

    /// Image from the spec when set, otherwise the default for `version`.
    pub fn resolve(&self, explicit: Option<&str>, component: &str, version: &str) -> Result<String> {
        match explicit {
            Some(image) if !image.is_empty() => Ok(image.to_string()),
            _ => self.get_image(component, version),
        }
    }

    /// Prefixes images pulled from Docker Hub with the configured registry.
    pub fn mirror(&self, image: &str) -> String {
        let Some(registry) = &self.registry else {
            return image.to_string();
        };
        let first = image.split('/').next().unwrap_or_default();
        let explicit_registry = image.contains('/')
            && (first.contains('.') || first.contains(':') || first == "localhost");
        if explicit_registry {
            image.to_string()
        } else {
            format!("{registry}/{image}")
        }
    }
}
