//! Digests pinning the content of ConfigMaps and Secrets into pod templates.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::render::DependencyKey;
use crate::util::errors::Result;

/// Digest recorded for a dependency that does not exist.
pub const ABSENT: &str = "absent";

fn sha256_hex(parts: impl IntoIterator<Item = (String, Vec<u8>)>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in parts {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(&value);
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

pub fn config_map_digest(config_map: &ConfigMap) -> String {
    let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for (key, value) in config_map.data.iter().flatten() {
        entries.insert(key.clone(), value.as_bytes().to_vec());
    }
    for (key, value) in config_map.binary_data.iter().flatten() {
        entries.insert(key.clone(), value.0.clone());
    }
    sha256_hex(entries)
}

pub fn secret_digest(secret: &Secret) -> String {
    let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for (key, value) in secret.data.iter().flatten() {
        entries.insert(key.clone(), value.0.clone());
    }
    for (key, value) in secret.string_data.iter().flatten() {
        entries.insert(key.clone(), value.as_bytes().to_vec());
    }
    sha256_hex(entries)
}

/// Combines per-dependency digests in key order into the annotation value.
pub fn combine(digests: &BTreeMap<DependencyKey, String>) -> String {
    sha256_hex(
        digests
            .iter()
            .map(|(key, digest)| (key.to_string(), digest.as_bytes().to_vec())),
    )
}

/// Hex sha-256 of the JSON encoding of `value`.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    fn config_map(value: &str) -> ConfigMap {
        ConfigMap {
            data: Some(BTreeMap::from([("config.yml".to_string(), value.to_string())])),
            ..Default::default()
        }
    }

    #[test]
    fn digest_tracks_content_only() {
        let mut a = config_map("port: 80");
        let b = config_map("port: 80");
        a.metadata.name = Some("renamed".to_string());
        assert_eq!(config_map_digest(&a), config_map_digest(&b));
        assert_ne!(config_map_digest(&a), config_map_digest(&config_map("port: 81")));
    }

    #[test]
    fn secret_data_and_string_data_agree() {
        let bytes = Secret {
            data: Some(BTreeMap::from([(
                "secret".to_string(),
                ByteString(b"s3cr3t".to_vec()),
            )])),
            ..Default::default()
        };
        let text = Secret {
            string_data: Some(BTreeMap::from([("secret".to_string(), "s3cr3t".to_string())])),
            ..Default::default()
        };
        assert_eq!(secret_digest(&bytes), secret_digest(&text));
    }

    #[test]
    fn combined_digest_is_order_independent_and_sensitive() {
        let mut first = BTreeMap::new();
        first.insert(DependencyKey::secret("b"), "2".to_string());
        first.insert(DependencyKey::config_map("a"), "1".to_string());

        let mut second = BTreeMap::new();
        second.insert(DependencyKey::config_map("a"), "1".to_string());
        second.insert(DependencyKey::secret("b"), "2".to_string());
        assert_eq!(combine(&first), combine(&second));

        second.insert(DependencyKey::secret("b"), ABSENT.to_string());
        assert_ne!(combine(&first), combine(&second));
    }

    #[test]
    fn fingerprint_follows_json_content() {
        let a = fingerprint(&serde_json::json!({"auth_mode": "oidc_auth"})).unwrap();
        let b = fingerprint(&serde_json::json!({"auth_mode": "oidc_auth"})).unwrap();
        let c = fingerprint(&serde_json::json!({"auth_mode": "db_auth"})).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
