//! Docker image reference parsing.

use std::fmt;

pub const DEFAULT_REGISTRY: &str = "docker.io";
const OFFICIAL_NAMESPACE: &str = "library";

/// An image reference split into its registry and everything after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: String,
    /// Repository path with its tag and/or digest, e.g. `library/busybox:1.32.0`.
    pub remainder: String,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid image reference '{image}': {reason}")]
pub struct InvalidReference {
    pub image: String,
    pub reason: &'static str,
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.remainder)
    }
}

/// The first path component names a registry when it looks like a host.
fn is_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn valid_path_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        && component.starts_with(|c: char| c.is_ascii_alphanumeric())
}

impl ImageRef {
    pub fn parse(image: &str) -> Result<Self, InvalidReference> {
        let invalid = |reason| InvalidReference {
            image: image.to_string(),
            reason,
        };
        if image.is_empty() {
            return Err(invalid("empty"));
        }
        if image.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }

        let (registry, rest) = match image.split_once('/') {
            Some((first, rest)) if is_registry(first) => (first.to_string(), rest),
            _ => (DEFAULT_REGISTRY.to_string(), image),
        };

        // Digest first, then a tag on the last path component.
        let (named, digest) = match rest.split_once('@') {
            Some((named, digest)) => (named, Some(digest)),
            None => (rest, None),
        };
        if digest.is_some_and(|d| !d.contains(':')) {
            return Err(invalid("malformed digest"));
        }
        let (path, tag) = match named.rsplit_once(':') {
            Some((path, tag)) if !tag.contains('/') => (path, Some(tag)),
            _ => (named, None),
        };
        if tag.is_some_and(str::is_empty) {
            return Err(invalid("empty tag"));
        }
        if !path.split('/').all(valid_path_component) {
            return Err(invalid("malformed repository path"));
        }

        let remainder = if registry == DEFAULT_REGISTRY && !path.contains('/') {
            format!("{OFFICIAL_NAMESPACE}/{rest}")
        } else {
            rest.to_string()
        };
        Ok(Self { registry, remainder })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(image: &str) -> (String, String) {
        let parsed = ImageRef::parse(image).unwrap();
        (parsed.registry, parsed.remainder)
    }

    #[test]
    fn bare_names_default_to_docker_hub_library() {
        assert_eq!(
            parse("busybox:1.32.0"),
            ("docker.io".to_string(), "library/busybox:1.32.0".to_string())
        );
        assert_eq!(parse("nginx"), ("docker.io".to_string(), "library/nginx".to_string()));
    }

    #[test]
    fn namespaced_hub_images_keep_their_path() {
        assert_eq!(
            parse("bitnami/redis:7"),
            ("docker.io".to_string(), "bitnami/redis:7".to_string())
        );
    }

    #[test]
    fn explicit_registries_are_split_off() {
        assert_eq!(parse("quay.io/foo:1"), ("quay.io".to_string(), "foo:1".to_string()));
        assert_eq!(
            parse("localhost:5000/team/app@sha256:abc"),
            ("localhost:5000".to_string(), "team/app@sha256:abc".to_string())
        );
        assert_eq!(
            parse("docker.io/library/busybox"),
            ("docker.io".to_string(), "library/busybox".to_string())
        );
    }

    #[test]
    fn malformed_references_are_rejected() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("Busybox:1").is_err());
        assert!(ImageRef::parse("busybox:").is_err());
        assert!(ImageRef::parse("quay.io//foo").is_err());
        assert!(ImageRef::parse("busy box").is_err());
        assert!(ImageRef::parse("app@nodigest").is_err());
    }
}
