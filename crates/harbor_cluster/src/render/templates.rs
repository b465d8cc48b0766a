//! Configuration templates bundled into the binary.
//!
//! Placeholders use the `{{NAME}}` form. Values known at render time are filled
//! by the renderer; the rest are substituted by the config init container from
//! its environment.

/// Configuration template of one component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Template {
    /// File name inside the ConfigMap and the rendered config volume.
    pub file: &'static str,
    pub content: &'static str,
}

pub const CORE: Template = Template {
    file: "app.conf",
    content: include_str!("../../templates/core-app.conf"),
};

pub const REGISTRY: Template = Template {
    file: "config.yml",
    content: include_str!("../../templates/registry-config.yml"),
};

pub const REGISTRY_CONTROLLER: Template = Template {
    file: "registryctl.yml",
    content: include_str!("../../templates/registryctl-config.yml"),
};

pub const JOB_SERVICE: Template = Template {
    file: "config.yml",
    content: include_str!("../../templates/jobservice-config.yml"),
};

pub const NOTARY_SERVER: Template = Template {
    file: "server.json",
    content: include_str!("../../templates/notary-server.json"),
};

pub const NOTARY_SIGNER: Template = Template {
    file: "signer.json",
    content: include_str!("../../templates/notary-signer.json"),
};

pub const CLAIR: Template = Template {
    file: "config.yaml",
    content: include_str!("../../templates/clair-config.yaml"),
};

impl Template {
    /// Replaces the given placeholders, leaving the others for the init container.
    pub fn fill(&self, values: &[(&str, String)]) -> String {
        values
            .iter()
            .fold(self.content.to_string(), |acc, (key, value)| {
                acc.replace(&placeholder(key), value)
            })
    }

    /// Placeholders still present in `content`, in order of first appearance.
    pub fn placeholders(content: &str) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let mut rest = content;
        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else { break };
            let name = after[..end].to_string();
            if !found.contains(&name) {
                found.push(name);
            }
            rest = &after[end + 2..];
        }
        found
    }
}

pub fn placeholder(key: &str) -> String {
    format!("{{{{{key}}}}}")
}
