//! Image rewrite rules of the form `registryRegex=>project`.

use std::collections::HashMap;
use std::sync::RwLock;

use regex::Regex;

use crate::error::WebhookError;
use crate::image::ImageRef;

pub const WILDCARD: &str = "*";
const SEPARATOR: &str = "=>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub registry: String,
    pub project: String,
}

impl Rule {
    pub fn is_wildcard(&self) -> bool {
        self.registry == WILDCARD
    }
}

/// Parses one rule; a leading `- ` is accepted so rules can be written as a YAML list.
pub fn parse_rule(line: &str) -> Result<Rule, WebhookError> {
    let text = line.trim();
    let text = text.strip_prefix("- ").unwrap_or(text).trim();
    if text.matches(SEPARATOR).count() != 1 {
        return Err(WebhookError::BadRequest(format!(
            "rule '{line}' must contain exactly one '{SEPARATOR}'"
        )));
    }
    let (registry, project) = text
        .split_once(SEPARATOR)
        .map(|(r, p)| (r.trim(), p.trim()))
        .unwrap_or_default();
    if registry.is_empty() || project.is_empty() {
        return Err(WebhookError::BadRequest(format!("rule '{line}' has an empty side")));
    }
    Ok(Rule {
        registry: registry.to_string(),
        project: project.to_string(),
    })
}

/// Parses a rule list, one rule per non-blank line.
pub fn parse_rules(text: &str) -> Result<Vec<Rule>, WebhookError> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_rule)
        .collect()
}

/// A rule together with the host of the server it rewrites to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundRule {
    pub rule: Rule,
    pub server: String,
}

/// Compiled registry patterns, shared by every admission request.
#[derive(Default)]
pub struct RegexCache {
    compiled: RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    pub fn get(&self, pattern: &str) -> Result<Regex, WebhookError> {
        if let Some(regex) = self.compiled.read().ok().and_then(|c| c.get(pattern).cloned()) {
            return Ok(regex);
        }
        let regex = Regex::new(pattern)
            .map_err(|e| WebhookError::BadRequest(format!("invalid registry pattern '{pattern}': {e}")))?;
        if let Ok(mut compiled) = self.compiled.write() {
            compiled.insert(pattern.to_string(), regex.clone());
        }
        Ok(regex)
    }

    pub fn len(&self) -> usize {
        self.compiled.read().map(|c| c.len()).unwrap_or_default()
    }
}

/// Rewritten image for `image`, or `None` when no rule applies.
///
/// Rules are tried in order with the wildcard ones only after every other rule.
/// Images already served by one of the rule servers are left alone.
pub fn rewrite(image: &ImageRef, rules: &[BoundRule], cache: &RegexCache) -> Result<Option<String>, WebhookError> {
    if rules.iter().any(|r| r.server == image.registry) {
        return Ok(None);
    }
    for bound in rules.iter().filter(|r| !r.rule.is_wildcard()) {
        if cache.get(&bound.rule.registry)?.is_match(&image.registry) {
            return Ok(Some(target(bound, image)));
        }
    }
    Ok(rules
        .iter()
        .find(|r| r.rule.is_wildcard())
        .map(|bound| target(bound, image)))
}

fn target(bound: &BoundRule, image: &ImageRef) -> String {
    format!("{}/{}/{}", bound.server, bound.rule.project, image.remainder)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(rules: &str, server: &str) -> Vec<BoundRule> {
        parse_rules(rules)
            .unwrap()
            .into_iter()
            .map(|rule| BoundRule {
                rule,
                server: server.to_string(),
            })
            .collect()
    }

    fn rewritten(image: &str, rules: &[BoundRule]) -> Option<String> {
        rewrite(&ImageRef::parse(image).unwrap(), rules, &RegexCache::default()).unwrap()
    }

    #[test]
    fn rules_accept_yaml_list_items() {
        let rules = parse_rules("- docker.io=>mirror\n\n  quay\\.io => quay-proxy \n").unwrap();
        assert_eq!(
            rules,
            vec![
                Rule {
                    registry: "docker.io".to_string(),
                    project: "mirror".to_string()
                },
                Rule {
                    registry: "quay\\.io".to_string(),
                    project: "quay-proxy".to_string()
                },
            ]
        );
    }

    #[test]
    fn ill_formed_rules_are_bad_requests() {
        for line in ["docker.io", "a=>b=>c", "=>mirror", "docker.io=>"] {
            assert!(
                matches!(parse_rule(line), Err(WebhookError::BadRequest(_))),
                "{line} should be rejected"
            );
        }
    }

    #[test]
    fn hub_images_go_to_the_mirror_project() {
        let rules = bound("docker.io=>mirror", "harbor.example.com");
        assert_eq!(
            rewritten("busybox:1.32.0", &rules).as_deref(),
            Some("harbor.example.com/mirror/library/busybox:1.32.0")
        );
    }

    #[test]
    fn wildcard_only_applies_after_every_other_rule() {
        let rules = bound("*=>B\nquay.io=>A", "harbor.example.com");
        assert_eq!(
            rewritten("quay.io/foo:1", &rules).as_deref(),
            Some("harbor.example.com/A/foo:1")
        );
        assert_eq!(
            rewritten("gcr.io/x:1", &rules).as_deref(),
            Some("harbor.example.com/B/x:1")
        );
    }

    #[test]
    fn unmatched_and_local_images_stay() {
        let rules = bound("quay.io=>A", "harbor.example.com");
        assert_eq!(rewritten("gcr.io/x:1", &rules), None);

        let rules = bound("*=>B", "harbor.example.com");
        assert_eq!(rewritten("harbor.example.com/B/x:1", &rules), None);
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut rules = bound("docker.io=>first", "one.example.com");
        rules.extend(bound("docker.io=>second", "two.example.com"));
        assert_eq!(
            rewritten("nginx", &rules).as_deref(),
            Some("one.example.com/first/library/nginx")
        );
    }

    #[test]
    fn patterns_compile_once() {
        let cache = RegexCache::default();
        cache.get("docker.io").unwrap();
        cache.get("docker.io").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(matches!(cache.get("("), Err(WebhookError::BadRequest(_))));
    }
}
