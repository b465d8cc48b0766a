use std::str::FromStr;
use std::time::Duration;

use crate::util::errors::{Result, StdError};

pub const CLASS_ENV: &str = "HARBOR_CLASSNAME";
pub const CONCURRENCY_ENV: &str = "HARBOR_CONTROLLER_CONCURRENCY";
pub const REQUEUE_PERIOD_ENV: &str = "HARBOR_REQUEUE_PERIOD_SECONDS";
pub const IMAGE_REGISTRY_ENV: &str = "HARBOR_IMAGE_REGISTRY";
pub const METRICS_ADDR_ENV: &str = "HARBOR_METRICS_ADDR";

/// Runtime settings of the operator process, read once at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Only CRs annotated with this class are reconciled; empty matches unannotated CRs.
    pub class_name: String,
    /// Parallel reconciles per controller.
    pub concurrency: u16,
    /// Period between verifications of healthy resources.
    pub requeue_period: Duration,
    /// Optional registry prefix replacing `docker.io` in default images.
    pub image_registry: Option<String>,
    pub metrics_addr: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            class_name: String::new(),
            concurrency: 1,
            requeue_period: Duration::from_secs(5 * 60),
            image_registry: None,
            metrics_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            class_name: lookup(CLASS_ENV).unwrap_or(defaults.class_name),
            concurrency: parse_or(&lookup, CONCURRENCY_ENV, defaults.concurrency)?,
            requeue_period: Duration::from_secs(parse_or(
                &lookup,
                REQUEUE_PERIOD_ENV,
                defaults.requeue_period.as_secs(),
            )?),
            image_registry: lookup(IMAGE_REGISTRY_ENV).filter(|v| !v.is_empty()),
            metrics_addr: lookup(METRICS_ADDR_ENV).unwrap_or(defaults.metrics_addr),
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| StdError::InvalidArgument(format!("{key}={raw}: {e}")).into()),
    }
}
