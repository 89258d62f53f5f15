//! Platform configuration
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! `STRATA_*` environment variables. The result is validated once and
//! consumed by [`crate::topology`] to materialize descriptors.

use crate::error::PlatformError;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "STRATA_";

/// Three /19 private plus three /22 public subnets need at least a /17.
const MAX_VPC_PREFIX: u8 = 17;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlatformConfig {
    pub region: String,
    pub cluster_name: String,
    pub k8s_version: String,
    pub node_instance_type: String,
    pub desired_capacity: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub vpc_cidr: String,
    pub letsencrypt_email: String,
    pub readiness: ReadinessConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            region: "us-west-2".into(),
            cluster_name: "microservices-cluster".into(),
            k8s_version: "1.31".into(),
            node_instance_type: "t3.large".into(),
            desired_capacity: 3,
            min_size: 2,
            max_size: 6,
            vpc_cidr: "10.0.0.0/16".into(),
            letsencrypt_email: "admin@example.com".into(),
            readiness: ReadinessConfig::default(),
        }
    }
}

/// Readiness budgets applied to the generated descriptors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessConfig {
    /// First poll interval; grows by 1.5x up to 30s
    pub poll_interval_ms: u64,
    /// Network, cluster and node pool
    pub infrastructure_timeout_secs: u64,
    /// Helm releases and manifests
    pub release_timeout_secs: u64,
    /// Fixed settle time for network policies
    pub policy_settle_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            infrastructure_timeout_secs: 1_800,
            release_timeout_secs: 600,
            policy_settle_ms: 2_000,
        }
    }
}

impl ReadinessConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn infrastructure_timeout(&self) -> Duration {
        Duration::from_secs(self.infrastructure_timeout_secs)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_secs(self.release_timeout_secs)
    }

    pub fn policy_settle(&self) -> Duration {
        Duration::from_millis(self.policy_settle_ms)
    }
}

impl PlatformConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, PlatformError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        tracing::debug!(?config, "platform configuration loaded");
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, PlatformError> {
        let content = std::fs::read_to_string(path).map_err(|source| PlatformError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            PlatformError::Parse { source, .. } => PlatformError::Parse {
                path: Some(path.to_path_buf()),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, PlatformError> {
        toml::from_str(content).map_err(|source| PlatformError::Parse { path: None, source })
    }

    /// Overlay `STRATA_<FIELD>` values returned by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), PlatformError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |field: &str| lookup(&format!("{ENV_PREFIX}{}", field.to_uppercase()));
        let number = |field: &str| -> Result<Option<u32>, PlatformError> {
            var(field)
                .map(|raw| {
                    raw.trim().parse::<u32>().map_err(|_| PlatformError::Invalid {
                        field: field.to_string(),
                        reason: format!("`{raw}` is not a non-negative integer"),
                    })
                })
                .transpose()
        };

        for (field, slot) in [
            ("region", &mut self.region),
            ("cluster_name", &mut self.cluster_name),
            ("k8s_version", &mut self.k8s_version),
            ("node_instance_type", &mut self.node_instance_type),
            ("vpc_cidr", &mut self.vpc_cidr),
            ("letsencrypt_email", &mut self.letsencrypt_email),
        ] {
            if let Some(value) = var(field) {
                *slot = value;
            }
        }
        if let Some(n) = number("desired_capacity")? {
            self.desired_capacity = n;
        }
        if let Some(n) = number("min_size")? {
            self.min_size = n;
        }
        if let Some(n) = number("max_size")? {
            self.max_size = n;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PlatformError> {
        let invalid = |field: &str, reason: String| PlatformError::Invalid {
            field: field.to_string(),
            reason,
        };

        for (field, value) in [
            ("region", &self.region),
            ("node_instance_type", &self.node_instance_type),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(field, "must not be empty".into()));
            }
        }

        if !valid_cluster_name(&self.cluster_name) {
            return Err(invalid(
                "cluster_name",
                format!(
                    "`{}` must start with a letter or digit and use only [A-Za-z0-9_-]",
                    self.cluster_name
                ),
            ));
        }

        if !valid_version(&self.k8s_version) {
            return Err(invalid(
                "k8s_version",
                format!("`{}` is not of the form MAJOR.MINOR", self.k8s_version),
            ));
        }

        if self.min_size == 0 {
            return Err(invalid("min_size", "at least one node is required".into()));
        }
        if !(self.min_size <= self.desired_capacity && self.desired_capacity <= self.max_size) {
            return Err(invalid(
                "desired_capacity",
                format!(
                    "node counts must satisfy min <= desired <= max (got {}/{}/{})",
                    self.min_size, self.desired_capacity, self.max_size
                ),
            ));
        }

        let (_, prefix) = parse_cidr(&self.vpc_cidr).map_err(|reason| invalid("vpc_cidr", reason))?;
        if prefix > MAX_VPC_PREFIX {
            return Err(invalid(
                "vpc_cidr",
                format!("/{prefix} is too small for the subnet layout, use /{MAX_VPC_PREFIX} or larger"),
            ));
        }

        if !valid_email(&self.letsencrypt_email) {
            return Err(invalid(
                "letsencrypt_email",
                format!("`{}` is not an email address", self.letsencrypt_email),
            ));
        }

        let r = &self.readiness;
        if r.poll_interval_ms == 0 || r.infrastructure_timeout_secs == 0 || r.release_timeout_secs == 0 {
            return Err(invalid(
                "readiness",
                "poll interval and timeouts must be positive".into(),
            ));
        }
        if r.policy_settle() >= r.release_timeout() {
            return Err(invalid(
                "readiness.policy_settle_ms",
                "must be shorter than the release timeout".into(),
            ));
        }
        Ok(())
    }

    /// Availability zones used for the subnet layout
    pub fn availability_zones(&self) -> Vec<String> {
        ["a", "b", "c"]
            .iter()
            .map(|suffix| format!("{}{suffix}", self.region))
            .collect()
    }
}

/// Parse `a.b.c.d/p`, rejecting host bits set below the prefix.
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), String> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| format!("`{cidr}` is missing a /prefix"))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| format!("`{addr}` is not an IPv4 address"))?;
    let prefix: u8 = prefix
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| format!("`{prefix}` is not a prefix length between 0 and 32"))?;
    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    if u32::from(addr) & !mask != 0 {
        return Err(format!("`{cidr}` has host bits set"));
    }
    Ok((addr, prefix))
}

fn valid_cluster_name(name: &str) -> bool {
    name.len() <= 100
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn valid_version(version: &str) -> bool {
    match version.split_once('.') {
        Some((major, minor)) => {
            [major, minor]
                .iter()
                .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
        }
        None => false,
    }
}

fn valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain
            .split('.')
            .filter(|label| !label.is_empty())
            .count()
            >= 2
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = PlatformConfig::default();
        config.validate().unwrap();
        assert_eq!(config.region, "us-west-2");
        assert_eq!(config.cluster_name, "microservices-cluster");
        assert_eq!(
            (config.min_size, config.desired_capacity, config.max_size),
            (2, 3, 6)
        );
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = PlatformConfig::from_toml(
            r#"
            cluster_name = "staging"
            desired_capacity = 4

            [readiness]
            poll_interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.cluster_name, "staging");
        assert_eq!(config.desired_capacity, 4);
        assert_eq!(config.k8s_version, "1.31");
        assert_eq!(config.readiness.poll_interval_ms, 250);
        assert_eq!(config.readiness.release_timeout_secs, 600);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = PlatformConfig::from_toml("clustr_name = \"typo\"").unwrap_err();
        assert!(matches!(err, PlatformError::Parse { .. }));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = PlatformConfig::from_toml("region = \"eu-west-1\"").unwrap();
        config
            .apply_env(env(&[
                ("STRATA_REGION", "eu-central-1"),
                ("STRATA_MAX_SIZE", "9"),
                ("STRATA_LETSENCRYPT_EMAIL", "ops@corp.io"),
            ]))
            .unwrap();
        assert_eq!(config.region, "eu-central-1");
        assert_eq!(config.max_size, 9);
        assert_eq!(config.letsencrypt_email, "ops@corp.io");
    }

    #[test]
    fn env_numbers_must_parse() {
        let mut config = PlatformConfig::default();
        let err = config
            .apply_env(env(&[("STRATA_MIN_SIZE", "two")]))
            .unwrap_err();
        assert!(err.to_string().contains("min_size"));
    }

    #[test]
    fn node_bounds_are_checked() {
        let config = PlatformConfig {
            min_size: 4,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("4/3/6"), "{err}");
    }

    #[test]
    fn cidr_validation() {
        assert_eq!(
            parse_cidr("10.0.0.0/16").unwrap(),
            (Ipv4Addr::new(10, 0, 0, 0), 16)
        );
        assert!(parse_cidr("10.0.0.0").is_err());
        assert!(parse_cidr("10.0.0.300/16").is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("10.0.1.0/16").is_err());

        let small = PlatformConfig {
            vpc_cidr: "10.0.0.0/24".into(),
            ..Default::default()
        };
        assert!(small.validate().unwrap_err().to_string().contains("/24"));
    }

    #[test]
    fn names_and_email_shape() {
        for name in ["", "-leading", "has space", "slash/name"] {
            let config = PlatformConfig {
                cluster_name: name.into(),
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{name:?} accepted");
        }
        for email in ["admin", "@example.com", "a@b", "a@@b.com", "a b@c.com", "a@.com"] {
            let config = PlatformConfig {
                letsencrypt_email: email.into(),
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{email:?} accepted");
        }
    }

    #[test]
    fn version_shape() {
        assert!(valid_version("1.31"));
        assert!(!valid_version("1"));
        assert!(!valid_version("v1.31"));
        assert!(!valid_version("1."));
    }

    #[test]
    fn zones_follow_region() {
        let config = PlatformConfig {
            region: "eu-west-1".into(),
            ..Default::default()
        };
        assert_eq!(
            config.availability_zones(),
            vec!["eu-west-1a", "eu-west-1b", "eu-west-1c"]
        );
    }
}
