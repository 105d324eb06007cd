use std::{path::Path, time::Duration};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{util::file_read_sync, Error, Result};

pub const DEFAULT_SHADOW_BUFF: usize = 10;
pub const DEFAULT_SHADOW_MIN_BUFF: usize = 1;
pub const DEFAULT_INSTANCE_MAX_REQUESTS: usize = 100;
pub const DEFAULT_INSTANCE_MAX_ERROR: u32 = 10;
pub const DEFAULT_ERROR_COOLDOWN_MS: u64 = 5_000;
pub const DEFAULT_SHADOW_MAX_AGE_MS: u64 = 5 * 60 * 1_000;
pub const DEFAULT_SHADOW_GC_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_REFILL_PARALLELISM: usize = 4;
pub const DEFAULT_MAX_GLOBAL_INSTANCES: usize = 4096;
// 16 MiB
pub const DEFAULT_MEMORY: u64 = 16 * 1024 * 1024;
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_GENERATED_DOMAIN_REGEX: &str = r"^[^.]+\.g\.edgelake\.link$";

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

/// Warm instance pool tunables, handed to every pool manager at creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Instances created per refill signal.
    #[serde(default = "default_shadow_buff")]
    pub shadow_buff: usize,
    /// Refill is requested when fewer than this many instances remain queued.
    #[serde(default = "default_shadow_min_buff")]
    pub shadow_min_buff: usize,
    /// Queue capacity.
    #[serde(default = "default_instance_max_requests")]
    pub instance_max_requests: usize,
    /// Creation failures after which background refill stops for good.
    #[serde(default = "default_instance_max_error")]
    pub instance_max_error: u32,
    #[serde(default = "default_error_cooldown_ms")]
    pub error_cooldown_ms: u64,
    #[serde(default = "default_shadow_max_age_ms")]
    pub shadow_max_age_ms: u64,
    #[serde(default = "default_shadow_gc_interval_ms")]
    pub shadow_gc_interval_ms: u64,
    #[serde(default = "default_refill_parallelism")]
    pub refill_parallelism: usize,
    /// Pooled instances allowed across all functions of the node.
    #[serde(default = "default_max_global_instances")]
    pub max_global_instances: usize,
    /// Memory ceiling for functions that do not configure one, in bytes.
    #[serde(default = "default_memory")]
    pub default_memory: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub default_timeout_ms: u64,
}

define_const!(default_shadow_buff, DEFAULT_SHADOW_BUFF, usize);
define_const!(default_shadow_min_buff, DEFAULT_SHADOW_MIN_BUFF, usize);
define_const!(default_instance_max_requests, DEFAULT_INSTANCE_MAX_REQUESTS, usize);
define_const!(default_instance_max_error, DEFAULT_INSTANCE_MAX_ERROR, u32);
define_const!(default_error_cooldown_ms, DEFAULT_ERROR_COOLDOWN_MS, u64);
define_const!(default_shadow_max_age_ms, DEFAULT_SHADOW_MAX_AGE_MS, u64);
define_const!(default_shadow_gc_interval_ms, DEFAULT_SHADOW_GC_INTERVAL_MS, u64);
define_const!(default_refill_parallelism, DEFAULT_REFILL_PARALLELISM, usize);
define_const!(default_max_global_instances, DEFAULT_MAX_GLOBAL_INSTANCES, usize);
define_const!(default_memory, DEFAULT_MEMORY, u64);
define_const!(default_call_timeout_ms, DEFAULT_CALL_TIMEOUT_MS, u64);

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            shadow_buff: default_shadow_buff(),
            shadow_min_buff: default_shadow_min_buff(),
            instance_max_requests: default_instance_max_requests(),
            instance_max_error: default_instance_max_error(),
            error_cooldown_ms: default_error_cooldown_ms(),
            shadow_max_age_ms: default_shadow_max_age_ms(),
            shadow_gc_interval_ms: default_shadow_gc_interval_ms(),
            refill_parallelism: default_refill_parallelism(),
            max_global_instances: default_max_global_instances(),
            default_memory: default_memory(),
            default_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn error_cooldown(&self) -> Duration {
        Duration::from_millis(self.error_cooldown_ms)
    }

    pub fn shadow_max_age(&self) -> Duration {
        Duration::from_millis(self.shadow_max_age_ms)
    }

    pub fn shadow_gc_interval(&self) -> Duration {
        Duration::from_millis(self.shadow_gc_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance_max_requests == 0 {
            return Err(Error::Config("pool.instance_max_requests must be positive".into()));
        }
        if self.refill_parallelism == 0 {
            return Err(Error::Config("pool.refill_parallelism must be positive".into()));
        }
        if self.error_cooldown_ms == 0 || self.shadow_gc_interval_ms == 0 {
            return Err(Error::Config("pool intervals must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Development nodes validate domains with the embedded key.
    #[serde(default)]
    pub dev: bool,
    /// Hosts matching this pattern belong to the platform and skip ownership checks.
    #[serde(default = "default_generated_domain_regex")]
    pub generated_domain_regex: String,
    /// Path of the domain validation public key.
    #[serde(default)]
    pub domain_public_key: Option<std::path::PathBuf>,
    /// Branches consulted for link indexes and commit freshness.
    #[serde(default = "default_branches")]
    pub default_branches: Vec<String>,
}

fn default_generated_domain_regex() -> String {
    DEFAULT_GENERATED_DOMAIN_REGEX.to_string()
}

pub fn default_branches() -> Vec<String> {
    vec!["main".to_string(), "master".to_string()]
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            dev: false,
            generated_domain_regex: default_generated_domain_regex(),
            domain_public_key: None,
            default_branches: default_branches(),
        }
    }
}

/// Cache settings, derived from the resolver section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub default_branches: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_branches: default_branches(),
        }
    }
}

impl From<&ResolverConfig> for CacheConfig {
    fn from(value: &ResolverConfig) -> Self {
        Self {
            default_branches: value.default_branches.clone(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = file_read_sync(path)?;
        let config = Self::from_slice(&content)?;
        config.pool.validate()?;
        Ok(config)
    }

    pub fn from_slice(content: &[u8]) -> anyhow::Result<Self> {
        parse_from_slice(content)
    }
}

pub fn parse_from_slice<T: DeserializeOwned>(content: &[u8]) -> anyhow::Result<T> {
    // read first non-space u8
    let is_json = match content
        .iter()
        .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
    {
        Some(first) => *first == b'{',
        None => false,
    };
    match is_json {
        true => serde_json::from_slice::<T>(content).map_err(Into::into),
        false => toml::from_str::<T>(&String::from_utf8_lossy(content)).map_err(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_deserialize() {
        const TEST_CONFIG: &str = r#"
            {
                "pool": { "shadow_buff": 3, "instance_max_error": 5 },
                "resolver": { "dev": true, "default_branches": ["dev"] }
            }
        "#;

        let config = NodeConfig::from_slice(TEST_CONFIG.as_bytes()).unwrap();
        assert_eq!(config.pool.shadow_buff, 3);
        assert_eq!(config.pool.instance_max_error, 5);
        assert_eq!(
            config.pool.instance_max_requests,
            DEFAULT_INSTANCE_MAX_REQUESTS
        );
        assert!(config.resolver.dev);
        assert_eq!(config.resolver.default_branches, vec!["dev".to_string()]);
    }

    #[test]
    fn test_toml_deserialize() {
        const TEST_CONFIG: &str = "
            [pool]
            shadow_max_age_ms = 750
            shadow_gc_interval_ms = 500

            [resolver]
            generated_domain_regex = '^[^.]+\\.g\\.example\\.com$'
        ";

        let config = NodeConfig::from_slice(TEST_CONFIG.as_bytes()).unwrap();
        assert_eq!(config.pool.shadow_max_age(), Duration::from_millis(750));
        assert_eq!(config.pool.shadow_gc_interval(), Duration::from_millis(500));
        assert_eq!(config.resolver.default_branches, default_branches());
        assert!(!config.resolver.dev);
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = NodeConfig::from_slice(b"").unwrap();
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.resolver, ResolverConfig::default());
    }

    #[test]
    fn test_pool_validation() {
        let pool = PoolConfig {
            instance_max_requests: 0,
            ..Default::default()
        };
        assert!(matches!(pool.validate(), Err(Error::Config(_))));
        assert!(PoolConfig::default().validate().is_ok());
    }
}
