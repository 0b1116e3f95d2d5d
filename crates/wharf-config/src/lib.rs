//! Backend pool configuration: a YAML file describing which executors are in the pool and
//! the defaults/circuit-breaker tunables applied to them.
//!
//! ```yaml
//! backends:
//!   - addr: "10.0.0.1:7777"
//!     arch: "x86_64"
//!     max_jobs: 4
//!     labels:
//!       gpu: "true"
//! default_max_jobs: 4
//! failure_threshold: 3
//! recovery_timeout: 30000
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use wharf_executor::{ExecutorPool, PoolConfig};

/// One backend entry in the pool config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub addr: String,
    pub arch: String,
    #[serde(default)]
    pub max_jobs: Option<u32>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// The full pool config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfigFile {
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub default_max_jobs: Option<u32>,
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default, with = "duration_opt")]
    pub recovery_timeout: Option<Duration>,
}

/// `Option<Duration>` wrapper over [`wharf_types::deserialize_duration`]/
/// [`wharf_types::serialize_duration`], so `recovery_timeout` accepts the same
/// human-readable-string-or-millisecond-count shape as every other duration in the
/// workspace instead of a narrower, millis-only rendition of the same thing.
mod duration_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;
    use wharf_types::{deserialize_duration, serialize_duration};

    struct Wrapper(Duration);

    impl Serialize for Wrapper {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serialize_duration(&self.0, serializer)
        }
    }

    impl<'de> Deserialize<'de> for Wrapper {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserialize_duration(deserializer).map(Wrapper)
        }
    }

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        value.map(Wrapper).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
    }
}

impl PoolConfigFile {
    /// Loads and parses a pool config file, rejecting unknown keys.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pool config file: {}", path.display()))?;
        let config: PoolConfigFile = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse pool config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// At least one backend, and no two backends sharing an `addr`.
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            bail!("pool config must declare at least one backend");
        }
        let mut seen = std::collections::BTreeSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.addr.as_str()) {
                bail!("duplicate backend addr in pool config: {}", backend.addr);
            }
        }
        Ok(())
    }

    /// Builds a fresh [`ExecutorPool`] and registers every configured backend.
    pub fn build_pool(&self) -> Result<ExecutorPool> {
        self.validate()?;

        let mut pool_config = PoolConfig::default();
        if let Some(default_max_jobs) = self.default_max_jobs {
            pool_config.default_max_jobs = default_max_jobs;
        }
        if let Some(failure_threshold) = self.failure_threshold {
            pool_config.failure_threshold = failure_threshold;
        }
        if let Some(recovery_timeout) = self.recovery_timeout {
            pool_config.recovery_timeout = recovery_timeout;
        }

        let pool = ExecutorPool::new(pool_config);
        for backend in &self.backends {
            pool.add_backend(&backend.addr, &backend.arch, backend.labels.clone(), backend.max_jobs)
                .with_context(|| format!("failed to register backend {}", backend.addr))?;
        }
        Ok(pool)
    }
}
