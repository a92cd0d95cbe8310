//! Partition and service configuration
//!
//! Loaded from TOML. Every field has a default so a partial (or missing) file
//! still yields a usable configuration:
//!
//! ```toml
//! [partition]
//! name = "DefaultPartition"
//! call_timeout_ms = 5000
//! max_concurrent_calls = 16
//!
//! [[services]]
//! name = "scheduler"
//! ```

use crate::errors::{CohortError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Name used when no partition name is configured.
pub const DEFAULT_PARTITION_NAME: &str = "DefaultPartition";

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CohortConfig {
    /// Partition this process joins
    pub partition: PartitionConfig,
    /// HA services to run on the partition
    pub services: Vec<ServiceConfig>,
}

/// Settings for one partition node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Partition name used for directory lookup
    pub name: String,

    /// Per-member timeout for synchronous cluster calls
    pub call_timeout_ms: u64,

    /// Worker permits for executing incoming calls on this node
    pub max_concurrent_calls: usize,

    /// Timeout for pulling replicant and state snapshots on join
    pub state_transfer_timeout_ms: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_PARTITION_NAME.to_string(),
            call_timeout_ms: 5_000,
            max_concurrent_calls: 16,
            state_transfer_timeout_ms: 5_000,
        }
    }
}

impl PartitionConfig {
    /// Configuration for a named partition with default tuning.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder-style call timeout override.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Per-member timeout for synchronous calls.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Timeout for join-time snapshot pulls.
    pub fn state_transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.state_transfer_timeout_ms)
    }

    /// Reject values that would make the partition unusable.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CohortError::configuration("partition name must not be empty"));
        }
        if self.call_timeout_ms == 0 {
            return Err(CohortError::configuration("call_timeout_ms must be positive"));
        }
        if self.state_transfer_timeout_ms == 0 {
            return Err(CohortError::configuration(
                "state_transfer_timeout_ms must be positive",
            ));
        }
        if self.max_concurrent_calls == 0 {
            return Err(CohortError::configuration(
                "max_concurrent_calls must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Settings for one HA service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Canonical service name (also its replicant and handler key)
    pub name: String,
    /// Partition to run on; falls back to the top-level partition name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
}

impl CohortConfig {
    /// Parse TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            CohortError::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CohortError::serialization(e.to_string()))
    }

    /// Partition a service runs on.
    pub fn partition_for<'a>(&'a self, service: &'a ServiceConfig) -> &'a str {
        service.partition.as_deref().unwrap_or(&self.partition.name)
    }

    /// Validate the partition section and every service entry.
    pub fn validate(&self) -> Result<()> {
        self.partition.validate()?;
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(CohortError::configuration("service name must not be empty"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = CohortConfig::from_toml_str(
            r#"
            [partition]
            name = "orders"

            [[services]]
            name = "scheduler"
            "#,
        )
        .unwrap();
        assert_eq!(config.partition.name, "orders");
        assert_eq!(config.partition.call_timeout(), Duration::from_secs(5));
        assert_eq!(config.partition_for(&config.services[0]), "orders");
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let err = CohortConfig::from_toml_str("[partition]\ncall_timeout_ms = 0\n").unwrap_err();
        assert!(matches!(err, CohortError::Configuration { .. }));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = CohortConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, CohortConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[partition]\nname = \"billing\"\nmax_concurrent_calls = 4\n\n[[services]]\nname = \"ledger\"\npartition = \"audit\""
        )
        .unwrap();
        let config = CohortConfig::load(file.path()).unwrap();
        assert_eq!(config.partition.max_concurrent_calls, 4);
        assert_eq!(config.partition_for(&config.services[0]), "audit");
    }

    #[test]
    fn test_rendered_config_parses_back() {
        let config = CohortConfig {
            partition: PartitionConfig::named("edge").with_call_timeout(Duration::from_millis(250)),
            services: vec![ServiceConfig {
                name: "cache-warmer".into(),
                partition: None,
            }],
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(CohortConfig::from_toml_str(&text).unwrap(), config);
    }
}
