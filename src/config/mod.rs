//! Configuration management for the dependency watch and dedup core.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support
//! - Environment variable overrides
//! - Component-wise validation
mod dedup;
mod node;
mod retry;
mod watch;
pub use dedup::*;
pub use node::*;
pub use retry::*;
pub use watch::*;

#[cfg(test)]
mod config_test;
#[cfg(test)]
mod dedup_test;

use std::env;
use std::fmt::Debug;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Environment variable prefix, e.g. `DTEMPLATE__DEDUP__ENABLED=true`
pub const ENV_PREFIX: &str = "DTEMPLATE";

/// Main configuration container
///
/// Combines all subsystem configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables (highest priority)
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct TemplateNodeConfig {
    /// Identity of this instance among cooperating instances
    #[serde(default)]
    pub node: NodeConfig,
    /// Blocking fetch parameters for dependency views
    #[serde(default)]
    pub watch: WatchConfig,
    /// Cross-instance deduplication
    #[serde(default)]
    pub dedup: DedupConfig,
    /// Retry policies for backend operations
    #[serde(default)]
    pub retry: RetryPolicies,
}

impl Debug for TemplateNodeConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TemplateNodeConfig")
            .field("node", &self.node)
            .field("dedup_enabled", &self.dedup.enabled)
            .finish()
    }
}

impl TemplateNodeConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Configuration sources are merged in the following order (later sources override earlier):
    /// 1. Type defaults (lowest priority)
    /// 2. Configuration file from `CONFIG_PATH` environment variable (if set)
    /// 3. Environment variables with `DTEMPLATE__` prefix (highest priority)
    ///
    /// # Note
    /// Validation is deferred so further overrides can be applied via
    /// `with_override_config()`. Callers MUST call `validate()` before use.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("CONFIG_PATH", "config/template.toml");
    /// std::env::set_var("DTEMPLATE__DEDUP__ENABLED", "true");
    /// let cfg = TemplateNodeConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config) // No validation - deferred to validate()
    }

    /// Applies additional configuration overrides from file without validation.
    ///
    /// Merging order (later sources override earlier):
    /// 1. Current configuration values
    /// 2. New configuration file
    /// 3. Latest environment variables (highest priority)
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config) // No validation - deferred to validate()
    }

    /// Validates configuration and returns validated instance.
    ///
    /// # Errors
    /// Returns the first subsystem validation error, e.g. an invalid dedup
    /// rule pattern or a heartbeat interval not shorter than the lease TTL.
    pub fn validate(self) -> Result<Self> {
        self.node.validate()?;
        self.watch.validate()?;
        self.dedup.validate()?;
        self.retry.validate()?;

        if self.retry.fetch.timeout_ms <= self.watch.max_wait_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "retry.fetch.timeout_ms ({}) must exceed watch.max_wait_ms ({})",
                self.retry.fetch.timeout_ms, self.watch.max_wait_ms
            ))));
        }
        Ok(self)
    }
}
