//! Deduplication configuration
//!
//! Dedup is enabled globally and narrowed with rules:
//!
//! ```toml
//! [dedup]
//! enabled = true
//! prefix = "d-template/dedup"
//! lease_ttl_ms = 15000
//!
//! [[dedup.rules]]
//! pattern = "^/etc/nginx/"
//! heartbeat_interval_ms = 2000
//!
//! [[dedup.rules]]
//! pattern = "\\.local\\.tmpl$"
//! enabled = false
//! ```
//!
//! The first rule whose pattern matches a template id decides. With no rules
//! every template is deduplicated; with rules, unmatched templates keep a
//! private watch.

use std::time::Duration;

use config::ConfigError;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;
use crate::TemplateId;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DedupConfig {
    /// Master switch
    #[serde(default)]
    pub enabled: bool,

    /// Key prefix for election records and shared data
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Lease time-to-live (milliseconds)
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Lease renewal cadence while leading (milliseconds)
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How often a follower retries to acquire leadership (milliseconds).
    /// Must not exceed the heartbeat interval.
    #[serde(default = "default_acquire_retry_interval_ms")]
    pub acquire_retry_interval_ms: u64,

    /// Blocking wait for follower reads of shared data (milliseconds)
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Per-template overrides, first match wins
    #[serde(default)]
    pub rules: Vec<DedupRule>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DedupRule {
    /// Regular expression matched against the template id
    pub pattern: String,

    #[serde(default = "default_rule_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub lease_ttl_ms: Option<u64>,

    #[serde(default)]
    pub heartbeat_interval_ms: Option<u64>,

    #[serde(default)]
    pub acquire_retry_interval_ms: Option<u64>,
}

impl DedupRule {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            enabled: true,
            lease_ttl_ms: None,
            heartbeat_interval_ms: None,
            acquire_retry_interval_ms: None,
        }
    }
}

/// Effective timing for one deduplicated template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupPolicy {
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub acquire_retry_interval: Duration,
    pub max_wait: Duration,
}

/// Compiled rule set.
#[derive(Debug, Clone)]
pub struct DedupMatcher {
    enabled: bool,
    default_policy: DedupPolicy,
    rules: Vec<(Regex, Option<DedupPolicy>)>,
}

impl DedupMatcher {
    /// Policy for `template`, or `None` when it keeps a private watch.
    pub fn policy_for(
        &self,
        template: &TemplateId,
    ) -> Option<DedupPolicy> {
        if !self.enabled {
            return None;
        }
        if self.rules.is_empty() {
            return Some(self.default_policy);
        }
        self.rules
            .iter()
            .find(|(re, _)| re.is_match(template.as_str()))
            .and_then(|(_, policy)| *policy)
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: default_prefix(),
            lease_ttl_ms: default_lease_ttl_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            acquire_retry_interval_ms: default_acquire_retry_interval_ms(),
            max_wait_ms: default_max_wait_ms(),
            rules: Vec::new(),
        }
    }
}

impl DedupConfig {
    pub fn default_policy(&self) -> DedupPolicy {
        DedupPolicy {
            lease_ttl: Duration::from_millis(self.lease_ttl_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            acquire_retry_interval: Duration::from_millis(self.acquire_retry_interval_ms),
            max_wait: Duration::from_millis(self.max_wait_ms),
        }
    }

    /// Compiles rule patterns.
    ///
    /// # Errors
    /// `Error::Config` for a pattern that is not a valid regular expression
    /// or an override that breaks the timing constraints.
    pub fn compile(&self) -> Result<DedupMatcher> {
        let default_policy = self.default_policy();
        let mut rules = Vec::with_capacity(self.rules.len());

        for (i, rule) in self.rules.iter().enumerate() {
            let re = Regex::new(&rule.pattern).map_err(|e| {
                Error::Config(ConfigError::Message(format!(
                    "dedup.rules[{i}].pattern {:?} is invalid: {e}",
                    rule.pattern
                )))
            })?;

            let policy = if rule.enabled {
                let heartbeat_interval = rule
                    .heartbeat_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default_policy.heartbeat_interval);
                let policy = DedupPolicy {
                    lease_ttl: rule
                        .lease_ttl_ms
                        .map(Duration::from_millis)
                        .unwrap_or(default_policy.lease_ttl),
                    heartbeat_interval,
                    // An inherited retry interval follows a shorter heartbeat
                    acquire_retry_interval: rule
                        .acquire_retry_interval_ms
                        .map(Duration::from_millis)
                        .unwrap_or_else(|| default_policy.acquire_retry_interval.min(heartbeat_interval)),
                    max_wait: default_policy.max_wait,
                };
                validate_policy(&policy, &format!("dedup.rules[{i}]"))?;
                Some(policy)
            } else {
                None
            };
            rules.push((re, policy));
        }

        Ok(DedupMatcher {
            enabled: self.enabled,
            default_policy,
            rules,
        })
    }

    pub(super) fn validate(&self) -> Result<()> {
        if self.prefix.trim_matches('/').is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "dedup.prefix cannot be empty".into(),
            )));
        }
        if self.max_wait_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "dedup.max_wait_ms must be greater than 0".into(),
            )));
        }
        validate_policy(&self.default_policy(), "dedup")?;
        self.compile()?;
        Ok(())
    }
}

fn validate_policy(
    policy: &DedupPolicy,
    scope: &str,
) -> Result<()> {
    if policy.lease_ttl.is_zero() {
        return Err(Error::Config(ConfigError::Message(format!(
            "{scope}.lease_ttl_ms must be greater than 0"
        ))));
    }
    if policy.heartbeat_interval.is_zero() || policy.heartbeat_interval >= policy.lease_ttl {
        return Err(Error::Config(ConfigError::Message(format!(
            "{scope}.heartbeat_interval_ms ({:?}) must be positive and shorter than lease_ttl_ms ({:?})",
            policy.heartbeat_interval, policy.lease_ttl
        ))));
    }
    // Keeps failover within lease_ttl + heartbeat_interval
    if policy.acquire_retry_interval.is_zero() || policy.acquire_retry_interval > policy.heartbeat_interval {
        return Err(Error::Config(ConfigError::Message(format!(
            "{scope}.acquire_retry_interval_ms ({:?}) must be positive and not longer than heartbeat_interval_ms ({:?})",
            policy.acquire_retry_interval, policy.heartbeat_interval
        ))));
    }
    Ok(())
}

fn default_prefix() -> String {
    "d-template/dedup".into()
}
fn default_rule_enabled() -> bool {
    true
}
// in ms
fn default_lease_ttl_ms() -> u64 {
    15_000
}
fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_acquire_retry_interval_ms() -> u64 {
    3_000
}
fn default_max_wait_ms() -> u64 {
    60_000
}
