use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Parameters shared by every dependency view.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    /// Upper bound the backend may hold a blocking fetch open (milliseconds)
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Minimum spacing between two fetches that returned an unchanged index
    /// (milliseconds). Guards against backends answering blocking queries
    /// immediately.
    #[serde(default = "default_min_fetch_interval_ms")]
    pub min_fetch_interval_ms: u64,

    /// Stop every view after its first delivered value
    #[serde(default)]
    pub once: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: default_max_wait_ms(),
            min_fetch_interval_ms: default_min_fetch_interval_ms(),
            once: false,
        }
    }
}

impl WatchConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn min_fetch_interval(&self) -> Duration {
        Duration::from_millis(self.min_fetch_interval_ms)
    }

    pub(super) fn validate(&self) -> Result<()> {
        if self.max_wait_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.max_wait_ms must be greater than 0".into(),
            )));
        }
        if self.min_fetch_interval_ms >= self.max_wait_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "watch.min_fetch_interval_ms ({}) must be less than max_wait_ms ({})",
                self.min_fetch_interval_ms, self.max_wait_ms
            ))));
        }
        Ok(())
    }
}

// in ms
fn default_max_wait_ms() -> u64 {
    60_000
}
fn default_min_fetch_interval_ms() -> u64 {
    100
}
