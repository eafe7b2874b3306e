//! Consumer configuration.
//!
//! Defaults match the values the dashboards were tuned with: ten retries on
//! HTTP 429, 240 ms apart.

use std::time::Duration;

use serde::Deserialize;

use crate::csrf::CsrfConfig;

pub const DEFAULT_RETRY_BUDGET: u32 = 10;
pub const DEFAULT_BACKOFF_MS: u64 = 240;

pub const ENV_RETRY_BUDGET: &str = "PORTAL_RETRY_BUDGET";
pub const ENV_BACKOFF_MS: &str = "PORTAL_BACKOFF_MS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Retries allowed per request when the server answers 429.
    pub retry_budget: u32,
    /// Fixed wait between rate-limited attempts.
    pub backoff_ms: u64,
    pub csrf: CsrfConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_RETRY_BUDGET,
            backoff_ms: DEFAULT_BACKOFF_MS,
            csrf: CsrfConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Defaults overridden by `PORTAL_RETRY_BUDGET` and `PORTAL_BACKOFF_MS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, with an injectable variable source. Unparsable
    /// values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_RETRY_BUDGET) {
            match raw.trim().parse() {
                Ok(n) => config.retry_budget = n,
                Err(e) => tracing::warn!(var = ENV_RETRY_BUDGET, value = %raw, error = %e, "ignoring invalid value"),
            }
        }
        if let Some(raw) = lookup(ENV_BACKOFF_MS) {
            match raw.trim().parse() {
                Ok(ms) => config.backoff_ms = ms,
                Err(e) => tracing::warn!(var = ENV_BACKOFF_MS, value = %raw, error = %e, "ignoring invalid value"),
            }
        }
        config
    }
}
