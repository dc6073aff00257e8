//! Step executor and logging configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Stop executing a test case at its first failing step
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,
    /// Timeout for wait steps that do not set their own
    #[serde(default = "default_wait_timeout_ms")]
    pub default_wait_timeout_ms: u64,
}

fn default_fail_fast() -> bool {
    true
}

fn default_wait_timeout_ms() -> u64 {
    5000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            fail_fast: default_fail_fast(),
            default_wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

impl ExecutorConfig {
    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.default_wait_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_filter(),
        }
    }
}
