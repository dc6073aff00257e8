//! Configuration types for harness components.

mod listen;
mod runtime;
mod target;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use listen::{ListenConfig, TlsConfig};
pub use runtime::{ExecutorConfig, LogFormat, LoggingConfig};
pub use target::{ClientTlsConfig, TargetConfig};

/// Default bound on establishing a proxy session's outbound connection.
pub const DEFAULT_PROXY_CONNECTION_TIMEOUT_MS: u64 = 30_000;

/// Proxy/mock server configuration.
///
/// The presence of `target` selects proxy mode; without it the server is a
/// pure mock.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    pub listen: ListenConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetConfig>,
    #[serde(default = "default_proxy_connection_timeout_ms")]
    pub proxy_connection_timeout_ms: u64,
}

fn default_proxy_connection_timeout_ms() -> u64 {
    DEFAULT_PROXY_CONNECTION_TIMEOUT_MS
}

impl ServerConfig {
    pub fn mock(listen_address: impl Into<String>) -> Self {
        Self {
            listen: ListenConfig::new(listen_address),
            target: None,
            proxy_connection_timeout_ms: default_proxy_connection_timeout_ms(),
        }
    }

    pub fn proxy(listen_address: impl Into<String>, target_address: impl Into<String>) -> Self {
        Self {
            target: Some(TargetConfig::new(target_address)),
            ..Self::mock(listen_address)
        }
    }

    pub fn with_proxy_connection_timeout(mut self, timeout: Duration) -> Self {
        self.proxy_connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn proxy_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_connection_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.listen.address.trim().is_empty() {
            anyhow::bail!("listen.address must not be empty");
        }
        if let Some(ref tls) = self.listen.tls {
            if tls.cert_path.is_empty() || tls.key_path.is_empty() {
                anyhow::bail!(
                    "TLS configuration requires both 'listen.tls.cert_path' and 'listen.tls.key_path'"
                );
            }
        }
        if let Some(ref target) = self.target {
            validate_target(target, "target")?;
        }
        if self.proxy_connection_timeout_ms == 0 {
            anyhow::bail!("proxy_connection_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

/// Client component configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClientConfig {
    pub target: TargetConfig,
    #[serde(default = "default_proxy_connection_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl ClientConfig {
    pub fn new(target_address: impl Into<String>) -> Self {
        Self {
            target: TargetConfig::new(target_address),
            connect_timeout_ms: default_proxy_connection_timeout_ms(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        validate_target(&self.target, "target")?;
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

fn validate_target(target: &TargetConfig, field: &str) -> Result<(), anyhow::Error> {
    if target.address.trim().is_empty() {
        anyhow::bail!("{field}.address must not be empty");
    }
    if let Some(ref tls) = target.tls {
        if tls.ca_path.is_none() && !tls.insecure_skip_verify {
            anyhow::bail!(
                "{field}.tls requires 'ca_path' unless 'insecure_skip_verify' is set"
            );
        }
    }
    Ok(())
}

/// Top-level file configuration for the `rift-harness` binary.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarnessConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HarnessConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: HarnessConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.server.validate()?;
        if self.executor.default_wait_timeout_ms == 0 {
            anyhow::bail!("executor.default_wait_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}
