//! Outbound target and client-side TLS configuration.

use serde::{Deserialize, Serialize};

/// TLS settings used when dialing a target.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct ClientTlsConfig {
    /// PEM bundle of trusted roots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_path: Option<String>,
    /// SNI / verification name, defaults to the host part of the address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Accept any server certificate (self-signed test backends only)
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TargetConfig {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ClientTlsConfig>,
}

impl TargetConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tls: None,
        }
    }

    /// Host part of `host:port`, used as the default TLS server name.
    pub fn host(&self) -> &str {
        match self.address.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
            None => &self.address,
        }
    }
}
