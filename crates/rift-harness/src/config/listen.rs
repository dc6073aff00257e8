//! Listener and server-side TLS configuration.

use serde::{Deserialize, Serialize};

/// TLS configuration for a listener
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to TLS certificate file (PEM format)
    pub cert_path: String,
    /// Path to TLS private key file (PEM format)
    pub key_path: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ListenConfig {
    /// `host:port` for network transports, any unique name for the in-memory one
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

impl ListenConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tls: None,
        }
    }
}
