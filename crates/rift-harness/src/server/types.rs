//! Type definitions for the proxy/mock server.

use crate::config::{ServerConfig, TargetConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operating mode, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMode {
    /// Hooks answer every message; nothing is forwarded.
    Mock,
    /// Each session gets one outbound connection to `target`.
    Proxy { target: TargetConfig },
}

impl ServerMode {
    pub(crate) fn from_config(config: &ServerConfig) -> Self {
        match config.target {
            Some(ref target) => ServerMode::Proxy {
                target: target.clone(),
            },
            None => ServerMode::Mock,
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, ServerMode::Proxy { .. })
    }

    pub fn target(&self) -> Option<&TargetConfig> {
        match self {
            ServerMode::Mock => None,
            ServerMode::Proxy { target } => Some(target),
        }
    }
}

/// A session whose outbound connection could not be established.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectFailure {
    pub session_id: String,
    pub target: String,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}
