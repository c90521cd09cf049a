use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, Result};

// =============================================================================
// Backend Types
// =============================================================================

/// Transport family used to reach a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Child process speaking over stdin/stdout.
    Pipe,
    /// HTTP endpoint.
    Http,
    /// Long-lived TCP stream.
    Stream,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pipe => write!(f, "pipe"),
            Self::Http => write!(f, "http"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

/// Connection descriptor for a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportSpec {
    /// Spawn a subprocess.
    Pipe {
        /// Command to run.
        command: String,
        /// Command arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables.
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// POST JSON-RPC to an HTTP endpoint.
    Http {
        /// Endpoint URL.
        url: String,
        /// Extra request headers.
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Connect to a TCP socket.
    Stream {
        /// `host:port` address.
        address: String,
    },
}

impl TransportSpec {
    /// The transport family of this descriptor.
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Pipe { .. } => TransportKind::Pipe,
            Self::Http { .. } => TransportKind::Http,
            Self::Stream { .. } => TransportKind::Stream,
        }
    }

    /// Check that the descriptor is usable.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Pipe { command, .. } => {
                if command.trim().is_empty() {
                    return Err(Error::config("pipe transport requires a command"));
                }
            }
            Self::Http { url, .. } => {
                let parsed = url::Url::parse(url)
                    .map_err(|e| Error::config(format!("invalid URL '{}': {}", url, e)))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(Error::config(format!(
                        "http transport requires an http(s) URL, got '{}'",
                        url
                    )));
                }
            }
            Self::Stream { address } => {
                if address.trim().is_empty() {
                    return Err(Error::config("stream transport requires an address"));
                }
            }
        }
        Ok(())
    }
}

/// A governed backend as described by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSpec {
    /// Unique backend identifier.
    pub id: String,
    /// Connection descriptor.
    #[serde(flatten)]
    pub transport: TransportSpec,
    /// Declared tool names. Empty means "not declared".
    #[serde(default)]
    pub tools: Vec<String>,
}

impl BackendSpec {
    pub fn new(id: impl Into<String>, transport: TransportSpec) -> Self {
        Self {
            id: id.into(),
            transport,
            tools: Vec::new(),
        }
    }

    /// Declare the tools this backend exposes.
    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }
}

/// Connection health as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendHealth {
    Connected,
    /// Reachable, but the last call faulted.
    Degraded,
    Disconnected,
}

/// Snapshot of one registered backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    pub id: String,
    pub kind: TransportKind,
    pub health: BackendHealth,
    pub tools: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_flat_json() {
        let spec: BackendSpec = serde_json::from_value(serde_json::json!({
            "id": "fs",
            "transport": "pipe",
            "command": "npx",
            "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
            "tools": ["read_file"]
        }))
        .unwrap();
        assert_eq!(spec.transport.kind(), TransportKind::Pipe);
        assert_eq!(spec.tools, vec!["read_file".to_string()]);
    }

    #[test]
    fn test_http_requires_http_scheme() {
        let spec = TransportSpec::Http {
            url: "ftp://example.com".to_string(),
            headers: BTreeMap::new(),
        };
        assert!(spec.validate().is_err());

        let spec = TransportSpec::Http {
            url: "http://localhost:8080/mcp".to_string(),
            headers: BTreeMap::new(),
        };
        assert!(spec.validate().is_ok());
    }
}
