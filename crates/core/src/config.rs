//! Layered application configuration.
//!
//! Sources, lowest precedence first: `config/default`, `config/{GOV_BRIDGE_ENV}`,
//! `config/local`, then `GOV_BRIDGE__*` environment variables. Setting
//! `GOV_BRIDGE_CONFIG` replaces the file layers with a single explicit file.

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::types::{
    BackendSpec, Policy, TrackingLevel, TransportSpec, DEFAULT_BLOCKED_PATTERNS,
    DEFAULT_MAX_ARGUMENT_BYTES, DEFAULT_RATE_LIMIT_PER_MINUTE,
};
use crate::{Error, Result};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub governance: GovernanceConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8173,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Per-call backend timeout.
    pub call_timeout_ms: u64,
    /// Bound on connecting to a backend and completing its handshake.
    pub connect_timeout_ms: u64,
    /// Idle period after which session counters are dropped.
    pub session_idle_secs: u64,
    /// How often the idle-session sweeper runs.
    pub sweep_interval_secs: u64,
    /// Audit records buffered before the oldest are dropped.
    pub audit_buffer_capacity: usize,
    /// Attempts per audit batch before it is counted as lost.
    pub audit_retry_attempts: u32,
    pub audit_retry_backoff_ms: u64,
    pub json_logs: bool,
    pub metrics_enabled: bool,
    /// Values applied where a backend policy leaves a field unset.
    pub defaults: PolicyDefaults,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            session_idle_secs: 3600,
            sweep_interval_secs: 60,
            audit_buffer_capacity: 10_000,
            audit_retry_attempts: 3,
            audit_retry_backoff_ms: 200,
            json_logs: false,
            metrics_enabled: true,
            defaults: PolicyDefaults::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PolicyDefaults {
    pub rate_limit_per_minute: u32,
    pub blocked_patterns: Vec<String>,
    pub tracking_level: TrackingLevel,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
            blocked_patterns: DEFAULT_BLOCKED_PATTERNS.iter().map(|p| p.to_string()).collect(),
            tracking_level: TrackingLevel::Detailed,
        }
    }
}

/// Which audit log store adapter to use.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditBackend {
    #[default]
    Memory,
    Jsonl,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuditConfig {
    #[serde(default)]
    pub backend: AuditBackend,
    /// File path for the `jsonl` and `sqlite` adapters.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(flatten)]
    pub transport: TransportSpec,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Per-backend policy overrides. Unset fields fall back to `PolicyDefaults`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PolicyConfig {
    pub rate_limit_per_minute: Option<u32>,
    pub allowed_hours: Option<Vec<u8>>,
    pub blocked_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub high_security: bool,
    #[serde(default)]
    pub high_security_allow: Vec<String>,
    pub max_argument_bytes: Option<usize>,
    pub tracking_level: Option<TrackingLevel>,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("GOV_BRIDGE_CONFIG") {
            return Self::from_file(path);
        }

        let env = std::env::var("GOV_BRIDGE_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map GOV_BRIDGE__SERVER__PORT=9000 to server.port
            .add_source(Environment::with_prefix("GOV_BRIDGE").separator("__"))
            .build()
            .map_err(config_error)?;

        s.try_deserialize().map_err(config_error)
    }

    /// Load a single configuration file (format inferred from the extension).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("GOV_BRIDGE").separator("__"))
            .build()
            .map_err(config_error)?;

        s.try_deserialize().map_err(config_error)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let s = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .map_err(config_error)?;

        s.try_deserialize().map_err(config_error)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.governance.call_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.governance.connect_timeout_ms)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.governance.session_idle_secs)
    }

    /// Validated backend descriptors.
    pub fn backend_specs(&self) -> Result<Vec<BackendSpec>> {
        self.backends
            .iter()
            .map(|(id, backend)| {
                backend
                    .transport
                    .validate()
                    .map_err(|e| Error::config(format!("backend '{}': {}", id, e)))?;
                Ok(BackendSpec {
                    id: id.clone(),
                    transport: backend.transport.clone(),
                    tools: backend.tools.clone(),
                })
            })
            .collect()
    }

    /// Effective, validated policies for every configured backend.
    pub fn policies(&self) -> Result<Vec<Policy>> {
        let defaults = &self.governance.defaults;
        self.backends
            .iter()
            .map(|(id, backend)| {
                let cfg = &backend.policy;
                let policy = Policy {
                    backend_id: id.clone(),
                    rate_limit_per_minute: cfg
                        .rate_limit_per_minute
                        .unwrap_or(defaults.rate_limit_per_minute),
                    allowed_hours: cfg.allowed_hours.clone().unwrap_or_default().into_iter().collect(),
                    blocked_patterns: cfg
                        .blocked_patterns
                        .clone()
                        .unwrap_or_else(|| defaults.blocked_patterns.clone()),
                    high_security: cfg.high_security,
                    high_security_allow: cfg.high_security_allow.clone(),
                    max_argument_bytes: cfg.max_argument_bytes.unwrap_or(DEFAULT_MAX_ARGUMENT_BYTES),
                    tracking_level: cfg.tracking_level.unwrap_or(defaults.tracking_level),
                };
                policy.validate()?;
                Ok(policy)
            })
            .collect()
    }
}

fn config_error(err: ConfigError) -> Error {
    Error::config(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransportKind;

    const SAMPLE: &str = r#"
        [server]
        host = "127.0.0.1"
        port = 9100

        [governance]
        call_timeout_ms = 1500

        [audit]
        backend = "jsonl"
        path = "/tmp/audit.jsonl"

        [backends.fs]
        transport = "pipe"
        command = "mcp-fs"
        args = ["/srv"]
        tools = ["read_file", "list_dir"]

        [backends.fs.policy]
        rate_limit_per_minute = 2
        allowed_hours = [9, 10, 10]

        [backends.search]
        transport = "http"
        url = "http://localhost:8080/mcp"

        [backends.search.policy]
        blocked_patterns = []
        high_security = true
        high_security_allow = ["query"]
    "#;

    #[test]
    fn test_parse_sample() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.call_timeout(), Duration::from_millis(1500));
        assert_eq!(config.audit.backend, AuditBackend::Jsonl);
        // untouched governance fields keep their defaults
        assert_eq!(config.governance.audit_retry_attempts, 3);

        let specs = config.backend_specs().unwrap();
        assert_eq!(specs.len(), 2);
        let fs = specs.iter().find(|s| s.id == "fs").unwrap();
        assert_eq!(fs.transport.kind(), TransportKind::Pipe);
        assert_eq!(fs.tools.len(), 2);
    }

    #[test]
    fn test_policy_defaults_applied() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        let policies = config.policies().unwrap();

        let fs = policies.iter().find(|p| p.backend_id == "fs").unwrap();
        assert_eq!(fs.rate_limit_per_minute, 2);
        assert_eq!(fs.allowed_hours.len(), 2);
        assert_eq!(fs.blocked_patterns.len(), DEFAULT_BLOCKED_PATTERNS.len());

        let search = policies.iter().find(|p| p.backend_id == "search").unwrap();
        assert_eq!(search.rate_limit_per_minute, DEFAULT_RATE_LIMIT_PER_MINUTE);
        assert!(search.blocked_patterns.is_empty());
        assert!(search.high_security);
        assert!(search.is_high_security_allowed("query"));
    }

    #[test]
    fn test_invalid_hour_rejected() {
        let config = AppConfig::from_toml_str(
            r#"
            [backends.fs]
            transport = "stream"
            address = "127.0.0.1:7000"

            [backends.fs.policy]
            allowed_hours = [25]
            "#,
        )
        .unwrap();
        assert!(config.policies().is_err());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.server.port, 8173);
        assert!(config.backends.is_empty());
        assert_eq!(config.audit.backend, AuditBackend::Memory);
    }
}
