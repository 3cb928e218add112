//! Gateway configuration loading and validation.
//!
//! Reads the backend map (JSON, or YAML by file extension) and resolves
//! `${VAR}` placeholders in backend env overrides against the gateway's own
//! environment. Backend order in the file is discovery order.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use super::errors::GatewayError;
use super::types::ClientIdentity;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Launch definition for one backend. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDescriptor {
    /// Unique key, taken from the backend map.
    #[serde(skip)]
    pub name: String,
    #[serde(alias = "Command")]
    pub command: String,
    #[serde(default, alias = "Args")]
    pub args: Vec<String>,
    #[serde(default, alias = "Env")]
    pub env: HashMap<String, String>,
    #[serde(default, alias = "WorkingDir", alias = "working_dir", alias = "cwd")]
    pub working_dir: Option<PathBuf>,
}

impl BackendDescriptor {
    /// Convenience constructor for a backend with no env overrides or cwd.
    pub fn new(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            working_dir: None,
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Client name announced to every backend.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    /// Per-backend handshake deadline.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Per-candidate deadline for tool listing and tool calls.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Time a backend gets to exit after SIGTERM before it is killed.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Deadline for the liveness probe sent at shutdown.
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Upper bound on inbound calls processed at once by the stdio server.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    /// Backends in discovery order.
    #[serde(
        alias = "servers",
        alias = "MCPStdIOServers",
        deserialize_with = "deserialize_backends"
    )]
    pub backends: Vec<BackendDescriptor>,
}

fn default_client_name() -> String {
    "mcp-gateway".to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    15_000
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_ping_timeout_ms() -> u64 {
    2_000
}

fn default_max_concurrent_calls() -> usize {
    16
}

impl GatewayConfig {
    /// Configuration with default settings for the given backends.
    pub fn with_backends(backends: Vec<BackendDescriptor>) -> Self {
        Self {
            client_name: default_client_name(),
            client_version: default_client_version(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            max_concurrent_calls: default_max_concurrent_calls(),
            backends,
        }
    }

    pub fn client_identity(&self) -> ClientIdentity {
        ClientIdentity {
            name: self.client_name.clone(),
            version: self.client_version.clone(),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// Preserve map order so configuration order becomes discovery order.
fn deserialize_backends<'de, D>(deserializer: D) -> Result<Vec<BackendDescriptor>, D::Error>
where
    D: Deserializer<'de>,
{
    struct BackendsVisitor;

    impl<'de> Visitor<'de> for BackendsVisitor {
        type Value = Vec<BackendDescriptor>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of backend name to backend definition")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut backends: Vec<BackendDescriptor> = Vec::new();
            while let Some((name, mut descriptor)) =
                map.next_entry::<String, BackendDescriptor>()?
            {
                if backends.iter().any(|b| b.name == name) {
                    return Err(de::Error::custom(format!("duplicate backend '{name}'")));
                }
                descriptor.name = name;
                backends.push(descriptor);
            }
            Ok(backends)
        }
    }

    deserializer.deserialize_map(BackendsVisitor)
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Serialization format of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// `.yaml` / `.yml` select YAML; anything else is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}

/// Load, interpolate and validate the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<GatewayConfig, GatewayError> {
    let raw = std::fs::read_to_string(path).map_err(|e| GatewayError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let config = parse_config(&raw, ConfigFormat::from_path(path))?;

    tracing::info!(
        path = %path.display(),
        backends = ?config.backends.iter().map(|b| b.name.as_str()).collect::<Vec<_>>(),
        "loaded gateway config"
    );

    Ok(config)
}

/// Parse configuration text, resolve env placeholders from the process
/// environment, and validate.
pub fn parse_config(raw: &str, format: ConfigFormat) -> Result<GatewayConfig, GatewayError> {
    let mut config: GatewayConfig = match format {
        ConfigFormat::Json => serde_json::from_str(raw).map_err(|e| GatewayError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?,
        ConfigFormat::Yaml => serde_yaml::from_str(raw).map_err(|e| GatewayError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?,
    };

    resolve_env_placeholders(&mut config, |name| std::env::var(name).ok())?;
    validate(&config)?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace every env value of the exact form `${NAME}` with `lookup(NAME)`.
///
/// An unset variable is a fatal configuration error. Values that merely
/// contain `${` somewhere are passed through untouched.
pub fn resolve_env_placeholders<F>(
    config: &mut GatewayConfig,
    lookup: F,
) -> Result<(), GatewayError>
where
    F: Fn(&str) -> Option<String>,
{
    for backend in &mut config.backends {
        for (key, value) in backend.env.iter_mut() {
            let Some(var) = placeholder_name(value).map(str::to_owned) else {
                continue;
            };
            match lookup(&var) {
                Some(resolved) => *value = resolved,
                None => {
                    return Err(GatewayError::ConfigError {
                        reason: format!(
                            "environment variable '{var}' (backend '{}', key '{key}') is not set",
                            backend.name
                        ),
                    });
                }
            }
        }
    }
    Ok(())
}

fn placeholder_name(value: &str) -> Option<&str> {
    value
        .strip_prefix("${")
        .and_then(|v| v.strip_suffix('}'))
        .filter(|name| !name.is_empty())
}

fn validate(config: &GatewayConfig) -> Result<(), GatewayError> {
    if config.backends.is_empty() {
        return Err(GatewayError::ConfigError {
            reason: "no backends configured".into(),
        });
    }
    if let Some(b) = config.backends.iter().find(|b| b.command.trim().is_empty()) {
        return Err(GatewayError::ConfigError {
            reason: format!("backend '{}' has an empty command", b.name),
        });
    }
    if config.max_concurrent_calls == 0 {
        return Err(GatewayError::ConfigError {
            reason: "maxConcurrentCalls must be at least 1".into(),
        });
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
