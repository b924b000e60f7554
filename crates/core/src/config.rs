use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration, loaded from a TOML file. Every section has
/// serde defaults so a partial file is enough.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub database: DatabaseConfig,
    pub cluster: ClusterConfig,
    pub secrets: SecretsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub retry: RetrySettings,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("netforge.redb"),
            retry: RetrySettings::default(),
        }
    }
}

/// Bounds for the transient-failure retry loops. Backoff is linear:
/// attempt `n` sleeps `backoff_ms * n`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub fetch_attempts: u32,
    pub commit_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            fetch_attempts: 3,
            commit_attempts: 5,
            backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub id: String,
    pub heartbeat_timeout_secs: i64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            heartbeat_timeout_secs: 30,
        }
    }
}

/// Credential backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretBackendKind {
    /// Encrypted values held by the process (default)
    Local,
    /// External vault; wired in by the embedding application
    Vault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    pub backend: SecretBackendKind,
    pub encryption_key: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            backend: SecretBackendKind::Local,
            encryption_key: "netforge-dev-key".to_string(),
        }
    }
}

impl CoreConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw).context("failed to parse config file")
    }
}
