//! Engine configuration
//!
//! [`EngineConfig`] collects the knobs a deployment sets once: step limits,
//! concurrency, static breakpoints and the checkpoint backend. It loads from a
//! YAML, TOML or JSON file and then takes `SUPERSTEP_*` environment overrides.
//!
//! ```yaml
//! recursion_limit: 50
//! max_concurrency: 8
//! interrupt_before: [review]
//! checkpointer:
//!   backend: sqlite
//!   url: sqlite://runs.db
//! encryption_key_env: SUPERSTEP_ENCRYPTION_KEY
//! ```
//!
//! | Variable | Field |
//! |----------|-------|
//! | `SUPERSTEP_RECURSION_LIMIT` | `recursion_limit` |
//! | `SUPERSTEP_MAX_CONCURRENCY` | `max_concurrency` |
//! | `SUPERSTEP_DATABASE_URL` | `checkpointer` (switches to SQLite) |

use crate::error::{GraphError, Result};
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use superstep_checkpoint::{
    CheckpointSaver, EncryptedSerializer, InMemoryCheckpointSaver, JsonSerializer,
};
use tracing::info;

/// Default number of supersteps a single run may take
pub const DEFAULT_RECURSION_LIMIT: usize = 25;

pub const ENV_RECURSION_LIMIT: &str = "SUPERSTEP_RECURSION_LIMIT";
pub const ENV_MAX_CONCURRENCY: &str = "SUPERSTEP_MAX_CONCURRENCY";
pub const ENV_DATABASE_URL: &str = "SUPERSTEP_DATABASE_URL";

/// Checkpoint backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CheckpointerConfig {
    /// Process-local, lost on exit
    #[default]
    Memory,
    /// SQLite database at `url` (`sqlite://path.db` or a plain path)
    Sqlite { url: String },
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum supersteps per run
    pub recursion_limit: usize,
    /// Maximum tasks running at once inside a superstep, unbounded when `None`
    pub max_concurrency: Option<usize>,
    /// Pause before these nodes run
    pub interrupt_before: Vec<String>,
    /// Pause after these nodes ran
    pub interrupt_after: Vec<String>,
    pub checkpointer: CheckpointerConfig,
    /// Environment variable holding a base64 AES-256 key for encryption at rest
    pub encryption_key_env: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            max_concurrency: None,
            interrupt_before: Vec::new(),
            interrupt_after: Vec::new(),
            checkpointer: CheckpointerConfig::Memory,
            encryption_key_env: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a file, detecting the format from its extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_config_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `SUPERSTEP_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(limit) = lookup(ENV_RECURSION_LIMIT) {
            self.recursion_limit = parse_env(ENV_RECURSION_LIMIT, &limit)?;
        }
        if let Some(concurrency) = lookup(ENV_MAX_CONCURRENCY) {
            self.max_concurrency = Some(parse_env(ENV_MAX_CONCURRENCY, &concurrency)?);
        }
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.checkpointer = CheckpointerConfig::Sqlite { url };
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn with_interrupt_before<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_before = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interrupt_after<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_after = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.recursion_limit == 0 {
            return Err(GraphError::Configuration(
                "recursion_limit must be at least 1".to_string(),
            ));
        }
        if self.max_concurrency == Some(0) {
            return Err(GraphError::Configuration(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Decode the encryption key named by `encryption_key_env`, if set
    pub fn encryption_key(&self) -> Result<Option<Vec<u8>>> {
        let Some(var) = &self.encryption_key_env else {
            return Ok(None);
        };
        let encoded = std::env::var(var).map_err(|_| {
            GraphError::Configuration(format!("Environment variable '{var}' not found"))
        })?;
        let key = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| {
                GraphError::Configuration(format!("'{var}' is not valid base64: {e}"))
            })?;
        if key.len() != 32 {
            return Err(GraphError::Configuration(format!(
                "'{var}' must decode to 32 bytes, got {}",
                key.len()
            )));
        }
        Ok(Some(key))
    }

    /// Build the configured checkpoint saver
    pub async fn open_checkpointer(&self) -> Result<Arc<dyn CheckpointSaver>> {
        let key = self.encryption_key()?;
        let encrypted = match &key {
            Some(key) => Some(EncryptedSerializer::from_slice(JsonSerializer, key)?),
            None => None,
        };

        match &self.checkpointer {
            CheckpointerConfig::Memory => {
                info!(encrypted = encrypted.is_some(), "Using in-memory checkpointer");
                Ok(match encrypted {
                    Some(serde) => Arc::new(InMemoryCheckpointSaver::with_serializer(serde)),
                    None => Arc::new(InMemoryCheckpointSaver::new()),
                })
            }
            #[cfg(feature = "sqlite")]
            CheckpointerConfig::Sqlite { url } => {
                info!(url = %url, encrypted = encrypted.is_some(), "Using SQLite checkpointer");
                let saver = superstep_checkpoint::SqliteCheckpointSaver::connect(url).await?;
                Ok(match encrypted {
                    Some(serde) => Arc::new(saver.with_serializer(serde)),
                    None => Arc::new(saver),
                })
            }
            #[cfg(not(feature = "sqlite"))]
            CheckpointerConfig::Sqlite { .. } => Err(GraphError::Configuration(
                "SQLite checkpointer requires the `sqlite` feature".to_string(),
            )),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| {
        GraphError::Configuration(format!(
            "Failed to parse environment variable '{}': {}",
            key, e
        ))
    })
}

/// Load a YAML, TOML or JSON file into `T` by extension
pub fn load_config_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| {
            GraphError::Configuration(format!("Unable to determine file extension for {:?}", path))
        })?;
    let content = std::fs::read_to_string(path)?;

    match extension.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(serde_yaml::from_str(&content)?),
        "toml" => Ok(toml::from_str(&content)?),
        "json" => Ok(serde_json::from_str(&content)?),
        other => Err(GraphError::Configuration(format!(
            "Unsupported config file extension: {}",
            other
        ))),
    }
}
