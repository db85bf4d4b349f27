//! Engine configuration
//!
//! Values come from an optional TOML file and `PARLEY_*` environment
//! variables, environment taking precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{ConversationError, ConversationResult};

const ENV_PREFIX: &str = "PARLEY";

/// Tunables of the conversation engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sessions kept by an eviction pass
    pub max_sessions: usize,
    /// Minimum time the tool indicator stays visible
    pub tool_min_display_ms: u64,
    /// Capacity of the per-turn packet queue
    pub packet_buffer: usize,
    /// Wait before asking the backend to name a new session
    pub naming_delay_ms: u64,
    /// Default `tracing` filter directive
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            tool_min_display_ms: 1500,
            packet_buffer: 256,
            naming_delay_ms: 200,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn tool_min_display(&self) -> Duration {
        Duration::from_millis(self.tool_min_display_ms)
    }

    pub fn naming_delay(&self) -> Duration {
        Duration::from_millis(self.naming_delay_ms)
    }

    pub fn validate(&self) -> ConversationResult<()> {
        if self.max_sessions == 0 {
            return Err(ConversationError::Config(
                "max_sessions must be greater than 0".to_string(),
            ));
        }
        if self.packet_buffer == 0 {
            return Err(ConversationError::Config(
                "packet_buffer must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads and saves [`EngineConfig`]
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::with_path(Self::default_config_path())
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    /// `<config dir>/parley/engine.toml`
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley")
            .join("engine.toml")
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Read file and environment, then validate
    pub fn load(&self) -> ConversationResult<EngineConfig> {
        let config = Config::builder()
            .add_source(File::from(self.config_path.clone()).required(false))
            .add_source(Environment::with_prefix(&self.env_prefix))
            .build()?;
        let engine: EngineConfig = config.try_deserialize()?;
        engine.validate()?;
        Ok(engine)
    }

    pub fn save(&self, config: &EngineConfig) -> ConversationResult<()> {
        config.validate()?;
        let toml = toml::to_string(config)?;
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.config_path, toml)?;
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
