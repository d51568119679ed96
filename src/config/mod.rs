//! Settings file and environment overrides
//!
//! Settings are optional: every field has a default, a TOML file may
//! override any of them, and a couple of environment variables override the
//! file. CLI flags are handled separately in [`crate::cli`].

use crate::error::{ErrorCode, Result, StackError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;

pub const DATA_ROOT_VAR: &str = "STACK_DATA_ROOT";
pub const ENGINE_VAR: &str = "STACK_ENGINE";

pub const DEFAULT_ENGINE: &str = "hsc-stack-engine";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub butler: ButlerSettings,
    pub engine: EngineSettings,
    pub stack: StackSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ButlerSettings {
    /// Directory holding `rerun/<name>/` trees
    pub data_root: PathBuf,
}

impl Default for ButlerSettings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Stacking executable
    pub program: String,
    /// Arguments placed before the operation name
    pub args: Vec<String>,
    /// Per-operation time limit; unlimited when absent
    pub timeout_secs: Option<u64>,
}

impl EngineSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            program: DEFAULT_ENGINE.to_string(),
            args: Vec::new(),
            timeout_secs: None,
        }
    }
}

/// Tiling parameters copied into the job configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackSettings {
    pub img_margin: u32,
    pub sub_img_size: u32,
    pub file_io: bool,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            img_margin: 256,
            sub_img_size: 4096,
            file_io: true,
        }
    }
}

impl Settings {
    /// Load settings from `path` (defaults when `None`) and apply the
    /// environment overrides.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let content = fs::read_to_string(path).await.map_err(|e| {
                    StackError::config_with_code(
                        ErrorCode::CONFIG_INVALID_SETTINGS,
                        format!("cannot read settings file {}", path.display()),
                    )
                    .with_source(e)
                })?;
                debug!("Loaded settings from {}", path.display());
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };

        settings.merge_env_vars();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn merge_env_vars(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup, normally the process environment
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup(DATA_ROOT_VAR) {
            self.butler.data_root = PathBuf::from(root);
        }
        if let Some(program) = lookup(ENGINE_VAR) {
            self.engine.program = program;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.program.trim().is_empty() {
            return Err(StackError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                "engine program must not be empty",
            ));
        }
        if self.stack.sub_img_size == 0 {
            return Err(StackError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                "sub_img_size must be positive",
            ));
        }
        if self.engine.timeout_secs == Some(0) {
            return Err(StackError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                "engine timeout must be positive when set",
            ));
        }
        Ok(())
    }
}
