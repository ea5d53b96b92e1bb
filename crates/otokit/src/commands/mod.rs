//! CLI command handlers.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use otokit_config::{ConfigSource, LoadedConfig};
use tracing::warn;

pub mod config;
pub mod prepare;
pub mod run;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    /// Explicit config file; discovery is skipped when set.
    pub config_path: Option<PathBuf>,
}

impl Context {
    /// Load the configuration.
    ///
    /// An explicit `--config` file must load; discovered layers that fail
    /// only produce warnings.
    pub fn load_config(&self) -> Result<LoadedConfig> {
        let loaded = match &self.config_path {
            Some(path) => {
                let config = otokit_config::load_config_file(path)
                    .with_context(|| format!("loading {}", path.display()))?;
                let source = ConfigSource {
                    path: path.clone(),
                    loaded: true,
                };
                LoadedConfig {
                    config,
                    sources: vec![source.clone()],
                    source: Some(source),
                    warnings: Vec::new(),
                }
            }
            None => otokit_config::load_config(None)?,
        };

        for warning in &loaded.warnings {
            warn!("{}", warning);
        }
        Ok(loaded)
    }
}
