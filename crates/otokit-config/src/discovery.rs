//! Where otokit looks for its config.
//!
//! Two files are layered, the local file replacing whole sections of the
//! user file:
//!
//! ```text
//! $OTOKIT_CONFIG_DIR/config.toml  (else <platform config dir>/otokit/config.toml)
//! ./otokit.toml
//! ```
//!
//! A file that exists but does not parse is skipped with a warning, so a
//! typo in one layer never blocks a run. `--config` on the command line
//! bypasses discovery.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{ConfigError, OtokitConfig, Result};

const LOCAL_FILE: &str = "otokit.toml";
const USER_FILE: &str = "config.toml";
const DIR_NAME: &str = "otokit";
const DIR_ENV: &str = "OTOKIT_CONFIG_DIR";

/// One candidate config file.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    /// False when the file is missing or failed to parse.
    pub loaded: bool,
}

/// The merged config plus what discovery saw on the way.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: OtokitConfig,
    /// Every candidate, user file first.
    pub sources: Vec<ConfigSource>,
    /// First candidate that loaded; `config init` and saves target it.
    pub source: Option<ConfigSource>,
    /// Skipped layers and risky settings, for the caller to log.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Discover and merge the user and local files. `project_dir` replaces the
/// working directory as the home of `otokit.toml`.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Like [`load_config`], reading the user file from `config_dir` instead of
/// `OTOKIT_CONFIG_DIR` or the platform directory.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let user = match config_dir {
        Some(dir) => Some(dir.join(USER_FILE)),
        None => user_config_path(),
    };
    let local = match project_dir {
        Some(dir) => dir.join(LOCAL_FILE),
        None => PathBuf::from(LOCAL_FILE),
    };

    let mut config = OtokitConfig::new();
    let mut warnings = Vec::new();
    let sources: Vec<ConfigSource> = user
        .into_iter()
        .chain(std::iter::once(local))
        .map(|path| load_layer(&mut config, path, &mut warnings))
        .collect();
    warnings.extend(lint(&config));

    let source = sources.iter().find(|s| s.loaded).cloned();
    Ok(LoadedConfig {
        config,
        sources,
        source,
        warnings,
    })
}

/// Read and parse one file. Errors are returned, not downgraded.
pub fn load_config_file(path: &Path) -> Result<OtokitConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    OtokitConfig::from_toml(&text)
}

/// Write `config` as TOML, creating missing directories.
pub fn save_config(config: &OtokitConfig, path: &Path) -> Result<()> {
    let write_err = |at: &Path, source: std::io::Error| ConfigError::WriteFile {
        path: at.display().to_string(),
        source,
    };

    let text = config.to_toml()?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| write_err(dir, e))?;
    }
    std::fs::write(path, text).map_err(|e| write_err(path, e))
}

/// `config.toml` inside [`user_config_dir`].
pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|d| d.join(USER_FILE))
}

/// `OTOKIT_CONFIG_DIR` when set and non-empty, else `otokit/` under the
/// platform config directory. Logs live here too.
pub fn user_config_dir() -> Option<PathBuf> {
    match std::env::var(DIR_ENV) {
        Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir().map(|d| d.join(DIR_NAME)),
    }
}

fn load_layer(config: &mut OtokitConfig, path: PathBuf, warnings: &mut Vec<String>) -> ConfigSource {
    let loaded = path.is_file()
        && match load_config_file(&path) {
            Ok(layer) => {
                debug!(path = %path.display(), "Loaded config layer");
                config.merge(layer);
                true
            }
            Err(e) => {
                warnings.push(format!("Skipped {}: {}", path.display(), e));
                false
            }
        };
    ConfigSource { path, loaded }
}

/// Settings that load fine but are likely to bite later.
fn lint(config: &OtokitConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if config.session.as_ref().is_some_and(|s| s.has_plaintext_password()) {
        warnings.push(
            "[session] holds a plaintext password; prefer --password or OTOKIT_PASSWORD"
                .to_string(),
        );
    }
    if config
        .tunnel
        .as_ref()
        .is_some_and(|t| t.enabled && t.bind_device.is_none())
    {
        warnings.push(
            "[tunnel] is enabled without bind_device; runs will be refused until it is set"
                .to_string(),
        );
    }
    warnings
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
