//! Configuration resolution for zenbridge.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/zenbridge/settings.json)
//! 3. Project config (.zenbridge/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete zenbridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// Toolchain invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Path or name of the toolchain binary.
    pub binary: PathBuf,
    /// Compiler passed via `--cc` when formatting run/build invocations.
    pub compiler: String,
    /// Workspace root; used as the server's working directory when set.
    pub workspace_root: Option<PathBuf>,
    /// Source-file extension watched for change notifications.
    pub source_extension: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("zc"),
            compiler: "gcc".to_string(),
            workspace_root: None,
            source_extension: "zc".to_string(),
        }
    }
}

/// Bridge behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Default deadline for correlated requests (seconds).
    pub request_timeout_secs: u64,
    /// Grace period between stop request and SIGKILL (seconds).
    pub terminate_timeout_secs: u64,
    pub log_level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            terminate_timeout_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".zenbridge").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".zenbridge").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/zenbridge/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("zenbridge").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    if overlay.toolchain.workspace_root.is_some() {
        base.toolchain.workspace_root = overlay.toolchain.workspace_root;
    }
    base.toolchain.binary = overlay.toolchain.binary;
    base.toolchain.compiler = overlay.toolchain.compiler;
    base.toolchain.source_extension = overlay.toolchain.source_extension;

    base.bridge = overlay.bridge;
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("ZENBRIDGE_BINARY") {
        config.toolchain.binary = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("ZENBRIDGE_CC") {
        config.toolchain.compiler = val;
    }
    if let Ok(val) = std::env::var("ZENBRIDGE_REQUEST_TIMEOUT") {
        if let Ok(n) = val.parse() {
            config.bridge.request_timeout_secs = n;
        }
    }
    if let Ok(val) = std::env::var("ZENBRIDGE_LOG_LEVEL") {
        config.bridge.log_level = val;
    }
}
