use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;

use python_sandbox::protocol::{
    ExecutionLimits, DEFAULT_CPU_TIME_LIMIT_SECONDS, DEFAULT_MEMORY_LIMIT_MB, DEFAULT_TIMEOUT_SECONDS,
};

use crate::denylist::Denylist;
use crate::error::SettingsError;
use crate::sanitizer::{InputSanitizer, DEFAULT_MAX_QUERY_CHARS};

/// Application name used in directory paths
const APP_NAME: &str = "secure-exec";

/// Settings file name inside the config directory
const CONFIG_FILE: &str = "config.json";

// ============ Strategy Preference ============

/// Which execution strategy the deployment asks for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyPreference {
    /// Isolated when the worker binary is available, otherwise in-process
    #[default]
    Auto,
    InProcess,
    Isolated,
}

impl FromStr for StrategyPreference {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(StrategyPreference::Auto),
            "in_process" | "inprocess" => Ok(StrategyPreference::InProcess),
            "isolated" => Ok(StrategyPreference::Isolated),
            _ => Err(SettingsError::UnknownStrategy(s.to_string())),
        }
    }
}

// ============ Sandbox Settings ============

/// Deployment settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub timeout_seconds: u64,
    pub memory_limit_mb: u64,
    pub cpu_time_limit_seconds: u64,
    /// Longest user query the sanitizer accepts, in characters
    pub max_query_chars: usize,
    pub strategy: StrategyPreference,
    /// Explicit `sandbox-worker` location; defaults to next to the current executable
    pub worker_path: Option<PathBuf>,
    /// Added to the built-in denylist. Entries can only be added, never removed.
    pub extra_forbidden_modules: Vec<String>,
    pub extra_forbidden_calls: Vec<String>,
    pub extra_forbidden_attributes: Vec<String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            cpu_time_limit_seconds: DEFAULT_CPU_TIME_LIMIT_SECONDS,
            max_query_chars: DEFAULT_MAX_QUERY_CHARS,
            strategy: StrategyPreference::Auto,
            worker_path: None,
            extra_forbidden_modules: Vec::new(),
            extra_forbidden_calls: Vec::new(),
            extra_forbidden_attributes: Vec::new(),
        }
    }
}

impl SandboxSettings {
    /// Default per-call limits
    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            timeout_seconds: self.timeout_seconds,
            memory_limit_mb: self.memory_limit_mb,
            cpu_time_limit_seconds: self.cpu_time_limit_seconds,
        }
    }

    /// Built-in denylist plus this deployment's additions
    pub fn denylist(&self) -> Denylist {
        Denylist::with_additions(
            self.extra_forbidden_modules.iter().cloned(),
            self.extra_forbidden_calls.iter().cloned(),
            self.extra_forbidden_attributes.iter().cloned(),
        )
    }

    pub fn sanitizer(&self) -> InputSanitizer {
        InputSanitizer::from_denylist(self.max_query_chars, &self.denylist())
    }
}

/// Get the configuration directory.
///
/// - Linux: `~/.config/secure-exec/`
/// - macOS: `~/Library/Application Support/secure-exec/`
/// - Windows: `%APPDATA%\secure-exec\`
pub fn get_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join(APP_NAME))
        .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME))
}

/// Get the path to the default settings file
pub fn get_config_path() -> PathBuf {
    get_config_dir().join(CONFIG_FILE)
}

/// Load settings.
///
/// An explicit path must exist. Without one the default location is tried
/// and a missing file means defaults.
pub async fn load_settings(explicit: Option<&Path>) -> Result<SandboxSettings, SettingsError> {
    let config_path = match explicit {
        Some(path) => path.to_path_buf(),
        None => get_config_path(),
    };

    let contents = match fs::read_to_string(&config_path).await {
        Ok(contents) => contents,
        Err(e) if explicit.is_none() && e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no settings file, using defaults");
            return Ok(SandboxSettings::default());
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: config_path,
                source,
            });
        }
    };

    let settings = serde_json::from_str(&contents).map_err(|source| SettingsError::Parse {
        path: config_path.clone(),
        source,
    })?;
    tracing::info!(path = %config_path.display(), "settings loaded");
    Ok(settings)
}
