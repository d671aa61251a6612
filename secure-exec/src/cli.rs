//! Command-line argument parsing and launch configuration.
//!
//! This module handles CLI argument parsing using clap, and applies
//! launch-time overrides to the loaded sandbox settings.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::settings::{SandboxSettings, StrategyPreference};

/// CLI arguments for secure-exec
#[derive(Parser, Debug, Clone)]
#[command(
    name = "secure-exec",
    version,
    about = "Validate and run agent-generated Python scripts in a sandbox"
)]
pub struct CliArgs {
    /// Settings file (defaults to <config dir>/secure-exec/config.json)
    #[arg(long, global = true, value_name = "PATH", env = "SECURE_EXEC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: LaunchOverrides,

    #[command(subcommand)]
    pub command: CliCommand,
}

/// Launch-time overrides, applied on top of the settings file
#[derive(clap::Args, Debug, Clone, Default)]
pub struct LaunchOverrides {
    /// Wall-clock limit per execution, in seconds
    #[arg(long, global = true, value_name = "SECONDS", env = "SECURE_EXEC_TIMEOUT")]
    pub timeout: Option<u64>,
    /// Memory limit per execution, in MB (0 disables)
    #[arg(long, global = true, value_name = "MB", env = "SECURE_EXEC_MEMORY_MB")]
    pub memory_mb: Option<u64>,
    /// CPU time limit per execution, in seconds (0 disables)
    #[arg(long, global = true, value_name = "SECONDS", env = "SECURE_EXEC_CPU_SECONDS")]
    pub cpu_seconds: Option<u64>,
    /// Execution strategy: auto, in_process or isolated
    #[arg(long, global = true, value_name = "STRATEGY", env = "SECURE_EXEC_STRATEGY")]
    pub strategy: Option<StrategyPreference>,
    /// Path to the sandbox-worker binary
    #[arg(long, global = true, value_name = "PATH", env = "SECURE_EXEC_WORKER")]
    pub worker: Option<PathBuf>,
}

impl LaunchOverrides {
    pub fn apply(&self, settings: &mut SandboxSettings) {
        if let Some(timeout) = self.timeout {
            settings.timeout_seconds = timeout;
        }
        if let Some(memory) = self.memory_mb {
            settings.memory_limit_mb = memory;
        }
        if let Some(cpu) = self.cpu_seconds {
            settings.cpu_time_limit_seconds = cpu;
        }
        if let Some(strategy) = self.strategy {
            settings.strategy = strategy;
        }
        if let Some(worker) = &self.worker {
            settings.worker_path = Some(worker.clone());
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Validate and run a script, printing a JSON report
    Run {
        /// Script file, or `-` for stdin
        #[arg(value_name = "FILE|-")]
        script: String,
        /// Trusted bindings as a JSON object (inline JSON or @path/to/json)
        #[arg(long, value_name = "JSON_OR_@FILE")]
        bindings: Option<String>,
        /// Also print the outcome and state trace
        #[arg(long)]
        trace: bool,
    },
    /// Screen a user query for obvious injection attempts
    Screen {
        /// Query text (or @path/to/file)
        #[arg(value_name = "TEXT_OR_@FILE")]
        text: String,
    },
    /// Validate a script without running it
    Validate {
        /// Script file, or `-` for stdin
        #[arg(value_name = "FILE|-")]
        script: String,
    },
    /// Report the execution strategy and platform capabilities
    Probe,
}

/// Read a value from either a literal string or a @path reference
pub fn read_value_or_file(raw: &str) -> Result<String> {
    if let Some(path) = raw.strip_prefix('@') {
        std::fs::read_to_string(Path::new(path)).with_context(|| format!("Failed to read {}", path))
    } else {
        Ok(raw.to_string())
    }
}

/// Parse a JSON value from either inline JSON or a @path reference
pub fn parse_json_or_file<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let data = read_value_or_file(raw)?;
    serde_json::from_str(&data).context("Failed to parse JSON")
}

/// Read a script from a file, or from stdin when the argument is `-`
pub fn read_script(arg: &str) -> Result<String> {
    if arg == "-" {
        let mut script = String::new();
        std::io::stdin()
            .read_to_string(&mut script)
            .context("Failed to read script from stdin")?;
        Ok(script)
    } else {
        std::fs::read_to_string(arg).with_context(|| format!("Failed to read script {}", arg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use python_sandbox::protocol::TrustedBindings;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_run_command_parses() {
        let args = CliArgs::try_parse_from([
            "secure-exec",
            "run",
            "script.py",
            "--bindings",
            r#"{"rows": [1, 2]}"#,
            "--timeout",
            "2",
            "--strategy",
            "in_process",
        ])
        .unwrap();

        assert_eq!(args.overrides.timeout, Some(2));
        assert_eq!(args.overrides.strategy, Some(StrategyPreference::InProcess));
        match args.command {
            CliCommand::Run { script, bindings, trace } => {
                assert_eq!(script, "script.py");
                assert!(bindings.is_some());
                assert!(!trace);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let parsed = CliArgs::try_parse_from(["secure-exec", "probe", "--strategy", "docker"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_overrides_apply_on_top_of_settings() {
        let overrides = LaunchOverrides {
            timeout: Some(5),
            memory_mb: Some(0),
            cpu_seconds: None,
            strategy: Some(StrategyPreference::Isolated),
            worker: Some(PathBuf::from("/opt/sandbox-worker")),
        };
        let mut settings = SandboxSettings::default();
        overrides.apply(&mut settings);

        assert_eq!(settings.timeout_seconds, 5);
        assert_eq!(settings.memory_limit_mb, 0);
        assert_eq!(settings.cpu_time_limit_seconds, 60);
        assert_eq!(settings.strategy, StrategyPreference::Isolated);
        assert_eq!(settings.worker_path, Some(PathBuf::from("/opt/sandbox-worker")));
    }

    #[test]
    fn test_parse_json_inline_and_from_file() {
        let inline: TrustedBindings = parse_json_or_file(r#"{"n": 3}"#).unwrap();
        assert_eq!(inline.get("n"), Some(&json!(3)));

        let dir = tempdir().unwrap();
        let path = dir.path().join("bindings.json");
        std::fs::write(&path, r#"{"rows": ["a", "b"]}"#).unwrap();

        let from_file: TrustedBindings = parse_json_or_file(&format!("@{}", path.display())).unwrap();
        assert_eq!(from_file.get("rows"), Some(&json!(["a", "b"])));
    }

    #[test]
    fn test_missing_file_reference_is_an_error() {
        assert!(read_value_or_file("@/nonexistent/query.txt").is_err());
        assert_eq!(read_value_or_file("plain text").unwrap(), "plain text");
    }
}
