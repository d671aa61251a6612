//! Protocol types for host-worker communication
//!
//! These types define the JSON-based protocol between the supervising host
//! and the sandboxed Python execution environment. A request crosses the
//! boundary once and a result comes back once; nothing else is shared.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Default wall-clock budget for one execution
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
/// Default address-space ceiling for one execution
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 512;
/// Default CPU-time ceiling for one execution
pub const DEFAULT_CPU_TIME_LIMIT_SECONDS: u64 = 60;

/// Caller-supplied values injected into the script's globals.
///
/// Values are JSON so they can be handed to a worker process unchanged.
pub type TrustedBindings = BTreeMap<String, Value>;

/// Resource ceilings for one execution.
///
/// A zero memory or CPU limit disables that ceiling. The timeout must be
/// positive; the host validates this before anything runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub timeout_seconds: u64,
    pub memory_limit_mb: u64,
    pub cpu_time_limit_seconds: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            cpu_time_limit_seconds: DEFAULT_CPU_TIME_LIMIT_SECONDS,
        }
    }
}

impl ExecutionLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Memory ceiling in bytes, `None` when disabled
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        (self.memory_limit_mb > 0).then(|| self.memory_limit_mb.saturating_mul(1024 * 1024))
    }

    /// CPU ceiling, `None` when disabled
    pub fn cpu_time_limit(&self) -> Option<Duration> {
        (self.cpu_time_limit_seconds > 0).then(|| Duration::from_secs(self.cpu_time_limit_seconds))
    }
}

/// Request from host to execute Python code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Script source, already accepted by the host's validator
    pub code: String,
    /// Values to inject as globals
    #[serde(default)]
    pub bindings: TrustedBindings,
    /// Ceilings the worker applies to itself before running the script
    #[serde(default)]
    pub limits: ExecutionLimits,
}

/// Which ceiling an execution ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    CpuTime,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Memory => write!(f, "memory"),
            ResourceKind::CpuTime => write!(f, "CPU time"),
        }
    }
}

/// Best-effort resource consumption, advisory only
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsageSample {
    pub memory_mb: f64,
    pub cpu_seconds: f64,
}

/// Status of execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ExecutionStatus {
    /// Execution completed successfully
    Complete,
    /// The script raised; carries `"<Type>: <message>"`
    Error(String),
    /// Execution was stopped by the host's interrupt
    Interrupted,
    /// The interpreter reported running out of a resource
    ResourceExceeded(ResourceKind),
}

/// Result returned from the sandbox to the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Status of execution
    pub status: ExecutionStatus,
    /// Captured output of `print`
    pub stdout: String,
    /// Value of the `result` global, if the script set one
    pub result: Option<Value>,
    /// Usage sampled by the worker after the run
    #[serde(default)]
    pub usage: Option<ResourceUsageSample>,
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self {
            status: ExecutionStatus::Complete,
            stdout: String::new(),
            result: None,
            usage: None,
        }
    }
}

impl ExecutionResult {
    /// Create a result indicating an error
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error(message.into()),
            ..Default::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ExecutionStatus::Complete
    }
}
