//! Error taxonomy for the sandbox.
//!
//! Every execution failure ends up as one of these and is converted into an
//! `ExecutionOutcome` inside the supervisor. The `Display` strings are what
//! the caller sees, so they name the blocked construct or the exceeded limit
//! and never include interpreter internals.

use python_sandbox::protocol::ResourceKind;
use std::path::PathBuf;
use thiserror::Error;

/// An execution that did not succeed, in caller-facing form
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Forbidden import/call/attribute, or unparseable script
    #[error("{reason}")]
    Validation { reason: String },

    /// Wall-clock ceiling exceeded
    #[error("Execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Memory or CPU ceiling exceeded
    #[error("{}", resource_message(.kind, .limit))]
    Resource { kind: ResourceKind, limit: u64 },

    /// The script's own logic failed
    #[error("Error executing code: {message}")]
    Runtime { message: String },

    /// The configured isolation cannot run on this host
    #[error("Sandboxed execution is not available on this platform: {0}")]
    Platform(#[from] PlatformError),
}

fn resource_message(kind: &ResourceKind, limit: &u64) -> String {
    match kind {
        ResourceKind::Memory => format!("Execution exceeded memory limit of {} MB", limit),
        ResourceKind::CpuTime => format!("Execution exceeded CPU time limit of {} seconds", limit),
    }
}

/// Resource-control primitives missing or failing on this host
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("{primitive} is not supported on this platform")]
    Unsupported { primitive: &'static str },

    #[error("{call} failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("sandbox worker not found at {}", .path.display())]
    WorkerUnavailable { path: PathBuf },

    #[error("isolated execution requires a unix host")]
    IsolationUnsupported,

    #[error("a {limit_mb} MB memory limit cannot be enforced in-process; use the sandbox worker or set the memory limit to 0")]
    InProcessMemoryCeiling { limit_mb: u64 },

    #[error("{reason}")]
    Unavailable { reason: String },
}

/// Limits that can never be honoured
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimitsError {
    #[error("timeout_seconds must be greater than zero")]
    ZeroTimeout,
}

/// Why a user query was refused by the input sanitizer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RejectionReason {
    #[error("Input cannot be empty")]
    Empty,

    #[error("Input is too long (max {max} characters)")]
    TooLong { max: usize },

    #[error("Input contains potentially dangerous pattern: '{pattern}'")]
    Suspicious { pattern: String },
}

/// Failures of the worker process itself, as opposed to the script it runs
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to read request: {0}")]
    Read(#[source] std::io::Error),

    #[error("invalid request: {0}")]
    Request(#[source] serde_json::Error),

    #[error("failed to apply resource limits: {0}")]
    Limits(#[from] PlatformError),

    #[error("failed to start the interpreter thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to write result: {0}")]
    Write(#[source] serde_json::Error),
}

/// Settings file problems
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings from {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings from {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown execution strategy '{0}' (expected auto, in_process or isolated)")]
    UnknownStrategy(String),
}
