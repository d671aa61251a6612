//! secure-exec - sandboxed execution of agent-generated Python scripts
//!
//! Scripts are screened, statically validated against a denylist, and run in a
//! restricted interpreter under wall-clock, CPU and memory ceilings. Every
//! call ends in exactly one `ExecutionOutcome`; the host never crashes or
//! hangs because of a script.

pub mod actors;
pub mod cli;
pub mod denylist;
pub mod error;
pub mod limiter;
pub mod process_utils;
pub mod sanitizer;
pub mod settings;
pub mod supervisor;
pub mod validator;
pub mod worker;

#[cfg(test)]
mod tests;

pub use error::{LimitsError, PlatformError, RejectionReason, SandboxError, SettingsError};
pub use python_sandbox::protocol::{ExecutionLimits, ResourceKind, ResourceUsageSample, TrustedBindings};
pub use sanitizer::screen_user_query;
pub use supervisor::{ExecutionOutcome, ExecutionReport, ExecutionStrategy, SandboxConfig, Supervisor};
pub use validator::{ValidationVerdict, Validator};

use tracing_subscriber::EnvFilter;

/// Default log filter when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "secure_exec=info";

/// Install the stderr log subscriber used by both binaries
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
