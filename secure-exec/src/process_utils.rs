//! Process utilities for spawning the sandbox worker.
//!
//! The worker gets nothing from the host it does not need: an empty
//! environment, a neutral working directory, and piped stdio so the only
//! channel in and out is the JSON request/result pair.

use std::process::Stdio;

/// Windows creation flag to prevent console window creation
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Extension trait that configures a command for running untrusted work.
///
/// # Example
/// ```ignore
/// use crate::process_utils::SandboxedCommand;
///
/// let child = tokio::process::Command::new(worker_path)
///     .sandboxed()
///     .spawn()?;
/// ```
pub trait SandboxedCommand {
    /// Clear the environment, pipe all stdio, run from the temp directory,
    /// and make sure the child dies with its handle.
    fn sandboxed(&mut self) -> &mut Self;
}

impl SandboxedCommand for tokio::process::Command {
    fn sandboxed(&mut self) -> &mut Self {
        self.env_clear()
            .current_dir(std::env::temp_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Let the worker's own logging honour the host's filter
        if let Ok(filter) = std::env::var("RUST_LOG") {
            self.env("RUST_LOG", filter);
        }

        #[cfg(windows)]
        self.creation_flags(CREATE_NO_WINDOW);

        self
    }
}
