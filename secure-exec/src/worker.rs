//! Worker side of the isolated strategy.
//!
//! The `sandbox-worker` binary reads one `ExecutionRequest` from stdin, runs
//! the script under native limits and writes one `ExecutionResult` to stdout.
//! The limits go on from the runner thread once the interpreter is built, so
//! neither the runner stack nor interpreter start-up eat into the budget.
//! The exit code tells the supervisor what happened when no result could be
//! written.

use std::io::{Read, Write};

use python_sandbox::protocol::{ExecutionRequest, ExecutionResult};

use crate::error::WorkerError;
use crate::limiter;

/// Stack size of the thread that runs the interpreter
pub const RUNNER_STACK_SIZE: usize = 64 * 1024 * 1024;

/// The request on stdin could not be read or parsed
pub const EXIT_BAD_REQUEST: i32 = 2;
/// Native resource limits could not be installed
pub const EXIT_LIMITS_UNAVAILABLE: i32 = 3;
/// The result could not be written back
pub const EXIT_WRITE_FAILED: i32 = 4;
/// The runner thread could not be started
pub const EXIT_SPAWN_FAILED: i32 = 5;

impl WorkerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::Read(_) | WorkerError::Request(_) => EXIT_BAD_REQUEST,
            WorkerError::Limits(_) => EXIT_LIMITS_UNAVAILABLE,
            WorkerError::Write(_) => EXIT_WRITE_FAILED,
            WorkerError::Spawn(_) => EXIT_SPAWN_FAILED,
        }
    }
}

/// Parse a request from raw input
pub fn read_request(mut input: impl Read) -> Result<ExecutionRequest, WorkerError> {
    let mut raw = String::new();
    input.read_to_string(&mut raw).map_err(WorkerError::Read)?;
    serde_json::from_str(&raw).map_err(WorkerError::Request)
}

/// Run a request on a dedicated large-stack thread, applying its limits to
/// this process just before the first statement
pub fn handle(request: ExecutionRequest) -> Result<ExecutionResult, WorkerError> {
    let runner = std::thread::Builder::new()
        .name("sandbox-runner".to_string())
        .stack_size(RUNNER_STACK_SIZE)
        .spawn(move || {
            python_sandbox::execute_with_setup(&request, None, || limiter::apply(&request.limits))
        })
        .map_err(WorkerError::Spawn)?;

    let mut result = match runner.join() {
        Ok(outcome) => outcome?,
        Err(_) => {
            tracing::error!("interpreter thread panicked");
            ExecutionResult::error("interpreter failed unexpectedly")
        }
    };
    result.usage = Some(limiter::sample());
    Ok(result)
}

/// Full worker cycle: read, run under limits, reply
pub fn serve(input: impl Read, mut output: impl Write) -> Result<(), WorkerError> {
    let request = read_request(input)?;
    tracing::debug!(
        code_len = request.code.len(),
        bindings = request.bindings.len(),
        "worker received request"
    );

    let result = handle(request)?;
    serde_json::to_writer(&mut output, &result).map_err(WorkerError::Write)?;
    output
        .flush()
        .map_err(|e| WorkerError::Write(serde_json::Error::io(e)))?;
    Ok(())
}
