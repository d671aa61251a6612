//! Execution Supervisor - the validate / prepare / limit / run pipeline
//!
//! Every call walks the same state machine:
//!
//! ```text
//! Idle -> Validating -> Rejected
//!                    -> Validated -> PreparingNamespace -> PlatformUnsupported
//!                                                       -> LimitsApplied -> Running -> Succeeded
//!                                                                                   -> TimedOut
//!                                                                                   -> ResourceExceeded
//!                                                                                   -> RuntimeFailure
//! ```
//!
//! Two strategies run the script once it is accepted:
//! - **InProcess**: a dedicated runner thread with its own interpreter, and a
//!   watchdog on the async runtime that interrupts it on timeout or when the
//!   usage guard reports the CPU budget spent. A failed allocation would abort
//!   the host, so a non-zero memory limit is refused rather than run unguarded.
//! - **Isolated**: a `sandbox-worker` child process that limits itself with
//!   native rlimits; the parent only enforces the wall clock and reads the
//!   exit status.
//!
//! Nothing is retried, and every wait is bounded.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use python_sandbox::protocol::{
    ExecutionLimits, ExecutionRequest, ExecutionResult, ExecutionStatus, ResourceKind,
    ResourceUsageSample, TrustedBindings,
};
use python_sandbox::interrupt_channel;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::time::{timeout, MissedTickBehavior};
use uuid::Uuid;

use crate::denylist::Denylist;
use crate::error::{LimitsError, PlatformError, SandboxError};
use crate::limiter::{self, UsageGuard};
use crate::process_utils::SandboxedCommand;
use crate::settings::{SandboxSettings, StrategyPreference};
use crate::validator::{validate_binding_name, ValidationVerdict, Validator};
use crate::worker::{EXIT_LIMITS_UNAVAILABLE, RUNNER_STACK_SIZE};

/// How often the in-process watchdog checks the runner
pub const WATCHDOG_TICK: Duration = Duration::from_millis(25);

/// How long an interrupted runner gets to unwind before it is abandoned
pub const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

/// File name of the worker binary
pub const WORKER_BINARY: &str = "sandbox-worker";

// ============ Strategy ============

/// Where accepted scripts run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStrategy {
    InProcess,
    Isolated { worker: PathBuf },
}

impl ExecutionStrategy {
    /// Pick the strategy for this process. Called once at startup.
    ///
    /// `Auto` prefers isolation when the worker binary can be found on a unix
    /// host. A forced `Isolated` is kept even when it cannot run, so each
    /// execution reports `PlatformUnsupported` instead of silently degrading.
    pub fn probe(preference: StrategyPreference, worker_path: Option<&Path>) -> Self {
        let worker = worker_path
            .map(Path::to_path_buf)
            .or_else(locate_worker);

        match preference {
            StrategyPreference::InProcess => ExecutionStrategy::InProcess,
            StrategyPreference::Isolated => {
                let worker = worker.unwrap_or_else(|| PathBuf::from(WORKER_BINARY));
                if !cfg!(unix) || !worker.is_file() {
                    tracing::warn!(
                        worker = %worker.display(),
                        "isolated execution requested but not available on this host"
                    );
                }
                ExecutionStrategy::Isolated { worker }
            }
            StrategyPreference::Auto => match worker {
                Some(worker) if cfg!(unix) && worker.is_file() => {
                    tracing::info!(worker = %worker.display(), "using isolated worker processes");
                    ExecutionStrategy::Isolated { worker }
                }
                _ => {
                    tracing::info!("sandbox worker not found, using in-process execution");
                    ExecutionStrategy::InProcess
                }
            },
        }
    }

    /// Why this strategy cannot run these limits here, if it cannot
    fn unavailable(&self, limits: &ExecutionLimits) -> Option<PlatformError> {
        match self {
            ExecutionStrategy::InProcess if limits.memory_limit_mb > 0 => {
                Some(PlatformError::InProcessMemoryCeiling {
                    limit_mb: limits.memory_limit_mb,
                })
            }
            ExecutionStrategy::InProcess => None,
            ExecutionStrategy::Isolated { .. } if !cfg!(unix) => Some(PlatformError::IsolationUnsupported),
            ExecutionStrategy::Isolated { worker } if !worker.is_file() => {
                Some(PlatformError::WorkerUnavailable {
                    path: worker.clone(),
                })
            }
            ExecutionStrategy::Isolated { .. } => None,
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStrategy::InProcess => write!(f, "in_process"),
            ExecutionStrategy::Isolated { .. } => write!(f, "isolated"),
        }
    }
}

/// `sandbox-worker` next to the running executable (or one directory up,
/// which is where cargo puts binaries relative to test executables)
fn locate_worker() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let name = format!("{}{}", WORKER_BINARY, std::env::consts::EXE_SUFFIX);
    exe.ancestors()
        .skip(1)
        .take(2)
        .map(|dir| dir.join(&name))
        .find(|candidate| candidate.is_file())
}

// ============ Config ============

/// Immutable process-lifetime configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub denylist: Denylist,
    pub default_limits: ExecutionLimits,
    pub strategy: ExecutionStrategy,
}

impl SandboxConfig {
    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self {
            denylist: settings.denylist(),
            default_limits: settings.limits(),
            strategy: ExecutionStrategy::probe(settings.strategy, settings.worker_path.as_deref()),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::from_settings(&SandboxSettings::default())
    }
}

/// Reject limits that can never be honoured
pub fn validate_limits(limits: &ExecutionLimits) -> Result<(), LimitsError> {
    if limits.timeout_seconds == 0 {
        return Err(LimitsError::ZeroTimeout);
    }
    Ok(())
}

// ============ State Machine ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Validating,
    Rejected,
    Validated,
    PreparingNamespace,
    LimitsApplied,
    Running,
    Succeeded,
    TimedOut,
    ResourceExceeded,
    RuntimeFailure,
    PlatformUnsupported,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Rejected
                | ExecutionState::Succeeded
                | ExecutionState::TimedOut
                | ExecutionState::ResourceExceeded
                | ExecutionState::RuntimeFailure
                | ExecutionState::PlatformUnsupported
        )
    }
}

/// States one execution passed through, in order
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTrace {
    pub exec_id: Uuid,
    states: Vec<ExecutionState>,
}

impl ExecutionTrace {
    fn new(exec_id: Uuid) -> Self {
        Self {
            exec_id,
            states: vec![ExecutionState::Idle],
        }
    }

    fn transition_to(&mut self, state: ExecutionState) {
        tracing::debug!(exec_id = %self.exec_id, from = ?self.current(), to = ?state, "state transition");
        self.states.push(state);
    }

    pub fn current(&self) -> ExecutionState {
        self.states.last().copied().unwrap_or(ExecutionState::Idle)
    }

    pub fn states(&self) -> &[ExecutionState] {
        &self.states
    }
}

// ============ Outcome ============

/// Exactly one result per execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        result: Value,
        stdout: String,
        usage: Option<ResourceUsageSample>,
    },
    ValidationRejected {
        reason: String,
    },
    TimedOut,
    ResourceExceeded {
        kind: ResourceKind,
    },
    RuntimeFailure {
        message: String,
    },
    PlatformUnsupported {
        reason: String,
    },
}

impl ExecutionOutcome {
    fn terminal_state(&self) -> ExecutionState {
        match self {
            ExecutionOutcome::Success { .. } => ExecutionState::Succeeded,
            ExecutionOutcome::ValidationRejected { .. } => ExecutionState::Rejected,
            ExecutionOutcome::TimedOut => ExecutionState::TimedOut,
            ExecutionOutcome::ResourceExceeded { .. } => ExecutionState::ResourceExceeded,
            ExecutionOutcome::RuntimeFailure { .. } => ExecutionState::RuntimeFailure,
            ExecutionOutcome::PlatformUnsupported { .. } => ExecutionState::PlatformUnsupported,
        }
    }

    /// The failure in error form, given the limits the run used
    pub fn to_error(&self, limits: &ExecutionLimits) -> Option<SandboxError> {
        match self {
            ExecutionOutcome::Success { .. } => None,
            ExecutionOutcome::ValidationRejected { reason } => Some(SandboxError::Validation {
                reason: reason.clone(),
            }),
            ExecutionOutcome::TimedOut => Some(SandboxError::Timeout {
                seconds: limits.timeout_seconds,
            }),
            ExecutionOutcome::ResourceExceeded { kind } => Some(SandboxError::Resource {
                kind: *kind,
                limit: match kind {
                    ResourceKind::Memory => limits.memory_limit_mb,
                    ResourceKind::CpuTime => limits.cpu_time_limit_seconds,
                },
            }),
            ExecutionOutcome::RuntimeFailure { message } => Some(SandboxError::Runtime {
                message: message.clone(),
            }),
            ExecutionOutcome::PlatformUnsupported { reason } => Some(SandboxError::Platform(
                PlatformError::Unavailable {
                    reason: reason.clone(),
                },
            )),
        }
    }
}

impl From<ExecutionResult> for ExecutionOutcome {
    fn from(result: ExecutionResult) -> Self {
        match result.status {
            ExecutionStatus::Complete => ExecutionOutcome::Success {
                result: result.result.unwrap_or(Value::Null),
                stdout: result.stdout,
                usage: result.usage,
            },
            ExecutionStatus::Error(message) => ExecutionOutcome::RuntimeFailure { message },
            // Only the watchdog interrupts, and only on timeout or a crossed ceiling
            ExecutionStatus::Interrupted => ExecutionOutcome::TimedOut,
            ExecutionStatus::ResourceExceeded(kind) => ExecutionOutcome::ResourceExceeded { kind },
        }
    }
}

/// Caller-facing summary of one execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub error_message: Option<String>,
    pub result: Option<Value>,
    pub stdout: String,
}

impl ExecutionReport {
    pub fn from_outcome(outcome: &ExecutionOutcome, limits: &ExecutionLimits) -> Self {
        match outcome {
            ExecutionOutcome::Success { result, stdout, .. } => Self {
                success: true,
                error_message: None,
                result: Some(result.clone()),
                stdout: stdout.clone(),
            },
            failure => Self::failure(failure.to_error(limits).map(|e| e.to_string())),
        }
    }

    fn failure(message: Option<String>) -> Self {
        Self {
            success: false,
            error_message: message,
            result: None,
            stdout: String::new(),
        }
    }
}

/// Outcome, trace and the limits that were in force
#[derive(Debug, Clone, Serialize)]
pub struct SupervisedExecution {
    pub outcome: ExecutionOutcome,
    pub trace: ExecutionTrace,
    pub limits: ExecutionLimits,
}

impl SupervisedExecution {
    pub fn report(&self) -> ExecutionReport {
        ExecutionReport::from_outcome(&self.outcome, &self.limits)
    }
}

// ============ Supervisor ============

/// Runs scripts. `Send + Sync`; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: SandboxConfig,
}

impl Supervisor {
    pub fn new(config: SandboxConfig) -> Self {
        tracing::info!(strategy = %config.strategy, "sandbox supervisor ready");
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Validate the script and, if accepted, run it under the limits.
    ///
    /// `None` limits mean the configured defaults.
    pub async fn execute(
        &self,
        script: &str,
        bindings: TrustedBindings,
        limits: Option<ExecutionLimits>,
    ) -> Result<SupervisedExecution, LimitsError> {
        let limits = limits.unwrap_or(self.config.default_limits);
        validate_limits(&limits)?;

        let exec_id = Uuid::new_v4();
        let mut trace = ExecutionTrace::new(exec_id);
        let started = Instant::now();
        tracing::trace!(%exec_id, script, "script received");

        let outcome = self.run_pipeline(script, bindings, &limits, &mut trace).await;

        let terminal = outcome.terminal_state();
        if trace.current() != terminal {
            trace.transition_to(terminal);
        }

        match &outcome {
            ExecutionOutcome::Success { .. } => tracing::info!(
                %exec_id,
                strategy = %self.config.strategy,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "execution succeeded"
            ),
            other => tracing::info!(
                %exec_id,
                strategy = %self.config.strategy,
                state = ?terminal,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %other.to_error(&limits).map(|e| e.to_string()).unwrap_or_default(),
                "execution failed"
            ),
        }

        Ok(SupervisedExecution {
            outcome,
            trace,
            limits,
        })
    }

    /// `execute`, flattened into the caller-facing report
    pub async fn execute_securely(
        &self,
        script: &str,
        bindings: TrustedBindings,
        limits: Option<ExecutionLimits>,
    ) -> ExecutionReport {
        match self.execute(script, bindings, limits).await {
            Ok(execution) => execution.report(),
            Err(e) => ExecutionReport::failure(Some(e.to_string())),
        }
    }

    /// Current usage of this process, advisory only
    pub fn resource_usage(&self) -> ResourceUsageSample {
        limiter::sample()
    }

    async fn run_pipeline(
        &self,
        script: &str,
        bindings: TrustedBindings,
        limits: &ExecutionLimits,
        trace: &mut ExecutionTrace,
    ) -> ExecutionOutcome {
        trace.transition_to(ExecutionState::Validating);

        if let ValidationVerdict::Rejected { reason, construct } =
            Validator::new(&self.config.denylist).validate(script)
        {
            tracing::warn!(exec_id = %trace.exec_id, ?construct, %reason, "script rejected");
            return ExecutionOutcome::ValidationRejected { reason };
        }
        for name in bindings.keys() {
            if let Err(reason) = validate_binding_name(name) {
                tracing::warn!(exec_id = %trace.exec_id, %reason, "binding rejected");
                return ExecutionOutcome::ValidationRejected { reason };
            }
        }
        trace.transition_to(ExecutionState::Validated);

        trace.transition_to(ExecutionState::PreparingNamespace);
        if let Some(err) = self.config.strategy.unavailable(limits) {
            tracing::warn!(exec_id = %trace.exec_id, error = %err, "strategy unavailable");
            return ExecutionOutcome::PlatformUnsupported {
                reason: err.to_string(),
            };
        }

        let request = ExecutionRequest {
            code: script.to_string(),
            bindings,
            limits: *limits,
        };

        match &self.config.strategy {
            ExecutionStrategy::InProcess => run_in_process(request, trace).await,
            ExecutionStrategy::Isolated { worker } => run_isolated(worker, request, trace).await,
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

// ============ In-process strategy ============

async fn run_in_process(request: ExecutionRequest, trace: &mut ExecutionTrace) -> ExecutionOutcome {
    let exec_id = trace.exec_id;
    let limits = request.limits;

    let guard = match UsageGuard::arm(&limits) {
        Ok(guard) => Some(guard),
        Err(e) => {
            tracing::warn!(%exec_id, error = %e, "usage sampling unavailable, only the timeout is enforced");
            None
        }
    };
    trace.transition_to(ExecutionState::LimitsApplied);

    let (handle, receiver) = interrupt_channel();
    let (tx, mut rx) = oneshot::channel::<ExecutionResult>();

    let spawned = std::thread::Builder::new()
        .name(format!("sandbox-{}", exec_id))
        .stack_size(RUNNER_STACK_SIZE)
        .spawn(move || {
            let result = python_sandbox::execute(&request, Some(receiver));
            let _ = tx.send(result);
        });
    if let Err(e) = spawned {
        return ExecutionOutcome::RuntimeFailure {
            message: format!("failed to start interpreter thread: {}", e),
        };
    }
    trace.transition_to(ExecutionState::Running);

    // None when the timeout is too far out to represent, which never fires
    let deadline = Instant::now().checked_add(limits.timeout());
    let mut verdict: Option<(ExecutionOutcome, Instant)> = None;
    let mut ticker = tokio::time::interval(WATCHDOG_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            finished = &mut rx => {
                if let Some((outcome, _)) = verdict {
                    return outcome;
                }
                return match finished {
                    Ok(mut result) => {
                        if result.usage.is_none() {
                            result.usage = guard.as_ref().map(UsageGuard::usage);
                        }
                        result.into()
                    }
                    Err(_) => ExecutionOutcome::RuntimeFailure {
                        message: "interpreter failed unexpectedly".to_string(),
                    },
                };
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                if verdict.is_none() {
                    let tripped = if deadline.is_some_and(|deadline| now >= deadline) {
                        Some(ExecutionOutcome::TimedOut)
                    } else {
                        guard
                            .as_ref()
                            .and_then(UsageGuard::exceeded)
                            .map(|kind| ExecutionOutcome::ResourceExceeded { kind })
                    };
                    if let Some(outcome) = tripped {
                        tracing::debug!(%exec_id, ?outcome, "watchdog interrupting runner");
                        verdict = Some((outcome, now + INTERRUPT_GRACE));
                    }
                }

                if let Some((outcome, give_up_at)) = &verdict {
                    // Re-sent every tick: another interpreter can consume the
                    // shared wake-up flag before this one sees it
                    handle.interrupt();
                    if now >= *give_up_at {
                        tracing::warn!(
                            %exec_id,
                            "runner ignored interrupts and was abandoned; use the isolated strategy for hard guarantees"
                        );
                        return outcome.clone();
                    }
                }
            }
        }
    }
}

// ============ Isolated strategy ============

/// How the worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl From<std::process::ExitStatus> for WorkerExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return WorkerExit::Signal(signal);
            }
        }
        match status.code() {
            Some(code) => WorkerExit::Code(code),
            None => WorkerExit::Unknown,
        }
    }
}

#[cfg(unix)]
const SIGNAL_CPU_LIMIT: i32 = libc::SIGXCPU;
#[cfg(not(unix))]
const SIGNAL_CPU_LIMIT: i32 = 24;

#[cfg(unix)]
const SIGNALS_MEMORY: [i32; 2] = [libc::SIGKILL, libc::SIGABRT];
#[cfg(not(unix))]
const SIGNALS_MEMORY: [i32; 2] = [9, 6];

/// Turn what the worker left behind into an outcome
pub fn classify_worker_exit(exit: WorkerExit, stdout: &[u8], stderr: &str) -> ExecutionOutcome {
    if let Ok(result) = serde_json::from_slice::<ExecutionResult>(stdout) {
        return result.into();
    }

    if stderr.contains("memory allocation") {
        return ExecutionOutcome::ResourceExceeded {
            kind: ResourceKind::Memory,
        };
    }

    match exit {
        WorkerExit::Signal(signal) if signal == SIGNAL_CPU_LIMIT => ExecutionOutcome::ResourceExceeded {
            kind: ResourceKind::CpuTime,
        },
        WorkerExit::Signal(signal) if SIGNALS_MEMORY.contains(&signal) => {
            ExecutionOutcome::ResourceExceeded {
                kind: ResourceKind::Memory,
            }
        }
        WorkerExit::Signal(signal) => ExecutionOutcome::RuntimeFailure {
            message: format!("worker process crashed (signal {})", signal),
        },
        WorkerExit::Code(EXIT_LIMITS_UNAVAILABLE) => ExecutionOutcome::PlatformUnsupported {
            reason: last_line(stderr)
                .unwrap_or("resource limits could not be applied")
                .to_string(),
        },
        WorkerExit::Code(code) => ExecutionOutcome::RuntimeFailure {
            message: format!("worker process crashed (exit code {})", code),
        },
        WorkerExit::Unknown => ExecutionOutcome::RuntimeFailure {
            message: "worker process crashed".to_string(),
        },
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|line| !line.is_empty())
}

async fn run_isolated(worker: &Path, request: ExecutionRequest, trace: &mut ExecutionTrace) -> ExecutionOutcome {
    let exec_id = trace.exec_id;
    let wall_clock = request.limits.timeout();

    let payload = match serde_json::to_vec(&request) {
        Ok(payload) => payload,
        Err(e) => {
            return ExecutionOutcome::RuntimeFailure {
                message: format!("failed to encode request: {}", e),
            };
        }
    };

    let mut child = match Command::new(worker).sandboxed().spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(%exec_id, worker = %worker.display(), error = %e, "failed to spawn sandbox worker");
            return ExecutionOutcome::PlatformUnsupported {
                reason: format!("failed to start sandbox worker: {}", e),
            };
        }
    };
    // The worker installs its rlimits before touching the script
    trace.transition_to(ExecutionState::LimitsApplied);

    let stdout_reader = child.stdout.take().map(|mut out| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf).await;
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut err| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    trace.transition_to(ExecutionState::Running);
    let waited = timeout(wall_clock, exchange(&mut child, payload)).await;

    let status = match waited {
        Err(_) => {
            if let Err(e) = child.kill().await {
                tracing::error!(%exec_id, error = %e, "failed to kill timed-out worker");
            }
            return ExecutionOutcome::TimedOut;
        }
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return ExecutionOutcome::RuntimeFailure {
                message: format!("lost contact with sandbox worker: {}", e),
            };
        }
        Ok(Ok(status)) => status,
    };

    let stdout = match stdout_reader {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };
    let stderr = match stderr_reader {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    for line in stderr.lines() {
        tracing::debug!(%exec_id, "worker: {}", line);
    }

    let exit = WorkerExit::from(status);
    let outcome = classify_worker_exit(exit, &stdout, &stderr);
    if matches!(outcome, ExecutionOutcome::RuntimeFailure { .. }) && !status.success() {
        tracing::error!(%exec_id, ?exit, "sandbox worker crashed");
    }
    outcome
}

/// Hand the request to the worker and wait for it to exit
async fn exchange(child: &mut Child, payload: Vec<u8>) -> std::io::Result<std::process::ExitStatus> {
    if let Some(mut stdin) = child.stdin.take() {
        // A worker that dies early closes the pipe; its exit status says why
        if let Err(e) = stdin.write_all(&payload).await {
            tracing::debug!(error = %e, "worker stopped reading its request");
        }
        drop(stdin);
    }
    child.wait().await
}
