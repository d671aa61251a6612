//! Process-level tests for the isolated strategy
//!
//! Each execution runs in a real `sandbox-worker` child with native rlimits.

#![cfg(unix)]

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde_json::json;

use secure_exec::denylist::Denylist;
use secure_exec::supervisor::ExecutionState;
use secure_exec::{
    ExecutionLimits, ExecutionOutcome, ExecutionStrategy, ResourceKind, SandboxConfig, Supervisor,
    TrustedBindings,
};

fn isolated() -> Supervisor {
    Supervisor::new(SandboxConfig {
        denylist: Denylist::default(),
        default_limits: ExecutionLimits::default(),
        strategy: ExecutionStrategy::Isolated {
            worker: PathBuf::from(env!("CARGO_BIN_EXE_sandbox-worker")),
        },
    })
}

#[tokio::test]
async fn test_result_comes_back_from_worker() {
    let mut bindings = TrustedBindings::new();
    bindings.insert("values".to_string(), json!([3, 4, 5]));

    let execution = isolated()
        .execute("print('summing')\nresult = sum(values)", bindings, None)
        .await
        .unwrap();

    match execution.outcome {
        ExecutionOutcome::Success { result, stdout, usage } => {
            assert_eq!(result, json!(12));
            assert_eq!(stdout, "summing\n");
            assert!(usage.is_some(), "worker should report its usage");
        }
        other => panic!("expected success, got {:?}", other),
    }
    assert_eq!(execution.trace.current(), ExecutionState::Succeeded);
}

#[tokio::test]
async fn test_worker_is_killed_on_timeout() {
    let limits = ExecutionLimits {
        timeout_seconds: 2,
        memory_limit_mb: 512,
        cpu_time_limit_seconds: 60,
    };

    let started = Instant::now();
    let report = isolated()
        .execute_securely("while True:\n    pass", TrustedBindings::new(), Some(limits))
        .await;
    let elapsed = started.elapsed();

    assert!(!report.success);
    assert_eq!(
        report.error_message.as_deref(),
        Some("Execution timed out after 2 seconds")
    );
    assert!(elapsed < Duration::from_secs(5), "returned late: {:?}", elapsed);
}

#[tokio::test]
async fn test_cpu_ceiling_is_enforced_by_the_kernel() {
    let limits = ExecutionLimits {
        timeout_seconds: 30,
        memory_limit_mb: 512,
        cpu_time_limit_seconds: 1,
    };

    let execution = isolated()
        .execute("while True:\n    pass", TrustedBindings::new(), Some(limits))
        .await
        .unwrap();

    assert_eq!(
        execution.outcome,
        ExecutionOutcome::ResourceExceeded {
            kind: ResourceKind::CpuTime
        }
    );
    assert_eq!(
        execution.report().error_message.as_deref(),
        Some("Execution exceeded CPU time limit of 1 seconds")
    );
}

#[tokio::test]
async fn test_memory_ceiling_is_enforced_by_the_kernel() {
    let limits = ExecutionLimits {
        timeout_seconds: 30,
        memory_limit_mb: 512,
        cpu_time_limit_seconds: 30,
    };

    let script = "\
chunks = []
while True:
    chunks.append('x' * (50000000 + len(chunks)))
";
    let execution = isolated()
        .execute(script, TrustedBindings::new(), Some(limits))
        .await
        .unwrap();

    assert_eq!(
        execution.outcome,
        ExecutionOutcome::ResourceExceeded {
            kind: ResourceKind::Memory
        }
    );
}

#[tokio::test]
async fn test_script_errors_are_runtime_failures() {
    let report = isolated()
        .execute_securely("result = {}['missing']", TrustedBindings::new(), None)
        .await;

    assert!(!report.success);
    assert!(report
        .error_message
        .unwrap()
        .starts_with("Error executing code: KeyError"));
}

#[tokio::test]
async fn test_rejected_script_never_reaches_the_worker() {
    let execution = isolated()
        .execute("from socket import socket", TrustedBindings::new(), None)
        .await
        .unwrap();

    assert_eq!(
        execution.outcome,
        ExecutionOutcome::ValidationRejected {
            reason: "Import from 'socket' is not allowed for security reasons".to_string()
        }
    );
    assert!(!execution.trace.states().contains(&ExecutionState::Running));
}

fn memory_only(mb: u64) -> Option<ExecutionLimits> {
    Some(ExecutionLimits {
        timeout_seconds: 30,
        memory_limit_mb: mb,
        cpu_time_limit_seconds: 30,
    })
}

#[tokio::test]
async fn test_small_memory_ceiling_still_runs_trivial_scripts() {
    for mb in [32, 64, 96, 128] {
        let execution = isolated()
            .execute("result = 2 + 2", TrustedBindings::new(), memory_only(mb))
            .await
            .unwrap();

        match execution.outcome {
            ExecutionOutcome::Success { result, .. } => assert_eq!(result, json!(4)),
            other => panic!("{} MB: expected success, got {:?}", mb, other),
        }
    }
}

#[tokio::test]
async fn test_growth_past_small_ceiling_is_memory() {
    let script = "\
chunks = []
while True:
    chunks.append('x' * (1000000 + len(chunks)))
";
    let execution = isolated()
        .execute(script, TrustedBindings::new(), memory_only(64))
        .await
        .unwrap();

    assert_eq!(
        execution.outcome,
        ExecutionOutcome::ResourceExceeded {
            kind: ResourceKind::Memory
        }
    );
}

#[tokio::test]
async fn test_single_huge_allocation_is_memory() {
    let execution = isolated()
        .execute(
            "x = 'a' * (200 * 1024 * 1024)\nresult = len(x)",
            TrustedBindings::new(),
            memory_only(64),
        )
        .await
        .unwrap();

    assert_eq!(
        execution.outcome,
        ExecutionOutcome::ResourceExceeded {
            kind: ResourceKind::Memory
        }
    );
}

#[test]
fn test_worker_keeps_stderr_quiet_on_success() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_sandbox-worker"))
        .env_clear()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let request = json!({
        "code": "result = 'ok'",
        "bindings": {},
        "limits": {"timeout_seconds": 5, "memory_limit_mb": 64, "cpu_time_limit_seconds": 5}
    });
    child
        .stdin
        .take()
        .unwrap()
        .write_all(request.to_string().as_bytes())
        .unwrap();

    let output = child.wait_with_output().unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(output.status.success(), "worker failed: {}", stderr);
    assert!(!stderr.contains("encodings"), "unexpected stderr: {}", stderr);
    let reply: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(reply["result"], json!("ok"));
}
