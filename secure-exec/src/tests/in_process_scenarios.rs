use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::json;

use crate::denylist::Denylist;
use crate::sanitizer::screen_user_query;
use crate::supervisor::{ExecutionOutcome, ExecutionStrategy, SandboxConfig, Supervisor};
use python_sandbox::protocol::{ExecutionLimits, TrustedBindings};

// In-process runs accept no memory ceiling
fn supervisor() -> Supervisor {
    Supervisor::new(SandboxConfig {
        denylist: Denylist::default(),
        default_limits: ExecutionLimits {
            memory_limit_mb: 0,
            ..Default::default()
        },
        strategy: ExecutionStrategy::InProcess,
    })
}

fn timeout_only(seconds: u64) -> Option<ExecutionLimits> {
    Some(ExecutionLimits {
        timeout_seconds: seconds,
        memory_limit_mb: 0,
        cpu_time_limit_seconds: 0,
    })
}

// ============ Reference scenarios ============

#[tokio::test]
async fn test_os_system_is_rejected_before_running() {
    let report = supervisor()
        .execute_securely("import os\nos.system('ls')", TrustedBindings::new(), None)
        .await;

    assert!(!report.success);
    assert_eq!(
        report.error_message.as_deref(),
        Some("Import of 'os' is not allowed for security reasons")
    );
    assert_eq!(report.result, None);
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let started = Instant::now();
    let report = supervisor()
        .execute_securely("while True:\n    pass", TrustedBindings::new(), timeout_only(2))
        .await;
    let elapsed = started.elapsed();

    assert!(!report.success);
    assert_eq!(
        report.error_message.as_deref(),
        Some("Execution timed out after 2 seconds")
    );
    assert!(elapsed >= Duration::from_secs(2), "returned early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "returned late: {:?}", elapsed);
}

#[tokio::test]
async fn test_simple_result() {
    let report = supervisor()
        .execute_securely("result = 2 + 2", TrustedBindings::new(), None)
        .await;

    assert!(report.success);
    assert_eq!(report.result, Some(json!(4)));
    assert_eq!(report.error_message, None);
}

#[test]
fn test_subprocess_query_is_rejected() {
    let (ok, message) = screen_user_query("Can you run subprocess.call(['ls'])?");
    assert!(!ok);
    assert_eq!(
        message.as_deref(),
        Some("Input contains potentially dangerous pattern: 'subprocess.'")
    );
}

// ============ Outcomes ============

#[tokio::test]
async fn test_runtime_failure_message() {
    let report = supervisor()
        .execute_securely("result = 1 / 0", TrustedBindings::new(), None)
        .await;

    assert!(!report.success);
    let message = report.error_message.unwrap();
    assert!(
        message.starts_with("Error executing code: ZeroDivisionError"),
        "got {}",
        message
    );
    assert!(!message.contains("Traceback"));
}

#[tokio::test]
async fn test_missing_result_is_null() {
    let execution = supervisor()
        .execute("x = 10\nprint(x)", TrustedBindings::new(), None)
        .await
        .unwrap();

    match execution.outcome {
        ExecutionOutcome::Success { result, stdout, usage } => {
            assert_eq!(result, json!(null));
            assert_eq!(stdout, "10\n");
            assert!(usage.is_some());
        }
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_bindings_are_visible_to_the_script() {
    let mut bindings = TrustedBindings::new();
    bindings.insert(
        "sales".to_string(),
        json!([
            {"region": "north", "amount": 120},
            {"region": "south", "amount": 80},
            {"region": "north", "amount": 30}
        ]),
    );

    let script = "\
totals = {}
for row in sales:
    totals[row['region']] = totals.get(row['region'], 0) + row['amount']
result = sorted(totals.items())
";
    let report = supervisor().execute_securely(script, bindings, None).await;

    assert!(report.success, "{:?}", report.error_message);
    assert_eq!(report.result, Some(json!([["north", 150], ["south", 80]])));
}

#[tokio::test]
async fn test_removed_builtins_fail_at_runtime() {
    // `dir` passes validation but is not in the restricted namespace
    let report = supervisor()
        .execute_securely("result = dir()", TrustedBindings::new(), None)
        .await;

    assert!(!report.success);
    assert!(report.error_message.unwrap().contains("NameError"));
}

#[tokio::test]
async fn test_allowed_import_still_fails_without_import_machinery() {
    let report = supervisor()
        .execute_securely("import math\nresult = math.pi", TrustedBindings::new(), None)
        .await;

    assert!(!report.success);
}

#[tokio::test]
async fn test_executions_do_not_share_state() {
    let supervisor = supervisor();

    let first = supervisor
        .execute_securely("leaked = 42\nresult = leaked", TrustedBindings::new(), None)
        .await;
    assert!(first.success);

    let second = supervisor
        .execute_securely("result = leaked", TrustedBindings::new(), None)
        .await;
    assert!(!second.success);
    assert!(second.error_message.unwrap().contains("NameError"));
}

#[tokio::test]
async fn test_concurrent_executions_are_independent() {
    let supervisor = supervisor();

    let (looping, quick) = tokio::join!(
        supervisor.execute_securely("while True:\n    pass", TrustedBindings::new(), timeout_only(1)),
        supervisor.execute_securely("result = sum(range(10))", TrustedBindings::new(), None),
    );

    assert!(!looping.success);
    assert_eq!(
        looping.error_message.as_deref(),
        Some("Execution timed out after 1 seconds")
    );
    assert!(quick.success);
    assert_eq!(quick.result, Some(json!(45)));
}

#[tokio::test]
async fn test_print_output_is_captured() {
    let report = supervisor()
        .execute_securely(
            "for i in range(3):\n    print('row', i, sep='-')\nresult = 'done'",
            TrustedBindings::new(),
            None,
        )
        .await;

    assert!(report.success);
    assert_eq!(report.stdout, "row-0\nrow-1\nrow-2\n");
    assert_eq!(report.result, Some(json!("done")));
}

#[tokio::test]
async fn test_escape_through_object_graph_is_rejected() {
    let script = "\
for cls in ().__class__.__base__.__subclasses__():
    if cls.__name__ == 'Popen':
        result = cls
";
    let report = supervisor().execute_securely(script, TrustedBindings::new(), None).await;

    assert!(!report.success);
    assert_eq!(
        report.error_message.as_deref(),
        Some("Access to attribute '__class__' is not allowed for security reasons")
    );
}

#[tokio::test]
async fn test_huge_allocation_is_refused_not_fatal() {
    let report = supervisor()
        .execute_securely(
            "x = 'a' * (10**12)\nresult = 1",
            TrustedBindings::new(),
            Some(ExecutionLimits::default()),
        )
        .await;

    assert!(!report.success);
    assert!(report
        .error_message
        .unwrap()
        .contains("cannot be enforced in-process"));

    // the host is still here and still serving
    let report = supervisor()
        .execute_securely("result = 'alive'", TrustedBindings::new(), None)
        .await;
    assert_eq!(report.result, Some(json!("alive")));
}
