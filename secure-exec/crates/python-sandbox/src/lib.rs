//! Python Sandbox - Restricted Python execution via RustPython
//!
//! This crate provides the execution half of the secure-exec sandbox:
//! - Uses RustPython for embedded Python execution
//! - Runs every script in a fresh interpreter with allow-listed builtins only
//! - Injects caller-trusted bindings as globals and reads `result` back out
//! - Captures `print` output
//! - Accepts an interrupt channel so a supervisor can stop a running script
//!
//! Static validation and resource ceilings live in the host crate; this crate
//! assumes the code it is given has already been accepted.

pub mod namespace;
pub mod protocol;
pub mod sandbox;

use namespace::{build_namespace, RESULT_VARIABLE};
use protocol::{ExecutionRequest, ExecutionResult, ExecutionStatus, ResourceKind};
use rustpython_compiler::Mode;
use rustpython_vm::builtins::PyBaseExceptionRef;
use rustpython_vm::{AsObject, VirtualMachine};
use sandbox::{create_sandboxed_interpreter, get_stdout, pyobject_to_json, reset_execution_state};

pub use sandbox::{interrupt_channel, InterruptHandle, InterruptReceiver};

/// Execute Python code in the sandbox
///
/// This is the main entry point for code execution.
/// It creates a fresh VM, restricts it, and executes the code. Passing an
/// interrupt receiver lets the caller stop the run from another thread.
pub fn execute(request: &ExecutionRequest, interrupt: Option<InterruptReceiver>) -> ExecutionResult {
    match execute_with_setup(request, interrupt, || Ok::<(), std::convert::Infallible>(())) {
        Ok(result) => result,
        Err(never) => match never {},
    }
}

/// Execute Python code, calling `before_run` once the interpreter, namespace
/// and bytecode are ready and before the first statement runs.
///
/// Anything `before_run` does to the process (such as installing resource
/// limits) therefore covers the script but not the interpreter start-up.
/// An error from `before_run` aborts the execution and is returned as is.
pub fn execute_with_setup<E>(
    request: &ExecutionRequest,
    interrupt: Option<InterruptReceiver>,
    before_run: impl FnOnce() -> Result<(), E>,
) -> Result<ExecutionResult, E> {
    reset_execution_state();

    let interpreter = create_sandboxed_interpreter(interrupt);

    interpreter.enter(|vm| {
        let scope = match build_namespace(vm, &request.bindings) {
            Ok(scope) => scope,
            Err(exc) => {
                return Ok(ExecutionResult::error(format!(
                    "Sandbox setup failed: {}",
                    describe_exception(&exc, vm)
                )));
            }
        };

        let code = match vm.compile(&request.code, Mode::Exec, "<code_execution>".to_string()) {
            Ok(code) => code,
            Err(e) => {
                return Ok(ExecutionResult::error(format!("SyntaxError: {:?}", e)));
            }
        };

        before_run()?;

        Ok(match vm.run_code_obj(code, scope.clone()) {
            Ok(_) => {
                let result = match scope.globals.get_item_opt(RESULT_VARIABLE, vm) {
                    Ok(Some(value)) if !value.is(&vm.ctx.none) => match pyobject_to_json(&value, vm) {
                        Ok(json) => Some(json),
                        Err(exc) => {
                            return Ok(ExecutionResult {
                                stdout: get_stdout(),
                                ..ExecutionResult::error(describe_exception(&exc, vm))
                            });
                        }
                    },
                    _ => None,
                };

                ExecutionResult {
                    status: ExecutionStatus::Complete,
                    stdout: get_stdout(),
                    result,
                    usage: None,
                }
            }
            Err(exc) => ExecutionResult {
                status: classify_exception(&exc, vm),
                stdout: get_stdout(),
                result: None,
                usage: None,
            },
        })
    })
}

/// Map an escaped exception onto an execution status
fn classify_exception(exc: &PyBaseExceptionRef, vm: &VirtualMachine) -> ExecutionStatus {
    if exc.fast_isinstance(vm.ctx.exceptions.keyboard_interrupt) {
        ExecutionStatus::Interrupted
    } else if exc.fast_isinstance(vm.ctx.exceptions.memory_error) {
        ExecutionStatus::ResourceExceeded(ResourceKind::Memory)
    } else {
        ExecutionStatus::Error(describe_exception(exc, vm))
    }
}

/// `"<Type>: <message>"` for an exception, without any traceback
fn describe_exception(exc: &PyBaseExceptionRef, vm: &VirtualMachine) -> String {
    let type_name = (*exc.class().name()).to_owned();
    let message = match exc.as_object().str(vm) {
        Ok(s) => s.as_str().to_owned(),
        Err(_) => String::new(),
    };

    if message.is_empty() {
        type_name
    } else {
        format!("{}: {}", type_name, message)
    }
}
