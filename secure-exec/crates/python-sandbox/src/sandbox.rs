//! Sandboxed RustPython VM configuration
//!
//! This module creates the interpreter a script runs in:
//! - A fresh, isolated interpreter per execution (no site, no user dirs)
//! - `print` captured into a bounded buffer instead of the host's stdout
//! - An optional interrupt channel the host uses to stop a running script
//! - JSON <-> Python value conversion for bindings and results

use rustpython_vm::builtins::{PyDict, PyFloat, PyInt, PyList, PyStr, PyTuple};
use rustpython_vm::function::FuncArgs;
use rustpython_vm::signal::{user_signal_channel, UserSignalReceiver, UserSignalSender};
use rustpython_vm::{AsObject, Interpreter, PyObjectRef, PyResult, Settings, VirtualMachine};
use serde_json::Value;
use std::cell::RefCell;

/// Maximum captured output size (in bytes)
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Message carried by the exception raised when the host interrupts a run
pub const INTERRUPT_MESSAGE: &str = "execution interrupted by the sandbox watchdog";

// Thread-local state for the execution running on this thread
thread_local! {
    static STDOUT_BUFFER: RefCell<String> = RefCell::new(String::new());
    static STDOUT_TRUNCATED: RefCell<bool> = RefCell::new(false);
}

/// Clear all thread-local state for a fresh execution
pub fn reset_execution_state() {
    STDOUT_BUFFER.with(|sb| sb.borrow_mut().clear());
    STDOUT_TRUNCATED.with(|t| *t.borrow_mut() = false);
}

/// Get the stdout buffer
pub fn get_stdout() -> String {
    let mut out = STDOUT_BUFFER.with(|sb| sb.borrow().clone());
    if STDOUT_TRUNCATED.with(|t| *t.borrow()) {
        out.push_str(TRUNCATION_MARKER);
    }
    out
}

/// Append to stdout, dropping anything past `MAX_OUTPUT_SIZE`
pub fn append_stdout(s: &str) {
    STDOUT_BUFFER.with(|sb| {
        let mut buffer = sb.borrow_mut();
        let room = MAX_OUTPUT_SIZE.saturating_sub(buffer.len());
        if s.len() <= room {
            buffer.push_str(s);
            return;
        }
        let mut cut = room;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        buffer.push_str(&s[..cut]);
        STDOUT_TRUNCATED.with(|t| *t.borrow_mut() = true);
    });
}

/// Host side of the interrupt channel.
///
/// Each call queues one exception for the interpreter; the VM raises it at
/// its next signal check (between bytecode instructions).
#[derive(Clone)]
pub struct InterruptHandle {
    tx: UserSignalSender,
}

impl InterruptHandle {
    /// Queue a `KeyboardInterrupt` for the running script.
    ///
    /// Returns false once the interpreter has gone away.
    pub fn interrupt(&self) -> bool {
        self.tx
            .send(Box::new(|vm: &VirtualMachine| {
                Err(vm.new_exception_msg(
                    vm.ctx.exceptions.keyboard_interrupt.to_owned(),
                    INTERRUPT_MESSAGE.to_owned(),
                ))
            }))
            .is_ok()
    }
}

/// Interpreter side of the interrupt channel
pub struct InterruptReceiver {
    rx: UserSignalReceiver,
}

/// Create a linked interrupt handle/receiver pair
pub fn interrupt_channel() -> (InterruptHandle, InterruptReceiver) {
    let (tx, rx) = user_signal_channel();
    (InterruptHandle { tx }, InterruptReceiver { rx })
}

/// Create a sandboxed Python interpreter
pub fn create_sandboxed_interpreter(interrupt: Option<InterruptReceiver>) -> Interpreter {
    let mut settings = Settings::default();
    settings.isolated = true;
    settings.user_site_directory = false;
    settings.import_site = false;

    Interpreter::with_init(settings, move |vm| {
        if let Some(receiver) = interrupt {
            vm.set_user_signal_channel(receiver.rx);
        }
    })
}

/// Replacement for `print` that writes into the capture buffer
pub fn sandbox_print_impl(args: FuncArgs, vm: &VirtualMachine) -> PyResult<()> {
    let sep = match args.kwargs.get("sep") {
        Some(v) if !v.is(&vm.ctx.none) => v.str(vm)?.as_str().to_owned(),
        _ => " ".to_owned(),
    };
    let end = match args.kwargs.get("end") {
        Some(v) if !v.is(&vm.ctx.none) => v.str(vm)?.as_str().to_owned(),
        _ => "\n".to_owned(),
    };

    let mut output = String::new();
    for (i, arg) in args.args.iter().enumerate() {
        if i > 0 {
            output.push_str(&sep);
        }
        let s: String = arg.str(vm)?.to_string();
        output.push_str(&s);
    }
    output.push_str(&end);
    append_stdout(&output);
    Ok(())
}

/// Convert a Python object to JSON Value
pub fn pyobject_to_json(obj: &PyObjectRef, vm: &VirtualMachine) -> PyResult<Value> {
    if obj.is(&vm.ctx.none) {
        return Ok(Value::Null);
    }

    // bool is a subclass of int, so it has to be checked first
    if obj.class().is(vm.ctx.types.bool_type) {
        if let Ok(b) = obj.try_to_value::<bool>(vm) {
            return Ok(Value::Bool(b));
        }
    }

    if let Some(i) = obj.downcast_ref::<PyInt>() {
        if let Ok(n) = i.try_to_primitive::<i64>(vm) {
            return Ok(Value::Number(n.into()));
        }
        // Too large for i64: keep the digits rather than lose them
        return Ok(Value::String(obj.str(vm)?.to_string()));
    }

    if let Some(f) = obj.downcast_ref::<PyFloat>() {
        if let Some(n) = serde_json::Number::from_f64(f.to_f64()) {
            return Ok(Value::Number(n));
        }
        return Ok(Value::Null);
    }

    if let Some(s) = obj.downcast_ref::<PyStr>() {
        return Ok(Value::String(s.as_str().to_string()));
    }

    if let Some(list) = obj.downcast_ref::<PyList>() {
        let items: Result<Vec<Value>, _> = list
            .borrow_vec()
            .iter()
            .map(|item| pyobject_to_json(item, vm))
            .collect();
        return Ok(Value::Array(items?));
    }

    if let Some(tuple) = obj.downcast_ref::<PyTuple>() {
        let items: Result<Vec<Value>, _> = tuple
            .as_slice()
            .iter()
            .map(|item| pyobject_to_json(item, vm))
            .collect();
        return Ok(Value::Array(items?));
    }

    if let Some(dict) = obj.downcast_ref::<PyDict>() {
        let mut map = serde_json::Map::new();
        for (k, v) in dict {
            let key_str: String = k.str(vm)?.to_string();
            let json_value = pyobject_to_json(&v, vm)?;
            map.insert(key_str, json_value);
        }
        return Ok(Value::Object(map));
    }

    // Anything else crosses the boundary as its string form
    let s: String = obj.str(vm)?.to_string();
    Ok(Value::String(s))
}

/// Convert a JSON Value to Python object
pub fn json_to_pyobject(value: &Value, vm: &VirtualMachine) -> PyResult {
    match value {
        Value::Null => Ok(vm.ctx.none()),
        Value::Bool(b) => Ok(vm.ctx.new_bool(*b).into()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(vm.ctx.new_int(i).into())
            } else if let Some(f) = n.as_f64() {
                Ok(vm.ctx.new_float(f).into())
            } else {
                Ok(vm.ctx.none())
            }
        }
        Value::String(s) => Ok(vm.ctx.new_str(s.clone()).into()),
        Value::Array(arr) => {
            let items: Result<Vec<_>, _> = arr.iter().map(|v| json_to_pyobject(v, vm)).collect();
            Ok(vm.ctx.new_list(items?).into())
        }
        Value::Object(obj) => {
            let dict = PyDict::new_ref(&vm.ctx);
            for (k, v) in obj {
                let py_value = json_to_pyobject(v, vm)?;
                dict.set_item(k.as_str(), py_value, vm)?;
            }
            Ok(dict.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_state() {
        append_stdout("left over");
        reset_execution_state();
        assert!(get_stdout().is_empty());
    }

    #[test]
    fn test_stdout_capture() {
        reset_execution_state();
        append_stdout("Hello ");
        append_stdout("World\n");
        assert_eq!(get_stdout(), "Hello World\n");
    }

    #[test]
    fn test_stdout_is_capped() {
        reset_execution_state();
        let chunk = "x".repeat(64 * 1024);
        for _ in 0..20 {
            append_stdout(&chunk);
        }

        let out = get_stdout();
        assert!(out.ends_with("[output truncated]"));
        assert!(out.len() <= MAX_OUTPUT_SIZE + TRUNCATION_MARKER.len());
        reset_execution_state();
    }

    #[test]
    fn test_json_round_trip_through_vm() {
        let interpreter = create_sandboxed_interpreter(None);
        interpreter.enter(|vm| {
            let value = serde_json::json!({"rows": [1, 2.5, "a", null, true]});
            let obj = json_to_pyobject(&value, vm).unwrap();
            assert_eq!(pyobject_to_json(&obj, vm).unwrap(), value);
        });
    }
}
