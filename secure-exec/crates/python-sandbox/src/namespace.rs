//! Restricted namespace construction
//!
//! The interpreter's builtins module is cut down to `SAFE_BUILTINS` and the
//! caller's trusted bindings are set as module globals. Nothing else from the
//! standard library is reachable: `__import__` is gone, so every import
//! statement fails at runtime.

use rustpython_vm::builtins::PyStr;
use rustpython_vm::scope::Scope;
use rustpython_vm::{PyResult, VirtualMachine};

use crate::protocol::TrustedBindings;
use crate::sandbox::{json_to_pyobject, sandbox_print_impl};

/// Name of the global the host reads back as the script's result
pub const RESULT_VARIABLE: &str = "result";

/// `__name__` of the module the script runs as
pub const MODULE_NAME: &str = "__sandbox__";

/// Builtins kept in the sandbox. Everything else is removed.
pub const SAFE_BUILTINS: &[&str] = &[
    // numbers
    "abs", "divmod", "pow", "round", "min", "max", "sum",
    "bin", "hex", "oct", "chr", "ord",
    // constructors / conversions
    "bool", "int", "float", "complex", "str", "bytes", "bytearray",
    "list", "tuple", "dict", "set", "frozenset", "slice", "range", "object",
    // iteration helpers
    "all", "any", "enumerate", "filter", "iter", "len", "map", "next",
    "reversed", "sorted", "zip",
    // text
    "format", "repr", "ascii", "hash",
    // type checks
    "isinstance", "issubclass", "hasattr", "callable", "type", "id",
    // class bodies
    "__build_class__", "super", "property", "staticmethod", "classmethod",
    // constants
    "None", "True", "False", "Ellipsis", "NotImplemented", "__debug__",
    // exceptions scripts commonly raise or catch
    "BaseException", "Exception", "ArithmeticError", "AssertionError",
    "AttributeError", "IndexError", "KeyError", "LookupError", "NameError",
    "NotImplementedError", "OverflowError", "RuntimeError", "StopIteration",
    "TypeError", "ValueError", "ZeroDivisionError",
    // captured output
    "print",
];

/// Strip the interpreter's builtins down to `SAFE_BUILTINS`.
///
/// `print` is replaced with the capturing implementation.
pub fn restrict_builtins(vm: &VirtualMachine) -> PyResult<()> {
    let builtins = vm.builtins.dict();

    let mut blocked = Vec::new();
    for (key, _value) in &*builtins {
        match key.downcast_ref::<PyStr>() {
            Some(name) if SAFE_BUILTINS.contains(&name.as_str()) => {}
            Some(name) => blocked.push(name.as_str().to_owned()),
            None => {}
        }
    }
    for name in &blocked {
        builtins.del_item(name.as_str(), vm)?;
    }

    builtins.set_item(
        "print",
        vm.new_function("print", sandbox_print_impl).into(),
        vm,
    )?;

    tracing::trace!(removed = blocked.len(), "restricted builtins");
    Ok(())
}

/// Build the scope a script runs in: restricted builtins plus bindings.
///
/// Bindings are set verbatim; if one shadows a builtin, the binding wins.
pub fn build_namespace(vm: &VirtualMachine, bindings: &TrustedBindings) -> PyResult<Scope> {
    restrict_builtins(vm)?;

    let scope = vm.new_scope_with_builtins();
    scope
        .globals
        .set_item("__name__", vm.ctx.new_str(MODULE_NAME).into(), vm)?;

    for (name, value) in bindings {
        let py_value = json_to_pyobject(value, vm)?;
        scope.globals.set_item(name.as_str(), py_value, vm)?;
    }

    Ok(scope)
}
