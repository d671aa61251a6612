//! End-to-end scenarios for the in-process strategy
//!
//! These run the full pipeline (validate, prepare, limit, run) inside the
//! test process. Scenarios that need the worker binary live in `tests/`.

pub mod in_process_scenarios;
