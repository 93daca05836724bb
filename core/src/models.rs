//! This module holds general structs that don't fit anywhere else. These
//! structs should mostly just be data containers, with little to no
//! functionality defined on them.

use crate::consts::{
    DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_LOOP_ITERATIONS, DEFAULT_MEMORY_LIMIT,
};
use serde::{Deserialize, Serialize};

/// Host-configurable execution limits and switches. This is needed at
/// construction time and consulted throughout a run.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterOptions {
    /// Upper bound on `loop()` invocations (and on iterations of any single
    /// loop header). Reaching it terminates the run cleanly.
    pub max_loop_iterations: u32,
    /// Upper bound on user-function call depth.
    pub max_call_depth: usize,
    /// Soft ceiling on total value-heap residency, in bytes.
    pub memory_limit_bytes: usize,
    /// When true, external reads block on the sync data provider. When
    /// false, reads yield a canonical zero and the request command is
    /// advisory only.
    pub sync_mode: bool,
    /// Enables tracer event recording.
    pub verbose: bool,
    /// When true, the first command of a run is `VERSION_INFO`.
    pub emit_version_info: bool,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            max_loop_iterations: DEFAULT_MAX_LOOP_ITERATIONS,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT,
            sync_mode: true,
            verbose: false,
            emit_version_info: true,
        }
    }
}

/// The lifecycle state of an [Interpreter](crate::Interpreter). Transitions
/// are driven exclusively by the public control operations and by internal
/// termination.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    /// Constructed (or reset) but not started
    Idle,
    /// Actively executing on the calling thread
    Running,
    /// Suspended between loop iterations; `resume` or `step` continues
    Paused,
    /// Executing a single step unit
    Stepping,
    /// Blocked inside a sync-data-provider call
    WaitingForResponse,
    /// Terminated cleanly (including by loop limit)
    Complete,
    /// Terminated by a fatal runtime error
    Error,
}

/// Execution counters, readable at any time and zeroed by `reset`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    /// Total commands handed to the command callback
    pub commands_emitted: u32,
    /// Completed `loop()` iterations
    pub loop_iterations: u32,
    /// Variables declared across all scopes over the run
    pub variables_declared: u32,
    /// User-defined function invocations
    pub functions_called: u32,
    /// Deepest scope-frame stack observed
    pub peak_scope_depth: usize,
}
