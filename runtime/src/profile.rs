//! Execution profiling hooks.

use std::time::Duration;

use parking_lot::Mutex;

/// Summary of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionProfile {
    pub module_name: String,
    pub run_id: u64,
    /// Host time from the compatibility check to the end of issuance (or the
    /// final wait, when the execution blocked).
    pub wall_time: Duration,
    pub units_launched: usize,
    pub streams_used: usize,
    pub blocked: bool,
}

/// Receives callbacks as an execution progresses. Every hook defaults to a no-op.
pub trait ExecutionProfiler: Send + Sync + std::fmt::Debug {
    fn on_unit_launched(&self, _unit: &str, _stream: usize) {}

    fn on_execution_finished(&self, _profile: &ExecutionProfile) {}
}

/// Profiler that keeps everything it is told.
#[derive(Debug, Default)]
pub struct RecordingProfiler {
    launches: Mutex<Vec<(String, usize)>>,
    profiles: Mutex<Vec<ExecutionProfile>>,
}

impl RecordingProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(unit name, stream)` pairs in launch order.
    pub fn launches(&self) -> Vec<(String, usize)> {
        self.launches.lock().clone()
    }

    pub fn profiles(&self) -> Vec<ExecutionProfile> {
        self.profiles.lock().clone()
    }
}

impl ExecutionProfiler for RecordingProfiler {
    fn on_unit_launched(&self, unit: &str, stream: usize) {
        self.launches.lock().push((unit.to_string(), stream));
    }

    fn on_execution_finished(&self, profile: &ExecutionProfile) {
        self.profiles.lock().push(profile.clone());
    }
}
