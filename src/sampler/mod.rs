//! External sampler supervision
//!
//! The sampler (powermetrics) runs as a child process writing NUL-delimited property lists
//! to its stdout. This module builds its command line, decides when to restart it, and
//! owns its lifecycle.

pub mod command;
pub mod policy;
pub mod supervisor;

pub use command::{SamplerCommand, SamplerProcess};
pub use policy::{Backoff, ExitReport, FlapDetector, RestartDecision, RestartPolicy};
pub use supervisor::{Control, RecordSink, Supervisor, SupervisorHandle};

use serde::Serialize;

/// Sampler process lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SamplerState {
    #[default]
    Starting,
    Running,
    Restarting,
    Stopped,
    Failed,
}

/// Supervisor-side status published alongside the metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SamplerStatus {
    pub state: SamplerState,
    /// Process generation, 1 for the first launch
    pub generation: u64,
    /// Restarts after an expected max-sample-count exit
    pub planned_restarts: u64,
    /// Restarts after an unexpected exit
    pub failed_restarts: u64,
    /// Too many failed restarts within the flap window
    pub flapping: bool,
    /// Exit code of the last process, when it exited normally
    pub last_exit_code: Option<i32>,
}
