//! Error types for pulselib
//!
//! One sum type covers the whole surface: transient frame outcomes, module
//! failures, and the structural errors a rebuild can raise. Severity ranking
//! lets executors aggregate the worst status observed in a pass.

use thiserror::Error;

use crate::core::record::ModuleId;

#[derive(Error, Debug)]
pub enum SchedulerError {
    /// A frame could not be produced in time. Absorbed by the compute loop.
    #[error("graph compute timed out")]
    Timeout,

    /// A module elected to drop the current frame. Absorbed by the compute loop.
    #[error("frame skipped")]
    Skip,

    /// A module failed in a way the caller may recover from.
    #[error("module error: {0}")]
    Module(String),

    /// An unrecoverable module failure. The worker thread must tear down.
    #[error("fatal module error: {0}")]
    Fatal(String),

    /// The active sub-graph could not be linearized.
    #[error("dependency cycle detected: ordered {ordered} of {expected} modules")]
    Cycle { expected: usize, ordered: usize },

    /// A module's I/O resolved to no active ports where some were required.
    #[error("stale module I/O: {0}")]
    StaleIo(ModuleId),

    /// A branched tensor is consumed by an in-place module.
    #[error("in-place aliasing conflict on tensor {hash:#018x} shared by {modules:?}")]
    InplaceAliasing { hash: u64, modules: Vec<ModuleId> },

    /// Scheduler misuse or executor lifecycle failure.
    #[error("scheduler runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SchedulerError {
    /// Rank used to keep the worst status observed during a pass.
    /// Higher is worse. Success would rank zero.
    pub fn severity(&self) -> u8 {
        match self {
            SchedulerError::Timeout => 1,
            SchedulerError::Skip => 2,
            SchedulerError::Module(_) | SchedulerError::Other(_) => 3,
            SchedulerError::Fatal(_)
            | SchedulerError::Cycle { .. }
            | SchedulerError::StaleIo(_)
            | SchedulerError::InplaceAliasing { .. }
            | SchedulerError::Runtime(_) => 4,
        }
    }

    /// Underruns are logged and swallowed by the compute loop.
    pub fn is_underrun(&self) -> bool {
        matches!(self, SchedulerError::Timeout | SchedulerError::Skip)
    }
}

/// Result type that uses SchedulerError
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(SchedulerError::Timeout.severity() < SchedulerError::Skip.severity());
        assert!(
            SchedulerError::Skip.severity() < SchedulerError::Module("x".into()).severity()
        );
        assert!(
            SchedulerError::Module("x".into()).severity()
                < SchedulerError::Fatal("x".into()).severity()
        );
    }

    #[test]
    fn test_underrun_classification() {
        assert!(SchedulerError::Timeout.is_underrun());
        assert!(SchedulerError::Skip.is_underrun());
        assert!(!SchedulerError::Fatal("boom".into()).is_underrun());
        assert!(!SchedulerError::Cycle { expected: 2, ordered: 1 }.is_underrun());
    }

    #[test]
    fn test_display_messages() {
        let err = SchedulerError::Cycle { expected: 3, ordered: 1 };
        assert!(err.to_string().contains("dependency cycle"));

        let err = SchedulerError::InplaceAliasing {
            hash: 0xdead_beef,
            modules: vec!["fft".into(), "scale".into()],
        };
        assert!(err.to_string().contains("in-place"));
    }
}
