//! Module contracts.
//!
//! A module is a single owning value. The compute and present capabilities
//! are projections borrowed from it, not independently shared handles; the
//! scheduler probes both once at registration and holds one
//! `Arc<Mutex<dyn Module>>` per module thereafter.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::device::Device;
use crate::core::error::Result;

/// Per-pass context handed to every compute invocation.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeMetadata {
    /// Monotonic frame counter of the owning executor.
    pub frame: u64,
    /// Device the executor runs on.
    pub device: Device,
}

/// Heavy-work capability of a module.
pub trait Compute {
    /// Non-blocking readiness probe. `SchedulerError::Timeout` requests a
    /// re-poll; anything else is fatal to the pass.
    fn compute_ready(&mut self) -> Result<()> {
        Ok(())
    }

    fn compute(&mut self, meta: &RuntimeMetadata) -> Result<()>;
}

/// Render-side capability of a module. Present modules are self-contained
/// and do not exchange data through the scheduler.
pub trait Present {
    fn present(&mut self) -> Result<()>;
}

/// A unit of work with typed ports bound to a device.
pub trait Module: Send {
    fn device(&self) -> Device;

    /// Emit human-readable configuration lines through the process logger.
    fn info(&self) {}

    fn as_compute(&mut self) -> Option<&mut dyn Compute> {
        None
    }

    fn as_present(&mut self) -> Option<&mut dyn Present> {
        None
    }
}

/// Shared module handle as stored by the scheduler and the executors.
pub type SharedModule = Arc<Mutex<dyn Module>>;
