//! Per-device graph executors.
//!
//! An executor owns one contiguous run of modules sharing a device and a
//! cluster, in dependency order. The scheduler feeds it wired-port
//! bookkeeping, chains externally-wired ports across executor boundaries,
//! then drives `compute_ready()`/`compute()` once per pass.

mod inline;
mod worker;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

pub use inline::InlineGraph;
pub use worker::WorkerGraph;

use crate::core::device::Device;
use crate::core::error::{Result, SchedulerError};
use crate::core::module::{RuntimeMetadata, SharedModule};
use crate::core::record::ModuleId;

/// Device-specific execution of an ordered module run.
///
/// Wiring accumulates between construction and `create()`; `create()` is
/// only called once all wiring is set. `compute()` must invoke every module
/// and return the worst status observed rather than short-circuiting.
pub trait GraphExecutor: Send + Sync {
    fn device(&self) -> Device;

    fn set_wired_input(&mut self, port_hash: u64);
    fn set_wired_output(&mut self, port_hash: u64);
    fn set_externally_wired_input(&mut self, port_hash: u64);
    fn set_externally_wired_output(&mut self, port_hash: u64);

    /// Append a module to the executor's ordered run.
    fn set_module(&mut self, name: ModuleId, module: SharedModule);

    fn create(&mut self) -> Result<()>;
    fn destroy(&mut self) -> Result<()>;

    /// Non-blocking readiness probe. `SchedulerError::Timeout` asks the
    /// scheduler to re-poll; other errors are fatal.
    fn compute_ready(&self) -> Result<()>;

    /// Run one pass over the module run.
    fn compute(&self) -> Result<()>;

    fn wired_inputs(&self) -> &BTreeSet<u64>;
    fn wired_outputs(&self) -> &BTreeSet<u64>;
    fn externally_wired_inputs(&self) -> &BTreeSet<u64>;
    fn externally_wired_outputs(&self) -> &BTreeSet<u64>;

    fn module_count(&self) -> usize;
}

/// Factory producing a fresh executor for a device run.
pub type GraphFactory = dyn Fn(Device) -> Box<dyn GraphExecutor> + Send + Sync;

/// Default executor selection: CPU runs inline on the compute thread,
/// accelerator devices get a worker thread modeling their queue.
pub fn default_graph_factory() -> Arc<GraphFactory> {
    graph_factory_with_frame_timeout(worker::DEFAULT_FRAME_TIMEOUT)
}

/// Default selection with the worker frame budget taken from the scheduler
/// configuration.
pub fn graph_factory_with_frame_timeout(frame_timeout: Duration) -> Arc<GraphFactory> {
    Arc::new(move |device| match device {
        Device::Cpu | Device::None => Box::new(InlineGraph::new(device)) as Box<dyn GraphExecutor>,
        Device::Cuda | Device::Metal | Device::Vulkan => {
            Box::new(WorkerGraph::with_frame_timeout(device, frame_timeout))
        }
    })
}

/// Invoke every module's compute capability in order, keeping the worst
/// status observed. Modules without the capability are skipped.
pub(crate) fn run_pass(
    modules: &[(ModuleId, SharedModule)],
    device: Device,
    frame: u64,
) -> Result<()> {
    let meta = RuntimeMetadata { frame, device };
    let mut worst: Option<SchedulerError> = None;
    for (name, module) in modules {
        let mut guard = module.lock();
        let Some(compute) = guard.as_compute() else {
            continue;
        };
        if let Err(err) = compute.compute(&meta) {
            if err.is_underrun() {
                tracing::warn!("[{name}] underrun: {err}");
            } else {
                tracing::error!("[{name}] compute failed: {err}");
            }
            if worst.as_ref().map_or(true, |w| err.severity() > w.severity()) {
                worst = Some(err);
            }
        }
    }
    match worst {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// Poll every module's readiness probe in order.
pub(crate) fn poll_ready(modules: &[(ModuleId, SharedModule)]) -> Result<()> {
    for (_, module) in modules {
        let mut guard = module.lock();
        if let Some(compute) = guard.as_compute() {
            compute.compute_ready()?;
        }
    }
    Ok(())
}
