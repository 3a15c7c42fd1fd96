//! Synchronous reference executor.
//!
//! Runs its module run directly on the calling thread. This is the executor
//! for CPU runs, where there is no device queue to hand work to.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::device::Device;
use crate::core::error::{Result, SchedulerError};
use crate::core::module::SharedModule;
use crate::core::record::ModuleId;

use super::{poll_ready, run_pass, GraphExecutor};

pub struct InlineGraph {
    device: Device,
    modules: Vec<(ModuleId, SharedModule)>,
    wired_inputs: BTreeSet<u64>,
    wired_outputs: BTreeSet<u64>,
    externally_wired_inputs: BTreeSet<u64>,
    externally_wired_outputs: BTreeSet<u64>,
    frame: AtomicU64,
    created: bool,
}

impl InlineGraph {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            modules: Vec::new(),
            wired_inputs: BTreeSet::new(),
            wired_outputs: BTreeSet::new(),
            externally_wired_inputs: BTreeSet::new(),
            externally_wired_outputs: BTreeSet::new(),
            frame: AtomicU64::new(0),
            created: false,
        }
    }
}

impl GraphExecutor for InlineGraph {
    fn device(&self) -> Device {
        self.device
    }

    fn set_wired_input(&mut self, port_hash: u64) {
        self.wired_inputs.insert(port_hash);
    }

    fn set_wired_output(&mut self, port_hash: u64) {
        self.wired_outputs.insert(port_hash);
    }

    fn set_externally_wired_input(&mut self, port_hash: u64) {
        self.externally_wired_inputs.insert(port_hash);
    }

    fn set_externally_wired_output(&mut self, port_hash: u64) {
        self.externally_wired_outputs.insert(port_hash);
    }

    fn set_module(&mut self, name: ModuleId, module: SharedModule) {
        self.modules.push((name, module));
    }

    fn create(&mut self) -> Result<()> {
        tracing::debug!(
            "[{}] inline graph created: {} module(s), {} wired input(s), {} wired output(s), {} external",
            self.device,
            self.modules.len(),
            self.wired_inputs.len(),
            self.wired_outputs.len(),
            self.externally_wired_inputs.len() + self.externally_wired_outputs.len(),
        );
        self.created = true;
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        self.created = false;
        Ok(())
    }

    fn compute_ready(&self) -> Result<()> {
        poll_ready(&self.modules)
    }

    fn compute(&self) -> Result<()> {
        if !self.created {
            return Err(SchedulerError::Runtime(
                "graph executor used before create()".into(),
            ));
        }
        let frame = self.frame.fetch_add(1, Ordering::Relaxed);
        run_pass(&self.modules, self.device, frame)
    }

    fn wired_inputs(&self) -> &BTreeSet<u64> {
        &self.wired_inputs
    }

    fn wired_outputs(&self) -> &BTreeSet<u64> {
        &self.wired_outputs
    }

    fn externally_wired_inputs(&self) -> &BTreeSet<u64> {
        &self.externally_wired_inputs
    }

    fn externally_wired_outputs(&self) -> &BTreeSet<u64> {
        &self.externally_wired_outputs
    }

    fn module_count(&self) -> usize {
        self.modules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::module::{Compute, Module, RuntimeMetadata};
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct FrameRecorder {
        frames: Arc<Mutex<Vec<u64>>>,
    }

    impl Module for FrameRecorder {
        fn device(&self) -> Device {
            Device::Cpu
        }

        fn as_compute(&mut self) -> Option<&mut dyn Compute> {
            Some(self)
        }
    }

    impl Compute for FrameRecorder {
        fn compute(&mut self, meta: &RuntimeMetadata) -> Result<()> {
            self.frames.lock().push(meta.frame);
            Ok(())
        }
    }

    #[test]
    fn test_compute_before_create_fails() {
        let graph = InlineGraph::new(Device::Cpu);
        assert!(matches!(graph.compute(), Err(SchedulerError::Runtime(_))));
    }

    #[test]
    fn test_frame_counter_advances() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let mut graph = InlineGraph::new(Device::Cpu);
        graph.set_module(
            "rec".into(),
            Arc::new(Mutex::new(FrameRecorder {
                frames: Arc::clone(&frames),
            })),
        );
        graph.create().unwrap();
        graph.compute().unwrap();
        graph.compute().unwrap();
        assert_eq!(*frames.lock(), vec![0, 1]);
    }

    #[test]
    fn test_wired_sets_accumulate() {
        let mut graph = InlineGraph::new(Device::Cpu);
        graph.set_wired_input(7);
        graph.set_wired_input(7);
        graph.set_wired_output(9);
        graph.set_externally_wired_output(9);
        assert_eq!(graph.wired_inputs().len(), 1);
        assert_eq!(graph.wired_outputs().len(), 1);
        assert_eq!(graph.externally_wired_outputs().len(), 1);
    }
}
