//! Worker-thread reference executor.
//!
//! Models an asynchronous device queue: `create()` spawns a dedicated
//! worker, `compute()` submits a pass and waits for the receipt within the
//! frame budget, and `compute_ready()` reports a timeout while a previous
//! frame is still in flight.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::core::device::Device;
use crate::core::error::{Result, SchedulerError};
use crate::core::module::SharedModule;
use crate::core::record::ModuleId;

use super::{poll_ready, run_pass, GraphExecutor};

pub(crate) const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_millis(100);

struct Worker {
    thread: JoinHandle<()>,
    job_tx: Sender<()>,
    done_rx: Receiver<Result<()>>,
    shutdown_tx: Sender<()>,
}

pub struct WorkerGraph {
    device: Device,
    modules: Vec<(ModuleId, SharedModule)>,
    wired_inputs: BTreeSet<u64>,
    wired_outputs: BTreeSet<u64>,
    externally_wired_inputs: BTreeSet<u64>,
    externally_wired_outputs: BTreeSet<u64>,
    frame_timeout: Duration,
    frame: Arc<AtomicU64>,
    busy: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl WorkerGraph {
    pub fn new(device: Device) -> Self {
        Self::with_frame_timeout(device, DEFAULT_FRAME_TIMEOUT)
    }

    pub fn with_frame_timeout(device: Device, frame_timeout: Duration) -> Self {
        Self {
            device,
            modules: Vec::new(),
            wired_inputs: BTreeSet::new(),
            wired_outputs: BTreeSet::new(),
            externally_wired_inputs: BTreeSet::new(),
            externally_wired_outputs: BTreeSet::new(),
            frame_timeout,
            frame: Arc::new(AtomicU64::new(0)),
            busy: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn shutdown_worker(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let _ = worker.shutdown_tx.send(());
        drop(worker.job_tx);
        if worker.thread.join().is_err() {
            tracing::error!("[{}] graph worker panicked during shutdown", self.device);
            return Err(SchedulerError::Runtime("graph worker panicked".into()));
        }
        tracing::debug!("[{}] graph worker joined", self.device);
        Ok(())
    }
}

impl GraphExecutor for WorkerGraph {
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
        if self.worker.is_some() {
            return Err(SchedulerError::Runtime(
                "graph executor created twice".into(),
            ));
        }

        let (job_tx, job_rx) = crossbeam_channel::bounded::<()>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

        let device = self.device;
        let modules = self.modules.clone();
        let frame = Arc::clone(&self.frame);
        let busy = Arc::clone(&self.busy);

        let thread = std::thread::Builder::new()
            .name(format!("graph-{}", device.pretty_name().to_lowercase()))
            .spawn(move || {
                worker_loop(device, modules, job_rx, done_tx, shutdown_rx, frame, busy);
            })
            .map_err(|e| SchedulerError::Runtime(format!("failed to spawn graph worker: {e}")))?;

        self.worker = Some(Worker {
            thread,
            job_tx,
            done_rx,
            shutdown_tx,
        });

        tracing::debug!(
            "[{}] worker graph created: {} module(s), frame budget {:?}",
            self.device,
            self.modules.len(),
            self.frame_timeout,
        );
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        self.shutdown_worker()
    }

    fn compute_ready(&self) -> Result<()> {
        if self.busy.load(Ordering::Acquire) {
            return Err(SchedulerError::Timeout);
        }
        poll_ready(&self.modules)
    }

    fn compute(&self) -> Result<()> {
        let Some(worker) = self.worker.as_ref() else {
            return Err(SchedulerError::Runtime(
                "graph executor used before create()".into(),
            ));
        };

        // Drop the receipt of a frame that already blew its budget.
        while let Ok(stale) = worker.done_rx.try_recv() {
            tracing::debug!("[{}] discarding late frame receipt: {:?}", self.device, stale);
        }

        worker
            .job_tx
            .send(())
            .map_err(|_| SchedulerError::Runtime("graph worker disconnected".into()))?;

        match worker.done_rx.recv_timeout(self.frame_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(SchedulerError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(SchedulerError::Runtime("graph worker disconnected".into()))
            }
        }
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

impl Drop for WorkerGraph {
    fn drop(&mut self) {
        let _ = self.shutdown_worker();
    }
}

fn worker_loop(
    device: Device,
    modules: Vec<(ModuleId, SharedModule)>,
    job_rx: Receiver<()>,
    done_tx: Sender<Result<()>>,
    shutdown_rx: Receiver<()>,
    frame: Arc<AtomicU64>,
    busy: Arc<AtomicBool>,
) {
    tracing::debug!("[{device}] graph worker started");

    loop {
        crossbeam_channel::select! {
            recv(shutdown_rx) -> _ => break,
            recv(job_rx) -> msg => {
                if msg.is_err() {
                    break;
                }
                busy.store(true, Ordering::Release);
                let pass = run_pass(&modules, device, frame.fetch_add(1, Ordering::Relaxed));
                if done_tx.send(pass).is_err() {
                    break;
                }
                // Cleared only once the receipt is queued, so a ready probe
                // cannot observe an idle worker with its receipt still in
                // flight.
                busy.store(false, Ordering::Release);
            }
        }
    }

    tracing::debug!("[{device}] graph worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::module::{Compute, Module, RuntimeMetadata};
    use parking_lot::Mutex;

    struct SleepyModule {
        delay: Duration,
    }

    impl Module for SleepyModule {
        fn device(&self) -> Device {
            Device::Cuda
        }

        fn as_compute(&mut self) -> Option<&mut dyn Compute> {
            Some(self)
        }
    }

    impl Compute for SleepyModule {
        fn compute(&mut self, _meta: &RuntimeMetadata) -> Result<()> {
            std::thread::sleep(self.delay);
            Ok(())
        }
    }

    fn graph_with(delay: Duration, budget: Duration) -> WorkerGraph {
        let mut graph = WorkerGraph::with_frame_timeout(Device::Cuda, budget);
        graph.set_module(
            "sleepy".into(),
            Arc::new(Mutex::new(SleepyModule { delay })),
        );
        graph
    }

    #[test]
    fn test_fast_frame_completes() {
        let mut graph = graph_with(Duration::from_millis(1), Duration::from_millis(500));
        graph.create().unwrap();
        assert!(graph.compute().is_ok());
        graph.destroy().unwrap();
    }

    #[test]
    fn test_slow_frame_reports_timeout() {
        let mut graph = graph_with(Duration::from_millis(100), Duration::from_millis(5));
        graph.create().unwrap();
        assert!(matches!(graph.compute(), Err(SchedulerError::Timeout)));
        // The frame is still in flight, so the readiness probe backs off too.
        assert!(matches!(
            graph.compute_ready(),
            Err(SchedulerError::Timeout)
        ));
        graph.destroy().unwrap();
    }

    #[test]
    fn test_compute_before_create_fails() {
        let graph = graph_with(Duration::from_millis(1), Duration::from_millis(10));
        assert!(matches!(graph.compute(), Err(SchedulerError::Runtime(_))));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut graph = graph_with(Duration::from_millis(1), Duration::from_millis(10));
        graph.create().unwrap();
        graph.destroy().unwrap();
        graph.destroy().unwrap();
    }
}
