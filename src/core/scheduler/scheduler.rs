//! Scheduler core.
//!
//! Takes the raw graph defined by the host and breaks it into execution
//! graphs:
//! 1. Filter tensors that are not connected inside the graph.
//! 2. Register the active inputs and outputs of each module.
//! 3. Break the graph into sub-graphs when there is no dependency between them.
//! 4. Create the execution order governed by tensor wiring.
//! 5. Split that order by device locale and cluster.
//! 6. Create per-device graph executors and assign wired tensors.
//! 7. Chain externally wired tensors between adjacent executors.
//! 8. Assert that an in-place module is not sharing a branched tensor.
//!
//! TODO: Automatically add a copy module when the in-place check trips.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::config::SchedulerConfig;
use crate::core::error::{Result, SchedulerError};
use crate::core::executor::{graph_factory_with_frame_timeout, GraphFactory};
use crate::core::module::SharedModule;
use crate::core::record::{Locale, RecordMap};

use super::coordinator::Coordinator;
use super::rebuild::{self, InplaceConflict, InplaceHook};
use super::state::{ComputeModuleState, PipelineState, PresentModuleState};

pub struct Scheduler {
    config: SchedulerConfig,
    factory: Arc<GraphFactory>,
    state: RwLock<PipelineState>,
    coordinator: Coordinator,
    running: AtomicBool,
    inplace_hook: Option<Box<InplaceHook>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let factory = graph_factory_with_frame_timeout(config.frame_timeout);
        Self::with_factory(config, factory)
    }

    /// Create a scheduler with a custom executor factory. Hosts use this to
    /// plug in their own device backends.
    pub fn with_factory(config: SchedulerConfig, factory: Arc<GraphFactory>) -> Self {
        config.validate();
        Self {
            config,
            factory,
            state: RwLock::new(PipelineState::default()),
            coordinator: Coordinator::new(),
            running: AtomicBool::new(false),
            inplace_hook: None,
        }
    }

    /// Observe in-place aliasing conflicts found during rebuilds, regardless
    /// of the configured policy. Extension seam for copy-injection.
    pub fn set_inplace_conflict_hook(
        &mut self,
        hook: impl Fn(&InplaceConflict) + Send + Sync + 'static,
    ) {
        self.inplace_hook = Some(Box::new(hook));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register a module and rebuild the pipeline.
    ///
    /// Destroys every existing executor first; on failure the pipeline is
    /// left empty but consistent and the error is returned.
    pub fn add_module(
        &self,
        locale: Locale,
        module: SharedModule,
        input_map: RecordMap,
        output_map: RecordMap,
    ) -> Result<()> {
        let name = locale.module_key();
        tracing::debug!("Adding module '{name}' to the pipeline.");

        self.running.store(true, Ordering::Release);

        let (device, has_compute, has_present) = {
            let mut guard = module.lock();
            (
                guard.device(),
                guard.as_compute().is_some(),
                guard.as_present().is_some(),
            )
        };

        tracing::info!(
            "[{locale}] [Device::{device}] [C: {}, P: {}]",
            if has_compute { "YES" } else { "NO" },
            if has_present { "YES" } else { "NO" },
        );
        tracing::info!("Configuration:");
        module.lock().info();
        log_port_table("Inputs", &input_map);
        log_port_table("Outputs", &output_map);

        self.lock_state(move |state| {
            for graph in state.graphs.iter_mut() {
                graph.destroy()?;
            }
            state.graphs.clear();

            if has_present {
                state.present_states.insert(
                    name.clone(),
                    PresentModuleState {
                        module: Arc::clone(&module),
                        input_map: input_map.clone(),
                        output_map: output_map.clone(),
                    },
                );
            }
            if has_compute {
                state.compute_states.insert(
                    name.clone(),
                    ComputeModuleState::new(Arc::clone(&module), device, input_map, output_map),
                );
            }

            rebuild::rebuild_pipeline(state, &*self.factory, &self.config, self.inplace_hook.as_deref())
        })
    }

    /// Unregister a module and rebuild. No-op when the scheduler is not
    /// running.
    pub fn remove_module(&self, locale: &Locale) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        let name = locale.module_key();
        tracing::debug!("Removing module '{name}' from the pipeline.");

        self.lock_state(move |state| {
            for graph in state.graphs.iter_mut() {
                graph.destroy()?;
            }
            state.graphs.clear();

            state.present_states.remove(&name);
            state.compute_states.remove(&name);

            rebuild::rebuild_pipeline(state, &*self.factory, &self.config, self.inplace_hook.as_deref())
        })
    }

    /// Tear everything down and stop.
    pub fn destroy(&self) -> Result<()> {
        tracing::debug!("Destroying compute pipeline.");

        self.lock_state(|state| {
            self.running.store(false, Ordering::Release);
            for graph in state.graphs.iter_mut() {
                graph.destroy()?;
            }
            state.clear();
            Ok(())
        })
    }

    /// One pass of the compute thread.
    pub fn compute(&self) -> Result<()> {
        {
            let state = self.state.read();
            if state.graphs.is_empty() {
                drop(state);
                std::thread::sleep(self.config.idle_sleep);
                return Ok(());
            }
        }

        if self.coordinator.compute_halted() {
            self.coordinator.wait_compute_unhalted();
            return Ok(());
        }

        // The pipeline must not change while executors wait for their
        // modules to come ready, so the barrier is flagged and mutations
        // drain it before proceeding.
        self.coordinator.enter_ready_barrier();
        let ready = 'ready: loop {
            let state = self.state.read();
            for graph in &state.graphs {
                match graph.compute_ready() {
                    Ok(()) => {}
                    Err(SchedulerError::Timeout) => continue 'ready,
                    Err(err) => break 'ready Err(err),
                }
            }
            break 'ready Ok(());
        };
        self.coordinator.exit_ready_barrier();
        ready?;

        let pass = self.coordinator.compute_pass(|| {
            let state = self.state.read();
            let mut result = Ok(());
            for graph in &state.graphs {
                result = graph.compute();
                if result.is_err() {
                    break;
                }
            }
            result
        });

        match pass {
            Ok(()) => Ok(()),
            Err(err) if err.is_underrun() => {
                tracing::warn!("Graph underrun. Skipping frame.");
                Ok(())
            }
            Err(err) => {
                tracing::error!("Fatal error: {err}");
                Err(err)
            }
        }
    }

    /// One pass of the present thread.
    pub fn present(&self) -> Result<()> {
        {
            let state = self.state.read();
            if state.valid_present.is_empty() {
                return Ok(());
            }
        }

        if self.coordinator.present_halted() {
            return Ok(());
        }

        self.coordinator.present_pass(|| {
            let state = self.state.read();
            let mut result = Ok(());
            for (name, present_state) in state.valid_present.iter() {
                let mut guard = present_state.module.lock();
                let Some(present) = guard.as_present() else {
                    continue;
                };
                if let Err(err) = present.present() {
                    tracing::error!("[{name}] present failed: {err}");
                    result = Err(err);
                    break;
                }
            }
            result
        })
    }

    /// Run `f` against exclusive pipeline state with both worker threads
    /// quiesced. Every mutation path funnels through here.
    fn lock_state<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut PipelineState) -> Result<()>,
    {
        self.coordinator.mutation_fence(|| {
            let mut state = self.state.write();
            f(&mut state)
        })
    }

    pub(crate) fn state(&self) -> &RwLock<PipelineState> {
        &self.state
    }
}

fn log_port_table(label: &str, map: &RecordMap) {
    tracing::info!("  {label}:");
    if map.is_empty() {
        tracing::info!("    None");
        return;
    }
    for (index, (pin, record)) in map.iter().enumerate() {
        tracing::info!(
            "    {index}: {pin} [{:>4}] {:?} | [Device::{}] | Pointer: {:#018x} | Hash: {:#018x} | [{}]",
            record.data_type,
            record.shape,
            record.device,
            record.data_ptr,
            record.hash,
            record.locale,
        );
    }
}
