// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-module scheduler state and the aggregate pipeline state.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::device::Device;
use crate::core::executor::GraphExecutor;
use crate::core::module::SharedModule;
use crate::core::record::{ModuleId, RecordMap};

/// Compute-side record for a registered module.
///
/// `active_inputs`/`active_outputs` are the post-prune subsets of the
/// declared maps; `cluster_id` is assigned during rebuild.
#[derive(Clone)]
pub(crate) struct ComputeModuleState {
    pub module: SharedModule,
    pub device: Device,
    pub input_map: RecordMap,
    pub output_map: RecordMap,
    pub active_inputs: RecordMap,
    pub active_outputs: RecordMap,
    pub cluster_id: u64,
}

impl ComputeModuleState {
    pub fn new(
        module: SharedModule,
        device: Device,
        input_map: RecordMap,
        output_map: RecordMap,
    ) -> Self {
        Self {
            module: Arc::clone(&module),
            device,
            input_map,
            output_map,
            active_inputs: RecordMap::new(),
            active_outputs: RecordMap::new(),
            cluster_id: 0,
        }
    }
}

/// Present-side record for a registered module.
#[derive(Clone)]
pub(crate) struct PresentModuleState {
    pub module: SharedModule,
    #[allow(dead_code)]
    pub input_map: RecordMap,
    #[allow(dead_code)]
    pub output_map: RecordMap,
}

/// Everything the rebuild pipeline reads and writes. Guarded by the
/// scheduler's state lock; worker threads only ever read it.
#[derive(Default)]
pub(crate) struct PipelineState {
    pub compute_states: BTreeMap<ModuleId, ComputeModuleState>,
    pub present_states: BTreeMap<ModuleId, PresentModuleState>,
    pub valid_compute: BTreeMap<ModuleId, ComputeModuleState>,
    pub valid_present: BTreeMap<ModuleId, PresentModuleState>,
    pub execution_order: Vec<ModuleId>,
    pub device_execution_order: Vec<(Device, Vec<ModuleId>)>,
    pub graphs: Vec<Box<dyn GraphExecutor>>,
}

impl PipelineState {
    pub fn clear(&mut self) {
        self.compute_states.clear();
        self.present_states.clear();
        self.valid_compute.clear();
        self.valid_present.clear();
        self.execution_order.clear();
        self.device_execution_order.clear();
        self.graphs.clear();
    }
}
