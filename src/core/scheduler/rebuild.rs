// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Pipeline rebuild: prune, order, cluster, split, validate, assemble.
//!
//! Invoked by every structural mutation with both worker threads quiesced.
//! The phases run in strict order; any failure leaves the pipeline with no
//! executors (empty but consistent).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::core::config::{InplacePolicy, SchedulerConfig};
use crate::core::device::Device;
use crate::core::error::{Result, SchedulerError};
use crate::core::executor::GraphFactory;
use crate::core::record::ModuleId;

use super::state::PipelineState;

/// A branched tensor consumed by at least one in-place module.
#[derive(Debug, Clone)]
pub struct InplaceConflict {
    /// Content hash of the shared tensor.
    pub hash: u64,
    /// Physical port the consumers read from.
    pub port_hash: u64,
    /// Every module consuming the port.
    pub consumers: Vec<ModuleId>,
    /// The consumers that alias the tensor in place.
    pub inplace_modules: Vec<ModuleId>,
}

/// Hook observing in-place conflicts, regardless of policy.
pub(crate) type InplaceHook = dyn Fn(&InplaceConflict) + Send + Sync;

/// Run the full rebuild. On failure every executor is destroyed and the
/// graph list cleared before the error propagates.
pub(crate) fn rebuild_pipeline(
    state: &mut PipelineState,
    factory: &GraphFactory,
    config: &SchedulerConfig,
    hook: Option<&InplaceHook>,
) -> Result<()> {
    let result = (|| {
        prune_inactive(state);
        arrange_dependency_order(state)?;
        check_sequence_validity(state, config.inplace_policy, hook)?;
        create_execution_graphs(state, factory)?;
        for graph in state.graphs.iter_mut() {
            graph.create()?;
        }
        Ok(())
    })();

    if result.is_err() {
        for graph in state.graphs.iter_mut() {
            let _ = graph.destroy();
        }
        state.graphs.clear();
    }
    result
}

/// Phase 1: drop ports whose hash is referenced only once, then drop
/// modules left with no active ports at all. A present module is excluded
/// exactly when its compute twin went stale.
pub(crate) fn prune_inactive(state: &mut PipelineState) {
    state.valid_compute.clear();
    state.valid_present.clear();

    tracing::debug!("Removing inactive I/O.");
    let mut uses: HashMap<u64, usize> = HashMap::new();
    for module_state in state.compute_states.values() {
        for record in module_state
            .input_map
            .values()
            .chain(module_state.output_map.values())
        {
            if record.hash != 0 {
                *uses.entry(record.hash).or_insert(0) += 1;
            }
        }
    }

    tracing::debug!("Generating I/O map for each module.");
    let mut stale: BTreeSet<ModuleId> = BTreeSet::new();
    for (name, module_state) in state.compute_states.iter_mut() {
        module_state.active_inputs.clear();
        module_state.active_outputs.clear();

        for (pin, record) in &module_state.input_map {
            if uses.get(&record.hash).copied().unwrap_or(0) > 1 {
                module_state
                    .active_inputs
                    .insert(pin.clone(), record.clone());
            } else {
                tracing::trace!(
                    "Nulling '{pin}' input from '{name}' module ({:#018x}).",
                    record.hash
                );
            }
        }
        for (pin, record) in &module_state.output_map {
            if uses.get(&record.hash).copied().unwrap_or(0) > 1 {
                module_state
                    .active_outputs
                    .insert(pin.clone(), record.clone());
            } else {
                tracing::trace!(
                    "Nulling '{pin}' output from '{name}' module ({:#018x}).",
                    record.hash
                );
            }
        }

        if module_state.active_inputs.is_empty() && module_state.active_outputs.is_empty() {
            tracing::trace!("Removing stale module '{name}'.");
            stale.insert(name.clone());
        }
    }

    for (name, module_state) in &state.compute_states {
        if !stale.contains(name) {
            state
                .valid_compute
                .insert(name.clone(), module_state.clone());
        }
    }
    for (name, module_state) in &state.present_states {
        if !stale.contains(name) {
            state
                .valid_present
                .insert(name.clone(), module_state.clone());
        }
    }
}

/// Phases 2 through 4: topological order with device affinity, cluster
/// assignment, and the split into per-device runs.
pub(crate) fn arrange_dependency_order(state: &mut PipelineState) -> Result<()> {
    state.execution_order.clear();
    state.device_execution_order.clear();

    tracing::debug!("Calculating module degrees.");
    let mut in_degrees: BTreeMap<ModuleId, usize> = BTreeMap::new();
    let mut queue: BTreeSet<ModuleId> = BTreeSet::new();
    for (name, module_state) in &state.valid_compute {
        in_degrees.insert(name.clone(), module_state.active_inputs.len());
        if module_state.active_inputs.is_empty() {
            queue.insert(name.clone());
        }
    }

    tracing::debug!("Creating module cache.");
    // Port hash of a producing pin maps to its consumers and its producer.
    let mut input_cache: HashMap<u64, Vec<ModuleId>> = HashMap::new();
    let mut output_cache: HashMap<u64, ModuleId> = HashMap::new();
    for (name, module_state) in &state.valid_compute {
        for record in module_state.active_inputs.values() {
            input_cache
                .entry(record.locale.port_hash())
                .or_default()
                .push(name.clone());
        }
        for record in module_state.active_outputs.values() {
            output_cache.insert(record.locale.port_hash(), name.clone());
        }
    }

    let mut edges: BTreeMap<ModuleId, BTreeSet<ModuleId>> = BTreeMap::new();
    for (name, module_state) in &state.valid_compute {
        let neighbors = edges.entry(name.clone()).or_default();
        for record in module_state.active_inputs.values() {
            if let Some(producer) = output_cache.get(&record.locale.port_hash()) {
                neighbors.insert(producer.clone());
            }
        }
        for record in module_state.active_outputs.values() {
            if let Some(consumers) = input_cache.get(&record.locale.port_hash()) {
                neighbors.extend(consumers.iter().cloned());
            }
        }
    }

    tracing::debug!("Calculating primitive execution order.");
    let mut last_device: Option<Device> = None;
    while !queue.is_empty() {
        let next = match last_device {
            // Extend the current device chain when possible.
            Some(device) => queue
                .iter()
                .find(|name| {
                    state
                        .valid_compute
                        .get(*name)
                        .map(|s| s.device == device)
                        .unwrap_or(false)
                })
                .cloned(),
            // Fresh chain: adopt the first ready module's device. With a
            // non-empty queue this always selects, so the reset below can
            // never loop forever.
            None => queue.iter().next().cloned(),
        };

        let Some(name) = next else {
            last_device = None;
            continue;
        };

        queue.remove(&name);
        let Some(module_state) = state.valid_compute.get(&name) else {
            continue;
        };
        last_device = Some(module_state.device);
        state.execution_order.push(name.clone());

        for record in module_state.active_outputs.values() {
            let Some(consumers) = input_cache.get(&record.locale.port_hash()) else {
                continue;
            };
            for consumer in consumers {
                if let Some(degree) = in_degrees.get_mut(consumer) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.insert(consumer.clone());
                    }
                }
            }
        }
    }

    if state.execution_order.len() != state.valid_compute.len() {
        tracing::error!(
            "Dependency cycle detected. Expected ({}) and actual ({}) execution order size mismatch.",
            state.valid_compute.len(),
            state.execution_order.len()
        );
        return Err(SchedulerError::Cycle {
            expected: state.valid_compute.len(),
            ordered: state.execution_order.len(),
        });
    }

    tracing::debug!("Splitting graph into sub-graphs.");
    let mut cluster_count: u64 = 0;
    let mut visited: BTreeSet<ModuleId> = BTreeSet::new();
    let names: Vec<ModuleId> = state.valid_compute.keys().cloned().collect();
    for name in names {
        if visited.contains(&name) {
            continue;
        }
        let mut stack = vec![name];
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(module_state) = state.valid_compute.get_mut(&current) {
                module_state.cluster_id = cluster_count;
            }
            if let Some(neighbors) = edges.get(&current) {
                stack.extend(
                    neighbors
                        .iter()
                        .filter(|neighbor| !visited.contains(*neighbor))
                        .cloned(),
                );
            }
        }
        cluster_count += 1;
    }

    tracing::debug!("Calculating graph execution order.");
    let mut last: Option<(Device, u64)> = None;
    for name in &state.execution_order {
        let Some(module_state) = state.valid_compute.get(name) else {
            continue;
        };
        let key = (module_state.device, module_state.cluster_id);
        if last != Some(key) {
            state
                .device_execution_order
                .push((module_state.device, Vec::new()));
        }
        last = Some(key);
        if let Some((_, run)) = state.device_execution_order.last_mut() {
            run.push(name.clone());
        }
    }

    tracing::info!("Device execution order:");
    for (index, (device, run)) in state.device_execution_order.iter().enumerate() {
        tracing::info!("  [{index:02}] [Device::{device}]: {run:?}");
    }

    Ok(())
}

/// Phase 5: flag branched tensors consumed by an in-place module.
pub(crate) fn check_sequence_validity(
    state: &PipelineState,
    policy: InplacePolicy,
    hook: Option<&InplaceHook>,
) -> Result<()> {
    tracing::debug!("Gathering modules with in-place operations.");
    let mut inplace_map: BTreeMap<u64, Vec<ModuleId>> = BTreeMap::new();
    for name in &state.execution_order {
        let Some(module_state) = state.valid_compute.get(name) else {
            continue;
        };
        let inputs: BTreeSet<u64> = module_state
            .active_inputs
            .values()
            .map(|record| record.hash)
            .collect();
        let outputs: BTreeSet<u64> = module_state
            .active_outputs
            .values()
            .map(|record| record.hash)
            .collect();
        for hash in inputs.intersection(&outputs) {
            inplace_map.entry(*hash).or_default().push(name.clone());
        }
    }

    tracing::debug!("Gathering positional memory layout.");
    let mut positional: BTreeMap<(u64, u64), Vec<ModuleId>> = BTreeMap::new();
    for name in &state.execution_order {
        let Some(module_state) = state.valid_compute.get(name) else {
            continue;
        };
        for record in module_state.active_inputs.values() {
            positional
                .entry((record.hash, record.locale.port_hash()))
                .or_default()
                .push(name.clone());
        }
    }

    for ((hash, port_hash), consumers) in &positional {
        if consumers.len() <= 1 {
            continue;
        }
        let Some(inplace_modules) = inplace_map.get(hash) else {
            continue;
        };
        let offenders: Vec<ModuleId> = consumers
            .iter()
            .filter(|name| inplace_modules.contains(name))
            .cloned()
            .collect();
        if offenders.is_empty() {
            continue;
        }

        let conflict = InplaceConflict {
            hash: *hash,
            port_hash: *port_hash,
            consumers: consumers.clone(),
            inplace_modules: offenders,
        };
        if let Some(hook) = hook {
            hook(&conflict);
        }
        match policy {
            InplacePolicy::Warn => {
                tracing::warn!(
                    "Vector is being shared by at least two modules after a branch \
                     and at least one of them is an in-place module."
                );
                tracing::warn!("    Hash: {hash:#018x} | Modules: {consumers:?}");
            }
            InplacePolicy::Reject => {
                return Err(SchedulerError::InplaceAliasing {
                    hash: *hash,
                    modules: consumers.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Assemble one executor per device run, chain externally-wired ports
/// between adjacent executors, in dependency order.
pub(crate) fn create_execution_graphs(
    state: &mut PipelineState,
    factory: &GraphFactory,
) -> Result<()> {
    state.graphs.clear();

    tracing::debug!("Instantiating compute graphs and adding wired tensors.");
    for (device, run) in &state.device_execution_order {
        let mut graph = factory(*device);
        for name in run {
            let Some(module_state) = state.valid_compute.get(name) else {
                continue;
            };
            for record in module_state.active_inputs.values() {
                graph.set_wired_input(record.locale.port_hash());
            }
            for record in module_state.active_outputs.values() {
                graph.set_wired_output(record.locale.port_hash());
            }
            graph.set_module(name.clone(), Arc::clone(&module_state.module));
        }
        state.graphs.push(graph);
    }

    tracing::debug!("Creating dependency list between graphs.");
    for index in 1..state.graphs.len() {
        let (head, tail) = state.graphs.split_at_mut(index);
        let previous = &mut head[index - 1];
        let current = &mut tail[0];

        let common: Vec<u64> = previous
            .wired_outputs()
            .intersection(current.wired_inputs())
            .copied()
            .collect();
        for port_hash in common {
            previous.set_externally_wired_output(port_hash);
            current.set_externally_wired_input(port_hash);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::Device;
    use crate::core::executor::InlineGraph;
    use crate::core::module::{Compute, Module, RuntimeMetadata, SharedModule};
    use crate::core::record::{Locale, Record, RecordMap};
    use crate::core::scheduler::state::ComputeModuleState;
    use parking_lot::Mutex;

    struct Passthrough {
        device: Device,
    }

    impl Module for Passthrough {
        fn device(&self) -> Device {
            self.device
        }

        fn as_compute(&mut self) -> Option<&mut dyn Compute> {
            Some(self)
        }
    }

    impl Compute for Passthrough {
        fn compute(&mut self, _meta: &RuntimeMetadata) -> Result<()> {
            Ok(())
        }
    }

    fn shared(device: Device) -> SharedModule {
        Arc::new(Mutex::new(Passthrough { device }))
    }

    fn record(block: &str, pin: &str, hash: u64, device: Device) -> Record {
        Record {
            data_type: "CF32".into(),
            shape: vec![2, 2048],
            device,
            data_ptr: 0,
            hash,
            locale: Locale::new(block, "", pin),
        }
    }

    fn add(
        state: &mut PipelineState,
        name: &str,
        device: Device,
        inputs: Vec<Record>,
        outputs: Vec<Record>,
    ) {
        let input_map: RecordMap = inputs
            .into_iter()
            .enumerate()
            .map(|(i, r)| (format!("in{i}"), r))
            .collect();
        let output_map: RecordMap = outputs
            .into_iter()
            .enumerate()
            .map(|(i, r)| (format!("out{i}"), r))
            .collect();
        state.compute_states.insert(
            name.to_string(),
            ComputeModuleState::new(shared(device), device, input_map, output_map),
        );
    }

    fn plan(state: &mut PipelineState) -> Result<()> {
        prune_inactive(state);
        arrange_dependency_order(state)
    }

    #[test]
    fn test_prune_marks_unreferenced_ports_inactive() {
        let mut state = PipelineState::default();
        let out = record("a", "out", 1, Device::Cpu);
        add(&mut state, "a", Device::Cpu, vec![], vec![out.clone()]);
        add(&mut state, "b", Device::Cpu, vec![out.view()], vec![
            record("b", "out", 2, Device::Cpu),
        ]);

        prune_inactive(&mut state);

        // The chain hash stays active, b's dangling output does not.
        let b = &state.valid_compute["b"];
        assert_eq!(b.active_inputs.len(), 1);
        assert!(b.active_outputs.is_empty());
    }

    #[test]
    fn test_prune_removes_stale_modules() {
        let mut state = PipelineState::default();
        add(&mut state, "lonely", Device::Cpu, vec![], vec![
            record("lonely", "out", 9, Device::Cpu),
        ]);
        prune_inactive(&mut state);
        assert!(state.valid_compute.is_empty());
    }

    #[test]
    fn test_prune_is_idempotent() {
        let mut state = PipelineState::default();
        let out = record("a", "out", 1, Device::Cpu);
        add(&mut state, "a", Device::Cpu, vec![], vec![out.clone()]);
        add(&mut state, "b", Device::Cpu, vec![out.view()], vec![]);

        prune_inactive(&mut state);
        let first: Vec<_> = state
            .valid_compute
            .iter()
            .map(|(name, s)| (name.clone(), s.active_inputs.len(), s.active_outputs.len()))
            .collect();

        prune_inactive(&mut state);
        let second: Vec<_> = state
            .valid_compute
            .iter()
            .map(|(name, s)| (name.clone(), s.active_inputs.len(), s.active_outputs.len()))
            .collect();

        assert_eq!(first, second);
    }

    #[test]
    fn test_linear_chain_orders_topologically() {
        let mut state = PipelineState::default();
        let a_out = record("a", "out", 1, Device::Cpu);
        let b_out = record("b", "out", 2, Device::Cpu);
        add(&mut state, "a", Device::Cpu, vec![], vec![a_out.clone()]);
        add(&mut state, "b", Device::Cpu, vec![a_out.view()], vec![b_out.clone()]);
        add(&mut state, "c", Device::Cpu, vec![b_out.view()], vec![]);

        plan(&mut state).unwrap();

        assert_eq!(state.execution_order, vec!["a", "b", "c"]);
        assert_eq!(state.device_execution_order.len(), 1);
        assert_eq!(state.device_execution_order[0].0, Device::Cpu);
        assert_eq!(state.device_execution_order[0].1, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_device_boundary_splits_runs() {
        let mut state = PipelineState::default();
        let a_out = record("a", "out", 1, Device::Cpu);
        let b_out = record("b", "out", 2, Device::Cuda);
        add(&mut state, "a", Device::Cpu, vec![], vec![a_out.clone()]);
        add(&mut state, "b", Device::Cuda, vec![a_out.view()], vec![b_out.clone()]);
        add(&mut state, "c", Device::Cpu, vec![b_out.view()], vec![]);

        plan(&mut state).unwrap();

        let runs: Vec<(Device, Vec<ModuleId>)> = state.device_execution_order.clone();
        assert_eq!(
            runs,
            vec![
                (Device::Cpu, vec!["a".to_string()]),
                (Device::Cuda, vec!["b".to_string()]),
                (Device::Cpu, vec!["c".to_string()]),
            ]
        );
    }

    #[test]
    fn test_affinity_keeps_same_device_together() {
        let mut state = PipelineState::default();
        // Two independent chains, one per device. Affinity should not
        // interleave them even though both roots are ready at once.
        let a_out = record("a", "out", 1, Device::Cpu);
        let x_out = record("x", "out", 3, Device::Cuda);
        add(&mut state, "a", Device::Cpu, vec![], vec![a_out.clone()]);
        add(&mut state, "b", Device::Cpu, vec![a_out.view()], vec![]);
        add(&mut state, "x", Device::Cuda, vec![], vec![x_out.clone()]);
        add(&mut state, "y", Device::Cuda, vec![x_out.view()], vec![]);

        plan(&mut state).unwrap();

        // Within the order, each device's modules are contiguous.
        let devices: Vec<Device> = state
            .execution_order
            .iter()
            .map(|name| state.valid_compute[name].device)
            .collect();
        let switches = devices.windows(2).filter(|w| w[0] != w[1]).count();
        assert_eq!(switches, 1, "devices interleaved: {devices:?}");
    }

    #[test]
    fn test_independent_subgraphs_get_distinct_clusters() {
        let mut state = PipelineState::default();
        let a_out = record("a", "out", 1, Device::Cpu);
        let x_out = record("x", "out", 3, Device::Cpu);
        add(&mut state, "a", Device::Cpu, vec![], vec![a_out.clone()]);
        add(&mut state, "b", Device::Cpu, vec![a_out.view()], vec![]);
        add(&mut state, "x", Device::Cpu, vec![], vec![x_out.clone()]);
        add(&mut state, "y", Device::Cpu, vec![x_out.view()], vec![]);

        plan(&mut state).unwrap();

        let cluster_a = state.valid_compute["a"].cluster_id;
        let cluster_b = state.valid_compute["b"].cluster_id;
        let cluster_x = state.valid_compute["x"].cluster_id;
        let cluster_y = state.valid_compute["y"].cluster_id;
        assert_eq!(cluster_a, cluster_b);
        assert_eq!(cluster_x, cluster_y);
        assert_ne!(cluster_a, cluster_x);

        // Same device, different clusters: two executors.
        assert_eq!(state.device_execution_order.len(), 2);
    }

    #[test]
    fn test_cycle_is_detected() {
        let mut state = PipelineState::default();
        let a_out = record("a", "out", 1, Device::Cpu);
        let b_out = record("b", "out", 2, Device::Cpu);
        add(&mut state, "a", Device::Cpu, vec![b_out.view()], vec![a_out.clone()]);
        add(&mut state, "b", Device::Cpu, vec![a_out.view()], vec![b_out.clone()]);

        let result = plan(&mut state);
        assert!(matches!(
            result,
            Err(SchedulerError::Cycle { expected: 2, ordered: 0 })
        ));
    }

    #[test]
    fn test_inplace_branch_conflict_detected() {
        let mut state = PipelineState::default();
        let source_out = record("source", "out", 7, Device::Cpu);
        // m writes the tensor back in place through its own pin.
        let m_out = record("m", "out", 7, Device::Cpu);
        add(&mut state, "source", Device::Cpu, vec![], vec![source_out.clone()]);
        add(&mut state, "m", Device::Cpu, vec![source_out.view()], vec![m_out.clone()]);
        add(&mut state, "n", Device::Cpu, vec![source_out.view()], vec![]);
        add(&mut state, "sink", Device::Cpu, vec![m_out.view()], vec![]);

        plan(&mut state).unwrap();

        let conflicts = Arc::new(Mutex::new(Vec::new()));
        let hook_conflicts = Arc::clone(&conflicts);
        let hook = move |conflict: &InplaceConflict| {
            hook_conflicts.lock().push(conflict.clone());
        };
        check_sequence_validity(&state, InplacePolicy::Warn, Some(&hook)).unwrap();

        let conflicts = conflicts.lock();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].hash, 7);
        assert!(conflicts[0].inplace_modules.contains(&"m".to_string()));
        assert!(conflicts[0].consumers.contains(&"n".to_string()));
    }

    #[test]
    fn test_inplace_conflict_rejected_under_strict_policy() {
        let mut state = PipelineState::default();
        let source_out = record("source", "out", 7, Device::Cpu);
        let m_out = record("m", "out", 7, Device::Cpu);
        add(&mut state, "source", Device::Cpu, vec![], vec![source_out.clone()]);
        add(&mut state, "m", Device::Cpu, vec![source_out.view()], vec![m_out.clone()]);
        add(&mut state, "n", Device::Cpu, vec![source_out.view()], vec![]);
        add(&mut state, "sink", Device::Cpu, vec![m_out.view()], vec![]);

        plan(&mut state).unwrap();

        let result = check_sequence_validity(&state, InplacePolicy::Reject, None);
        assert!(matches!(
            result,
            Err(SchedulerError::InplaceAliasing { hash: 7, .. })
        ));
    }

    #[test]
    fn test_externally_wired_chains_between_graphs() {
        let mut state = PipelineState::default();
        let a_out = record("a", "out", 1, Device::Cpu);
        let b_out = record("b", "out", 2, Device::Cuda);
        add(&mut state, "a", Device::Cpu, vec![], vec![a_out.clone()]);
        add(&mut state, "b", Device::Cuda, vec![a_out.view()], vec![b_out.clone()]);
        add(&mut state, "c", Device::Cpu, vec![b_out.view()], vec![]);

        plan(&mut state).unwrap();
        let factory = |device: Device| -> Box<dyn crate::core::executor::GraphExecutor> {
            Box::new(InlineGraph::new(device))
        };
        create_execution_graphs(&mut state, &factory).unwrap();

        assert_eq!(state.graphs.len(), 3);
        let a_port = a_out.locale.port_hash();
        let b_port = b_out.locale.port_hash();
        assert!(state.graphs[0].externally_wired_outputs().contains(&a_port));
        assert!(state.graphs[1].externally_wired_inputs().contains(&a_port));
        assert!(state.graphs[1].externally_wired_outputs().contains(&b_port));
        assert!(state.graphs[2].externally_wired_inputs().contains(&b_port));
    }
}
