// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Read-only introspection for the host's pipeline panel.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use petgraph::dot::{Config, Dot};
use petgraph::graph::DiGraph;
use serde::Serialize;

use crate::core::device::Device;
use crate::core::record::ModuleId;

use super::scheduler::Scheduler;

/// One executor's row in the debug panel.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSummary {
    pub device: Device,
    pub modules: Vec<ModuleId>,
}

/// Snapshot of the pipeline counters and the executor list.
#[derive(Debug, Clone, Serialize)]
pub struct DebugSnapshot {
    pub graph_count: usize,
    pub stale_count: usize,
    pub present_count: usize,
    pub compute_count: usize,
    pub graphs: Vec<GraphSummary>,
}

impl fmt::Display for DebugSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pipeline: {} graph(s)", self.graph_count)?;
        writeln!(f, "Stale:    {} block(s)", self.stale_count)?;
        writeln!(f, "Present:  {} block(s)", self.present_count)?;
        writeln!(f, "Compute:  {} block(s)", self.compute_count)?;
        writeln!(f, "Graph List:")?;
        for (index, graph) in self.graphs.iter().enumerate() {
            writeln!(
                f,
                "  [{index}] {}: {} blocks",
                graph.device.pretty_name(),
                graph.modules.len()
            )?;
        }
        Ok(())
    }
}

impl Scheduler {
    /// Snapshot the pipeline counters. Pure read.
    pub fn draw_debug(&self) -> DebugSnapshot {
        let state = self.state().read();
        DebugSnapshot {
            graph_count: state.graphs.len(),
            stale_count: state.compute_states.len() - state.valid_compute.len(),
            present_count: state.valid_present.len(),
            compute_count: state.valid_compute.len(),
            graphs: state
                .device_execution_order
                .iter()
                .map(|(device, run)| GraphSummary {
                    device: *device,
                    modules: run.clone(),
                })
                .collect(),
        }
    }

    /// Render the active dependency graph in DOT format.
    pub fn to_dot(&self) -> String {
        let state = self.state().read();

        let mut graph: DiGraph<ModuleId, ()> = DiGraph::new();
        let mut indices = BTreeMap::new();
        for name in state.valid_compute.keys() {
            indices.insert(name.clone(), graph.add_node(name.clone()));
        }

        let mut producers: HashMap<u64, ModuleId> = HashMap::new();
        for (name, module_state) in &state.valid_compute {
            for record in module_state.active_outputs.values() {
                producers.insert(record.locale.port_hash(), name.clone());
            }
        }
        for (name, module_state) in &state.valid_compute {
            for record in module_state.active_inputs.values() {
                let Some(producer) = producers.get(&record.locale.port_hash()) else {
                    continue;
                };
                if let (Some(&from), Some(&to)) = (indices.get(producer), indices.get(name)) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        format!("{:?}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
    }
}
