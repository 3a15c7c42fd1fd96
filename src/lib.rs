//! # pulselib - Real-Time Signal-Processing Compute Scheduler
//!
//! A library crate that turns a raw graph of signal-processing modules into
//! executable, device-grouped sub-graphs and drives them from two cooperating
//! threads: a compute thread doing the heavy lifting and a present thread
//! serving the render loop.
//!
//! ## Architecture
//!
//! ```text
//! host application
//!   ├─ add_module / remove_module ──► Scheduler ──► rebuild pipeline
//!   ├─ compute thread ─────────────► Scheduler::compute()  (one pass)
//!   └─ present thread ─────────────► Scheduler::present()  (one pass)
//! ```
//!
//! The scheduler owns the module registry, the execution order, and the
//! per-device graph executors. Structural mutations quiesce both worker
//! threads before touching anything, so neither thread ever observes a
//! half-built pipeline.
//!
//! ## Example
//!
//! ```ignore
//! use pulselib::{Scheduler, Locale, Device};
//!
//! let scheduler = Arc::new(Scheduler::new());
//! scheduler.add_module(locale, module, inputs, outputs)?;
//!
//! // compute thread
//! loop { scheduler.compute()?; }
//!
//! // present thread
//! loop { scheduler.present()?; }
//! ```

pub mod core;

pub use crate::core::{
    default_graph_factory, Compute, DebugSnapshot, Device, GraphExecutor, GraphFactory,
    GraphSummary, InlineGraph, InplaceConflict, InplacePolicy, Locale, Module, ModuleId, Present,
    Record, RecordMap, Result, RuntimeMetadata, Scheduler, SchedulerConfig, SchedulerError,
    SharedModule, WorkerGraph,
};
