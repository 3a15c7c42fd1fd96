//! pulselib core: scheduler, executors, and the tensor-port data model.
//!
//! Everything the host application touches lives here. The scheduler is the
//! only stateful entry point; modules and graph executors are contracts the
//! host (or this crate's reference executors) implement.

pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod module;
pub mod record;
pub mod scheduler;

pub use config::{InplacePolicy, SchedulerConfig};
pub use device::Device;
pub use error::{Result, SchedulerError};
pub use executor::{default_graph_factory, GraphExecutor, GraphFactory, InlineGraph, WorkerGraph};
pub use module::{Compute, Module, Present, RuntimeMetadata, SharedModule};
pub use record::{Locale, ModuleId, Record, RecordMap};
pub use scheduler::{DebugSnapshot, GraphSummary, InplaceConflict, Scheduler};
