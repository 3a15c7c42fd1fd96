// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How an in-place aliasing conflict found during rebuild is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InplacePolicy {
    /// Log the conflict and keep the pipeline. Current default while the
    /// automatic copy-module insertion does not exist.
    Warn,

    /// Fail the rebuild with `SchedulerError::InplaceAliasing`.
    Reject,
}

impl Default for InplacePolicy {
    fn default() -> Self {
        InplacePolicy::Warn
    }
}

/// Tuning knobs for the scheduler and the bundled executors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Sleep applied by `compute()` when the pipeline is empty.
    pub idle_sleep: Duration,

    /// Frame budget the worker executor waits for before reporting an
    /// underrun.
    pub frame_timeout: Duration,

    pub inplace_policy: InplacePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_millis(200),
            frame_timeout: Duration::from_millis(100),
            inplace_policy: InplacePolicy::default(),
        }
    }
}

impl SchedulerConfig {
    /// Preset that turns aliasing conflicts into rebuild failures.
    pub fn strict() -> Self {
        Self {
            inplace_policy: InplacePolicy::Reject,
            ..Self::default()
        }
    }

    pub fn validate(&self) {
        if self.frame_timeout.is_zero() {
            tracing::warn!("frame_timeout of zero will report every worker frame as an underrun");
        }
        if self.idle_sleep.is_zero() {
            tracing::warn!("idle_sleep of zero busy-spins the compute thread on an empty pipeline");
        }
    }
}
