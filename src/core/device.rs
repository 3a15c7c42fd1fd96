// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Execution device tags.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Device a module's buffers are bound to. Drives executor selection and
/// device-affinity grouping, which compares tags for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Cuda,
    Metal,
    Vulkan,
    None,
}

impl Device {
    /// Pretty name used in log lines and the debug panel.
    pub fn pretty_name(&self) -> &'static str {
        match self {
            Device::Cpu => "CPU",
            Device::Cuda => "CUDA",
            Device::Metal => "Metal",
            Device::Vulkan => "Vulkan",
            Device::None => "None",
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::None
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pretty_name())
    }
}
