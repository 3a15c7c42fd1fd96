// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Tensor-port identity: locales and records.
//!
//! The scheduler never touches tensor data. Each port is reduced to the
//! triple (record hash, port hash, device): equal record hashes alias the
//! same logical tensor, equal port hashes name the same physical pin.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::core::device::Device;

/// Stable module name derived from a locale, used as map key and in logs.
pub type ModuleId = String;

/// Stable per-port identifier: block, sub-block, pin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locale {
    pub block_id: String,
    pub sub_id: String,
    pub pin_id: String,
}

impl Locale {
    pub fn new(
        block_id: impl Into<String>,
        sub_id: impl Into<String>,
        pin_id: impl Into<String>,
    ) -> Self {
        Self {
            block_id: block_id.into(),
            sub_id: sub_id.into(),
            pin_id: pin_id.into(),
        }
    }

    /// Identity of the owning module: hashes (block, sub) only.
    pub fn module_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.block_id.hash(&mut hasher);
        self.sub_id.hash(&mut hasher);
        hasher.finish()
    }

    /// Identity of the physical port: module hash plus the pin.
    pub fn port_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.block_id.hash(&mut hasher);
        self.sub_id.hash(&mut hasher);
        self.pin_id.hash(&mut hasher);
        hasher.finish()
    }

    /// Module name used as the scheduler's map key.
    pub fn module_key(&self) -> ModuleId {
        if self.sub_id.is_empty() {
            self.block_id.clone()
        } else {
            format!("{}/{}", self.block_id, self.sub_id)
        }
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.module_key())?;
        if !self.pin_id.is_empty() {
            write!(f, ":{}", self.pin_id)?;
        }
        Ok(())
    }
}

/// Immutable tensor-port descriptor produced by a module's wiring
/// declaration. `data_ptr` is opaque and only ever formatted into logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub data_type: String,
    pub shape: Vec<usize>,
    pub device: Device,
    pub data_ptr: u64,
    /// Content-identity hash. Ports sharing this hash alias one tensor.
    pub hash: u64,
    pub locale: Locale,
}

impl Record {
    /// A consumer-side view of this record. The hash and locale carry over,
    /// so the consumer's port resolves to the producing pin.
    pub fn view(&self) -> Record {
        self.clone()
    }
}

/// Pin-name to record mapping declared by a module. Keys are unique per
/// module; ordered so rebuilds iterate reproducibly.
pub type RecordMap = BTreeMap<String, Record>;
