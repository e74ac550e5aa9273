//! Register snapshots and the atomic publish store
//!
//! A [`RegisterSnapshot`] is an immutable aggregate of the four register
//! space mappings captured in one acquisition cycle. The [`SnapshotStore`]
//! replaces the published snapshot with a single pointer swap, so observers
//! either see the complete previous state or the complete new state, never a
//! mixture of the two.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// The four register spaces of a register-oriented field device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterSpace {
    /// Read/write single bits
    Coils,
    /// Read-only single bits
    DiscreteInputs,
    /// Read-only 16-bit registers
    InputRegisters,
    /// Read/write 16-bit registers
    HoldingRegisters,
}

impl fmt::Display for RegisterSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterSpace::Coils => "coils",
            RegisterSpace::DiscreteInputs => "discrete inputs",
            RegisterSpace::InputRegisters => "input registers",
            RegisterSpace::HoldingRegisters => "holding registers",
        };
        f.write_str(name)
    }
}

/// Mutable staging buffer filled during one acquisition cycle
///
/// Never visible to observers. Becomes a [`RegisterSnapshot`] only when all
/// four reads of the cycle have succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterImage {
    pub coils: HashMap<u16, bool>,
    pub discrete_inputs: HashMap<u16, bool>,
    pub input_registers: HashMap<u16, u16>,
    pub holding_registers: HashMap<u16, u16>,
}

/// Immutable device state captured at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSnapshot {
    coils: HashMap<u16, bool>,
    discrete_inputs: HashMap<u16, bool>,
    input_registers: HashMap<u16, u16>,
    holding_registers: HashMap<u16, u16>,
    sequence: u64,
    captured_at: DateTime<Utc>,
}

impl RegisterSnapshot {
    fn from_image(image: RegisterImage, sequence: u64, captured_at: DateTime<Utc>) -> Self {
        Self {
            coils: image.coils,
            discrete_inputs: image.discrete_inputs,
            input_registers: image.input_registers,
            holding_registers: image.holding_registers,
            sequence,
            captured_at,
        }
    }

    /// Monotonically increasing publish sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Capture timestamp of the acquisition cycle that produced this snapshot
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Coil value at `address`, if it was inside the polled span
    pub fn coil(&self, address: u16) -> Option<bool> {
        self.coils.get(&address).copied()
    }

    /// Discrete input value at `address`
    pub fn discrete_input(&self, address: u16) -> Option<bool> {
        self.discrete_inputs.get(&address).copied()
    }

    /// Input register value at `address`
    pub fn input_register(&self, address: u16) -> Option<u16> {
        self.input_registers.get(&address).copied()
    }

    /// Holding register value at `address`
    pub fn holding_register(&self, address: u16) -> Option<u16> {
        self.holding_registers.get(&address).copied()
    }

    pub fn coils(&self) -> &HashMap<u16, bool> {
        &self.coils
    }

    pub fn discrete_inputs(&self) -> &HashMap<u16, bool> {
        &self.discrete_inputs
    }

    pub fn input_registers(&self) -> &HashMap<u16, u16> {
        &self.input_registers
    }

    pub fn holding_registers(&self) -> &HashMap<u16, u16> {
        &self.holding_registers
    }
}

/// Replace-on-write holder for the currently published snapshot
///
/// The handle swap is the only mutation; snapshots themselves are immutable
/// once published and the superseded snapshot is simply dropped.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: RwLock<Option<Arc<RegisterSnapshot>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently published snapshot, if any cycle has succeeded yet
    pub fn latest(&self) -> Option<Arc<RegisterSnapshot>> {
        self.current.read().clone()
    }

    /// Sequence number of the published snapshot (0 before the first publish)
    pub fn sequence(&self) -> u64 {
        self.current.read().as_ref().map_or(0, |s| s.sequence)
    }

    /// Promote a fully populated staging buffer to the published snapshot
    pub fn publish(&self, image: RegisterImage) -> Arc<RegisterSnapshot> {
        let mut slot = self.current.write();
        let sequence = slot.as_ref().map_or(0, |s| s.sequence) + 1;
        let snapshot = Arc::new(RegisterSnapshot::from_image(image, sequence, Utc::now()));
        *slot = Some(Arc::clone(&snapshot));
        snapshot
    }
}
