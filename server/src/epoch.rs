//! Generation tokens used to detect that the addressee of a deferred effect
//! is gone.
//!
//! Remote calls are never cancelled. Instead, every continuation captures a
//! guard when its call is issued and re-checks it before touching live
//! state. A player slot's epoch moves on every connect and disconnect, so a
//! guard taken for one occupant never matches the next one. A [`RunId`]
//! identifies one game session; it changes when a new session starts.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(u128);

impl RunId {
    pub fn generate() -> Self {
        RunId(rand::random())
    }

    pub fn from_raw(raw: u128) -> Self {
        RunId(raw)
    }
}

impl fmt::Display for RunId {
    // Rendered in the canonical 8-4-4-4-12 layout.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = format!("{:032x}", self.0);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }
}

/// Read access to the current generation of slots and of the running session.
pub trait EpochSource {
    /// Current epoch of a slot, `None` if the slot does not exist.
    fn slot_epoch(&self, slot: usize) -> Option<u64>;

    fn run_id(&self) -> RunId;

    fn guard_slot(&self, slot: usize) -> Option<SlotGuard> {
        self.slot_epoch(slot).map(|epoch| SlotGuard { slot, epoch })
    }
}

/// Snapshot of one slot's epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGuard {
    pub slot: usize,
    pub epoch: u64,
}

impl SlotGuard {
    pub fn is_current<S: EpochSource + ?Sized>(&self, source: &S) -> bool {
        source.slot_epoch(self.slot) == Some(self.epoch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochGuard {
    /// Effect targets whoever occupied the slot at issue time.
    Slot(SlotGuard),
    /// Effect targets session-wide state of one game session.
    Run(RunId),
}

impl EpochGuard {
    pub fn is_current<S: EpochSource + ?Sized>(&self, source: &S) -> bool {
        match self {
            EpochGuard::Slot(guard) => guard.is_current(source),
            EpochGuard::Run(run) => source.run_id() == *run,
        }
    }
}

/// Filters a set of slot guards down to the slots that still hold the same
/// occupant.
pub fn live_slots<S: EpochSource + ?Sized>(guards: &[SlotGuard], source: &S) -> Vec<usize> {
    guards
        .iter()
        .filter(|guard| guard.is_current(source))
        .map(|guard| guard.slot)
        .collect()
}

/// Per-slot generation counters.
#[derive(Debug, Clone)]
pub struct SlotEpochs {
    epochs: Vec<u64>,
}

impl SlotEpochs {
    pub fn new(slots: usize) -> Self {
        Self {
            epochs: vec![0; slots],
        }
    }

    pub fn get(&self, slot: usize) -> Option<u64> {
        self.epochs.get(slot).copied()
    }

    /// Moves a slot to its next generation. Called whenever its occupant changes.
    pub fn advance(&mut self, slot: usize) -> Option<u64> {
        let epoch = self.epochs.get_mut(slot)?;
        *epoch += 1;
        Some(*epoch)
    }
}
