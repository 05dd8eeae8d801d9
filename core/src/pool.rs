/// Start-state pool: one tape buffer per distinct start state.
///
/// Batch members are grouped by the identity of their start state, never by
/// position. Every member that starts from the learned init state reads the
/// same parameter buffer, so their backward contributions land in one
/// gradient slot. Explicit start states get their own buffer unless tagged,
/// and members sharing a tag share the buffer registered for it first.

use std::collections::HashMap;

use crate::tape::BufId;

/// Identity of a start state within one sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateKey {
    /// The cell's learned start state.
    Learned,
    /// A caller-supplied state shared by every member using this tag.
    Tagged(u64),
    /// A caller-supplied state private to one member.
    Member(usize),
}

/// Where a batch member's recurrence begins.
#[derive(Clone, Debug, PartialEq)]
pub enum StartState {
    /// The learned start state (e.g. the dense cell's init_trace).
    Learned,
    /// An explicit state for this member alone, one vector per state tensor.
    Given(Vec<Vec<f64>>),
    /// An explicit state shared by tag. The first member registering a tag
    /// supplies the values; later members only reuse the slot.
    Shared(u64, Vec<Vec<f64>>),
}

impl StartState {
    pub fn key(&self, member: usize) -> StateKey {
        match self {
            StartState::Learned => StateKey::Learned,
            StartState::Given(_) => StateKey::Member(member),
            StartState::Shared(tag, _) => StateKey::Tagged(*tag),
        }
    }

    /// Explicit values, if any.
    pub fn values(&self) -> Option<&[Vec<f64>]> {
        match self {
            StartState::Learned => None,
            StartState::Given(v) | StartState::Shared(_, v) => Some(v),
        }
    }
}

/// One pooled start state and the members reading it.
#[derive(Clone, Debug)]
pub struct PoolSlot {
    pub key: StateKey,
    /// One buffer per state tensor.
    pub states: Vec<BufId>,
    /// Batch members starting here, in registration order.
    pub members: Vec<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct StatePool {
    slots: Vec<PoolSlot>,
    index: HashMap<StateKey, usize>,
}

impl StatePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers for `key`, registering them via `register` on first sight.
    /// Records `member` as a reader either way.
    pub fn acquire(&mut self, key: StateKey, member: usize, register: impl FnOnce() -> Vec<BufId>) -> &[BufId] {
        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                let slot = self.slots.len();
                self.slots.push(PoolSlot { key, states: register(), members: Vec::new() });
                self.index.insert(key, slot);
                slot
            }
        };
        self.slots[slot].members.push(member);
        &self.slots[slot].states
    }

    pub fn slots(&self) -> &[PoolSlot] {
        &self.slots
    }

    /// Slot index that `member` starts from.
    pub fn slot_of(&self, member: usize) -> Option<usize> {
        self.slots.iter().position(|s| s.members.contains(&member))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
