/// Sequence graph: a bound cell unrolled over a batch of sequences.
///
/// Members advance in lockstep ticks. A tick steps any subset of members once,
/// so sequences of different lengths share the graph; a member that has run
/// out simply stops appearing. Each tick's ops form one contiguous segment of
/// the tape, which is what lets the reverse sweep inject upstream gradients
/// between timesteps.
///
/// Layout on the tape:
///   [params][gate prelude][start states][tick 0 ops][tick 1 ops]...
/// Inputs are registered inside their tick but carry no ops.

use std::collections::HashSet;
use std::ops::Range;

use tracing::debug;

use crate::cell::{BoundCell, Cell};
use crate::error::{expect_len, HebbError};
use crate::pool::{StartState, StateKey, StatePool};
use crate::tape::{BufId, Tape};

/// Buffers produced for one batch member.
pub(crate) struct MemberTrack {
    /// states[0] is the start state; states[k + 1] is emitted by step k.
    pub(crate) states: Vec<Vec<BufId>>,
    /// outputs[k] is emitted by step k.
    pub(crate) outputs: Vec<BufId>,
}

/// One lockstep tick: the tape segment and the (member, step) pairs it holds.
pub(crate) struct Tick {
    pub(crate) ops: Range<usize>,
    pub(crate) members: Vec<(usize, usize)>,
}

pub struct SequenceGraph {
    pub(crate) tape: Tape,
    pub(crate) cell: Box<dyn BoundCell>,
    input_count: usize,
    output_count: usize,
    pub(crate) pool: StatePool,
    pub(crate) members: Vec<MemberTrack>,
    pub(crate) ticks: Vec<Tick>,
    /// Ops recorded at bind time (the gate), shared by every tick.
    pub(crate) prelude: Range<usize>,
}

impl SequenceGraph {
    /// Empty first-order graph with one member per start state.
    pub fn new(cell: &dyn Cell, starts: &[StartState]) -> Result<Self, HebbError> {
        Self::build(cell, starts, Tape::new(), None)
    }

    /// Bind `cell` on `tape` and register every member's start state.
    pub(crate) fn build(
        cell: &dyn Cell,
        starts: &[StartState],
        mut tape: Tape,
        direction: Option<&[Vec<f64>]>,
    ) -> Result<Self, HebbError> {
        let begin = tape.mark();
        let bound = cell.bind(&mut tape, direction)?;
        let prelude = begin..tape.mark();

        let sizes = bound.state_sizes();
        let mut pool = StatePool::new();
        let mut members = Vec::with_capacity(starts.len());
        for (m, start) in starts.iter().enumerate() {
            if let Some(values) = start.values() {
                if values.len() != sizes.len() {
                    return Err(HebbError::shape("start state tensors", sizes.len(), values.len()));
                }
                for (v, &n) in values.iter().zip(sizes.iter()) {
                    expect_len("start state", n, v.len())?;
                }
            }
            let tape = &mut tape;
            let states = pool
                .acquire(start.key(m), m, || match start.values() {
                    Some(values) => values
                        .iter()
                        .map(|v| tape.register_input(v, vec![v.len()]))
                        .collect(),
                    None => bound.start_states(),
                })
                .to_vec();
            members.push(MemberTrack { states: vec![states], outputs: Vec::new() });
        }

        debug!(
            members = members.len(),
            slots = pool.len(),
            params = bound.params().len(),
            sensitivity = tape.has_sensitivity(),
            "sequence graph bound"
        );

        Ok(SequenceGraph {
            tape,
            cell: bound,
            input_count: cell.input_count(),
            output_count: cell.output_count(),
            pool,
            members,
            ticks: Vec::new(),
            prelude,
        })
    }

    /// Bind and run every sequence from the learned start state.
    pub fn run(cell: &dyn Cell, sequences: &[Vec<Vec<f64>>]) -> Result<Self, HebbError> {
        let starts = vec![StartState::Learned; sequences.len()];
        Self::run_from(cell, &starts, sequences)
    }

    /// Bind and run `sequences[m]` from `starts[m]`.
    pub fn run_from(cell: &dyn Cell, starts: &[StartState], sequences: &[Vec<Vec<f64>>]) -> Result<Self, HebbError> {
        let mut graph = Self::new(cell, starts)?;
        graph.forward_all(sequences)?;
        Ok(graph)
    }

    /// Advance the listed members by one step. Returns their outputs in the
    /// order given.
    pub fn forward(&mut self, batch: &[(usize, &[f64])]) -> Result<Vec<Vec<f64>>, HebbError> {
        let mut seen = HashSet::with_capacity(batch.len());
        for &(m, x) in batch {
            if m >= self.members.len() {
                return Err(HebbError::UnknownMember { member: m, count: self.members.len() });
            }
            if !seen.insert(m) {
                return Err(HebbError::DuplicateMember { member: m });
            }
            if x.len() != self.input_count {
                return Err(HebbError::InputSize { expected: self.input_count, got: x.len() });
            }
        }

        let start = self.tape.mark();
        let mut stepped = Vec::with_capacity(batch.len());
        let mut outputs = Vec::with_capacity(batch.len());
        for &(m, x) in batch {
            let input = self.tape.register_input(x, vec![x.len()]);
            let track = &mut self.members[m];
            let step = track.outputs.len();
            let current = track.states[step].clone();
            let (next, out) = self.cell.step(&mut self.tape, &current, input);
            track.states.push(next);
            track.outputs.push(out);
            stepped.push((m, step));
            outputs.push(self.tape.buf_data(out).to_vec());
        }
        self.ticks.push(Tick { ops: start..self.tape.mark(), members: stepped });
        Ok(outputs)
    }

    /// Run one sequence per member to completion. Members whose sequence has
    /// ended sit out the remaining ticks.
    pub fn forward_all(&mut self, sequences: &[Vec<Vec<f64>>]) -> Result<(), HebbError> {
        if sequences.len() != self.members.len() {
            return Err(HebbError::shape("sequence batch", self.members.len(), sequences.len()));
        }
        let longest = sequences.iter().map(Vec::len).max().unwrap_or(0);
        for t in 0..longest {
            let batch: Vec<(usize, &[f64])> = sequences
                .iter()
                .enumerate()
                .filter_map(|(m, seq)| seq.get(t).map(|x| (m, x.as_slice())))
                .collect();
            self.forward(&batch)?;
        }
        debug!(members = sequences.len(), ticks = longest, ops = self.tape.num_ops(), "forward complete");
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn output_count(&self) -> usize {
        self.output_count
    }

    /// Steps taken so far by `member`.
    pub fn len(&self, member: usize) -> Result<usize, HebbError> {
        Ok(self.track(member)?.outputs.len())
    }

    pub fn num_ticks(&self) -> usize {
        self.ticks.len()
    }

    pub(crate) fn track(&self, member: usize) -> Result<&MemberTrack, HebbError> {
        self.members
            .get(member)
            .ok_or(HebbError::UnknownMember { member, count: self.members.len() })
    }

    pub(crate) fn output_id(&self, member: usize, step: usize) -> Result<BufId, HebbError> {
        let track = self.track(member)?;
        track.outputs.get(step).copied().ok_or(HebbError::UnknownStep {
            member,
            step,
            len: track.outputs.len(),
        })
    }

    /// State buffers emitted by `step` (not the start state).
    pub(crate) fn state_ids(&self, member: usize, step: usize) -> Result<&[BufId], HebbError> {
        let track = self.track(member)?;
        let len = track.outputs.len();
        if step >= len {
            return Err(HebbError::UnknownStep { member, step, len });
        }
        Ok(&track.states[step + 1])
    }

    pub fn output(&self, member: usize, step: usize) -> Result<&[f64], HebbError> {
        Ok(self.tape.buf_data(self.output_id(member, step)?))
    }

    pub fn outputs(&self, member: usize) -> Result<Vec<Vec<f64>>, HebbError> {
        let track = self.track(member)?;
        Ok(track.outputs.iter().map(|&id| self.tape.buf_data(id).to_vec()).collect())
    }

    /// State tensors emitted by `step`.
    pub fn state(&self, member: usize, step: usize) -> Result<Vec<&[f64]>, HebbError> {
        let ids = self.state_ids(member, step)?;
        Ok(ids.iter().map(|&id| self.tape.buf_data(id)).collect())
    }

    /// Latest state of `member`; the start state if it has not stepped.
    pub fn final_state(&self, member: usize) -> Result<Vec<&[f64]>, HebbError> {
        let track = self.track(member)?;
        let last = &track.states[track.states.len() - 1];
        Ok(last.iter().map(|&id| self.tape.buf_data(id)).collect())
    }

    /// Pool slot key that `member` starts from.
    pub fn start_key(&self, member: usize) -> Result<StateKey, HebbError> {
        self.track(member)?;
        self.pool
            .slot_of(member)
            .map(|i| self.pool.slots()[i].key)
            .ok_or(HebbError::UnknownMember { member, count: self.members.len() })
    }

    pub fn pool(&self) -> &StatePool {
        &self.pool
    }

    pub fn tape(&self) -> &Tape {
        &self.tape
    }
}
