//! # llama-kv
//!
//! Context-window bookkeeping for llama-stream.
//!
//! The backend keeps per-token attention state for every position it has
//! evaluated. [`ContextWindow`] mirrors that state in-process:
//! - **history**: every token the session has accepted, in order
//! - **committed**: how many of those tokens the backend has actually evaluated
//! - **shift**: discard the oldest tokens and renumber the rest so generation can
//!   continue past the raw capacity
//!
//! # Invariants
//! - `committed <= history.len() <= capacity` after every operation, including
//!   failed ones
//! - the backend holds positions `0..committed` of [`DEFAULT_SEQ`] and nothing else
//!   once a caller has either committed or rolled back its pending tokens

use llama_engine::{Position, SeqId, SequenceMemory, TokenId, DEFAULT_SEQ};
use tracing::{debug, info, warn};

/// Error type for context-window operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("context window capacity exceeded: {len} > {max}")]
    CapacityExceeded { len: usize, max: usize },

    #[error("cannot commit {requested} tokens: {committed} committed of {len} held")]
    CommitOverrun {
        committed: usize,
        requested: usize,
        len: usize,
    },

    #[error("backend refused to remove positions [{start}, {end})")]
    ShiftRefused { start: Position, end: Position },

    #[error("capacity {capacity} is below the {len} tokens already held")]
    CapacityBelowLength { capacity: usize, len: usize },
}

pub type KVResult<T> = Result<T, KVError>;

/// Ordered token history plus the committed-position counter.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    history: Vec<TokenId>,
    committed: usize,
    capacity: usize,
    seq: SeqId,
}

impl ContextWindow {
    /// Create an empty window holding at most `capacity` tokens.
    pub fn new(capacity: usize) -> Self {
        Self {
            history: Vec::with_capacity(capacity.min(4096)),
            committed: 0,
            capacity,
            seq: DEFAULT_SEQ,
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Tokens already folded into the backend's state.
    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free positions left before the window is exhausted.
    pub fn headroom(&self) -> usize {
        self.capacity.saturating_sub(self.committed)
    }

    /// Position at which the next evaluated token must land.
    pub fn next_position(&self) -> Position {
        self.committed as Position
    }

    /// Full accepted history, oldest first.
    pub fn tokens(&self) -> &[TokenId] {
        &self.history
    }

    /// Tokens appended but not yet evaluated.
    pub fn pending(&self) -> &[TokenId] {
        &self.history[self.committed..]
    }

    /// Change the session-level capacity.
    ///
    /// Fails without mutation when the window already holds more tokens.
    pub fn set_capacity(&mut self, capacity: usize) -> KVResult<()> {
        if self.history.len() > capacity {
            return Err(KVError::CapacityBelowLength {
                capacity,
                len: self.history.len(),
            });
        }
        self.capacity = capacity;
        Ok(())
    }

    /// Extend the history. The new tokens are pending until [`mark_committed`].
    ///
    /// [`mark_committed`]: ContextWindow::mark_committed
    pub fn append(&mut self, tokens: &[TokenId]) -> KVResult<()> {
        let len = self.history.len() + tokens.len();
        if len > self.capacity {
            return Err(KVError::CapacityExceeded {
                len,
                max: self.capacity,
            });
        }
        self.history.extend_from_slice(tokens);
        Ok(())
    }

    /// Advance `committed` after the backend evaluated exactly `n` pending tokens.
    pub fn mark_committed(&mut self, n: usize) -> KVResult<()> {
        if self.committed + n > self.history.len() {
            return Err(KVError::CommitOverrun {
                committed: self.committed,
                requested: n,
                len: self.history.len(),
            });
        }
        self.committed += n;
        Ok(())
    }

    /// Keep only the newest `keep` committed tokens.
    ///
    /// Removes positions `[0, drop)` from the backend and renumbers the rest by
    /// `-drop`. No-op (returns 0) when `committed <= keep`. If the backend refuses
    /// the removal, history and counters are left untouched.
    pub fn shift<M>(&mut self, keep: usize, mem: &mut M) -> KVResult<usize>
    where
        M: SequenceMemory + ?Sized,
    {
        if self.committed <= keep {
            return Ok(0);
        }

        let drop = self.committed - keep;
        let drop_pos = drop as Position;
        if !mem.remove_range(self.seq, 0, Some(drop_pos)) {
            warn!(drop, keep, "backend refused window shift");
            return Err(KVError::ShiftRefused {
                start: 0,
                end: drop_pos,
            });
        }
        mem.shift_positions(
            self.seq,
            drop_pos,
            Some(self.committed as Position),
            -(drop as i64),
        );

        self.history.drain(..drop);
        self.committed = keep;

        info!(dropped = drop, kept = keep, "context window shifted");
        Ok(drop)
    }

    /// Drop everything, in-process and backend-side.
    pub fn clear<M: SequenceMemory + ?Sized>(&mut self, mem: &mut M) {
        mem.clear_sequence(self.seq);
        self.history.clear();
        self.committed = 0;
        debug!("context window cleared");
    }

    /// Discard pending tokens and any backend state past `committed`.
    ///
    /// Used after a failed evaluation, which may have written part of a batch.
    /// Returns the number of history entries dropped.
    pub fn rollback<M: SequenceMemory + ?Sized>(&mut self, mem: &mut M) -> usize {
        let dropped = self.history.len() - self.committed;
        self.history.truncate(self.committed);
        if !mem.remove_range(self.seq, self.committed as Position, None) {
            warn!(
                committed = self.committed,
                "backend refused to discard uncommitted positions"
            );
        }
        dropped
    }

    /// Whether the backend's highest position agrees with `committed`.
    pub fn verify<M: SequenceMemory + ?Sized>(&self, mem: &M) -> bool {
        let held = mem
            .max_position(self.seq)
            .map_or(0, |pos| pos as usize + 1);
        held == self.committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_leaves_tokens_pending() {
        let mut window = ContextWindow::new(8);
        window.append(&[1, 2, 3]).unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window.committed(), 0);
        assert_eq!(window.pending(), &[1, 2, 3]);
    }

    #[test]
    fn append_beyond_capacity_is_rejected_without_mutation() {
        let mut window = ContextWindow::new(4);
        window.append(&[1, 2, 3]).unwrap();
        let err = window.append(&[4, 5]).unwrap_err();
        assert_eq!(err, KVError::CapacityExceeded { len: 5, max: 4 });
        assert_eq!(window.tokens(), &[1, 2, 3]);
    }

    #[test]
    fn mark_committed_advances_up_to_len() {
        let mut window = ContextWindow::new(8);
        window.append(&[1, 2, 3]).unwrap();
        window.mark_committed(2).unwrap();
        assert_eq!(window.committed(), 2);
        assert_eq!(window.pending(), &[3]);
        assert_eq!(window.next_position(), 2);

        let err = window.mark_committed(2).unwrap_err();
        assert!(matches!(err, KVError::CommitOverrun { .. }));
        assert_eq!(window.committed(), 2);
    }

    #[test]
    fn headroom_tracks_committed() {
        let mut window = ContextWindow::new(10);
        window.append(&[1; 6]).unwrap();
        assert_eq!(window.headroom(), 10);
        window.mark_committed(6).unwrap();
        assert_eq!(window.headroom(), 4);
    }

    #[test]
    fn set_capacity_rejects_shrinking_below_len() {
        let mut window = ContextWindow::new(10);
        window.append(&[1; 6]).unwrap();
        assert!(window.set_capacity(6).is_ok());
        let err = window.set_capacity(5).unwrap_err();
        assert_eq!(err, KVError::CapacityBelowLength { capacity: 5, len: 6 });
        assert_eq!(window.capacity(), 6);
    }
}
