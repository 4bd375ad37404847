//! Per-source remaining-row counter with a three-state lifecycle tag.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

/// Lifecycle of one source's counter.
///
/// Transitions are monotonic: `Uninitialized → Initialized → Finished`.
/// `Initialized` is set only after the first page's total has been applied;
/// `Finished` only once the count reaches zero and every page from the
/// source has been enqueued downstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SourceState {
    Uninitialized = 0,
    Initialized = 1,
    Finished = 2,
}

impl SourceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SourceState::Uninitialized,
            1 => SourceState::Initialized,
            _ => SourceState::Finished,
        }
    }
}

/// Remaining-row counter for one contributing source.
///
/// The count may transiently go negative when a later page overtakes the
/// first page on the wire; that is expected, not an error. The state tag is
/// written with release ordering so an observer that reads a tag also sees
/// the count updates and page enqueues that preceded it.
#[derive(Debug)]
pub struct SourceCounter {
    remaining: AtomicI64,
    state: AtomicU8,
}

impl SourceCounter {
    pub fn new() -> Self {
        Self {
            remaining: AtomicI64::new(0),
            state: AtomicU8::new(SourceState::Uninitialized as u8),
        }
    }

    /// Atomically add `delta` and return the new remaining count.
    pub fn add_and_get(&self, delta: i64) -> i64 {
        self.remaining.fetch_add(delta, Ordering::AcqRel) + delta
    }

    pub fn get(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SourceState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Default for SourceCounter {
    fn default() -> Self {
        Self::new()
    }
}
