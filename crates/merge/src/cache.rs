//! Bounded append-only cache of rows already pulled through a cursor.
//!
//! A fresh `find` replays this cache before switching to the live stream,
//! so a query can re-open its cursor without re-fetching from the sources.
//! The cache is discarded wholesale once it would outgrow its cap; from
//! then on any lookup that needs replay fails with `FetchedTooLarge`.

use common::{MergeError, MergeResult, Row};
use parking_lot::RwLock;
use std::sync::Arc;

/// Append-only row sequence with a hard cap.
pub struct FetchCache {
    rows: RwLock<Option<Vec<Row>>>,
    cap: usize,
}

impl FetchCache {
    pub fn new(cap: usize) -> Self {
        Self {
            rows: RwLock::new(Some(Vec::new())),
            cap,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Append a row, discarding the whole cache if it is already at cap.
    ///
    /// Discard is sticky: once the sequence is gone it never comes back
    /// within the life of the index.
    pub fn append(&self, row: Row) {
        let mut guard = self.rows.write();
        let at_cap = match guard.as_ref() {
            Some(rows) => rows.len() == self.cap,
            None => return,
        };
        if at_cap {
            *guard = None;
        } else if let Some(rows) = guard.as_mut() {
            rows.push(row);
        }
    }

    pub fn is_discarded(&self) -> bool {
        self.rows.read().is_none()
    }

    /// Number of cached rows; zero once discarded.
    pub fn len(&self) -> usize {
        self.rows.read().as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row at `idx`, or `None` past the current end.
    ///
    /// # Errors
    ///
    /// Returns `FetchedTooLarge` if the cache has been discarded.
    pub fn get(&self, idx: usize) -> MergeResult<Option<Row>> {
        let guard = self.rows.read();
        match guard.as_ref() {
            Some(rows) => Ok(rows.get(idx).cloned()),
            None => Err(MergeError::FetchedTooLarge(self.cap)),
        }
    }

    /// Stable forward cursor over the cache.
    ///
    /// The cursor is index-based: rows appended after creation are still
    /// returned, and appends never invalidate it.
    pub fn cursor(self: &Arc<Self>) -> CacheCursor {
        CacheCursor {
            cache: Arc::clone(self),
            pos: 0,
        }
    }
}

/// Index-based cursor over a `FetchCache`, tolerant of concurrent appends.
pub struct CacheCursor {
    cache: Arc<FetchCache>,
    pos: usize,
}

impl CacheCursor {
    /// Next cached row, including rows appended since the last call.
    pub fn next(&mut self) -> MergeResult<Option<Row>> {
        match self.cache.get(self.pos)? {
            Some(row) => {
                self.pos += 1;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// Rows returned so far.
    pub fn pos(&self) -> usize {
        self.pos
    }
}
