//! Test doubles and builders shared by merge engine tests.

use common::{MergeError, MergeResult, Row, SourceId};
use merge::{FetchNext, NodeDiscovery, ResultPage, RowCursor};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use types::Value;

/// Single-column integer row.
pub fn int_row(v: i64) -> Row {
    Row::new(vec![Value::Int(v)])
}

/// Batch of single-column integer rows.
pub fn int_rows(vals: &[i64]) -> Vec<Row> {
    vals.iter().map(|&v| int_row(v)).collect()
}

/// Data page without a next-page thunk.
pub fn data_page(source: SourceId, vals: &[i64], all_rows: Option<u64>) -> ResultPage {
    ResultPage::new(source, int_rows(vals), all_rows, None)
}

/// Data page whose next-page demands are recorded in `log`.
pub fn logged_page(
    source: SourceId,
    vals: &[i64],
    all_rows: Option<u64>,
    log: &Arc<FetchLog>,
) -> ResultPage {
    ResultPage::new(source, int_rows(vals), all_rows, Some(log.thunk()))
}

/// Records next-page demands a cursor issues against a fake transport.
#[derive(Default)]
pub struct FetchLog {
    demands: AtomicUsize,
}

impl FetchLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn demands(&self) -> usize {
        self.demands.load(Ordering::SeqCst)
    }

    fn thunk(self: &Arc<Self>) -> FetchNext {
        let log = Arc::clone(self);
        Box::new(move || {
            log.demands.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Discovery double backed by a mutable alive-set.
pub struct StaticDiscovery {
    alive: Mutex<HashSet<SourceId>>,
}

impl StaticDiscovery {
    pub fn all_alive(sources: &[SourceId]) -> Self {
        Self {
            alive: Mutex::new(sources.iter().copied().collect()),
        }
    }

    pub fn mark_dead(&self, source: SourceId) {
        self.alive.lock().remove(&source);
    }
}

impl NodeDiscovery for StaticDiscovery {
    fn is_alive(&self, source: SourceId) -> bool {
        self.alive.lock().contains(&source)
    }
}

/// Pull a cursor until exhaustion, collecting every row.
pub fn drain_cursor(cursor: &mut dyn RowCursor) -> MergeResult<Vec<Row>> {
    let mut rows = Vec::new();
    while let Some(row) = cursor.next()? {
        rows.push(row);
    }
    Ok(rows)
}

/// Bridge from the wire protocol to engine pages, as a reducer-side
/// transport would do after decoding a frame.
pub mod envelope {
    use super::*;
    use protocol::PageEnvelope;

    pub fn to_page(env: PageEnvelope) -> ResultPage {
        if env.is_fail {
            let reason = env
                .error
                .unwrap_or_else(|| format!("source {} failed", env.source));
            ResultPage::fail(env.source, MergeError::SourceFailure(reason))
        } else if env.is_last {
            ResultPage::last()
        } else {
            ResultPage::new(env.source, env.rows, env.all_rows, None)
        }
    }
}
