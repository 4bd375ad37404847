//! Reducer-side merge index for a two-step distributed query engine.
//!
//! Map nodes stream partial result pages to the reducer; the merge index
//! stitches them into one logical rowset and exposes it to the SQL executor
//! as an ordinary index: a forward cursor over rows.
//!
//! # Architecture
//!
//! ```text
//! remote node ──page──▶ PageIntake ──enqueue──▶ page buffer (FIFO / sorted lanes)
//!                          │                          │
//!                   SourceCounter per source     stream cursor
//!                          │                          │
//!                    completion check            MergeIndex::find()
//!                          │                          │
//!                    "last" sentinel ──▶ executor pulls rows, FetchCache
//!                                        records them for cursor replay
//! ```
//!
//! Three roles touch an index concurrently: transport threads delivering
//! pages, a background liveness sweep, and the single executor thread
//! draining cursors. Only the cursor path blocks; every other entry point
//! is non-blocking.

mod cache;
mod counter;
mod index;
mod intake;
mod page;
mod stream;

pub use cache::{CacheCursor, FetchCache};
pub use counter::{SourceCounter, SourceState};
pub use index::{MergeIndex, TableIndex, COST_OFFSET};
pub use intake::PageIntake;
pub use page::{FetchNext, ResultPage};
pub use stream::{PageSink, RowStream};

use common::{MergeResult, Row, SourceId};

/// Forward cursor over index rows, in the pull style SQL executors expect.
///
/// `next` blocks while the underlying stream is empty and not yet
/// terminated; a failed stream surfaces its error on every subsequent pull.
pub trait RowCursor: Send {
    /// Fetch the next row, or `None` once the rowset is exhausted.
    fn next(&mut self) -> MergeResult<Option<Row>>;
}

impl std::fmt::Debug for dyn RowCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn RowCursor")
    }
}

/// Liveness probe into the discovery service.
///
/// The merge engine only consumes this seam; the discovery implementation
/// belongs to the surrounding grid.
pub trait NodeDiscovery {
    /// Whether the given source node is still part of the cluster.
    fn is_alive(&self, source: SourceId) -> bool;
}
