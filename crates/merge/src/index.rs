//! The planner-facing merge index facade.
//!
//! `MergeIndex` wires the intake, the page buffer, and the fetch cache
//! together and presents them to the SQL engine as an ordinary index: a row
//! count, a flat scan cost, and `find` returning a forward cursor. Lookups
//! are served from the cache when every expected row has already been
//! pulled, and otherwise by a cursor that replays the cache and then
//! switches, irreversibly, to the live stream.

use crate::cache::{CacheCursor, FetchCache};
use crate::intake::PageIntake;
use crate::page::ResultPage;
use crate::stream::{
    fifo_channel, FifoStream, PageSink, RowStream, SortedShared, SortedSink, SortedStream,
};
use crate::{NodeDiscovery, RowCursor};
use common::{
    compare_rows, Column, ColumnId, Config, MergeError, MergeKey, MergeResult, Row, SourceId,
};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Flat cost added on top of the row count: the planner should treat a
/// merge index as a scan, never as a point-lookup structure.
pub const COST_OFFSET: u64 = 10;

/// Index contract the query planner and executor program against.
///
/// A merge index supports only the scan side of it; every mutation fails
/// with `Unsupported`.
pub trait TableIndex {
    /// Current estimate of the total row count; monotonically non-decreasing.
    fn row_count(&self) -> u64;

    /// Scan cost proportional to size, regardless of masks or requested order.
    fn cost(&self, masks: Option<&[ColumnId]>, sort: Option<&[MergeKey]>) -> u64;

    /// Open a cursor over rows within `[first, last]`.
    fn find(
        &self,
        first: Option<&Row>,
        last: Option<&Row>,
    ) -> MergeResult<Box<dyn RowCursor>>;

    fn find_first_or_last(&self, first: bool) -> MergeResult<Row>;
    fn add(&self, row: Row) -> MergeResult<()>;
    fn remove(&self, row: &Row) -> MergeResult<()>;
    fn truncate(&self) -> MergeResult<()>;
    fn rename(&self, name: &str) -> MergeResult<()>;
}

/// State shared between the facade and its cursors.
struct Core {
    intake: Arc<PageIntake>,
    cache: Arc<FetchCache>,
    /// Rows the stream side has yielded so far; keeps counting even after
    /// the cache itself has been discarded.
    fetched_count: AtomicU64,
    /// The single consumer half of the page buffer. Only the executor
    /// thread drains it; the lock is there so cursors can share `&self`.
    stream: Mutex<Box<dyn RowStream>>,
}

/// Reducer-side index over the row streams of many remote sources.
pub struct MergeIndex {
    label: String,
    columns: Vec<Column>,
    keys: Vec<MergeKey>,
    core: Arc<Core>,
}

#[bon::bon]
impl MergeIndex {
    /// Build an index with a fixed column set. Passing `keys` selects the
    /// sorted k-way merge variant; without them pages drain in arrival
    /// order.
    ///
    /// # Example
    /// ```ignore
    /// let index = MergeIndex::builder()
    ///     .label("reduce_part_0")
    ///     .columns(vec![
    ///         Column::new("id", SqlType::Int),
    ///         Column::new("name", SqlType::Text),
    ///     ])
    ///     .keys(vec![MergeKey::asc(0)])
    ///     .build();
    /// ```
    #[builder]
    pub fn new(
        #[builder(into)] label: String,
        columns: Vec<Column>,
        keys: Option<Vec<MergeKey>>,
        config: Option<Config>,
    ) -> Self {
        let config = config.unwrap_or_default();
        let keys = keys.unwrap_or_default();

        let (intake, stream): (Arc<PageIntake>, Box<dyn RowStream>) = if keys.is_empty() {
            let (sink, rx) = fifo_channel();
            let intake = Arc::new(PageIntake::new(Arc::new(sink) as Arc<dyn PageSink>));
            let stream = FifoStream::new(rx, Arc::clone(&intake));
            (intake, Box::new(stream))
        } else {
            let shared = SortedShared::new();
            let sink = Arc::new(SortedSink::new(Arc::clone(&shared)));
            let intake = Arc::new(PageIntake::new(sink as Arc<dyn PageSink>));
            let stream = SortedStream::new(shared, Arc::clone(&intake), keys.clone());
            (intake, Box::new(stream))
        };

        Self {
            label,
            columns,
            keys,
            core: Arc::new(Core {
                intake,
                cache: Arc::new(FetchCache::new(config.max_fetch_size)),
                fetched_count: AtomicU64::new(0),
                stream: Mutex::new(stream),
            }),
        }
    }
}

impl MergeIndex {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn keys(&self) -> &[MergeKey] {
        &self.keys
    }

    /// Register a contributing source, exactly once, before its pages flow.
    pub fn register_source(&self, source: SourceId) -> MergeResult<()> {
        self.core.intake.register_source(source)
    }

    /// Admit one inbound page from the transport.
    pub fn add_page(&self, page: ResultPage) -> MergeResult<()> {
        self.core.intake.add_page(page)
    }

    /// Fail the whole stream, e.g. on query cancellation.
    pub fn fail(&self, error: MergeError) {
        self.core.intake.fail(error);
    }

    /// Fail one source's stream; the index cannot recover from it.
    pub fn fail_source(&self, source: SourceId) {
        self.core.intake.fail_source(source);
    }

    /// Probe every source against discovery and fail the first dead one.
    pub fn check_source_nodes_alive(&self, discovery: &dyn NodeDiscovery) {
        self.core.intake.check_source_nodes_alive(discovery);
    }

    /// Rows already pulled through the stream, cached or not.
    pub fn fetched_rows(&self) -> u64 {
        self.core.fetched_count.load(AtomicOrdering::Acquire)
    }

    /// Release the index. Resources are owned by the transport, so this is
    /// a no-op for state.
    pub fn close(&self) {}
}

impl TableIndex for MergeIndex {
    fn row_count(&self) -> u64 {
        self.core.intake.expected_rows()
    }

    fn cost(&self, _masks: Option<&[ColumnId]>, _sort: Option<&[MergeKey]>) -> u64 {
        self.row_count() + COST_OFFSET
    }

    fn find(
        &self,
        first: Option<&Row>,
        last: Option<&Row>,
    ) -> MergeResult<Box<dyn RowCursor>> {
        if self.core.cache.is_discarded() {
            return Err(MergeError::FetchedTooLarge(self.core.cache.cap()));
        }

        let bounds = Bounds {
            first: first.cloned(),
            last: last.cloned(),
            keys: self.keys.clone(),
        };

        if self.fetched_rows() == self.core.intake.expected_rows() {
            tracing::debug!(label = %self.label, "serving lookup from cache");
            Ok(Box::new(CachedCursor {
                inner: self.core.cache.cursor(),
                bounds,
            }))
        } else {
            tracing::debug!(label = %self.label, "serving lookup from cache replay + stream");
            Ok(Box::new(FetchingCursor {
                core: Arc::clone(&self.core),
                replay: self.core.cache.cursor(),
                streaming: false,
            }))
        }
    }

    fn find_first_or_last(&self, _first: bool) -> MergeResult<Row> {
        Err(MergeError::Unsupported("find_first_or_last"))
    }

    fn add(&self, _row: Row) -> MergeResult<()> {
        Err(MergeError::Unsupported("add"))
    }

    fn remove(&self, _row: &Row) -> MergeResult<()> {
        Err(MergeError::Unsupported("remove"))
    }

    fn truncate(&self) -> MergeResult<()> {
        Err(MergeError::Unsupported("truncate"))
    }

    fn rename(&self, _name: &str) -> MergeResult<()> {
        Err(MergeError::Unsupported("rename"))
    }
}

impl fmt::Display for MergeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

impl fmt::Debug for MergeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeIndex")
            .field("label", &self.label)
            .field("columns", &self.columns)
            .field("keys", &self.keys)
            .field("expected_rows", &self.row_count())
            .field("fetched_rows", &self.fetched_rows())
            .finish()
    }
}

/// Key-range filter applied to cached scans.
///
/// An index without merge keys has no key order to interpret bounds under,
/// so it passes every row through and leaves filtering to the executor.
struct Bounds {
    first: Option<Row>,
    last: Option<Row>,
    keys: Vec<MergeKey>,
}

impl Bounds {
    fn contains(&self, row: &Row) -> bool {
        if self.keys.is_empty() {
            return true;
        }
        if let Some(first) = &self.first {
            if compare_rows(row, first, &self.keys) == Ordering::Less {
                return false;
            }
        }
        if let Some(last) = &self.last {
            if compare_rows(row, last, &self.keys) == Ordering::Greater {
                return false;
            }
        }
        true
    }
}

/// Cursor over the cache alone, used once every expected row is fetched.
struct CachedCursor {
    inner: CacheCursor,
    bounds: Bounds,
}

impl RowCursor for CachedCursor {
    fn next(&mut self) -> MergeResult<Option<Row>> {
        while let Some(row) = self.inner.next()? {
            if self.bounds.contains(&row) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
}

/// Cursor that replays the cache, then switches to the live stream.
///
/// The switch is one-way. Duplicates are impossible because a row is
/// appended to the cache exactly once, at the moment it is first drawn from
/// the stream.
struct FetchingCursor {
    core: Arc<Core>,
    replay: CacheCursor,
    streaming: bool,
}

impl RowCursor for FetchingCursor {
    fn next(&mut self) -> MergeResult<Option<Row>> {
        if !self.streaming {
            if let Some(row) = self.replay.next()? {
                return Ok(Some(row));
            }
            self.streaming = true;
        }

        let mut stream = self.core.stream.lock();
        match stream.next_row()? {
            Some(row) => {
                self.core.cache.append(row.clone());
                self.core.fetched_count.fetch_add(1, AtomicOrdering::AcqRel);
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use types::{SqlType, Value};

    fn row(v: i64) -> Row {
        Row::new(vec![Value::Int(v)])
    }

    fn rows(vals: &[i64]) -> Vec<Row> {
        vals.iter().map(|&v| row(v)).collect()
    }

    fn unsorted_index() -> MergeIndex {
        MergeIndex::builder()
            .label("test_merge")
            .columns(vec![Column::new("v", SqlType::Int)])
            .build()
    }

    fn drain(cursor: &mut dyn RowCursor) -> Vec<Row> {
        let mut out = Vec::new();
        while let Some(r) = cursor.next().unwrap() {
            out.push(r);
        }
        out
    }

    #[test]
    fn display_prints_the_label() {
        let index = unsorted_index();
        assert_eq!(index.to_string(), "test_merge");
        assert_eq!(index.columns(), &[Column::new("v", SqlType::Int)]);
    }

    #[test]
    fn mutations_are_unsupported() {
        let index = unsorted_index();
        assert_eq!(
            index.add(row(1)).unwrap_err(),
            MergeError::Unsupported("add")
        );
        assert_eq!(
            index.remove(&row(1)).unwrap_err(),
            MergeError::Unsupported("remove")
        );
        assert_eq!(index.truncate().unwrap_err(), MergeError::Unsupported("truncate"));
        assert_eq!(
            index.rename("other").unwrap_err(),
            MergeError::Unsupported("rename")
        );
        assert_eq!(
            index.find_first_or_last(true).unwrap_err(),
            MergeError::Unsupported("find_first_or_last")
        );
    }

    #[test]
    fn row_count_tracks_first_pages_and_cost_adds_offset() {
        let index = unsorted_index();
        let s1 = SourceId::random();
        let s2 = SourceId::random();
        index.register_source(s1).unwrap();
        index.register_source(s2).unwrap();

        assert_eq!(index.row_count(), 0);
        assert_eq!(index.cost(None, None), COST_OFFSET);

        index
            .add_page(ResultPage::new(s1, rows(&[1, 2]), Some(7), None))
            .unwrap();
        assert_eq!(index.row_count(), 7);

        index
            .add_page(ResultPage::new(s2, rows(&[3]), Some(3), None))
            .unwrap();
        assert_eq!(index.row_count(), 10);
        assert_eq!(index.cost(None, None), 10 + COST_OFFSET);
    }

    #[test]
    fn cursor_drains_the_whole_stream() {
        let index = unsorted_index();
        let s = SourceId::random();
        index.register_source(s).unwrap();
        index
            .add_page(ResultPage::new(s, rows(&[1, 2, 3]), Some(3), None))
            .unwrap();

        let mut cursor = index.find(None, None).unwrap();
        assert_eq!(drain(cursor.as_mut()), rows(&[1, 2, 3]));
        assert_eq!(index.fetched_rows(), 3);
    }

    #[test]
    fn second_find_replays_cache_then_streams() {
        let index = unsorted_index();
        let s = SourceId::random();
        index.register_source(s).unwrap();
        index
            .add_page(ResultPage::new(s, rows(&[1, 2]), Some(5), None))
            .unwrap();
        index
            .add_page(ResultPage::new(s, rows(&[3, 4, 5]), None, None))
            .unwrap();

        // pull two rows, then abandon the cursor
        let mut c1 = index.find(None, None).unwrap();
        assert_eq!(c1.next().unwrap(), Some(row(1)));
        assert_eq!(c1.next().unwrap(), Some(row(2)));
        drop(c1);

        // a fresh cursor sees the cached prefix and the remaining stream,
        // with no duplicate and no gap
        let mut c2 = index.find(None, None).unwrap();
        assert_eq!(drain(c2.as_mut()), rows(&[1, 2, 3, 4, 5]));
    }

    #[test]
    fn fully_fetched_index_serves_lookups_from_cache() {
        let index = unsorted_index();
        let s = SourceId::random();
        index.register_source(s).unwrap();
        index
            .add_page(ResultPage::new(s, rows(&[1, 2, 3]), Some(3), None))
            .unwrap();

        let mut c1 = index.find(None, None).unwrap();
        assert_eq!(drain(c1.as_mut()), rows(&[1, 2, 3]));
        drop(c1);

        // everything is cached now; repeated scans keep working
        for _ in 0..2 {
            let mut c = index.find(None, None).unwrap();
            assert_eq!(drain(c.as_mut()), rows(&[1, 2, 3]));
        }
        assert_eq!(index.fetched_rows(), 3);
    }

    #[test]
    fn find_before_initialization_sees_an_empty_rowset() {
        // With no first page yet, zero rows are expected and zero fetched:
        // the lookup is served from the (empty) cache. The outer engine
        // only opens its cursor once the map phase is underway.
        let index = unsorted_index();
        index.register_source(SourceId::random()).unwrap();

        let mut cursor = index.find(None, None).unwrap();
        assert_eq!(cursor.next().unwrap(), None);
    }

    #[test]
    fn cap_overrun_discards_cache_and_fails_later_lookups() {
        let index = MergeIndex::builder()
            .label("small_cache")
            .columns(vec![Column::new("v", SqlType::Int)])
            .config(Config::builder().max_fetch_size(3).build())
            .build();
        let s = SourceId::random();
        index.register_source(s).unwrap();
        index
            .add_page(ResultPage::new(s, rows(&[1, 2, 3, 4, 5]), Some(5), None))
            .unwrap();

        let mut cursor = index.find(None, None).unwrap();
        // the stream itself is unaffected by the cache overflowing
        assert_eq!(drain(cursor.as_mut()), rows(&[1, 2, 3, 4, 5]));
        assert_eq!(index.fetched_rows(), 5);

        assert_eq!(
            index.find(None, None).unwrap_err(),
            MergeError::FetchedTooLarge(3)
        );
        // discard is sticky
        assert_eq!(
            index.find(None, None).unwrap_err(),
            MergeError::FetchedTooLarge(3)
        );
    }

    #[test]
    fn sorted_index_applies_bounds_to_cached_scans() {
        let index = MergeIndex::builder()
            .label("sorted_merge")
            .columns(vec![Column::new("v", SqlType::Int)])
            .keys(vec![MergeKey::asc(0)])
            .build();
        let s1 = SourceId::random();
        let s2 = SourceId::random();
        index.register_source(s1).unwrap();
        index.register_source(s2).unwrap();
        index
            .add_page(ResultPage::new(s1, rows(&[1, 3, 5]), Some(3), None))
            .unwrap();
        index
            .add_page(ResultPage::new(s2, rows(&[2, 4, 6]), Some(3), None))
            .unwrap();

        let mut all = index.find(None, None).unwrap();
        assert_eq!(drain(all.as_mut()), rows(&[1, 2, 3, 4, 5, 6]));
        drop(all);

        let mut ranged = index.find(Some(&row(2)), Some(&row(4))).unwrap();
        assert_eq!(drain(ranged.as_mut()), rows(&[2, 3, 4]));
    }

    #[test]
    fn unsorted_index_ignores_bounds() {
        let index = unsorted_index();
        let s = SourceId::random();
        index.register_source(s).unwrap();
        index
            .add_page(ResultPage::new(s, rows(&[9, 1, 5]), Some(3), None))
            .unwrap();

        let mut c1 = index.find(None, None).unwrap();
        assert_eq!(drain(c1.as_mut()), rows(&[9, 1, 5]));
        drop(c1);

        let mut bounded = index.find(Some(&row(2)), Some(&row(4))).unwrap();
        assert_eq!(drain(bounded.as_mut()), rows(&[9, 1, 5]));
    }
}
