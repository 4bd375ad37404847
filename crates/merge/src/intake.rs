//! Page admission: counters, completion detection, sentinel injection.
//!
//! The intake is called from many transport threads at once. Pages may
//! arrive reordered (a later page can overtake the first page that carries
//! the source's total), so a counter transiently going negative is normal.
//! Completion is only ever declared for a source whose counter has left
//! `Uninitialized` and reached exactly zero.

use crate::counter::{SourceCounter, SourceState};
use crate::page::ResultPage;
use crate::stream::PageSink;
use crate::NodeDiscovery;
use common::{MergeError, MergeResult, SourceId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Streaming aggregator state shared by every thread touching the index.
pub struct PageIntake {
    /// Registered sources; keys are fixed once pages start flowing.
    sources: DashMap<SourceId, Arc<SourceCounter>>,
    /// Sum of `all_rows` over every first page seen so far.
    expected_rows: AtomicU64,
    /// One-shot guard for the terminal sentinel.
    last_emitted: AtomicBool,
    sink: Arc<dyn PageSink>,
}

impl PageIntake {
    pub fn new(sink: Arc<dyn PageSink>) -> Self {
        Self {
            sources: DashMap::new(),
            expected_rows: AtomicU64::new(0),
            last_emitted: AtomicBool::new(false),
            sink,
        }
    }

    /// Register a contributing source, exactly once, before any of its pages.
    pub fn register_source(&self, source: SourceId) -> MergeResult<()> {
        if source.is_nil() {
            return Err(MergeError::InvariantViolation(
                "the nil source id is reserved for synthetic pages".into(),
            ));
        }
        match self.sources.entry(source) {
            Entry::Occupied(_) => Err(MergeError::InvariantViolation(format!(
                "source {source} registered twice"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(SourceCounter::new()));
                Ok(())
            }
        }
    }

    /// Ids of every registered source.
    pub fn source_ids(&self) -> Vec<SourceId> {
        self.sources.iter().map(|entry| *entry.key()).collect()
    }

    /// Current lifecycle state of one source's counter.
    pub fn source_state(&self, source: SourceId) -> Option<SourceState> {
        self.sources.get(&source).map(|cnt| cnt.state())
    }

    /// Current remaining count of one source.
    pub fn source_remaining(&self, source: SourceId) -> Option<i64> {
        self.sources.get(&source).map(|cnt| cnt.get())
    }

    /// Total rows expected across all sources. Grows monotonically as first
    /// pages arrive; an estimate until every source has initialized.
    pub fn expected_rows(&self) -> u64 {
        self.expected_rows.load(Ordering::Acquire)
    }

    /// Whether the terminal sentinel has been emitted.
    pub fn is_last_emitted(&self) -> bool {
        self.last_emitted.load(Ordering::Acquire)
    }

    /// Admit one inbound page.
    ///
    /// Sentinel pages go straight downstream. For data pages: the first
    /// page (the one carrying `all_rows`) seeds the counter with the
    /// source's total, later pages only subtract, and pages with rows are
    /// enqueued *before* any state flip so an observer that sees the new
    /// state also sees the page.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` for a data page from an unregistered source or
    /// a duplicate first page.
    pub fn add_page(&self, page: ResultPage) -> MergeResult<()> {
        if page.is_fail() || page.is_last() {
            self.sink.enqueue(page);
            return Ok(());
        }

        let source = page.source();
        let cnt = self
            .sources
            .get(&source)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                MergeError::InvariantViolation(format!("page from unregistered source {source}"))
            })?;

        let rows_in_page = page.rows_in_page() as i64;

        let remaining = match page.all_rows() {
            Some(all_rows) => {
                if cnt.state() != SourceState::Uninitialized {
                    return Err(MergeError::InvariantViolation(format!(
                        "duplicate first page from source {source}"
                    )));
                }

                let remaining = cnt.add_and_get(all_rows as i64 - rows_in_page);
                self.expected_rows.fetch_add(all_rows, Ordering::AcqRel);

                tracing::debug!(%source, all_rows, rows_in_page, "first page admitted");

                if rows_in_page > 0 {
                    self.sink.enqueue(page);
                }
                // enqueue before the flip: seeing Initialized implies seeing the page
                cnt.set_state(SourceState::Initialized);
                remaining
            }
            None => {
                let remaining = cnt.add_and_get(-rows_in_page);
                if rows_in_page > 0 {
                    self.sink.enqueue(page);
                }
                remaining
            }
        };

        if remaining == 0 && cnt.state() != SourceState::Uninitialized {
            cnt.set_state(SourceState::Finished);
            tracing::debug!(%source, "source finished");
            self.emit_last_if_complete();
        }

        Ok(())
    }

    /// Fail the whole stream: every registered source gets a failure
    /// sentinel so any cursor blocked on any source wakes up.
    pub fn fail(&self, error: MergeError) {
        tracing::warn!(%error, "failing merge stream");
        for entry in self.sources.iter() {
            self.sink
                .enqueue(ResultPage::fail(*entry.key(), error.clone()));
        }
    }

    /// Fail a single source; the consumer treats it as a hard stop.
    pub fn fail_source(&self, source: SourceId) {
        tracing::warn!(%source, "failing source");
        self.sink.enqueue(ResultPage::fail(
            source,
            MergeError::SourceFailure(format!("source {source} is not alive")),
        ));
    }

    /// Sweep every registered source against the discovery service and fail
    /// the first dead one found.
    pub fn check_source_nodes_alive(&self, discovery: &dyn NodeDiscovery) {
        for entry in self.sources.iter() {
            let source = *entry.key();
            if !discovery.is_alive(source) {
                tracing::warn!(%source, "source node left the cluster");
                self.fail_source(source);
                return;
            }
        }
    }

    /// Ask the transport for the page after `page`, unless that source has
    /// already drained. A negative count means later pages outran the first
    /// page: the source is still pending, so the request is still issued.
    pub fn fetch_next_page(&self, page: &ResultPage) -> MergeResult<()> {
        let source = page.source();
        let cnt = self
            .sources
            .get(&source)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                MergeError::InvariantViolation(format!("page from unregistered source {source}"))
            })?;

        if cnt.get() != 0 {
            page.fetch_next_page()
        } else {
            Ok(())
        }
    }

    fn emit_last_if_complete(&self) {
        let all_finished = self
            .sources
            .iter()
            .all(|entry| entry.value().state() == SourceState::Finished);

        if all_finished
            && self
                .last_emitted
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            tracing::debug!("all sources finished, emitting terminal sentinel");
            self.sink.enqueue(ResultPage::last());
        }
    }
}
