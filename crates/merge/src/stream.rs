//! Page buffers and the stream cursors draining them.
//!
//! Two variants plug into the intake through the same capability pair: a
//! `PageSink` the intake pushes pages into, and a `RowStream` the executor
//! side pulls rows from. The FIFO pair serves an unsorted index (rows in
//! arrival order); the sorted pair keeps one lane per source and k-way
//! merges the lane heads under the index's key comparator.
//!
//! Pulling is the only blocking path in the engine: a cursor suspends while
//! its buffer is empty and no terminal sentinel has arrived. Cancellation
//! reaches a blocked cursor as a failure sentinel.

use crate::counter::SourceState;
use crate::intake::PageIntake;
use crate::page::ResultPage;
use common::{compare_rows, MergeError, MergeKey, MergeResult, Row, SourceId};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Sink half of a page buffer: the intake and transports push pages here.
pub trait PageSink: Send + Sync {
    fn enqueue(&self, page: ResultPage);
}

/// Stream half: the executor-side cursor drains rows in merge order.
pub trait RowStream: Send {
    /// Next row, blocking while the buffer is empty and not terminated.
    ///
    /// Returns `None` once the terminal sentinel has been consumed. After a
    /// failure the same error is returned on every subsequent call.
    fn next_row(&mut self) -> MergeResult<Option<Row>>;
}

/// Build the FIFO buffer pair used by an unsorted index.
pub fn fifo_channel() -> (FifoSink, Receiver<ResultPage>) {
    let (tx, rx) = unbounded();
    (FifoSink { tx }, rx)
}

/// Multi-producer sink feeding the FIFO stream.
pub struct FifoSink {
    tx: Sender<ResultPage>,
}

impl PageSink for FifoSink {
    fn enqueue(&self, page: ResultPage) {
        // the receiver lives as long as the index; a send failure means the
        // whole index is gone and the page has nowhere to go
        let _ = self.tx.send(page);
    }
}

/// Unsorted stream: pages in arrival order, rows in on-wire order.
pub struct FifoStream {
    rx: Receiver<ResultPage>,
    intake: Arc<PageIntake>,
    rows: Vec<Row>,
    pos: usize,
    done: bool,
    failed: Option<MergeError>,
}

impl FifoStream {
    pub fn new(rx: Receiver<ResultPage>, intake: Arc<PageIntake>) -> Self {
        Self {
            rx,
            intake,
            rows: Vec::new(),
            pos: 0,
            done: false,
            failed: None,
        }
    }

    fn fail(&mut self, error: MergeError) -> MergeError {
        self.failed = Some(error.clone());
        error
    }
}

impl RowStream for FifoStream {
    fn next_row(&mut self) -> MergeResult<Option<Row>> {
        loop {
            if let Some(error) = &self.failed {
                return Err(error.clone());
            }
            if let Some(row) = self.rows.get_mut(self.pos) {
                self.pos += 1;
                return Ok(Some(std::mem::replace(row, Row::new(Vec::new()))));
            }
            if self.done {
                return Ok(None);
            }

            let page = match self.rx.recv() {
                Ok(page) => page,
                Err(_) => {
                    let error =
                        MergeError::SourceFailure("page stream disconnected".into());
                    return Err(self.fail(error));
                }
            };

            if page.is_last() {
                self.done = true;
                continue;
            }
            if page.is_fail() {
                let error = page
                    .error()
                    .cloned()
                    .unwrap_or_else(|| MergeError::SourceFailure("source failed".into()));
                return Err(self.fail(error));
            }

            // demand the next page only now that this one is being consumed
            if let Err(error) = self.intake.fetch_next_page(&page) {
                return Err(self.fail(error));
            }

            match page.into_rows() {
                Ok(rows) => {
                    self.rows = rows;
                    self.pos = 0;
                }
                Err(error) => return Err(self.fail(error)),
            }
        }
    }
}

/// State shared between the sorted sink and its stream.
pub struct SortedShared {
    state: Mutex<SortedState>,
    available: Condvar,
}

#[derive(Default)]
struct SortedState {
    lanes: HashMap<SourceId, VecDeque<ResultPage>>,
    done: bool,
    failed: Option<MergeError>,
}

impl SortedShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SortedState::default()),
            available: Condvar::new(),
        })
    }
}

/// Sink routing each source's pages into its own lane.
pub struct SortedSink {
    shared: Arc<SortedShared>,
}

impl SortedSink {
    pub fn new(shared: Arc<SortedShared>) -> Self {
        Self { shared }
    }
}

impl PageSink for SortedSink {
    fn enqueue(&self, page: ResultPage) {
        {
            let mut state = self.shared.state.lock();
            if page.is_last() {
                state.done = true;
            } else if page.is_fail() {
                // a single lost source poisons the whole merge; first error wins
                if state.failed.is_none() {
                    state.failed = Some(
                        page.error()
                            .cloned()
                            .unwrap_or_else(|| MergeError::SourceFailure("source failed".into())),
                    );
                }
            } else {
                state.lanes.entry(page.source()).or_default().push_back(page);
            }
        }
        self.shared.available.notify_all();
    }
}

struct PageRun {
    rows: Vec<Row>,
    pos: usize,
}

impl PageRun {
    fn current(&self) -> Option<&Row> {
        self.rows.get(self.pos)
    }
}

/// K-way merged stream: one head row per source, minimum first.
///
/// Ties under the key comparator fall back to source-id order so the merge
/// is deterministic.
pub struct SortedStream {
    shared: Arc<SortedShared>,
    intake: Arc<PageIntake>,
    keys: Vec<MergeKey>,
    heads: HashMap<SourceId, PageRun>,
    exhausted: HashSet<SourceId>,
    failed: Option<MergeError>,
}

impl SortedStream {
    pub fn new(shared: Arc<SortedShared>, intake: Arc<PageIntake>, keys: Vec<MergeKey>) -> Self {
        Self {
            shared,
            intake,
            keys,
            heads: HashMap::new(),
            exhausted: HashSet::new(),
            failed: None,
        }
    }

    fn fail(&mut self, error: MergeError) -> MergeError {
        self.failed = Some(error.clone());
        error
    }

    /// A source is exhausted once its counter is `Finished`, its lane is
    /// empty, and its last page run has been drained. The `Finished` flip
    /// happens after the source's final enqueue, so observing it under the
    /// lane lock means no further page can appear.
    fn head_row(&self, source: SourceId) -> Option<&Row> {
        self.heads.get(&source).and_then(PageRun::current)
    }
}

impl RowStream for SortedStream {
    fn next_row(&mut self) -> MergeResult<Option<Row>> {
        if let Some(error) = &self.failed {
            return Err(error.clone());
        }

        loop {
            let sources = self.intake.source_ids();

            // refill: pop a lane page for every live source missing a head,
            // or wait until one shows up
            let mut popped: Vec<ResultPage> = Vec::new();
            {
                let mut state = self.shared.state.lock();
                loop {
                    if let Some(error) = state.failed.clone() {
                        drop(state);
                        return Err(self.fail(error));
                    }

                    let mut waiting = false;
                    for &source in &sources {
                        if self.exhausted.contains(&source) || self.head_row(source).is_some() {
                            continue;
                        }
                        if let Some(page) =
                            state.lanes.get_mut(&source).and_then(VecDeque::pop_front)
                        {
                            popped.push(page);
                        } else if self.intake.source_state(source)
                            == Some(SourceState::Finished)
                        {
                            self.exhausted.insert(source);
                        } else {
                            waiting = true;
                        }
                    }

                    if !popped.is_empty() || !waiting {
                        break;
                    }
                    self.shared.available.wait(&mut state);
                }
            }

            // request follow-up pages and install new heads outside the lock
            for page in popped {
                if let Err(error) = self.intake.fetch_next_page(&page) {
                    return Err(self.fail(error));
                }
                let source = page.source();
                match page.into_rows() {
                    Ok(rows) => {
                        self.heads.insert(source, PageRun { rows, pos: 0 });
                    }
                    Err(error) => return Err(self.fail(error)),
                }
            }

            let all_ready = sources
                .iter()
                .all(|s| self.exhausted.contains(s) || self.head_row(*s).is_some());
            if !all_ready {
                continue;
            }
            if sources.iter().all(|s| self.exhausted.contains(s)) {
                return Ok(None);
            }

            // every live source has a head: pick the minimum
            let mut best: Option<SourceId> = None;
            for &source in &sources {
                let Some(row) = self.head_row(source) else { continue };
                best = Some(match best {
                    None => source,
                    Some(current) => match self.head_row(current) {
                        Some(current_row) => {
                            let ord = compare_rows(row, current_row, &self.keys)
                                .then_with(|| source.cmp(&current));
                            if ord == Ordering::Less {
                                source
                            } else {
                                current
                            }
                        }
                        None => source,
                    },
                });
            }

            if let Some(winner) = best {
                if let Some(run) = self.heads.get_mut(&winner) {
                    if let Some(row) = run.rows.get(run.pos).cloned() {
                        run.pos += 1;
                        return Ok(Some(row));
                    }
                }
            }
        }
    }
}
