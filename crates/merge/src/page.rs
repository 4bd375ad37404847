//! Result pages delivered by the transport, plus the synthetic sentinels.
//!
//! A page owns only its source id, its payload, and a thunk that asks the
//! transport for the next page from the same source. It holds no reference
//! back to the index.

use common::{MergeError, MergeResult, Row, SourceId};
use std::fmt;

/// Transport action requesting the next page from the page's source.
pub type FetchNext = Box<dyn Fn() -> MergeResult<()> + Send + Sync>;

enum PageBody {
    Rows(Vec<Row>),
    Fail(MergeError),
    Last,
}

/// One page of a source's result stream.
///
/// Exactly one page per source carries `all_rows`: the total number of rows
/// that source will ever send. Sentinel pages carry no rows; a `fail` page
/// raises its error from both row access and `fetch_next_page`.
pub struct ResultPage {
    source: SourceId,
    all_rows: Option<u64>,
    body: PageBody,
    fetch_next: Option<FetchNext>,
}

impl ResultPage {
    /// A data page. `all_rows` must be present on the source's first page
    /// and absent on every later one.
    pub fn new(
        source: SourceId,
        rows: Vec<Row>,
        all_rows: Option<u64>,
        fetch_next: Option<FetchNext>,
    ) -> Self {
        Self {
            source,
            all_rows,
            body: PageBody::Rows(rows),
            fetch_next,
        }
    }

    /// A failure sentinel: the stream from `source` is lost.
    pub fn fail(source: SourceId, error: MergeError) -> Self {
        Self {
            source,
            all_rows: None,
            body: PageBody::Fail(error),
            fetch_next: None,
        }
    }

    /// The terminal sentinel, synthesized by the intake once every source
    /// has finished. Belongs to no source.
    pub fn last() -> Self {
        Self {
            source: SourceId::nil(),
            all_rows: None,
            body: PageBody::Last,
            fetch_next: None,
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn all_rows(&self) -> Option<u64> {
        self.all_rows
    }

    /// Number of payload rows; zero for sentinels.
    pub fn rows_in_page(&self) -> usize {
        match &self.body {
            PageBody::Rows(rows) => rows.len(),
            _ => 0,
        }
    }

    pub fn is_fail(&self) -> bool {
        matches!(self.body, PageBody::Fail(_))
    }

    pub fn is_last(&self) -> bool {
        matches!(self.body, PageBody::Last)
    }

    /// Error carried by a failure sentinel.
    pub fn error(&self) -> Option<&MergeError> {
        match &self.body {
            PageBody::Fail(e) => Some(e),
            _ => None,
        }
    }

    /// Payload rows.
    ///
    /// # Errors
    ///
    /// A failure sentinel raises its carried error.
    pub fn rows(&self) -> MergeResult<&[Row]> {
        match &self.body {
            PageBody::Rows(rows) => Ok(rows),
            PageBody::Fail(e) => Err(e.clone()),
            PageBody::Last => Ok(&[]),
        }
    }

    /// Consume the page into its payload rows.
    ///
    /// # Errors
    ///
    /// A failure sentinel raises its carried error.
    pub fn into_rows(self) -> MergeResult<Vec<Row>> {
        match self.body {
            PageBody::Rows(rows) => Ok(rows),
            PageBody::Fail(e) => Err(e),
            PageBody::Last => Ok(Vec::new()),
        }
    }

    /// Ask the transport for the next page from the same source.
    ///
    /// A no-op for pages without a thunk (sentinels, final pages).
    ///
    /// # Errors
    ///
    /// A failure sentinel re-raises its carried error.
    pub fn fetch_next_page(&self) -> MergeResult<()> {
        if let PageBody::Fail(e) = &self.body {
            return Err(e.clone());
        }
        match &self.fetch_next {
            Some(fetch) => fetch(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ResultPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.body {
            PageBody::Rows(_) => "rows",
            PageBody::Fail(_) => "fail",
            PageBody::Last => "last",
        };
        f.debug_struct("ResultPage")
            .field("source", &self.source)
            .field("kind", &kind)
            .field("rows_in_page", &self.rows_in_page())
            .field("all_rows", &self.all_rows)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use types::Value;

    #[test]
    fn data_page_exposes_payload() {
        let source = SourceId::random();
        let page = ResultPage::new(
            source,
            vec![Row::new(vec![Value::Int(1)])],
            Some(4),
            None,
        );

        assert_eq!(page.source(), source);
        assert_eq!(page.all_rows(), Some(4));
        assert_eq!(page.rows_in_page(), 1);
        assert!(!page.is_fail());
        assert!(!page.is_last());
        assert_eq!(page.rows().unwrap().len(), 1);
    }

    #[test]
    fn fail_page_raises_on_access_and_fetch() {
        let err = MergeError::SourceFailure("node down".into());
        let page = ResultPage::fail(SourceId::random(), err.clone());

        assert!(page.is_fail());
        assert_eq!(page.rows().unwrap_err(), err);
        assert_eq!(page.fetch_next_page().unwrap_err(), err);
        assert_eq!(page.error(), Some(&err));
    }

    #[test]
    fn last_page_is_sourceless_and_empty() {
        let page = ResultPage::last();
        assert!(page.is_last());
        assert!(page.source().is_nil());
        assert_eq!(page.rows_in_page(), 0);
        assert!(page.rows().unwrap().is_empty());
        assert!(page.fetch_next_page().is_ok());
    }

    #[test]
    fn fetch_next_invokes_the_thunk() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_thunk = Arc::clone(&calls);
        let page = ResultPage::new(
            SourceId::random(),
            vec![],
            None,
            Some(Box::new(move || {
                calls_in_thunk.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        );

        page.fetch_next_page().unwrap();
        page.fetch_next_page().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
