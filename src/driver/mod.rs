//! Pagination driver. Walks the result pages of one (region, document type)
//! tuple, one year window at a time.
//!
//! Each window runs the state machine
//!
//! ```text
//! Init → Searching → ExtractingPage(1) → ExtractingPage(2) → … → Done
//!            └──────────────┴───────────────────┴──────────→ Faulted
//! ```
//!
//! A faulted window is logged and skipped; the worker moves on to the next
//! window. The session is closed when the tuple run ends, whatever happened.

mod context;
mod search;

pub use context::WorkerContext;
pub use search::SearchForm;

use crate::error::{Error, Result};
use crate::extract::fold_label;
use crate::retry::Backoff;
use crate::types::{Event, ParameterTuple, TupleReport, YearWindow};

/// Elements that may carry the next-page affordance
const NEXT_PAGE_SELECTOR: &str = "a, button, input[type=button], input[type=submit]";

/// Folded labels of the next-page affordance
const NEXT_PAGE_LABELS: [&str; 3] = ["proxima", "proximo", "next"];

/// Where a window's run currently stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    /// Nothing submitted yet
    Init,
    /// Search form being filled and submitted
    Searching,
    /// Processing the 1-based result page
    ExtractingPage(u32),
    /// No further pages
    Done,
    /// Abandoned after an unrecoverable error
    Faulted,
}

/// Split `range` into consecutive windows spanning at most `max_years` years.
///
/// Windows cover the range exactly: no gaps, no overlaps, in ascending order.
pub fn split_windows(range: YearWindow, max_years: u32) -> Vec<YearWindow> {
    let step = i32::try_from(max_years.max(1)).unwrap_or(i32::MAX);
    let mut windows = Vec::new();
    let mut start = range.start;
    while start <= range.end {
        let end = start.saturating_add(step - 1).min(range.end);
        windows.push(YearWindow::new(start, end));
        if end == i32::MAX {
            break;
        }
        start = end + 1;
    }
    windows
}

impl WorkerContext {
    /// Run every window of `years` and release the session.
    pub async fn run_tuple(mut self, years: YearWindow) -> TupleReport {
        let mut report = TupleReport::new(self.region, self.document_type);
        self.emit(Event::TupleStarted {
            region: self.region,
            document_type: self.document_type,
        });
        tracing::info!(
            region = %self.region,
            document_type = %self.document_type,
            years = %years,
            "Starting tuple"
        );

        for (i, window) in split_windows(years, self.config.max_window_years)
            .into_iter()
            .enumerate()
        {
            self.emit(Event::WindowStarted {
                region: self.region,
                document_type: self.document_type,
                window,
            });
            match self.run_window(window, i == 0).await {
                Ok(()) => report.windows_completed += 1,
                Err((state, e)) => {
                    report.windows_faulted += 1;
                    self.counters.faulted_windows += 1;
                    tracing::error!(
                        region = %self.region,
                        document_type = %self.document_type,
                        window = %window,
                        state = ?state,
                        error = %e,
                        "Window faulted, skipping"
                    );
                    self.emit(Event::WindowFaulted {
                        region: self.region,
                        document_type: self.document_type,
                        window,
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Err(e) = self.session.close().await {
            tracing::warn!(region = %self.region, error = %e, "Failed to close session");
        }

        report.counters = self.counters;
        tracing::info!(
            region = %self.region,
            document_type = %self.document_type,
            listed = report.counters.listed,
            fetched_ok = report.counters.fetched_ok,
            windows_faulted = report.windows_faulted,
            "Tuple finished"
        );
        self.emit(Event::TupleFinished {
            report: report.clone(),
        });
        report
    }

    /// Drive one window to `Done`; on failure return the state it faulted in.
    async fn run_window(
        &mut self,
        window: YearWindow,
        first_window: bool,
    ) -> std::result::Result<(), (DriverState, Error)> {
        let mut state = DriverState::Init;
        loop {
            let next = match state {
                DriverState::Init => Ok(DriverState::Searching),
                DriverState::Searching => self.search(window).await.map(|()| DriverState::ExtractingPage(1)),
                DriverState::ExtractingPage(page) => self.process_page(window, page, first_window).await,
                DriverState::Done => return Ok(()),
                DriverState::Faulted => {
                    return Err((state, Error::Other("window already faulted".to_string())));
                }
            };
            match next {
                Ok(next) => {
                    tracing::trace!(from = ?state, to = ?next, window = %window, "Driver transition");
                    state = next;
                }
                Err(e) => return Err((state, e)),
            }
        }
    }

    /// Submit the search form, retrying transient failures with backoff
    async fn search(&mut self, window: YearWindow) -> Result<()> {
        let mut backoff = Backoff::new(&self.config.retry);
        let search = ParameterTuple {
            region: self.region,
            document_type: self.document_type,
            years: window,
        };
        loop {
            let result = self
                .form
                .submit(
                    self.session.as_mut(),
                    &self.pacer,
                    &self.config.base_url,
                    search,
                    self.config.request_timeout,
                )
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let attempt = backoff.attempt();
                    let Some(wait) = backoff.next_delay(&e) else {
                        return Err(e);
                    };
                    tracing::warn!(
                        region = %self.region,
                        window = %window,
                        attempt,
                        delay_ms = wait.as_millis(),
                        error = %e,
                        "Search failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Extract, fetch and store one page; decide what comes next
    async fn process_page(
        &mut self,
        window: YearWindow,
        page: u32,
        first_window: bool,
    ) -> Result<DriverState> {
        let markup = self.read_page(page).await?;
        let extraction = self.extractor.extract(&markup, self.document_type);

        self.counters.pages += 1;
        self.counters.discarded_rows += extraction.discarded as u64;
        self.emit(Event::PageExtracted {
            region: self.region,
            document_type: self.document_type,
            window,
            page,
            records: extraction.rows.len(),
        });

        if extraction.is_empty() {
            if page == 1 {
                tracing::info!(
                    region = %self.region,
                    document_type = %self.document_type,
                    window = %window,
                    "No results for window"
                );
                if first_window && self.config.save_empty_result_pages {
                    self.save_empty_page(window, &markup).await;
                }
            } else {
                tracing::warn!(
                    region = %self.region,
                    document_type = %self.document_type,
                    window = %window,
                    page,
                    "Empty result page after the first one; pagination may have drifted"
                );
            }
            return Ok(DriverState::Done);
        }

        let found = extraction.rows.len();
        for row in extraction.rows {
            self.process_record(row, window).await;
        }
        tracing::info!(
            region = %self.region,
            document_type = %self.document_type,
            window = %window,
            page,
            records = found,
            listed_total = self.counters.listed,
            "Page processed"
        );

        if self.config.max_pages.is_some_and(|max| page >= max) {
            tracing::info!(region = %self.region, page, "Page limit reached");
            return Ok(DriverState::Done);
        }

        if self.goto_next_page().await? {
            Ok(DriverState::ExtractingPage(page + 1))
        } else {
            Ok(DriverState::Done)
        }
    }

    /// Current page markup; one full reload is attempted when it cannot be read
    async fn read_page(&mut self, page: u32) -> Result<String> {
        match self.session.content().await {
            Ok(markup) => return Ok(markup),
            Err(e) => {
                tracing::warn!(region = %self.region, page, error = %e, "Page unreadable, reloading");
            }
        }
        self.pacer.acquire().await;
        let reread = match self.session.reload(self.config.request_timeout).await {
            Ok(()) => self.session.content().await,
            Err(e) => Err(e),
        };
        reread.map_err(|e| Error::Extraction {
            page,
            reason: e.to_string(),
        })
    }

    /// Click the next-page affordance if there is one
    async fn goto_next_page(&mut self) -> Result<bool> {
        let candidates = self.session.locate(NEXT_PAGE_SELECTOR).await?;
        let Some(next) = candidates.iter().find(|h| {
            let label = if h.text.is_empty() {
                h.attr("value").unwrap_or_default()
            } else {
                h.text.as_str()
            };
            is_next_page_label(label) && !is_disabled(h)
        }) else {
            return Ok(false);
        };

        self.pacer.acquire().await;
        self.session.click_nth(NEXT_PAGE_SELECTOR, next.index).await?;
        self.session
            .wait_for_network_idle(self.config.request_timeout)
            .await?;
        Ok(true)
    }

    async fn save_empty_page(&mut self, window: YearWindow, markup: &str) {
        let name = format!(
            "{}_{}_{}_empty.html",
            self.region.code(),
            self.document_type.name(),
            window.start
        );
        match self.store.save_debug_page(&name, markup).await {
            Ok(path) => tracing::info!(path = %path.display(), "Saved empty result page"),
            Err(e) => tracing::warn!(error = %e, "Failed to save empty result page"),
        }
    }
}

fn is_next_page_label(text: &str) -> bool {
    fold_label(text)
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| NEXT_PAGE_LABELS.contains(&word))
}

fn is_disabled(handle: &crate::session::ElementHandle) -> bool {
    handle.attr("disabled").is_some()
        || handle.attr("aria-disabled") == Some("true")
        || handle
            .attr("class")
            .is_some_and(|c| c.split_whitespace().any(|k| k.eq_ignore_ascii_case("disabled")))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ElementHandle;
    use std::collections::BTreeMap;

    fn require_send<T: Send>(_: &T) {}

    // Workers are handed to tokio::spawn; this stops compiling if the tuple
    // future ever holds a shared borrow of the non-Sync context across an await.
    #[allow(dead_code)]
    fn tuple_future_is_send(ctx: WorkerContext) {
        let future = ctx.run_tuple(YearWindow::new(2022, 2023));
        require_send(&future);
    }

    fn assert_exact_cover(range: YearWindow, windows: &[YearWindow], max: u32) {
        assert_eq!(windows.first().unwrap().start, range.start);
        assert_eq!(windows.last().unwrap().end, range.end);
        for w in windows {
            assert!(w.start <= w.end);
            assert!(w.span_years() <= max, "{w} wider than {max} years");
        }
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start, "gap or overlap between windows");
        }
    }

    #[test]
    fn test_split_windows_no_gaps_no_overlaps() {
        for (start, end) in [(2010, 2025), (2010, 2011), (2020, 2020), (2015, 2019)] {
            let range = YearWindow::new(start, end);
            let windows = split_windows(range, 2);
            assert_exact_cover(range, &windows, 2);
        }
    }

    #[test]
    fn test_split_windows_examples() {
        assert_eq!(
            split_windows(YearWindow::new(2010, 2014), 2),
            vec![
                YearWindow::new(2010, 2011),
                YearWindow::new(2012, 2013),
                YearWindow::new(2014, 2014),
            ]
        );
        assert_eq!(
            split_windows(YearWindow::new(2020, 2021), 2),
            vec![YearWindow::new(2020, 2021)]
        );
        assert_eq!(split_windows(YearWindow::new(2020, 2023), 1).len(), 4);
    }

    #[test]
    fn test_split_windows_zero_width_treated_as_one() {
        let windows = split_windows(YearWindow::new(2000, 2002), 0);
        assert_eq!(windows.len(), 3);
    }

    #[test]
    fn test_next_page_labels() {
        assert!(is_next_page_label("Próxima"));
        assert!(is_next_page_label("PRÓXIMO »"));
        assert!(is_next_page_label("Next"));
        assert!(!is_next_page_label("Anterior"));
        assert!(!is_next_page_label("Nextel"));
    }

    #[test]
    fn test_disabled_affordance() {
        let mut attributes = BTreeMap::new();
        attributes.insert("class".to_string(), "paginacao disabled".to_string());
        let handle = ElementHandle {
            selector: "a".to_string(),
            index: 0,
            tag: "a".to_string(),
            text: "Próxima".to_string(),
            attributes,
        };
        assert!(is_disabled(&handle));
    }
}
