//! Tuple dispatch under bounded concurrency.

use std::collections::HashSet;

use futures::StreamExt;

use super::Crawler;
use crate::driver::WorkerContext;
use crate::error::Result;
use crate::fetcher::AttachmentFetcher;
use crate::pacer::RequestPacer;
use crate::types::{
    CrawlCounters, DocumentType, Event, ParameterTuple, Region, RunSummary, TupleReport,
    YearWindow,
};

impl Crawler {
    /// Crawl the whole configured parameter space.
    ///
    /// Runs at most `max_workers` tuples at once. Each tuple runs in its own
    /// task, so a failing or panicking worker is recorded in the summary and
    /// never cancels the others.
    pub async fn run(&self) -> RunSummary {
        let started_at = chrono::Utc::now();
        let tuples = self.tuples();
        tracing::info!(
            tuples = tuples.len(),
            max_workers = self.config.max_workers,
            years = %self.config.collection_years(),
            "Starting crawl"
        );

        let reports: Vec<TupleReport> = futures::stream::iter(tuples)
            .map(|tuple| self.spawn_tuple(tuple))
            .buffer_unordered(self.config.max_workers)
            .collect()
            .await;

        let summary = RunSummary::from_reports(started_at, chrono::Utc::now(), reports);
        tracing::info!(
            tuples_total = summary.tuples_total,
            tuples_failed = summary.tuples_failed,
            listed = summary.totals.listed,
            fetched_ok = summary.totals.fetched_ok,
            fetched_invalid_signature = summary.totals.fetched_invalid_signature,
            fetch_failed = summary.totals.fetch_failed,
            skipped_no_token = summary.totals.skipped_no_token,
            "Crawl finished"
        );
        summary
    }

    /// Crawl a single (region, document type) tuple over the configured years
    pub async fn run_tuple(&self, region: Region, document_type: DocumentType) -> TupleReport {
        self.run_tuple_years(region, document_type, self.config.collection_years())
            .await
    }

    /// Crawl a single tuple over `years`
    pub async fn run_tuple_years(
        &self,
        region: Region,
        document_type: DocumentType,
        years: YearWindow,
    ) -> TupleReport {
        match self.worker_context(region, document_type).await {
            Ok(ctx) => ctx.run_tuple(years).await,
            Err(e) => {
                tracing::error!(
                    region = %region,
                    document_type = %document_type,
                    error = %e,
                    "Worker could not start"
                );
                let mut report = TupleReport::new(region, document_type);
                report.error = Some(e.to_string());
                self.emit_event(Event::TupleFinished {
                    report: report.clone(),
                });
                report
            }
        }
    }

    /// Run one tuple in its own task, turning a panic into a failed report
    async fn spawn_tuple(&self, tuple: ParameterTuple) -> TupleReport {
        let crawler = self.clone();
        let ParameterTuple {
            region,
            document_type,
            years,
        } = tuple;

        let handle = tokio::spawn(async move {
            crawler
                .run_tuple_years(region, document_type, years)
                .await
        });

        match handle.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(
                    region = %region,
                    document_type = %document_type,
                    error = %e,
                    "Worker task failed"
                );
                let mut report = TupleReport::new(region, document_type);
                report.error = Some(format!("worker task failed: {e}"));
                report
            }
        }
    }

    /// Open the session and build the per-worker state
    async fn worker_context(
        &self,
        region: Region,
        document_type: DocumentType,
    ) -> Result<WorkerContext> {
        let fetcher = AttachmentFetcher::new(&self.config)?;
        let session = self.sessions.open().await?;
        Ok(WorkerContext {
            config: self.config.clone(),
            region,
            document_type,
            session,
            fetcher,
            extractor: self.extractor.clone(),
            store: self.store.clone(),
            form: self.form.clone(),
            pacer: RequestPacer::new(self.config.min_request_interval),
            seen: HashSet::new(),
            counters: CrawlCounters::default(),
            event_tx: self.event_tx.clone(),
        })
    }
}
