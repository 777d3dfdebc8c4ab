//! Worker context: everything one (region, document type) worker owns, and
//! the per-record pipeline: fetch, validate, store.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast;

use super::search::SearchForm;
use crate::config::Config;
use crate::error::FetchFailure;
use crate::extract::{ExtractedRow, RecordExtractor};
use crate::fetcher::AttachmentFetcher;
use crate::pacer::RequestPacer;
use crate::session::FormSession;
use crate::store::{ArtifactStore, ManifestEntry};
use crate::types::{
    Attachment, CrawlCounters, DocumentType, Event, ListingRecord, Region, YearWindow,
};

/// State owned by one worker for the whole tuple run.
///
/// Nothing here is shared with other workers except the read-only pieces
/// behind `Arc` and the store, whose subtrees are disjoint per tuple.
pub struct WorkerContext {
    pub(crate) config: Arc<Config>,
    pub(crate) region: Region,
    pub(crate) document_type: DocumentType,
    pub(crate) session: Box<dyn FormSession>,
    pub(crate) fetcher: AttachmentFetcher,
    pub(crate) extractor: Arc<RecordExtractor>,
    pub(crate) store: ArtifactStore,
    pub(crate) form: Arc<SearchForm>,
    pub(crate) pacer: RequestPacer,
    /// Registry ids already handled in this run
    pub(crate) seen: HashSet<String>,
    pub(crate) counters: CrawlCounters,
    pub(crate) event_tx: broadcast::Sender<Event>,
}

impl WorkerContext {
    pub(crate) fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Fetch and store one extracted record. Never fails: every outcome is counted.
    pub(crate) async fn process_record(&mut self, row: ExtractedRow, window: YearWindow) {
        let record = row.record;
        self.counters.listed += 1;

        if !self.document_type.matches_label(&record.document_type_label) {
            self.counters.skipped_other_type += 1;
            tracing::debug!(
                region = %self.region,
                registry_id = %record.registry_id,
                document_type = %self.document_type,
                label = %record.document_type_label,
                "Row of another instrument type, skipping"
            );
            return;
        }

        if !self.seen.insert(record.registry_id.clone()) {
            self.counters.skipped_duplicate += 1;
            tracing::debug!(
                region = %self.region,
                registry_id = %record.registry_id,
                "Already handled in this run, skipping"
            );
            return;
        }

        let year = record.registry_year().unwrap_or(window.start);
        let attachment = self.acquire_attachment(&record, year).await;

        let stored = match self
            .store
            .store(self.region, year, &record, &row.snapshot, attachment.as_ref())
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                self.counters.storage_failures += 1;
                tracing::error!(
                    region = %self.region,
                    registry_id = %record.registry_id,
                    error = %e,
                    "Failed to store instrument"
                );
                return;
            }
        };

        let entry = ManifestEntry {
            registry_id: record.registry_id.clone(),
            request_id: record.request_id.clone(),
            year,
            collected_at: stored.metadata.collected_at,
            attachment_hash: stored.metadata.attachment_hash.clone(),
        };
        if let Err(e) = self
            .store
            .append_manifest(self.region, self.document_type, &entry)
            .await
        {
            self.counters.storage_failures += 1;
            tracing::warn!(
                region = %self.region,
                registry_id = %record.registry_id,
                error = %e,
                "Failed to append manifest entry"
            );
        }

        self.emit(Event::InstrumentStored {
            region: self.region,
            registry_id: record.registry_id,
            with_attachment: attachment.is_some(),
        });
    }

    /// Decide whether to download, and download. `None` leaves any stored attachment alone.
    async fn acquire_attachment(
        &mut self,
        record: &ListingRecord,
        year: i32,
    ) -> Option<Attachment> {
        if record.download_token.is_none() {
            self.counters.skipped_no_token += 1;
            tracing::debug!(
                region = %self.region,
                registry_id = %record.registry_id,
                "No download token in listing row"
            );
            return None;
        }

        if self.config.skip_existing_attachments
            && self
                .store
                .existing_valid_attachment(self.region, year, record.document_type, &record.registry_id)
                .await
                .is_some()
        {
            self.counters.skipped_existing += 1;
            tracing::debug!(
                region = %self.region,
                registry_id = %record.registry_id,
                "Valid attachment already stored"
            );
            return None;
        }

        match self
            .fetcher
            .fetch(record, Some(self.session.as_mut()), &self.pacer)
            .await
        {
            Ok(attachment) => {
                self.counters.fetched_ok += 1;
                tracing::info!(
                    region = %self.region,
                    registry_id = %record.registry_id,
                    size = attachment.bytes.len(),
                    "Attachment downloaded"
                );
                Some(attachment)
            }
            Err(failure) => {
                match failure {
                    FetchFailure::SignatureMismatch(_) => self.counters.fetched_invalid_signature += 1,
                    _ => self.counters.fetch_failed += 1,
                }
                tracing::warn!(
                    region = %self.region,
                    registry_id = %record.registry_id,
                    reason = failure.label(),
                    error = %failure,
                    "Attachment not captured"
                );
                self.emit(Event::AttachmentFailed {
                    region: self.region,
                    registry_id: record.registry_id.clone(),
                    reason: failure.label().to_string(),
                });
                None
            }
        }
    }
}
