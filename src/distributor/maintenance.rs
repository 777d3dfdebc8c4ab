//! Store maintenance: attachment repair and diagnosis.

use std::path::PathBuf;

use futures::StreamExt;

use super::Crawler;
use crate::error::{Error, Result};
use crate::fetcher::AttachmentFetcher;
use crate::pacer::RequestPacer;
use crate::signature;
use crate::store::{ATTACHMENT_FILE, verified_attachment};
use crate::types::{DiagnoseSummary, RepairSummary};

/// What happened to one instrument during repair
enum RepairOutcome {
    Repaired,
    AlreadyValid,
    MissingRequestId,
    Failed,
}

impl Crawler {
    /// Re-fetch every stored attachment that is missing or fails verification.
    ///
    /// Uses the direct-link strategy only (no listing page is loaded), with
    /// the usual retry policy and pacing, `max_workers` instruments at a time.
    pub async fn repair_attachments(&self) -> Result<RepairSummary> {
        let dirs = self.instrument_dirs().await?;
        let fetcher = AttachmentFetcher::new(&self.config)?;
        let pacer = RequestPacer::new(self.config.min_request_interval);
        tracing::info!(instruments = dirs.len(), "Starting attachment repair");

        let outcomes: Vec<RepairOutcome> = futures::stream::iter(dirs)
            .map(|dir| {
                let fetcher = &fetcher;
                let pacer = &pacer;
                async move { self.repair_one(fetcher, pacer, dir).await }
            })
            .buffer_unordered(self.config.max_workers)
            .collect()
            .await;

        let mut summary = RepairSummary::default();
        for outcome in outcomes {
            summary.total += 1;
            match outcome {
                RepairOutcome::Repaired => summary.repaired += 1,
                RepairOutcome::AlreadyValid => summary.already_valid += 1,
                RepairOutcome::MissingRequestId => summary.missing_request_id += 1,
                RepairOutcome::Failed => summary.failed += 1,
            }
        }

        tracing::info!(
            total = summary.total,
            repaired = summary.repaired,
            already_valid = summary.already_valid,
            missing_request_id = summary.missing_request_id,
            failed = summary.failed,
            "Attachment repair finished"
        );
        Ok(summary)
    }

    async fn repair_one(
        &self,
        fetcher: &AttachmentFetcher,
        pacer: &RequestPacer,
        dir: PathBuf,
    ) -> RepairOutcome {
        if verified_attachment(&dir).await.is_some() {
            return RepairOutcome::AlreadyValid;
        }

        let metadata = match self.store.load_metadata(&dir).await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Unreadable metadata");
                return RepairOutcome::Failed;
            }
        };

        let request_id = Some(metadata.record.request_id.as_str())
            .filter(|id| !id.trim().is_empty())
            .or_else(|| {
                metadata
                    .record
                    .download_token
                    .as_ref()
                    .map(|t| t.request_id.as_str())
            })
            .map(str::to_string);
        let Some(request_id) = request_id else {
            tracing::debug!(
                registry_id = %metadata.record.registry_id,
                "No request id to repair with"
            );
            return RepairOutcome::MissingRequestId;
        };

        let attachment = match fetcher.fetch_direct(&request_id, pacer).await {
            Ok(attachment) => attachment,
            Err(failure) => {
                tracing::warn!(
                    registry_id = %metadata.record.registry_id,
                    reason = failure.label(),
                    error = %failure,
                    "Repair fetch failed"
                );
                return RepairOutcome::Failed;
            }
        };

        let registry_id = metadata.record.registry_id.clone();
        match self.store.replace_attachment(&dir, metadata, &attachment).await {
            Ok(_) => {
                tracing::info!(registry_id = %registry_id, "Attachment repaired");
                RepairOutcome::Repaired
            }
            Err(e) => {
                tracing::error!(registry_id = %registry_id, error = %e, "Failed to write repaired attachment");
                RepairOutcome::Failed
            }
        }
    }

    /// Classify every stored attachment by its leading bytes
    pub async fn diagnose(&self) -> Result<DiagnoseSummary> {
        let dirs = self.instrument_dirs().await?;
        let mut summary = DiagnoseSummary::default();

        for dir in dirs {
            summary.total += 1;
            match tokio::fs::read(dir.join(ATTACHMENT_FILE)).await {
                Ok(bytes) => {
                    let kind = signature::classify(&bytes);
                    if kind != signature::PayloadKind::Pdf {
                        tracing::debug!(dir = %dir.display(), kind = %kind, "Invalid attachment");
                    }
                    summary.record(kind);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => summary.missing += 1,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        tracing::info!(
            total = summary.total,
            pdf = summary.pdf,
            invalid = summary.invalid(),
            missing = summary.missing,
            "Store diagnosis finished"
        );
        Ok(summary)
    }

    async fn instrument_dirs(&self) -> Result<Vec<PathBuf>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.instrument_dirs())
            .await
            .map_err(|e| Error::Other(format!("store scan failed: {e}")))
    }
}
