//! Attachment retrieval.
//!
//! Two strategies, tried in order:
//! 1. Direct link: load the per-request summary view, find the anchor pointing
//!    at the stored attachment and download it with a plain GET. Retried with
//!    backoff on transient failures.
//! 2. Interactive trigger: on the listing page already loaded in the worker's
//!    session, arm download capture and click the row's download control.
//!    Attempted once, only when the direct link failed.
//!
//! Whatever comes back passes the signature gate before it is returned, so a
//! caller never sees an unvalidated [`Attachment`]. Every request goes through
//! the worker's [`RequestPacer`].

use std::time::Duration;

use scraper::{Html, Selector};
use url::Url;

use crate::config::{Config, RetryConfig};
use crate::error::{Error, FetchFailure, Result};
use crate::pacer::RequestPacer;
use crate::retry::with_retry;
use crate::session::FormSession;
use crate::signature::{self, PDF_SIGNATURE};
use crate::types::{Attachment, DownloadToken, ListingRecord};

/// Path segment identifying attachment links on the summary view
const ATTACHMENT_MARKER: &str = "imagemanexo";
/// Suffix of attachment links
const ATTACHMENT_SUFFIX: &str = ".pdf";
/// Query parameter carrying the request number
const REQUEST_PARAM: &str = "nrSolicitacao";

/// Which request of the direct-link strategy a response belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// The per-request summary view
    DetailPage,
    /// The attachment itself
    Attachment,
}

impl Phase {
    /// Classify a transport error (no HTTP status received)
    fn transport_failure(self, error: &reqwest::Error, timeout: Duration) -> FetchFailure {
        if error.is_timeout() {
            return FetchFailure::TransferTimedOut(timeout.as_secs());
        }
        match self {
            Phase::DetailPage => FetchFailure::DetailPageUnreachable(error.to_string()),
            Phase::Attachment => FetchFailure::TransferInterrupted(error.to_string()),
        }
    }
}

/// Retrieves and validates attachments for listing records
#[derive(Debug)]
pub struct AttachmentFetcher {
    client: reqwest::Client,
    origin: Url,
    detail_path: String,
    transfer_timeout: Duration,
    retry: RetryConfig,
}

impl AttachmentFetcher {
    /// Build a fetcher with its own cookie-keeping client
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(&config.user_agent)
            .timeout(config.transfer_timeout)
            .build()?;
        Ok(Self {
            client,
            origin: config.site_origin()?,
            detail_path: config.detail_path.clone(),
            transfer_timeout: config.transfer_timeout,
            retry: config.retry.clone(),
        })
    }

    /// URL of the summary view for `request_id`
    pub fn detail_url(&self, request_id: &str) -> Result<String> {
        let page = self
            .origin
            .join(&self.detail_path)
            .map_err(|e| Error::config("detail_path", format!("invalid path: {e}")))?;
        Ok(format!(
            "{page}?{REQUEST_PARAM}={}",
            urlencoding::encode(request_id)
        ))
    }

    /// Fetch the attachment of `record`.
    ///
    /// `session` is the worker's live session with the listing page loaded;
    /// pass `None` to restrict the fetch to the direct link.
    ///
    /// When both strategies fail, the interactive failure is reported if it
    /// proves the registry served something (a rejection or a non-PDF body);
    /// otherwise the direct-link failure is.
    pub async fn fetch(
        &self,
        record: &ListingRecord,
        session: Option<&mut dyn FormSession>,
        pacer: &RequestPacer,
    ) -> std::result::Result<Attachment, FetchFailure> {
        let Some(token) = &record.download_token else {
            return Err(FetchFailure::TokenMissing);
        };
        let request_id = if record.request_id.is_empty() {
            token.request_id.as_str()
        } else {
            record.request_id.as_str()
        };

        let direct = self.fetch_direct(request_id, pacer).await;
        let failure = match direct {
            Ok(attachment) => return Ok(attachment),
            Err(failure) => failure,
        };

        let Some(session) = session else {
            return Err(failure);
        };
        tracing::debug!(
            registry_id = %record.registry_id,
            error = %failure,
            "Direct link failed, trying interactive trigger"
        );
        match self.fetch_interactive(session, token, pacer).await {
            Ok(attachment) => Ok(attachment),
            Err(Some(interactive)) => {
                tracing::debug!(
                    registry_id = %record.registry_id,
                    error = %interactive,
                    "Interactive trigger failed"
                );
                match interactive {
                    FetchFailure::SignatureMismatch(_) | FetchFailure::TransferRejected(_) => {
                        Err(interactive)
                    }
                    _ => Err(failure),
                }
            }
            Err(None) => Err(failure),
        }
    }

    /// Direct-link strategy with retry
    pub async fn fetch_direct(
        &self,
        request_id: &str,
        pacer: &RequestPacer,
    ) -> std::result::Result<Attachment, FetchFailure> {
        with_retry(&self.retry, || self.direct_once(request_id, pacer)).await
    }

    async fn direct_once(
        &self,
        request_id: &str,
        pacer: &RequestPacer,
    ) -> std::result::Result<Attachment, FetchFailure> {
        let deadline = self.transfer_timeout;
        tokio::time::timeout(deadline, self.direct_attempt(request_id, pacer))
            .await
            .map_err(|_| FetchFailure::TransferTimedOut(deadline.as_secs()))?
    }

    async fn direct_attempt(
        &self,
        request_id: &str,
        pacer: &RequestPacer,
    ) -> std::result::Result<Attachment, FetchFailure> {
        let detail_url = self
            .detail_url(request_id)
            .map_err(|e| FetchFailure::DetailPageUnreachable(e.to_string()))?;
        let page = self.get(&detail_url, Phase::DetailPage, pacer).await?;
        let markup = String::from_utf8_lossy(&page);

        let href = find_attachment_link(&markup).ok_or(FetchFailure::LinkNotFound)?;
        let link = self
            .origin
            .join(&href)
            .map_err(|_| FetchFailure::LinkNotFound)?;
        tracing::debug!(request_id, url = %link, "Downloading attachment");

        let bytes = self.get(link.as_str(), Phase::Attachment, pacer).await?;
        signature::validate(bytes, PDF_SIGNATURE).map_err(FetchFailure::SignatureMismatch)
    }

    async fn get(
        &self,
        url: &str,
        phase: Phase,
        pacer: &RequestPacer,
    ) -> std::result::Result<Vec<u8>, FetchFailure> {
        pacer.acquire().await;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| phase.transport_failure(&e, self.transfer_timeout))?;

        let status = response.status();
        if !status.is_success() {
            // 5xx/429 on the summary view is transient; anything else is final
            if phase == Phase::DetailPage && (status.is_server_error() || status.as_u16() == 429) {
                return Err(FetchFailure::DetailPageUnreachable(format!(
                    "HTTP status {status}"
                )));
            }
            return Err(FetchFailure::TransferRejected(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| phase.transport_failure(&e, self.transfer_timeout))?;
        Ok(bytes.to_vec())
    }

    /// Interactive strategy.
    ///
    /// `Err(None)` means the strategy could not be attempted (no control on the
    /// page, or a backend that cannot run the trigger).
    async fn fetch_interactive(
        &self,
        session: &mut dyn FormSession,
        token: &DownloadToken,
        pacer: &RequestPacer,
    ) -> std::result::Result<Attachment, Option<FetchFailure>> {
        let deadline = self.transfer_timeout;
        let attempt = self.interactive_attempt(session, token, pacer);
        match tokio::time::timeout(deadline, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Some(FetchFailure::TransferTimedOut(deadline.as_secs()))),
        }
    }

    async fn interactive_attempt(
        &self,
        session: &mut dyn FormSession,
        token: &DownloadToken,
        pacer: &RequestPacer,
    ) -> std::result::Result<Attachment, Option<FetchFailure>> {
        let control = download_control_selector(token);
        let timeout_secs = self.transfer_timeout.as_secs();

        let found = session.locate(&control).await.map_err(|_| None)?;
        if found.is_empty() {
            return Err(None);
        }
        session.begin_download_capture().await.map_err(|_| None)?;
        pacer.acquire().await;
        if let Err(e) = session.click_nth(&control, 0).await {
            return Err(match e {
                Error::Navigation {
                    timed_out: true, ..
                } => Some(FetchFailure::TransferTimedOut(timeout_secs)),
                Error::Navigation { .. } | Error::Network(_) => {
                    Some(FetchFailure::DetailPageUnreachable(e.to_string()))
                }
                _ => None,
            });
        }

        let transfer = match session.await_transfer(self.transfer_timeout).await {
            Ok(Some(transfer)) => transfer,
            Ok(None) => return Err(Some(FetchFailure::TransferTimedOut(timeout_secs))),
            Err(_) => return Err(None),
        };
        if !(200..300).contains(&transfer.status) {
            return Err(Some(FetchFailure::TransferRejected(transfer.status)));
        }
        signature::validate(transfer.bytes, PDF_SIGNATURE)
            .map_err(|kind| Some(FetchFailure::SignatureMismatch(kind)))
    }
}

/// Selector for the listing control that triggers the download of `token`
fn download_control_selector(token: &DownloadToken) -> String {
    let escape = |s: &str| s.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        r#"[onclick*="{}"][onclick*="{}"]"#,
        escape(&token.request_id),
        escape(&token.party_hash)
    )
}

/// First anchor on the summary view that points at a stored attachment
fn find_attachment_link(markup: &str) -> Option<String> {
    let anchors = Selector::parse("a[href]").ok()?;
    let html = Html::parse_document(markup);
    html.select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .find(|href| {
            let lower = href.to_ascii_lowercase();
            lower.contains(ATTACHMENT_MARKER) && lower.contains(ATTACHMENT_SUFFIX)
        })
        .map(str::to_string)
}
