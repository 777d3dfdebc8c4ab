//! Store repair and diagnosis against a pre-populated artifact store

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::path::PathBuf;

use common::{
    HTML_ERROR_BODY, PDF_BYTES, ScriptedSite, listing_record, mount_attachment, test_config,
};
use mediador_crawler::store::ATTACHMENT_FILE;
use mediador_crawler::{Crawler, Region};
use tempfile::TempDir;
use wiremock::MockServer;

/// Store an instrument and put `attachment` (if any) next to it by hand
async fn seed(
    crawler: &Crawler,
    registry_id: &str,
    request_id: &str,
    attachment: Option<&[u8]>,
) -> PathBuf {
    let record = listing_record(registry_id, request_id);
    let stored = crawler
        .store()
        .store(Region::Ac, 2023, &record, "<tr></tr>", None)
        .await
        .unwrap();
    if let Some(bytes) = attachment {
        tokio::fs::write(stored.dir.join(ATTACHMENT_FILE), bytes)
            .await
            .unwrap();
    }
    stored.dir
}

#[tokio::test]
async fn test_diagnose_classifies_stored_attachments() {
    let server = MockServer::start().await;
    let temp = TempDir::new().unwrap();
    let (_site, sessions) = ScriptedSite::new().into_factory();
    let crawler = Crawler::new(test_config(&server, temp.path()), sessions)
        .await
        .unwrap();

    seed(&crawler, "AC000001/2023", "MR000001/2023", Some(PDF_BYTES)).await;
    seed(&crawler, "AC000002/2023", "MR000002/2023", Some(HTML_ERROR_BODY)).await;
    seed(&crawler, "AC000003/2023", "MR000003/2023", Some(b"".as_slice())).await;
    seed(&crawler, "AC000004/2023", "MR000004/2023", None).await;
    crawler
        .store()
        .save_debug_page("AC_CCT_2022_empty.html", "<html></html>")
        .await
        .unwrap();

    let summary = crawler.diagnose().await.unwrap();
    assert_eq!(summary.total, 4);
    assert_eq!(summary.pdf, 1);
    assert_eq!(summary.html, 1);
    assert_eq!(summary.empty, 1);
    assert_eq!(summary.missing, 1);
    assert_eq!(summary.invalid(), 2);
}

#[tokio::test]
async fn test_repair_refetches_invalid_attachments() {
    let server = MockServer::start().await;
    let temp = TempDir::new().unwrap();
    mount_attachment(&server, "MR000012/2023", PDF_BYTES, 1).await;
    mount_attachment(&server, "MR000013/2023", PDF_BYTES, 1).await;
    let (site, sessions) = ScriptedSite::new().into_factory();
    let crawler = Crawler::new(test_config(&server, temp.path()), sessions)
        .await
        .unwrap();

    seed(&crawler, "AC000011/2023", "MR000011/2023", Some(PDF_BYTES)).await;
    let html = seed(&crawler, "AC000012/2023", "MR000012/2023", Some(HTML_ERROR_BODY)).await;
    seed(&crawler, "AC000013/2023", "MR000013/2023", None).await;
    seed(&crawler, "AC000014/2023", "", None).await;

    let summary = crawler.repair_attachments().await.unwrap();
    assert_eq!(summary.total, 4);
    assert_eq!(summary.already_valid, 1);
    assert_eq!(summary.repaired, 2);
    assert_eq!(summary.missing_request_id, 1);
    assert_eq!(summary.failed, 0);

    assert_eq!(tokio::fs::read(html.join(ATTACHMENT_FILE)).await.unwrap(), PDF_BYTES);
    let metadata = crawler.store().load_metadata(&html).await.unwrap();
    assert!(metadata.attachment_hash.is_some());

    let after = crawler.diagnose().await.unwrap();
    assert_eq!(after.pdf, 3);
    assert_eq!(after.missing, 1);

    // Repair never drives the search form
    assert_eq!(site.opened.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_repair_counts_unrecoverable_attachments() {
    let server = MockServer::start().await;
    let temp = TempDir::new().unwrap();
    mount_attachment(&server, "MR000015/2023", HTML_ERROR_BODY, 1).await;
    let (_site, sessions) = ScriptedSite::new().into_factory();
    let crawler = Crawler::new(test_config(&server, temp.path()), sessions)
        .await
        .unwrap();

    let dir = seed(&crawler, "AC000015/2023", "MR000015/2023", None).await;

    let summary = crawler.repair_attachments().await.unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.failed, 1);
    assert!(!dir.join(ATTACHMENT_FILE).exists());
}
