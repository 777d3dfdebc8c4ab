//! # mediador-crawler
//!
//! Crawler for the Sistema Mediador registry of collective labor agreements.
//! Walks the registry's paginated search over region × document type × year
//! window, turns each result row into a structured record, downloads the
//! record's PDF attachment, checks its signature and stores everything in a
//! hierarchical directory tree.
//!
//! ## Design
//!
//! - **Trait at the browser seam** - the search form is driven through
//!   [`session::FormSession`]; [`session::HttpSession`] is a plain HTTP backend
//! - **Workers own their state** - one session, pacer and counter set per
//!   (region, document type) tuple, nothing global
//! - **Nothing unvalidated reaches disk** - attachments pass the `%PDF`
//!   signature gate before they are stored
//! - **Event-driven** - consumers subscribe to [`Event`]s, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use mediador_crawler::{Config, Crawler, HttpSessionFactory};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let sessions = Arc::new(HttpSessionFactory::new(&config));
//!     let crawler = Crawler::new(config, sessions).await?;
//!
//!     let mut events = crawler.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let summary = crawler.run().await;
//!     println!("{}", serde_json::to_string_pretty(&summary)?);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Work distributor (the `Crawler` entry point)
pub mod distributor;
/// Pagination driver and search form mapping
pub mod driver;
/// Error types
pub mod error;
/// Listing page record extraction
pub mod extract;
/// Attachment retrieval strategies
pub mod fetcher;
/// Per-worker request pacing
pub mod pacer;
/// Retry logic with exponential backoff
pub mod retry;
/// Form interaction sessions
pub mod session;
/// Content hashing and file signature checks
pub mod signature;
/// Hierarchical artifact store
pub mod store;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{Config, RetryConfig};
pub use distributor::Crawler;
pub use driver::{DriverState, SearchForm, split_windows};
pub use error::{Error, FetchFailure, Result};
pub use extract::{ExtractionPolicy, PageExtraction, RecordExtractor};
pub use fetcher::AttachmentFetcher;
pub use session::{FormSession, HttpSession, HttpSessionFactory, SessionFactory};
pub use store::ArtifactStore;
pub use types::{
    Attachment, CrawlCounters, DiagnoseSummary, DocumentType, DownloadToken, Event,
    ListingRecord, ParameterTuple, Region, RepairSummary, RunSummary, TupleReport, YearWindow,
};
