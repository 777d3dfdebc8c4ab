//! Work distributor and the [`Crawler`] entry point.
//!
//! The `Crawler` struct and its methods are organized by concern:
//! - [`run`] - Tuple enumeration and bounded-concurrency dispatch
//! - [`maintenance`] - Store repair and diagnosis passes

mod maintenance;
mod run;

use std::sync::Arc;

use crate::config::Config;
use crate::driver::SearchForm;
use crate::error::Result;
use crate::extract::{ExtractionPolicy, RecordExtractor};
use crate::session::SessionFactory;
use crate::store::ArtifactStore;
use crate::types::{Event, ParameterTuple};

/// Event channel capacity
const EVENT_BUFFER: usize = 1000;

/// Main crawler instance (cloneable - all fields are Arc-wrapped or cheap handles)
#[derive(Clone)]
pub struct Crawler {
    /// Configuration (wrapped in Arc for sharing across workers)
    pub(crate) config: Arc<Config>,
    /// Artifact store rooted at `config.data_root`
    pub(crate) store: ArtifactStore,
    /// Opens one session per worker
    pub(crate) sessions: Arc<dyn SessionFactory>,
    /// Listing page parser, shared read-only by all workers
    pub(crate) extractor: Arc<RecordExtractor>,
    /// Search form selectors
    pub(crate) form: Arc<SearchForm>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
}

impl Crawler {
    /// Create a crawler.
    ///
    /// Validates the configuration and opens the artifact store; an unusable
    /// data root is the one failure that stops everything before any work starts.
    pub async fn new(config: Config, sessions: Arc<dyn SessionFactory>) -> Result<Self> {
        config.validate()?;
        let store = ArtifactStore::open(&config.data_root).await?;
        let extractor = RecordExtractor::new(ExtractionPolicy::default())?;
        let (event_tx, _rx) = tokio::sync::broadcast::channel(EVENT_BUFFER);

        tracing::info!(
            data_root = %config.data_root.display(),
            max_workers = config.max_workers,
            regions = config.regions.len(),
            document_types = config.document_types.len(),
            "Crawler initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            sessions,
            extractor: Arc::new(extractor),
            form: Arc::new(SearchForm::default()),
            event_tx,
        })
    }

    /// Subscribe to crawl events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Artifact store in use
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Every (region, document type) tuple of the configured parameter space
    pub fn tuples(&self) -> Vec<ParameterTuple> {
        let years = self.config.collection_years();
        self.config
            .regions
            .iter()
            .flat_map(|&region| {
                self.config
                    .document_types
                    .iter()
                    .map(move |&document_type| ParameterTuple {
                        region,
                        document_type,
                        years,
                    })
            })
            .collect()
    }

    pub(crate) fn emit_event(&self, event: Event) {
        // Send returns an error only when nobody is subscribed
        self.event_tx.send(event).ok();
    }
}
