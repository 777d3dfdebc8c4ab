//! Form interaction sessions.
//!
//! The crawler drives the registry's search form through the [`FormSession`]
//! trait: navigate, fill fields, click, read the page, capture file transfers.
//! A browser automation backend implements it for the live site; [`HttpSession`]
//! implements it over plain HTTP for forms that work without JavaScript, and
//! tests script it directly.
//!
//! Each worker opens its own session through a [`SessionFactory`] and owns it
//! for the whole run. Sessions are never shared because the registry keeps
//! search state in per-session cookies.

mod http;

pub use http::{HttpSession, HttpSessionFactory};

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Result;

/// When a navigation is considered complete
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitPolicy {
    /// The load event fired
    #[default]
    Load,
    /// The DOM is parsed (scripts may still be running)
    DomContentLoaded,
    /// No network activity for a short period
    NetworkIdle,
}

/// Which option of a `<select>` to choose
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectChoice {
    /// Option whose `value` attribute equals the string
    Value(String),
    /// Option at this zero-based position
    Index(usize),
}

/// Snapshot of an element located on the current page
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ElementHandle {
    /// Selector the element was located with
    pub selector: String,
    /// Position among the selector's matches
    pub index: usize,
    /// Lowercase tag name
    pub tag: String,
    /// Whitespace-normalized text content
    pub text: String,
    /// All attributes
    pub attributes: BTreeMap<String, String>,
}

impl ElementHandle {
    /// Attribute value by name
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// A file transfer captured after a download trigger
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    /// URL the bytes came from, when known
    pub url: Option<String>,
    /// HTTP status of the transfer (200 when the backend does not expose one)
    pub status: u16,
    /// Transferred bytes
    pub bytes: Vec<u8>,
}

/// Browser-like session over the registry's search form
#[async_trait::async_trait]
pub trait FormSession: Send {
    /// Load `url` and wait according to `wait`, failing after `timeout`
    async fn navigate(&mut self, url: &str, wait: WaitPolicy, timeout: Duration) -> Result<()>;

    /// Reload the current page, re-submitting the request that produced it
    async fn reload(&mut self, timeout: Duration) -> Result<()>;

    /// Choose an option of the `<select>` matching `field`
    async fn select_option(&mut self, field: &str, choice: SelectChoice) -> Result<()>;

    /// Type `value` into the text input matching `field`
    async fn fill_text(&mut self, field: &str, value: &str) -> Result<()>;

    /// Tick the checkbox matching `field`
    async fn check(&mut self, field: &str) -> Result<()>;

    /// Click the `index`-th element matching `selector`
    async fn click_nth(&mut self, selector: &str, index: usize) -> Result<()>;

    /// Click the first element matching `field`
    async fn click(&mut self, field: &str) -> Result<()> {
        self.click_nth(field, 0).await
    }

    /// Wait until the page stops issuing requests
    async fn wait_for_network_idle(&mut self, timeout: Duration) -> Result<()>;

    /// Start capturing the next file transfer
    async fn begin_download_capture(&mut self) -> Result<()>;

    /// Wait for the transfer armed by [`FormSession::begin_download_capture`].
    ///
    /// `Ok(None)` means nothing arrived within `timeout`.
    async fn await_transfer(&mut self, timeout: Duration) -> Result<Option<Transfer>>;

    /// Raw markup of the current page
    async fn content(&mut self) -> Result<String>;

    /// All elements matching `selector` on the current page
    async fn locate(&mut self, selector: &str) -> Result<Vec<ElementHandle>>;

    /// URL of the current page
    fn current_url(&self) -> Option<String>;

    /// Release the session and everything it holds
    async fn close(&mut self) -> Result<()>;
}

/// Opens one exclusive [`FormSession`] per worker
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a fresh session
    async fn open(&self) -> Result<Box<dyn FormSession>>;
}
