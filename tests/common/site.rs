//! Scripted registry site behind the `FormSession` trait.
//!
//! Result pages are keyed by region code and the start year of the searched
//! window, read back from what the search form filled in. Clicking the
//! search button loads page 1; clicking anything else that is not a download
//! control moves to the next page.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mediador_crawler::session::{
    ElementHandle, FormSession, SelectChoice, SessionFactory, Transfer, WaitPolicy,
};
use mediador_crawler::{Error, Region, Result};
use scraper::{Html, Selector};

/// Search form page served after navigation
pub const SEARCH_PAGE: &str = r#"<html><body><form id="frmConsulta"></form></body></html>"#;

/// Result page of a search that matched nothing
pub const NO_RESULTS_PAGE: &str =
    "<html><body><p>Nenhum registro encontrado para os parâmetros informados</p></body></html>";

const REGION_FIELD: &str = "#cboUFRegistro";
const START_DATE_FIELD: &str = "#txtDTInicioRegistro";
const SEARCH_BUTTON: &str = "#btnPesquisar";

type WindowKey = (String, i32);
type PageKey = (String, i32, usize);

/// Canned site state shared by every session of a test
#[derive(Default)]
pub struct ScriptedSite {
    results: HashMap<WindowKey, Vec<String>>,
    failing_searches: HashSet<WindowKey>,
    unreadable_pages: HashSet<PageKey>,
    flaky_pages: Mutex<HashSet<PageKey>>,
    refused_opens: AtomicUsize,
    /// Sessions handed out
    pub opened: AtomicUsize,
    /// Sessions closed
    pub closed: AtomicUsize,
    /// Search submissions seen
    pub searches: AtomicUsize,
}

impl ScriptedSite {
    /// Empty site: every search returns [`NO_RESULTS_PAGE`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `pages` for searches of `region` whose window starts in `start_year`
    pub fn with_results(mut self, region: Region, start_year: i32, pages: Vec<String>) -> Self {
        self.results
            .insert((region.code().to_string(), start_year), pages);
        self
    }

    /// Reject every search of `region` whose window starts in `start_year`
    pub fn with_failing_search(mut self, region: Region, start_year: i32) -> Self {
        self.failing_searches
            .insert((region.code().to_string(), start_year));
        self
    }

    /// Make the 1-based `page` of a window unreadable, even after a reload
    pub fn with_unreadable_page(mut self, region: Region, start_year: i32, page: usize) -> Self {
        self.unreadable_pages
            .insert((region.code().to_string(), start_year, page - 1));
        self
    }

    /// Make the 1-based `page` of a window fail its first read only
    pub fn with_page_failing_once(self, region: Region, start_year: i32, page: usize) -> Self {
        if let Ok(mut flaky) = self.flaky_pages.lock() {
            flaky.insert((region.code().to_string(), start_year, page - 1));
        }
        self
    }

    /// Fail the next `n` session opens
    pub fn refusing_opens(self, n: usize) -> Self {
        self.refused_opens.store(n, Ordering::SeqCst);
        self
    }

    /// Wrap into a factory
    pub fn into_factory(self) -> (Arc<ScriptedSite>, Arc<ScriptedFactory>) {
        let site = Arc::new(self);
        let factory = Arc::new(ScriptedFactory { site: site.clone() });
        (site, factory)
    }
}

/// Opens [`ScriptedSession`]s over one [`ScriptedSite`]
pub struct ScriptedFactory {
    site: Arc<ScriptedSite>,
}

#[async_trait::async_trait]
impl SessionFactory for ScriptedFactory {
    async fn open(&self) -> Result<Box<dyn FormSession>> {
        let refused = self
            .site
            .refused_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::NotSupported("browser unavailable".to_string()));
        }
        self.site.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            site: self.site.clone(),
            fields: HashMap::new(),
            window: None,
            page: 0,
            markup: String::new(),
            url: None,
        }))
    }
}

/// One worker's view of the scripted site
pub struct ScriptedSession {
    site: Arc<ScriptedSite>,
    fields: HashMap<String, String>,
    window: Option<WindowKey>,
    page: usize,
    markup: String,
    url: Option<String>,
}

impl ScriptedSession {
    fn submit_search(&mut self) -> Result<()> {
        self.site.searches.fetch_add(1, Ordering::SeqCst);
        let region = self.fields.get(REGION_FIELD).cloned().unwrap_or_default();
        let start_year = self
            .fields
            .get(START_DATE_FIELD)
            .and_then(|d| d.rsplit('/').next())
            .and_then(|y| y.parse().ok())
            .ok_or_else(|| Error::FormFieldNotFound(START_DATE_FIELD.to_string()))?;
        let key = (region, start_year);

        if self.site.failing_searches.contains(&key) {
            return Err(Error::Navigation {
                url: SEARCH_BUTTON.to_string(),
                reason: "search rejected".to_string(),
                timed_out: false,
            });
        }

        self.markup = self
            .site
            .results
            .get(&key)
            .and_then(|pages| pages.first().cloned())
            .unwrap_or_else(|| NO_RESULTS_PAGE.to_string());
        self.window = Some(key);
        self.page = 0;
        Ok(())
    }

    fn next_page(&mut self) -> Result<()> {
        let key = self
            .window
            .clone()
            .ok_or_else(|| Error::Other("no search submitted".to_string()))?;
        let next = self
            .site
            .results
            .get(&key)
            .and_then(|pages| pages.get(self.page + 1).cloned())
            .ok_or_else(|| Error::Other(format!("page {} does not exist", self.page + 2)))?;
        self.page += 1;
        self.markup = next;
        Ok(())
    }
}

#[async_trait::async_trait]
impl FormSession for ScriptedSession {
    async fn navigate(&mut self, url: &str, _wait: WaitPolicy, _timeout: Duration) -> Result<()> {
        self.url = Some(url.to_string());
        self.markup = SEARCH_PAGE.to_string();
        self.fields.clear();
        self.window = None;
        self.page = 0;
        Ok(())
    }

    async fn reload(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn select_option(&mut self, field: &str, choice: SelectChoice) -> Result<()> {
        let value = match choice {
            SelectChoice::Value(v) => v,
            SelectChoice::Index(i) => i.to_string(),
        };
        self.fields.insert(field.to_string(), value);
        Ok(())
    }

    async fn fill_text(&mut self, field: &str, value: &str) -> Result<()> {
        self.fields.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn check(&mut self, field: &str) -> Result<()> {
        self.fields.insert(field.to_string(), "S".to_string());
        Ok(())
    }

    async fn click_nth(&mut self, selector: &str, _index: usize) -> Result<()> {
        if selector == SEARCH_BUTTON {
            self.submit_search()
        } else if selector.starts_with("[onclick") {
            Err(Error::NotSupported("download triggers".to_string()))
        } else {
            self.next_page()
        }
    }

    async fn wait_for_network_idle(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn begin_download_capture(&mut self) -> Result<()> {
        Ok(())
    }

    async fn await_transfer(&mut self, _timeout: Duration) -> Result<Option<Transfer>> {
        Ok(None)
    }

    async fn content(&mut self) -> Result<String> {
        if let Some((region, start_year)) = &self.window {
            let key = (region.clone(), *start_year, self.page);
            if self.site.unreadable_pages.contains(&key) {
                return Err(Error::Other("page detached".to_string()));
            }
            let first_read = self
                .site
                .flaky_pages
                .lock()
                .map(|mut flaky| flaky.remove(&key))
                .unwrap_or(false);
            if first_read {
                return Err(Error::Other("execution context destroyed".to_string()));
            }
        }
        Ok(self.markup.clone())
    }

    async fn locate(&mut self, selector: &str) -> Result<Vec<ElementHandle>> {
        locate_in(&self.markup, selector)
    }

    fn current_url(&self) -> Option<String> {
        self.url.clone()
    }

    async fn close(&mut self) -> Result<()> {
        self.site.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn locate_in(markup: &str, selector: &str) -> Result<Vec<ElementHandle>> {
    let parsed = Selector::parse(selector)
        .map_err(|e| Error::Other(format!("invalid selector {selector:?}: {e:?}")))?;
    let doc = Html::parse_document(markup);
    Ok(doc
        .select(&parsed)
        .enumerate()
        .map(|(index, el)| ElementHandle {
            selector: selector.to_string(),
            index,
            tag: el.value().name().to_string(),
            text: el
                .text()
                .flat_map(str::split_whitespace)
                .collect::<Vec<_>>()
                .join(" "),
            attributes: el
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        })
        .collect())
}
