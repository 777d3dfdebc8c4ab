//! Configuration types for mediador-crawler

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::error::{Error, Result};
use crate::types::{DocumentType, Region, YearWindow};

/// Crawler configuration
///
/// Every field has a default, so `Config::default()` is a complete configuration
/// for a full crawl of the public registry. [`Config::from_env`] overlays the
/// environment-style settings on top of the defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Root directory of the artifact store (default: "./data/raw/mediador")
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Search page of the registry
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path (relative to the site root) of the per-request summary view
    #[serde(default = "default_detail_path")]
    pub detail_path: String,

    /// Maximum number of concurrent workers (default: 8)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Minimum interval between two requests of the same worker (default: 1 second)
    #[serde(default = "default_min_request_interval", with = "duration_serde")]
    pub min_request_interval: Duration,

    /// First registration year to collect (default: 2010)
    #[serde(default = "default_start_year")]
    pub start_year: i32,

    /// Last registration year to collect (None = current year)
    #[serde(default)]
    pub end_year: Option<i32>,

    /// Years per search window (default and maximum: 2, the widest range the
    /// registry accepts)
    #[serde(default = "default_max_window_years")]
    pub max_window_years: u32,

    /// Run the browser session without a visible window (default: true)
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Timeout for page navigation and listing requests (default: 120 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Hard timeout for a single attachment strategy (default: 30 seconds)
    #[serde(default = "default_transfer_timeout", with = "duration_serde")]
    pub transfer_timeout: Duration,

    /// User-Agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Regions to crawl (default: all 27)
    #[serde(default = "default_regions")]
    pub regions: Vec<Region>,

    /// Document types to crawl (default: all 3)
    #[serde(default = "default_document_types")]
    pub document_types: Vec<DocumentType>,

    /// Stop after this many pages per window (None = until exhausted)
    #[serde(default)]
    pub max_pages: Option<u32>,

    /// Do not re-download attachments that are already stored and valid (default: true)
    #[serde(default = "default_true")]
    pub skip_existing_attachments: bool,

    /// Save the raw page when the first search of a tuple returns nothing (default: true)
    #[serde(default = "default_true")]
    pub save_empty_result_pages: bool,

    /// Retry policy for attachment fetches and searches
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            base_url: default_base_url(),
            detail_path: default_detail_path(),
            max_workers: default_max_workers(),
            min_request_interval: default_min_request_interval(),
            start_year: default_start_year(),
            end_year: None,
            max_window_years: default_max_window_years(),
            headless: true,
            request_timeout: default_request_timeout(),
            transfer_timeout: default_transfer_timeout(),
            user_agent: default_user_agent(),
            regions: default_regions(),
            document_types: default_document_types(),
            max_pages: None,
            skip_existing_attachments: true,
            save_empty_result_pages: true,
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Build a configuration from the process environment.
    ///
    /// Recognized variables: `DATA_ROOT`, `BASE_URL`, `MAX_WORKERS`,
    /// `RATE_LIMIT` (seconds, fractional allowed), `START_YEAR`, `DATA_INICIO`
    /// (dd/mm/yyyy, used when `START_YEAR` is unset), `END_YEAR`, `HEADLESS`,
    /// `MAX_RETRIES`, `REQUEST_TIMEOUT`, `TRANSFER_TIMEOUT`, `USER_AGENT`.
    /// Unset variables keep their defaults; malformed ones are an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(root) = lookup("DATA_ROOT") {
            config.data_root = PathBuf::from(root);
        }
        if let Some(url) = lookup("BASE_URL") {
            config.base_url = url;
        }
        if let Some(agent) = lookup("USER_AGENT") {
            config.user_agent = agent;
        }
        if let Some(v) = lookup("MAX_WORKERS") {
            config.max_workers = parse_var("MAX_WORKERS", &v)?;
        }
        if let Some(v) = lookup("RATE_LIMIT") {
            let secs: f64 = parse_var("RATE_LIMIT", &v)?;
            config.min_request_interval = Duration::try_from_secs_f64(secs)
                .map_err(|e| Error::config("RATE_LIMIT", e.to_string()))?;
        }
        if let Some(v) = lookup("START_YEAR") {
            config.start_year = parse_var("START_YEAR", &v)?;
        } else if let Some(v) = lookup("DATA_INICIO") {
            config.start_year = year_from_date("DATA_INICIO", &v)?;
        }
        if let Some(v) = lookup("END_YEAR") {
            config.end_year = Some(parse_var("END_YEAR", &v)?);
        }
        if let Some(v) = lookup("HEADLESS") {
            config.headless = v.trim().eq_ignore_ascii_case("true") || v.trim() == "1";
        }
        if let Some(v) = lookup("MAX_RETRIES") {
            config.retry.max_attempts = parse_var("MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("REQUEST_TIMEOUT") {
            config.request_timeout = Duration::from_secs(parse_var("REQUEST_TIMEOUT", &v)?);
        }
        if let Some(v) = lookup("TRANSFER_TIMEOUT") {
            config.transfer_timeout = Duration::from_secs(parse_var("TRANSFER_TIMEOUT", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the crawler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::config("max_workers", "must be at least 1"));
        }
        if self.max_window_years == 0 {
            return Err(Error::config("max_window_years", "must be at least 1"));
        }
        if self.max_window_years > MAX_WINDOW_YEARS {
            return Err(Error::config(
                "max_window_years",
                format!("the registry accepts at most {MAX_WINDOW_YEARS} years per search"),
            ));
        }
        if self.regions.is_empty() {
            return Err(Error::config("regions", "at least one region is required"));
        }
        if self.document_types.is_empty() {
            return Err(Error::config(
                "document_types",
                "at least one document type is required",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts", "must be at least 1"));
        }
        if let Some(end) = self.end_year
            && end < self.start_year
        {
            return Err(Error::config(
                "end_year",
                format!("{end} is before start year {}", self.start_year),
            ));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| Error::config("base_url", format!("invalid URL: {e}")))?;
        Ok(())
    }

    /// Year range to collect, resolving an open end to the current year
    pub fn collection_years(&self) -> YearWindow {
        let end = self
            .end_year
            .unwrap_or_else(|| chrono::Datelike::year(&chrono::Local::now().date_naive()));
        YearWindow::new(self.start_year, end.max(self.start_year))
    }

    /// Scheme + host of the registry, used to resolve relative links
    pub fn site_origin(&self) -> Result<url::Url> {
        let base = url::Url::parse(&self.base_url)
            .map_err(|e| Error::config("base_url", format!("invalid URL: {e}")))?;
        base.join("/")
            .map_err(|e| Error::config("base_url", format!("invalid URL: {e}")))
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| Error::config(key, format!("invalid value {value:?}: {e}")))
}

fn year_from_date(key: &str, value: &str) -> Result<i32> {
    let date = chrono::NaiveDate::parse_from_str(value.trim(), "%d/%m/%Y")
        .map_err(|e| Error::config(key, format!("expected dd/mm/yyyy, got {value:?}: {e}")))?;
    Ok(chrono::Datelike::year(&date))
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts, the first one included (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt (default: 2 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between attempts (default: 8 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./data/raw/mediador")
}

fn default_base_url() -> String {
    "https://www3.mte.gov.br/sistemas/mediador/ConsultarInstColetivo".to_string()
}

fn default_detail_path() -> String {
    "/sistemas/mediador/Resumo/ResumoVisualiza".to_string()
}

fn default_max_workers() -> usize {
    8
}

fn default_min_request_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_start_year() -> i32 {
    2010
}

/// Widest registration period the search form accepts
pub const MAX_WINDOW_YEARS: u32 = 2;

fn default_max_window_years() -> u32 {
    MAX_WINDOW_YEARS
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_transfer_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}

fn default_regions() -> Vec<Region> {
    Region::ALL.to_vec()
}

fn default_document_types() -> Vec<DocumentType> {
    DocumentType::ALL.to_vec()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(8)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper (whole seconds, fractional on input)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
