//! Core types for mediador-crawler

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::signature::PayloadKind;

/// Brazilian federative unit (UF) used as the first-level partition of the crawl
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[allow(missing_docs)]
pub enum Region {
    Ac,
    Al,
    Am,
    Ap,
    Ba,
    Ce,
    Df,
    Es,
    Go,
    Ma,
    Mg,
    Ms,
    Mt,
    Pa,
    Pb,
    Pe,
    Pi,
    Pr,
    Rj,
    Rn,
    Ro,
    Rr,
    Rs,
    Sc,
    Se,
    Sp,
    To,
}

impl Region {
    /// Every region, in the order the registry lists them
    pub const ALL: [Region; 27] = [
        Region::Ac,
        Region::Al,
        Region::Am,
        Region::Ap,
        Region::Ba,
        Region::Ce,
        Region::Df,
        Region::Es,
        Region::Go,
        Region::Ma,
        Region::Mg,
        Region::Ms,
        Region::Mt,
        Region::Pa,
        Region::Pb,
        Region::Pe,
        Region::Pi,
        Region::Pr,
        Region::Rj,
        Region::Rn,
        Region::Ro,
        Region::Rr,
        Region::Rs,
        Region::Sc,
        Region::Se,
        Region::Sp,
        Region::To,
    ];

    /// Two-letter UF code as the registry form expects it (e.g. "AC")
    pub fn code(&self) -> &'static str {
        match self {
            Region::Ac => "AC",
            Region::Al => "AL",
            Region::Am => "AM",
            Region::Ap => "AP",
            Region::Ba => "BA",
            Region::Ce => "CE",
            Region::Df => "DF",
            Region::Es => "ES",
            Region::Go => "GO",
            Region::Ma => "MA",
            Region::Mg => "MG",
            Region::Ms => "MS",
            Region::Mt => "MT",
            Region::Pa => "PA",
            Region::Pb => "PB",
            Region::Pe => "PE",
            Region::Pi => "PI",
            Region::Pr => "PR",
            Region::Rj => "RJ",
            Region::Rn => "RN",
            Region::Ro => "RO",
            Region::Rr => "RR",
            Region::Rs => "RS",
            Region::Sc => "SC",
            Region::Se => "SE",
            Region::Sp => "SP",
            Region::To => "TO",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        Region::ALL
            .iter()
            .copied()
            .find(|r| r.code() == wanted)
            .ok_or_else(|| format!("unknown region code: {s}"))
    }
}

/// Classification of a collective labor instrument
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentType {
    /// Convenção Coletiva de Trabalho (code 1)
    Cct,
    /// Acordo Coletivo de Trabalho (code 2)
    Act,
    /// Termo Aditivo (code 3)
    Aditivo,
}

impl DocumentType {
    /// All document types, by code
    pub const ALL: [DocumentType; 3] = [DocumentType::Cct, DocumentType::Act, DocumentType::Aditivo];

    /// Numeric code ("1", "2", "3")
    pub fn code(&self) -> &'static str {
        match self {
            DocumentType::Cct => "1",
            DocumentType::Act => "2",
            DocumentType::Aditivo => "3",
        }
    }

    /// Short name used in storage paths ("CCT", "ACT", "ADITIVO")
    pub fn name(&self) -> &'static str {
        match self {
            DocumentType::Cct => "CCT",
            DocumentType::Act => "ACT",
            DocumentType::Aditivo => "ADITIVO",
        }
    }

    /// Index of the matching option in the registry's instrument-type select.
    ///
    /// The site has no dedicated "aditivo" option, so amendments are searched
    /// under "all types" (index 0).
    pub fn form_option_index(&self) -> usize {
        match self {
            DocumentType::Cct => 4,
            DocumentType::Act => 1,
            DocumentType::Aditivo => 0,
        }
    }

    /// Whether a row whose "Tipo do Instrumento" reads `label` belongs here.
    ///
    /// CCT and ACT searches are filtered by the site. The amendment search
    /// returns every type, so only labels naming a "Termo Aditivo" are kept.
    pub fn matches_label(&self, label: &str) -> bool {
        match self {
            DocumentType::Cct | DocumentType::Act => true,
            DocumentType::Aditivo => label.to_lowercase().contains("aditivo"),
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "1" | "CCT" => Ok(DocumentType::Cct),
            "2" | "ACT" => Ok(DocumentType::Act),
            "3" | "ADITIVO" => Ok(DocumentType::Aditivo),
            _ => Err(format!("unknown document type: {s}")),
        }
    }
}

/// Inclusive range of calendar years
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct YearWindow {
    /// First year (inclusive)
    pub start: i32,
    /// Last year (inclusive)
    pub end: i32,
}

impl YearWindow {
    /// Create a window; `start` and `end` are swapped if given in reverse
    pub fn new(start: i32, end: i32) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// Number of calendar years covered
    pub fn span_years(&self) -> u32 {
        (self.end - self.start + 1).unsigned_abs()
    }

    /// First day of the window in the registry's date format (dd/mm/yyyy)
    pub fn first_day(&self) -> String {
        format!("01/01/{:04}", self.start)
    }

    /// Last day of the window in the registry's date format (dd/mm/yyyy)
    pub fn last_day(&self) -> String {
        format!("31/12/{:04}", self.end)
    }
}

impl fmt::Display for YearWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// One unit of work for the distributor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterTuple {
    /// Region to search
    pub region: Region,
    /// Instrument type to search
    pub document_type: DocumentType,
    /// Requested year range, split into registry-sized windows before use
    pub years: YearWindow,
}

/// Identifiers needed to resolve or trigger an attachment download
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadToken {
    /// Request identifier passed to the download control (e.g. "MR063207/2023")
    pub request_id: String,
    /// Party hash passed alongside the request identifier
    pub party_hash: String,
}

/// A single instrument as listed on a result page
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    /// Registry number, the business key (e.g. "AC000001/2024")
    pub registry_id: String,
    /// Site-internal request number (e.g. "MR063207/2023")
    pub request_id: String,
    /// Document type the search was issued for
    pub document_type: DocumentType,
    /// Instrument type exactly as the listing shows it
    pub document_type_label: String,
    /// Start of validity, when present and parseable
    pub validity_start: Option<NaiveDate>,
    /// End of validity, when present and parseable
    pub validity_end: Option<NaiveDate>,
    /// Parties to the instrument, joined with " / "
    pub parties: String,
    /// Download identifiers, when the row carries a download control
    pub download_token: Option<DownloadToken>,
}

impl ListingRecord {
    /// Year used to partition storage.
    ///
    /// Taken from the registry number suffix ("AC000001/2024" → 2024) so the
    /// same instrument always lands in the same directory regardless of which
    /// search window listed it.
    pub fn registry_year(&self) -> Option<i32> {
        let (_, suffix) = self.registry_id.rsplit_once('/')?;
        let year: i32 = suffix.trim().parse().ok()?;
        (1900..=9999).contains(&year).then_some(year)
    }
}

/// A downloaded attachment that passed the signature gate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    /// Raw file contents
    pub bytes: Vec<u8>,
    /// SHA-256 of `bytes`, lowercase hex
    pub content_hash: String,
    /// Whether the leading bytes matched the expected signature
    pub validated: bool,
}

/// Durable metadata written as `metadata.json` for every stored instrument
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMetadata {
    /// Listing fields
    #[serde(flatten)]
    pub record: ListingRecord,
    /// Region the instrument was collected from
    pub region: Region,
    /// Storage partition year
    pub year: i32,
    /// Source system tag
    pub source: String,
    /// When this snapshot was collected
    pub collected_at: DateTime<Utc>,
    /// SHA-256 of the stored attachment, if one is stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_hash: Option<String>,
    /// Size of the stored attachment in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_size: Option<u64>,
}

/// Source tag recorded in every metadata file
pub const SOURCE_TAG: &str = "MEDIADOR";

/// Per-run counters, aggregated per tuple and across the whole run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlCounters {
    /// Records extracted from listing pages
    pub listed: u64,
    /// Attachments downloaded and validated
    pub fetched_ok: u64,
    /// Attachments rejected by the signature check
    pub fetched_invalid_signature: u64,
    /// Attachments that could not be retrieved
    pub fetch_failed: u64,
    /// Records without a download token
    pub skipped_no_token: u64,
    /// Records whose stored attachment was already valid
    pub skipped_existing: u64,
    /// Records listed more than once within the same tuple run
    pub skipped_duplicate: u64,
    /// Rows of another instrument type returned by an "all types" search
    #[serde(default)]
    pub skipped_other_type: u64,
    /// Rows discarded because they had no registry number
    pub discarded_rows: u64,
    /// Records that could not be written to the store
    pub storage_failures: u64,
    /// Pages processed
    pub pages: u64,
    /// Year windows abandoned after an unrecoverable error
    pub faulted_windows: u64,
}

impl CrawlCounters {
    /// Add another set of counters into this one
    pub fn merge(&mut self, other: &CrawlCounters) {
        self.listed += other.listed;
        self.fetched_ok += other.fetched_ok;
        self.fetched_invalid_signature += other.fetched_invalid_signature;
        self.fetch_failed += other.fetch_failed;
        self.skipped_no_token += other.skipped_no_token;
        self.skipped_existing += other.skipped_existing;
        self.skipped_duplicate += other.skipped_duplicate;
        self.skipped_other_type += other.skipped_other_type;
        self.discarded_rows += other.discarded_rows;
        self.storage_failures += other.storage_failures;
        self.pages += other.pages;
        self.faulted_windows += other.faulted_windows;
    }
}

/// Outcome of one (region, document type) worker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TupleReport {
    /// Region searched
    pub region: Region,
    /// Document type searched
    pub document_type: DocumentType,
    /// Counters for this tuple
    pub counters: CrawlCounters,
    /// Windows that reached `Done`
    pub windows_completed: u32,
    /// Windows that ended `Faulted`
    pub windows_faulted: u32,
    /// Set when the worker could not run at all (session failure, panic)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TupleReport {
    /// Empty report for a tuple about to start
    pub fn new(region: Region, document_type: DocumentType) -> Self {
        Self {
            region,
            document_type,
            counters: CrawlCounters::default(),
            windows_completed: 0,
            windows_faulted: 0,
            error: None,
        }
    }

    /// True when the worker failed before or outside of window processing
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Structured summary printed at the end of every crawl
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run finished
    pub finished_at: DateTime<Utc>,
    /// Number of tuples dispatched
    pub tuples_total: usize,
    /// Number of tuples whose worker failed outright
    pub tuples_failed: usize,
    /// Counters summed over all tuples
    pub totals: CrawlCounters,
    /// Per-tuple breakdown
    pub tuples: Vec<TupleReport>,
}

impl RunSummary {
    /// Build a summary from finished tuple reports
    pub fn from_reports(
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        mut tuples: Vec<TupleReport>,
    ) -> Self {
        tuples.sort_by_key(|t| (t.region, t.document_type));
        let mut totals = CrawlCounters::default();
        for t in &tuples {
            totals.merge(&t.counters);
        }
        Self {
            started_at,
            finished_at,
            tuples_total: tuples.len(),
            tuples_failed: tuples.iter().filter(|t| t.is_failed()).count(),
            totals,
            tuples,
        }
    }
}

/// Event emitted during the crawl lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A worker started for a tuple
    TupleStarted {
        /// Region
        region: Region,
        /// Document type
        document_type: DocumentType,
    },

    /// A year window search was submitted
    WindowStarted {
        /// Region
        region: Region,
        /// Document type
        document_type: DocumentType,
        /// Window being searched
        window: YearWindow,
    },

    /// A result page was extracted
    PageExtracted {
        /// Region
        region: Region,
        /// Document type
        document_type: DocumentType,
        /// Window being searched
        window: YearWindow,
        /// 1-based page number
        page: u32,
        /// Records found on the page
        records: usize,
    },

    /// An instrument was written to the store
    InstrumentStored {
        /// Region
        region: Region,
        /// Business key
        registry_id: String,
        /// Whether a validated attachment was written with it
        with_attachment: bool,
    },

    /// An attachment could not be captured
    AttachmentFailed {
        /// Region
        region: Region,
        /// Business key
        registry_id: String,
        /// Failure classification
        reason: String,
    },

    /// A year window was abandoned
    WindowFaulted {
        /// Region
        region: Region,
        /// Document type
        document_type: DocumentType,
        /// Window that faulted
        window: YearWindow,
        /// Error message
        error: String,
    },

    /// A worker finished
    TupleFinished {
        /// Final report for the tuple
        report: TupleReport,
    },
}

/// Outcome of an attachment repair pass over the store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairSummary {
    /// Instruments examined
    pub total: u64,
    /// Attachments downloaded and replaced
    pub repaired: u64,
    /// Attachments that already verified
    pub already_valid: u64,
    /// Instruments whose metadata has no request id to fetch with
    pub missing_request_id: u64,
    /// Instruments that could not be repaired
    pub failed: u64,
}

/// Stored attachments classified by their leading bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnoseSummary {
    /// Instrument directories examined
    pub total: u64,
    /// Directories without an attachment file
    pub missing: u64,
    /// Valid PDF files
    pub pdf: u64,
    /// HTML pages stored in place of a PDF
    pub html: u64,
    /// JSON bodies
    pub json: u64,
    /// XML bodies
    pub xml: u64,
    /// Zero-byte files
    pub empty: u64,
    /// Anything else
    pub unknown: u64,
}

impl DiagnoseSummary {
    /// Count one classified attachment
    pub fn record(&mut self, kind: PayloadKind) {
        match kind {
            PayloadKind::Pdf => self.pdf += 1,
            PayloadKind::Html => self.html += 1,
            PayloadKind::Json => self.json += 1,
            PayloadKind::Xml => self.xml += 1,
            PayloadKind::Empty => self.empty += 1,
            PayloadKind::Unknown => self.unknown += 1,
        }
    }

    /// Attachments that are not valid PDFs
    pub fn invalid(&self) -> u64 {
        self.html + self.json + self.xml + self.empty + self.unknown
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn record(registry_id: &str) -> ListingRecord {
        ListingRecord {
            registry_id: registry_id.to_string(),
            request_id: "MR000001/2024".to_string(),
            document_type: DocumentType::Cct,
            document_type_label: String::new(),
            validity_start: None,
            validity_end: None,
            parties: String::new(),
            download_token: None,
        }
    }

    #[test]
    fn region_round_trips_through_code() {
        for region in Region::ALL {
            assert_eq!(region.code().parse::<Region>().unwrap(), region);
        }
        assert_eq!("sp".parse::<Region>().unwrap(), Region::Sp);
        assert!("XX".parse::<Region>().is_err());
    }

    #[test]
    fn region_serializes_as_uppercase_code() {
        assert_eq!(serde_json::to_string(&Region::Df).unwrap(), "\"DF\"");
    }

    #[test]
    fn document_type_accepts_codes_and_names() {
        assert_eq!("1".parse::<DocumentType>().unwrap(), DocumentType::Cct);
        assert_eq!("act".parse::<DocumentType>().unwrap(), DocumentType::Act);
        assert_eq!("ADITIVO".parse::<DocumentType>().unwrap(), DocumentType::Aditivo);
        assert!("4".parse::<DocumentType>().is_err());
    }

    #[test]
    fn amendment_search_keeps_only_amendment_rows() {
        let aditivo = DocumentType::Aditivo;
        assert!(aditivo.matches_label("Termo Aditivo de Convenção Coletiva"));
        assert!(aditivo.matches_label("TERMO ADITIVO DE ACORDO COLETIVO"));
        assert!(!aditivo.matches_label("Convenção Coletiva"));
        assert!(!aditivo.matches_label("Acordo Coletivo"));
        assert!(!aditivo.matches_label(""));

        // The form filters these by type already
        assert!(DocumentType::Cct.matches_label("Convenção Coletiva"));
        assert!(DocumentType::Act.matches_label(""));
    }

    #[test]
    fn year_window_normalizes_reversed_bounds() {
        let w = YearWindow::new(2024, 2020);
        assert_eq!(w, YearWindow { start: 2020, end: 2024 });
        assert_eq!(w.span_years(), 5);
        assert_eq!(w.first_day(), "01/01/2020");
        assert_eq!(w.last_day(), "31/12/2024");
    }

    #[test]
    fn registry_year_comes_from_suffix() {
        assert_eq!(record("AC000001/2024").registry_year(), Some(2024));
        assert_eq!(record("AC000001").registry_year(), None);
        assert_eq!(record("AC000001/abcd").registry_year(), None);
    }

    #[test]
    fn summary_totals_sum_tuple_counters() {
        let mut a = TupleReport::new(Region::Sp, DocumentType::Act);
        a.counters.listed = 3;
        a.counters.fetched_ok = 2;
        let mut b = TupleReport::new(Region::Ac, DocumentType::Cct);
        b.counters.listed = 1;
        b.error = Some("session failed".to_string());

        let now = Utc::now();
        let summary = RunSummary::from_reports(now, now, vec![a, b]);

        assert_eq!(summary.tuples_total, 2);
        assert_eq!(summary.tuples_failed, 1);
        assert_eq!(summary.totals.listed, 4);
        assert_eq!(summary.totals.fetched_ok, 2);
        assert_eq!(summary.tuples[0].region, Region::Ac, "sorted by region");
    }
}
