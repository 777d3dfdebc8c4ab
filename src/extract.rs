//! Listing page extraction.
//!
//! Result rows are `tr` elements carrying the row marker attribute (`indice`),
//! each holding nested tables of label/value cells. The markup has drifted
//! between samples (extra wrapper tables, fields moving between rows), so the
//! extractor never relies on column positions: every row is flattened into its
//! leaf cells in document order and each recognized label takes the value of
//! the cell that follows it.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::error::{Error, Result};
use crate::types::{DocumentType, DownloadToken, ListingRecord};

/// Fields the extractor knows how to find
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    /// Registry number (business key)
    RegistryNumber,
    /// Request number (site tracking id)
    RequestNumber,
    /// Instrument type as listed
    InstrumentType,
    /// Validity period "dd/mm/yyyy - dd/mm/yyyy"
    Validity,
    /// Parties, one per line
    Parties,
}

/// Label texts that identify one field
#[derive(Clone, Debug)]
pub struct LabelRule {
    /// Field the labels map to
    pub field: Field,
    /// Accepted label texts; compared case- and accent-insensitively as prefixes
    pub labels: Vec<String>,
}

/// Label table and row marker used for extraction
#[derive(Clone, Debug)]
pub struct ExtractionPolicy {
    /// Attribute that marks a result row and carries its request number
    pub row_marker: String,
    /// Label rules, checked in order
    pub rules: Vec<LabelRule>,
}

impl Default for ExtractionPolicy {
    fn default() -> Self {
        let rule = |field, labels: &[&str]| LabelRule {
            field,
            labels: labels.iter().map(|l| l.to_string()).collect(),
        };
        Self {
            row_marker: "indice".to_string(),
            rules: vec![
                rule(
                    Field::RegistryNumber,
                    &["Nº do Registro", "Número do Registro", "Registry Number"],
                ),
                rule(
                    Field::RequestNumber,
                    &["Nº da Solicitação", "Número da Solicitação", "Request Number"],
                ),
                rule(
                    Field::InstrumentType,
                    &["Tipo do Instrumento", "Tipo de Instrumento", "Instrument Type"],
                ),
                rule(Field::Validity, &["Vigência", "Validity"]),
                rule(Field::Parties, &["Partes", "Parties"]),
            ],
        }
    }
}

/// One extracted record with the markup it came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedRow {
    /// Parsed record
    pub record: ListingRecord,
    /// Outer HTML of the result row
    pub snapshot: String,
}

/// Everything extracted from one page
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageExtraction {
    /// Records in page order
    pub rows: Vec<ExtractedRow>,
    /// Marker rows dropped because no registry number could be found
    pub discarded: usize,
}

impl PageExtraction {
    /// True when the page produced no records
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Parses listing pages into [`ListingRecord`]s
#[derive(Debug)]
pub struct RecordExtractor {
    row_marker: String,
    rules: Vec<(Field, Vec<String>)>,
    row_selector: Selector,
    cell_selector: Selector,
    nested_table_selector: Selector,
    token_pattern: &'static Regex,
    date_pattern: Regex,
}

impl RecordExtractor {
    /// Build an extractor for `policy`
    pub fn new(policy: ExtractionPolicy) -> Result<Self> {
        let row_selector = selector(&format!("tr[{}]", policy.row_marker))?;
        let rules = policy
            .rules
            .into_iter()
            .map(|r| (r.field, r.labels.iter().map(|l| fold_label(l)).collect()))
            .collect();
        Ok(Self {
            row_marker: policy.row_marker,
            rules,
            row_selector,
            cell_selector: selector("td, th")?,
            nested_table_selector: selector("table")?,
            token_pattern: download_token_pattern()
                .ok_or_else(|| Error::Other("invalid token pattern".to_string()))?,
            date_pattern: Regex::new(r"(\d{1,2}/\d{1,2}/\d{4})")
                .map_err(|e| Error::Other(format!("invalid date pattern: {e}")))?,
        })
    }

    /// Extract every result row of `markup`, in page order.
    ///
    /// Never fails: a page without marker rows yields an empty extraction.
    pub fn extract(&self, markup: &str, document_type: DocumentType) -> PageExtraction {
        let html = Html::parse_document(markup);
        let mut extraction = PageExtraction::default();

        for row in html.select(&self.row_selector) {
            if self.is_nested_result_row(&row) {
                continue;
            }
            match self.extract_row(&row, document_type) {
                Some(record) => extraction.rows.push(ExtractedRow {
                    record,
                    snapshot: row.html(),
                }),
                None => {
                    extraction.discarded += 1;
                    tracing::warn!(
                        marker = row.value().attr(&self.row_marker).unwrap_or(""),
                        "Discarding result row without registry number"
                    );
                }
            }
        }

        extraction
    }

    fn is_nested_result_row(&self, row: &ElementRef<'_>) -> bool {
        row.ancestors()
            .filter_map(ElementRef::wrap)
            .any(|e| e.value().name() == "tr" && e.value().attr(&self.row_marker).is_some())
    }

    fn extract_row(&self, row: &ElementRef<'_>, document_type: DocumentType) -> Option<ListingRecord> {
        let cells = self.leaf_cells(row);
        let mut registry_id = None;
        let mut request_id = None;
        let mut type_label = None;
        let mut validity = None;
        let mut parties = None;

        let mut i = 0;
        while i < cells.len() {
            let Some(label) = self.classify_label(&cells[i]) else {
                i += 1;
                continue;
            };
            let value = match (label, cells.get(i + 1)) {
                (CellLabel::Known(_), Some(next)) if self.classify_label(next).is_none() => {
                    i += 1;
                    Some(next)
                }
                _ => None,
            };
            if let (CellLabel::Known(field), Some(cell)) = (label, value) {
                let slot = match field {
                    Field::RegistryNumber => &mut registry_id,
                    Field::RequestNumber => &mut request_id,
                    Field::InstrumentType => &mut type_label,
                    Field::Validity => &mut validity,
                    Field::Parties => &mut parties,
                };
                if slot.is_none() {
                    *slot = Some(if field == Field::Parties {
                        cell.pieces.join(" / ")
                    } else {
                        cell.pieces.join(" ")
                    });
                }
            }
            i += 1;
        }

        let registry_id = registry_id.filter(|s| !s.is_empty())?;
        let marker = row.value().attr(&self.row_marker).unwrap_or("").trim();
        let request_id = request_id
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| marker.to_string());
        let (validity_start, validity_end) = validity
            .as_deref()
            .map(|v| self.parse_validity(v))
            .unwrap_or((None, None));

        Some(ListingRecord {
            registry_id,
            request_id,
            document_type,
            document_type_label: type_label.unwrap_or_default(),
            validity_start,
            validity_end,
            parties: parties.unwrap_or_default(),
            download_token: self.find_token(row),
        })
    }

    /// Cells without a nested table, in document order, as trimmed text pieces
    fn leaf_cells(&self, row: &ElementRef<'_>) -> Vec<Cell> {
        row.select(&self.cell_selector)
            .filter(|cell| cell.select(&self.nested_table_selector).next().is_none())
            .map(|cell| Cell {
                pieces: cell
                    .text()
                    .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
                    .filter(|t| !t.is_empty())
                    .collect(),
            })
            .collect()
    }

    fn classify_label(&self, cell: &Cell) -> Option<CellLabel> {
        let text = cell.pieces.join(" ");
        let folded = fold_label(&text);
        if folded.is_empty() {
            return None;
        }
        for (field, labels) in &self.rules {
            if labels.iter().any(|l| folded.starts_with(l.as_str())) {
                return Some(CellLabel::Known(*field));
            }
        }
        // Unrecognized labels must not be taken as values of the preceding label
        text.trim_end().ends_with(':').then_some(CellLabel::Unknown)
    }

    /// Parse "01/09/2023 - 31/08/2025 *VIGÊNCIA EXPIRADA"
    fn parse_validity(&self, text: &str) -> (Option<NaiveDate>, Option<NaiveDate>) {
        let text = text.split('*').next().unwrap_or("");
        let mut dates = self
            .date_pattern
            .captures_iter(text)
            .map(|c| NaiveDate::parse_from_str(&c[1], "%d/%m/%Y").ok());
        let start = dates.next().flatten();
        let end = dates.next().flatten();
        (start, end)
    }

    fn find_token(&self, row: &ElementRef<'_>) -> Option<DownloadToken> {
        std::iter::once(*row)
            .chain(row.descendants().filter_map(ElementRef::wrap))
            .flat_map(|e| e.value().attrs().map(|(_, v)| v).collect::<Vec<_>>())
            .find_map(|value| parse_download_token_with(self.token_pattern, value))
    }
}

#[derive(Debug)]
struct Cell {
    pieces: Vec<String>,
}

#[derive(Clone, Copy, Debug)]
enum CellLabel {
    Known(Field),
    Unknown,
}

fn selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| Error::Other(format!("invalid selector {s:?}: {e:?}")))
}

/// Any `*download*('<request id>', '<party hash>')` invocation
const DOWNLOAD_TOKEN_PATTERN: &str =
    r#"(?i)[a-z0-9_$.]*download[a-z0-9_]*\s*\(\s*['"]([^'"]+)['"]\s*,\s*['"]([^'"]+)['"]\s*\)"#;

fn download_token_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(DOWNLOAD_TOKEN_PATTERN).ok())
        .as_ref()
}

fn parse_download_token_with(pattern: &Regex, text: &str) -> Option<DownloadToken> {
    let caps = pattern.captures(text)?;
    Some(DownloadToken {
        request_id: caps[1].trim().to_string(),
        party_hash: caps[2].trim().to_string(),
    })
}

/// Find a download invocation such as `fDownload('MR063207/2023','76535764032770')`
/// in arbitrary text
pub fn parse_download_token(text: &str) -> Option<DownloadToken> {
    parse_download_token_with(download_token_pattern()?, text)
}

/// Lowercase, strip accents and ordinal marks, collapse whitespace, drop a trailing colon
pub(crate) fn fold_label(text: &str) -> String {
    let folded: String = text
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' | 'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' | 'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' | 'º' | '°' => 'o',
            'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => 'u',
            'ç' | 'Ç' => 'c',
            other => other.to_ascii_lowercase(),
        })
        .collect();
    folded
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(':')
        .trim_end()
        .to_string()
}
