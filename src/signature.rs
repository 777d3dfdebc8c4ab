//! Attachment signature check and content hashing
//!
//! Every downloaded artifact passes through [`inspect`] before it is allowed
//! into the store. Servers frequently answer a download request with an HTML
//! error page, a JSON error body or an XML fault while still returning 200;
//! those bodies fail the signature check and are reported as fetch failures.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::types::Attachment;

/// Magic prefix of a PDF document
pub const PDF_SIGNATURE: &[u8] = b"%PDF";

/// Result of checking a byte buffer against an expected signature
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inspection {
    /// Leading bytes matched the expected signature
    pub valid: bool,
    /// SHA-256 of the full buffer, lowercase hex
    pub hash: String,
}

/// What a payload looks like, judged by its leading bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// `%PDF`
    Pdf,
    /// `<!DOCTYPE` or `<html`
    Html,
    /// `{` or `[`
    Json,
    /// `<?xml`
    Xml,
    /// Zero-length body
    Empty,
    /// Anything else
    Unknown,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PayloadKind::Pdf => "PDF",
            PayloadKind::Html => "HTML",
            PayloadKind::Json => "JSON",
            PayloadKind::Xml => "XML",
            PayloadKind::Empty => "empty body",
            PayloadKind::Unknown => "unknown content",
        };
        f.write_str(s)
    }
}

/// SHA-256 of `bytes` as lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Check `bytes` against `signature` and hash them.
///
/// Pure: the result depends only on the inputs. An empty signature accepts
/// everything; an empty buffer never matches a non-empty signature.
pub fn inspect(bytes: &[u8], signature: &[u8]) -> Inspection {
    Inspection {
        valid: bytes.starts_with(signature),
        hash: sha256_hex(bytes),
    }
}

/// Gate a downloaded buffer.
///
/// Returns the validated [`Attachment`] or the detected payload kind when the
/// signature does not match.
pub fn validate(bytes: Vec<u8>, signature: &[u8]) -> Result<Attachment, PayloadKind> {
    let inspection = inspect(&bytes, signature);
    if !inspection.valid {
        return Err(classify(&bytes));
    }
    Ok(Attachment {
        bytes,
        content_hash: inspection.hash,
        validated: true,
    })
}

/// Classify a payload by its leading bytes, ignoring leading whitespace and a UTF-8 BOM
pub fn classify(bytes: &[u8]) -> PayloadKind {
    if bytes.is_empty() {
        return PayloadKind::Empty;
    }
    if bytes.starts_with(PDF_SIGNATURE) {
        return PayloadKind::Pdf;
    }

    let trimmed = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let start = trimmed
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(trimmed.len());
    let head = &trimmed[start..];
    let prefix: Vec<u8> = head.iter().take(16).map(u8::to_ascii_lowercase).collect();

    if prefix.starts_with(b"<?xml") {
        PayloadKind::Xml
    } else if prefix.starts_with(b"<!doctype") || prefix.starts_with(b"<html") {
        PayloadKind::Html
    } else if prefix.starts_with(b"{") || prefix.starts_with(b"[") {
        PayloadKind::Json
    } else {
        PayloadKind::Unknown
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn empty_input_is_never_valid() {
        let result = inspect(b"", PDF_SIGNATURE);
        assert!(!result.valid);
        assert_eq!(result.hash, EMPTY_SHA256);
    }

    #[test]
    fn prefix_shorter_than_signature_is_invalid() {
        assert!(!inspect(b"%PD", PDF_SIGNATURE).valid);
        assert!(!inspect(b"%", PDF_SIGNATURE).valid);
    }

    #[test]
    fn mismatch_is_independent_of_length() {
        for len in [1usize, 4, 100, 10_000] {
            let bytes = vec![b'x'; len];
            assert!(!inspect(&bytes, PDF_SIGNATURE).valid, "length {len}");
        }
    }

    #[test]
    fn valid_pdf_hash_matches_sha256_of_input() {
        let bytes = b"%PDF-1.7\n1 0 obj\n<<>>\nendobj\n%%EOF".to_vec();
        let result = inspect(&bytes, PDF_SIGNATURE);
        assert!(result.valid);
        assert_eq!(result.hash, sha256_hex(&bytes));

        let attachment = validate(bytes.clone(), PDF_SIGNATURE).unwrap();
        assert_eq!(attachment.content_hash, sha256_hex(&attachment.bytes));
        assert!(attachment.validated);
    }

    #[test]
    fn known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn html_error_page_is_rejected() {
        let body = b"<!DOCTYPE html><html><body>Erro</body></html>".to_vec();
        assert_eq!(validate(body, PDF_SIGNATURE), Err(PayloadKind::Html));
    }

    #[test]
    fn classify_recognizes_common_error_bodies() {
        assert_eq!(classify(b"%PDF-1.4"), PayloadKind::Pdf);
        assert_eq!(classify(b"  <HTML><head>"), PayloadKind::Html);
        assert_eq!(classify(b"\xEF\xBB\xBF<?xml version=\"1.0\"?>"), PayloadKind::Xml);
        assert_eq!(classify(b"{\"error\":\"denied\"}"), PayloadKind::Json);
        assert_eq!(classify(b""), PayloadKind::Empty);
        assert_eq!(classify(b"PK\x03\x04"), PayloadKind::Unknown);
    }

    #[test]
    fn pdf_signature_must_be_at_offset_zero() {
        assert!(!inspect(b" %PDF-1.4", PDF_SIGNATURE).valid);
    }
}
