//! Hierarchical artifact store.
//!
//! Layout:
//!
//! ```text
//! <root>/<region>/<year>/<TYPE>/<registry id, / and \ replaced by _>/
//!     metadata.json
//!     instrumento.html     (listing row the record came from)
//!     instrumento.pdf      (only once a validated attachment exists)
//!     instrumento.sha256
//! <root>/<region>/manifest-<TYPE>.jsonl
//! <root>/_debug/
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, in the
//! order above, so a reader never observes a partially written file. Storing a
//! record without an attachment leaves a previously stored attachment alone.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::signature::{self, PDF_SIGNATURE};
use crate::types::{
    Attachment, DocumentType, InstrumentMetadata, ListingRecord, Region, SOURCE_TAG,
};

/// Metadata file name
pub const METADATA_FILE: &str = "metadata.json";
/// Listing snapshot file name
pub const SNAPSHOT_FILE: &str = "instrumento.html";
/// Attachment file name
pub const ATTACHMENT_FILE: &str = "instrumento.pdf";
/// Attachment digest file name
pub const DIGEST_FILE: &str = "instrumento.sha256";
/// Directory for diagnostic page dumps
pub const DEBUG_DIR: &str = "_debug";

/// Result of a successful [`ArtifactStore::store`]
#[derive(Clone, Debug, PartialEq)]
pub struct StoredInstrument {
    /// Directory holding the instrument's files
    pub dir: PathBuf,
    /// Metadata as written
    pub metadata: InstrumentMetadata,
    /// Whether an attachment is present after the write
    pub has_attachment: bool,
}

/// One line of a manifest file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Business key
    pub registry_id: String,
    /// Site tracking id
    pub request_id: String,
    /// Storage partition year
    pub year: i32,
    /// When the record was stored
    pub collected_at: DateTime<Utc>,
    /// Digest of the stored attachment, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_hash: Option<String>,
}

/// Filesystem store rooted at the configured data directory
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) the store at `root`.
    ///
    /// This is the only storage failure that should stop a run.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let unavailable = |reason: String| Error::StorageRootUnavailable {
            path: root.clone(),
            reason,
        };

        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let meta = tokio::fs::metadata(&root)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !meta.is_dir() {
            return Err(unavailable("not a directory".to_string()));
        }
        if meta.permissions().readonly() {
            return Err(unavailable("read-only".to_string()));
        }

        tracing::debug!(root = %root.display(), "Artifact store opened");
        Ok(Self { root })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one instrument
    pub fn instrument_dir(
        &self,
        region: Region,
        year: i32,
        document_type: DocumentType,
        registry_id: &str,
    ) -> PathBuf {
        self.root
            .join(region.code())
            .join(year.to_string())
            .join(document_type.name())
            .join(sanitize_segment(registry_id))
    }

    /// Manifest file for one (region, document type) pair
    pub fn manifest_path(&self, region: Region, document_type: DocumentType) -> PathBuf {
        self.root
            .join(region.code())
            .join(format!("manifest-{}.jsonl", document_type.name()))
    }

    /// Persist a record, its listing snapshot and optionally its attachment.
    ///
    /// Re-storing the same registry id overwrites in place. With `attachment`
    /// set to `None` an attachment stored earlier is kept and its digest is
    /// carried into the new metadata.
    pub async fn store(
        &self,
        region: Region,
        year: i32,
        record: &ListingRecord,
        snapshot: &str,
        attachment: Option<&Attachment>,
    ) -> Result<StoredInstrument> {
        let dir = self.instrument_dir(region, year, record.document_type, &record.registry_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_error(&dir, e))?;

        let (attachment_hash, attachment_size) = match attachment {
            Some(a) => (Some(a.content_hash.clone()), Some(a.bytes.len() as u64)),
            None => existing_attachment_digest(&dir).await,
        };

        let metadata = InstrumentMetadata {
            record: record.clone(),
            region,
            year,
            source: SOURCE_TAG.to_string(),
            collected_at: Utc::now(),
            attachment_hash,
            attachment_size,
        };

        let json = serde_json::to_vec_pretty(&metadata)?;
        write_atomic(&dir.join(METADATA_FILE), &json).await?;
        write_atomic(&dir.join(SNAPSHOT_FILE), snapshot.as_bytes()).await?;
        if let Some(a) = attachment {
            write_attachment(&dir, a).await?;
        }

        tracing::debug!(
            region = %region,
            registry_id = %record.registry_id,
            dir = %dir.display(),
            with_attachment = attachment.is_some(),
            "Instrument stored"
        );

        Ok(StoredInstrument {
            dir,
            has_attachment: metadata.attachment_hash.is_some(),
            metadata,
        })
    }

    /// Digest of the stored attachment when it exists and still verifies
    pub async fn existing_valid_attachment(
        &self,
        region: Region,
        year: i32,
        document_type: DocumentType,
        registry_id: &str,
    ) -> Option<String> {
        let dir = self.instrument_dir(region, year, document_type, registry_id);
        verified_attachment(&dir).await
    }

    /// Append one line to the manifest of `(region, document_type)`
    pub async fn append_manifest(
        &self,
        region: Region,
        document_type: DocumentType,
        entry: &ManifestEntry,
    ) -> Result<()> {
        let path = self.manifest_path(region, document_type);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error(parent, e))?;
        }

        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| storage_error(&path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| storage_error(&path, e))?;
        file.flush().await.map_err(|e| storage_error(&path, e))?;
        Ok(())
    }

    /// Save a raw page under `_debug/` for later inspection
    pub async fn save_debug_page(&self, name: &str, markup: &str) -> Result<PathBuf> {
        let dir = self.root.join(DEBUG_DIR);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_error(&dir, e))?;
        let path = dir.join(sanitize_segment(name));
        write_atomic(&path, markup.as_bytes()).await?;
        Ok(path)
    }

    /// Every instrument directory in the store (those holding a metadata file)
    pub fn instrument_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.file_name() != DEBUG_DIR)
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.file_name() == METADATA_FILE)
            .filter_map(|e| e.path().parent().map(Path::to_path_buf))
            .collect();
        dirs.sort();
        dirs
    }

    /// Read the metadata of an instrument directory
    pub async fn load_metadata(&self, dir: &Path) -> Result<InstrumentMetadata> {
        let bytes = tokio::fs::read(dir.join(METADATA_FILE)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Replace the attachment of an already stored instrument and update its metadata
    pub async fn replace_attachment(
        &self,
        dir: &Path,
        mut metadata: InstrumentMetadata,
        attachment: &Attachment,
    ) -> Result<InstrumentMetadata> {
        metadata.attachment_hash = Some(attachment.content_hash.clone());
        metadata.attachment_size = Some(attachment.bytes.len() as u64);
        let json = serde_json::to_vec_pretty(&metadata)?;
        write_atomic(&dir.join(METADATA_FILE), &json).await?;
        write_attachment(dir, attachment).await?;
        Ok(metadata)
    }
}

/// Make a business key safe to use as a single path segment
pub fn sanitize_segment(id: &str) -> String {
    let cleaned: String = id
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "_") + "_"
    } else {
        cleaned
    }
}

/// Digest of the attachment in `dir` if it has the PDF signature and matches
/// its recorded digest (when one is recorded)
pub async fn verified_attachment(dir: &Path) -> Option<String> {
    let bytes = tokio::fs::read(dir.join(ATTACHMENT_FILE)).await.ok()?;
    let inspection = signature::inspect(&bytes, PDF_SIGNATURE);
    if !inspection.valid {
        return None;
    }
    match tokio::fs::read_to_string(dir.join(DIGEST_FILE)).await {
        Ok(recorded) if recorded.trim() != inspection.hash => None,
        _ => Some(inspection.hash),
    }
}

async fn existing_attachment_digest(dir: &Path) -> (Option<String>, Option<u64>) {
    let Ok(meta) = tokio::fs::metadata(dir.join(ATTACHMENT_FILE)).await else {
        return (None, None);
    };
    let hash = match tokio::fs::read_to_string(dir.join(DIGEST_FILE)).await {
        Ok(recorded) => recorded.trim().to_string(),
        Err(_) => match tokio::fs::read(dir.join(ATTACHMENT_FILE)).await {
            Ok(bytes) => signature::sha256_hex(&bytes),
            Err(_) => return (None, None),
        },
    };
    (Some(hash), Some(meta.len()))
}

async fn write_attachment(dir: &Path, attachment: &Attachment) -> Result<()> {
    write_atomic(&dir.join(ATTACHMENT_FILE), &attachment.bytes).await?;
    write_atomic(
        &dir.join(DIGEST_FILE),
        format!("{}\n", attachment.content_hash).as_bytes(),
    )
    .await
}

/// Write to a temporary sibling, then rename over `path`
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    if let Err(e) = tokio::fs::write(&tmp, contents).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(storage_error(path, e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(storage_error(path, e));
    }
    Ok(())
}

fn storage_error(path: &Path, e: std::io::Error) -> Error {
    Error::StorageWrite {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}
