use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub file_path: PathBuf,
    pub file_name: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub page_count: usize,
    pub content_type: String,
}

#[derive(Debug, Clone)]
pub struct LoadedDocument {
    /// Extracted text per page, in page order. Pages without text are empty strings.
    pub pages: Vec<String>,
    pub metadata: DocumentMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    /// 1-based page number the chunk was cut from.
    pub page: usize,
    /// Ordinal across the whole document.
    pub chunk_index: usize,
    pub content_hash: String,
}

/// File-level change detector: blake3 over path, size and modification time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileSignature(String);

impl FileSignature {
    #[must_use]
    pub fn compute(path: &Path, size: u64, modified_nanos: u128) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(path.as_os_str().as_encoded_bytes());
        hasher.update(&size.to_le_bytes());
        hasher.update(&modified_nanos.to_le_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    /// Stat the file and derive its signature.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error when the file cannot be stat'ed.
    pub async fn of(path: &Path) -> std::io::Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos());
        Ok(Self::compute(path, meta.len(), modified))
    }

    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FileSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest of whitespace-normalized text. Two chunks differing only in spacing hash the same.
#[must_use]
pub fn content_hash(text: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    let mut first = true;
    for word in text.split_whitespace() {
        if !first {
            hasher.update(b" ");
        }
        hasher.update(word.as_bytes());
        first = false;
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_ignores_whitespace_layout() {
        assert_eq!(
            content_hash("Torque  spec:\n 45 Nm"),
            content_hash("Torque spec: 45 Nm ")
        );
        assert_ne!(content_hash("45 Nm"), content_hash("54 Nm"));
    }

    #[test]
    fn signature_changes_with_size_and_mtime() {
        let p = Path::new("/docs/manual.pdf");
        let base = FileSignature::compute(p, 100, 1);
        assert_eq!(base, FileSignature::compute(p, 100, 1));
        assert_ne!(base, FileSignature::compute(p, 101, 1));
        assert_ne!(base, FileSignature::compute(p, 100, 2));
        assert_ne!(base, FileSignature::compute(Path::new("/docs/other.pdf"), 100, 1));
    }

    #[tokio::test]
    async fn signature_of_file_tracks_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pdf");
        std::fs::write(&path, b"one").unwrap();
        let first = FileSignature::of(&path).await.unwrap();
        assert_eq!(first, FileSignature::of(&path).await.unwrap());
        std::fs::write(&path, b"one two").unwrap();
        assert_ne!(first, FileSignature::of(&path).await.unwrap());
    }

    #[tokio::test]
    async fn signature_of_missing_file_errors() {
        let err = FileSignature::of(Path::new("/definitely/not/here.pdf"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
