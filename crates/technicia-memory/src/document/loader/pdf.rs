use std::path::Path;
use std::pin::Pin;
use std::sync::LazyLock;
use std::time::Duration;

use regex::bytes::Regex;

use super::super::{
    DEFAULT_MAX_FILE_SIZE, DocumentError, DocumentLoader, DocumentMetadata, LoadedDocument,
};
use super::read_with_retry;

static LITERAL_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s-u)/(Title|Author)\s*\(((?:\\.|[^\\)])*)\)")
        .expect("literal info field regex is valid")
});
static HEX_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?-u)/(Title|Author)\s*<([0-9A-Fa-f\s]*)>").expect("hex info field regex is valid")
});

pub struct PdfLoader {
    pub max_file_size: u64,
    pub read_retries: u32,
    pub read_backoff: Duration,
}

impl Default for PdfLoader {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            read_retries: 3,
            read_backoff: Duration::from_millis(250),
        }
    }
}

impl DocumentLoader for PdfLoader {
    fn load(
        &self,
        path: &Path,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<LoadedDocument, DocumentError>> + Send + '_>>
    {
        let path = path.to_path_buf();
        Box::pin(async move {
            if !self.supports(&path) {
                let ext = path
                    .extension()
                    .map_or_else(String::new, |e| e.to_string_lossy().into_owned());
                return Err(DocumentError::UnsupportedFormat(ext));
            }

            let bytes =
                read_with_retry(&path, self.max_file_size, self.read_retries, self.read_backoff)
                    .await?;

            let (pages, title, author) = tokio::task::spawn_blocking(move || {
                let pages = pdf_extract::extract_text_from_mem_by_pages(&bytes)
                    .map_err(|e| DocumentError::Pdf(e.to_string()))?;
                let (title, author) = info_fields(&bytes);
                Ok::<_, DocumentError>((pages, title, author))
            })
            .await
            .map_err(|e| {
                if e.is_panic() {
                    DocumentError::Pdf("text extraction panicked".into())
                } else {
                    DocumentError::Join(e)
                }
            })??;

            let file_name = path
                .file_name()
                .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
            tracing::debug!(file = %path.display(), pages = pages.len(), "extracted pdf text");

            Ok(LoadedDocument {
                metadata: DocumentMetadata {
                    file_path: path,
                    file_name,
                    title,
                    author,
                    page_count: pages.len(),
                    content_type: "application/pdf".to_owned(),
                },
                pages,
            })
        })
    }

    fn supported_extensions(&self) -> &[&str] {
        &["pdf"]
    }
}

/// Best-effort `/Title` and `/Author` from the document information dictionary.
///
/// Only uncompressed dictionaries are visible; anything else yields `None`.
fn info_fields(bytes: &[u8]) -> (Option<String>, Option<String>) {
    let mut title = None;
    let mut author = None;

    let literal = LITERAL_FIELD
        .captures_iter(bytes)
        .map(|c| (c[1].to_vec(), decode_text_string(&unescape_literal(&c[2]))));
    let hex = HEX_FIELD
        .captures_iter(bytes)
        .map(|c| (c[1].to_vec(), decode_text_string(&unhex(&c[2]))));

    for (key, value) in literal.chain(hex) {
        let value = value.trim().to_owned();
        if value.is_empty() {
            continue;
        }
        let slot = if key == b"Title" { &mut title } else { &mut author };
        if slot.is_none() {
            *slot = Some(value);
        }
    }
    (title, author)
}

fn unescape_literal(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let b = raw[i];
        if b != b'\\' || i + 1 == raw.len() {
            out.push(b);
            i += 1;
            continue;
        }
        let next = raw[i + 1];
        i += 2;
        match next {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'0'..=b'7' => {
                let mut value = u32::from(next - b'0');
                let mut digits = 1;
                while digits < 3 && i < raw.len() && (b'0'..=b'7').contains(&raw[i]) {
                    value = value * 8 + u32::from(raw[i] - b'0');
                    i += 1;
                    digits += 1;
                }
                out.push(u8::try_from(value & 0xff).unwrap_or(b'?'));
            }
            b'\r' | b'\n' => {}
            other => out.push(other),
        }
    }
    out
}

fn unhex(raw: &[u8]) -> Vec<u8> {
    let digits: Vec<u8> = raw
        .iter()
        .filter(|b| b.is_ascii_hexdigit())
        .map(|b| match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            _ => b - b'A' + 10,
        })
        .collect();
    digits
        .chunks(2)
        .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
        .collect()
}

/// PDF text strings are UTF-16BE with a BOM, or a Latin-1 superset otherwise.
fn decode_text_string(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xfe, 0xff]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|p| u16::from_be_bytes([p[0], p[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    if let Ok(s) = std::str::from_utf8(bytes) {
        return s.to_owned();
    }
    bytes.iter().map(|&b| char::from(b)).collect()
}
