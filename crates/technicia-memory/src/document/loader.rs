mod pdf;

use std::io::ErrorKind as IoKind;
use std::path::Path;
use std::time::Duration;

pub use pdf::PdfLoader;

use super::DocumentError;

const HEADER_WINDOW: usize = 1024;
const TRAILER_WINDOW: usize = 1024;

/// Read a PDF's bytes, retrying transient failures with exponential backoff.
///
/// `retries` counts additional attempts after the first. The file is opened and
/// closed inside each attempt.
///
/// # Errors
///
/// Returns an input-class error immediately, or the last transient error once
/// the retries are exhausted.
pub async fn read_with_retry(
    path: &Path,
    max_file_size: u64,
    retries: u32,
    backoff: Duration,
) -> Result<Vec<u8>, DocumentError> {
    let mut attempt = 0u32;
    loop {
        match read_once(path, max_file_size).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.is_transient() && attempt < retries => {
                let delay = backoff.saturating_mul(1 << attempt.min(10));
                tracing::debug!(
                    file = %path.display(),
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "transient read failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn read_once(path: &Path, max_file_size: u64) -> Result<Vec<u8>, DocumentError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| map_io(path, e))?;
    if meta.len() > max_file_size {
        return Err(DocumentError::FileTooLarge(meta.len()));
    }
    let bytes = tokio::fs::read(path).await.map_err(|e| map_io(path, e))?;
    check_pdf_bytes(path, &bytes)?;
    Ok(bytes)
}

fn map_io(path: &Path, err: std::io::Error) -> DocumentError {
    match err.kind() {
        IoKind::NotFound => DocumentError::NotFound(path.to_path_buf()),
        IoKind::PermissionDenied
        | IoKind::WouldBlock
        | IoKind::Interrupted
        | IoKind::TimedOut
        | IoKind::ResourceBusy
        | IoKind::UnexpectedEof => DocumentError::Locked {
            path: path.to_path_buf(),
            source: err,
        },
        _ => DocumentError::Io(err),
    }
}

/// Header and trailer sanity check.
///
/// An empty file or one without `%%EOF` near its end is treated as still being written.
pub(crate) fn check_pdf_bytes(path: &Path, bytes: &[u8]) -> Result<(), DocumentError> {
    if bytes.is_empty() {
        return Err(DocumentError::Partial(path.to_path_buf()));
    }
    let head = &bytes[..bytes.len().min(HEADER_WINDOW)];
    if !contains(head, b"%PDF-") {
        return Err(DocumentError::NotPdf(path.to_path_buf()));
    }
    let tail = &bytes[bytes.len().saturating_sub(TRAILER_WINDOW)..];
    if !contains(tail, b"%%EOF") {
        return Err(DocumentError::Partial(path.to_path_buf()));
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &[u8] = b"%PDF-1.4\n1 0 obj\n<< >>\nendobj\ntrailer\n<< >>\n%%EOF\n";

    #[test]
    fn accepts_well_formed_envelope() {
        assert!(check_pdf_bytes(Path::new("a.pdf"), MINIMAL).is_ok());
    }

    #[test]
    fn rejects_non_pdf_as_input_error() {
        let err = check_pdf_bytes(Path::new("a.pdf"), b"hello world %%EOF").unwrap_err();
        assert!(matches!(err, DocumentError::NotPdf(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn missing_trailer_is_partial() {
        let err = check_pdf_bytes(Path::new("a.pdf"), b"%PDF-1.7\n1 0 obj").unwrap_err();
        assert!(matches!(err, DocumentError::Partial(_)));
    }

    #[test]
    fn empty_file_is_partial() {
        let err = check_pdf_bytes(Path::new("a.pdf"), b"").unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn missing_file_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let err = read_with_retry(
            &dir.path().join("nope.pdf"),
            u64::MAX,
            5,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DocumentError::NotFound(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.pdf");
        std::fs::write(&path, MINIMAL).unwrap();
        let err = read_with_retry(&path, 4, 0, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, DocumentError::FileTooLarge(_)));
    }

    #[tokio::test]
    async fn partial_file_recovers_once_writer_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("growing.pdf");
        std::fs::write(&path, b"%PDF-1.4\n1 0 obj\n").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tokio::fs::write(&writer_path, MINIMAL).await.unwrap();
        });

        let bytes = read_with_retry(&path, u64::MAX, 6, Duration::from_millis(20))
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(bytes, MINIMAL);
    }

    #[tokio::test]
    async fn partial_file_gives_up_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stuck.pdf");
        std::fs::write(&path, b"%PDF-1.4\n").unwrap();
        let err = read_with_retry(&path, u64::MAX, 2, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DocumentError::Partial(_)));
    }
}
