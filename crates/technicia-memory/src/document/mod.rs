pub mod error;
pub mod loader;
pub mod splitter;
pub mod types;

pub use error::DocumentError;
pub use loader::PdfLoader;
pub use splitter::{SplitterConfig, TextSplitter};
pub use types::{Chunk, DocumentMetadata, FileSignature, LoadedDocument};

/// Default maximum file size: 50 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Reads one file into ordered page texts plus metadata.
///
/// Implementations must not hold a file handle once the returned future resolves,
/// whichever way it resolves.
pub trait DocumentLoader: Send + Sync {
    fn load(
        &self,
        path: &std::path::Path,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<LoadedDocument, DocumentError>> + Send + '_>,
    >;

    fn supported_extensions(&self) -> &[&str];

    fn supports(&self, path: &std::path::Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.supported_extensions()
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(ext))
            })
    }
}
