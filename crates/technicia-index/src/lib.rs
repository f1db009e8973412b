//! PDF indexing pipeline: per-document indexing, question answering over the
//! indexed chunks, and a directory watcher that keeps the index in sync.

pub mod error;
pub mod indexer;
pub mod retriever;
pub mod watcher;

pub use error::{IndexError, Result};
pub use indexer::{
    ClearAck, DeleteAck, DirectoryReport, DocumentIndexer, IndexOutcome, IndexStatus,
};
pub use retriever::{RetrievalConfig, RetrievalError, Retriever, SearchOutcome, SearchResponse, Source};
pub use watcher::{IndexWatcher, Reindexer, WatcherConfig};
