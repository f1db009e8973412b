//! Indexing building blocks: PDF loading, chunking, content-hash deduplication,
//! batched embedding and the vector-store adapter.

pub mod dedup;
pub mod document;
pub mod embedder;
pub mod in_memory_store;
pub mod qdrant_ops;
pub mod store;
pub mod vector_store;

pub use dedup::{Claim, DedupIndex, Handoff};
pub use embedder::{EmbedConfig, EmbedError, EmbedOutcome, EmbeddingGateway};
pub use in_memory_store::InMemoryVectorStore;
pub use qdrant_ops::QdrantOps;
pub use store::{ChunkPayload, CollectionInfo, DocumentStore, IndexedFile, SearchHit, StoredChunk};
pub use technicia_llm::ErrorKind;
pub use vector_store::{
    CollectionParams, Distance, FieldCondition, FieldValue, ScoredVectorPoint, VectorFilter,
    VectorPoint, VectorStore, VectorStoreError,
};
