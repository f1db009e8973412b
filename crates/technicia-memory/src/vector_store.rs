use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use technicia_llm::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    /// The store cannot be reached or timed out. Callers present this as a degraded service.
    #[error("vector store unavailable: {0}")]
    Unavailable(String),
    #[error("collection error: {0}")]
    Collection(String),
    #[error(
        "collection {collection} exists with {actual_size}-dim {actual_distance:?} vectors, expected {expected_size}-dim {expected_distance:?}"
    )]
    Incompatible {
        collection: String,
        expected_size: u64,
        expected_distance: Distance,
        actual_size: u64,
        actual_distance: Distance,
    },
    #[error("vector has {got} dimensions, collection expects {expected}")]
    Dimension { expected: u64, got: usize },
    #[error("upsert error: {0}")]
    Upsert(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("delete error: {0}")]
    Delete(String),
    #[error("payload update error: {0}")]
    Payload(String),
    #[error("scroll error: {0}")]
    Scroll(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl VectorStoreError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Provider,
            Self::Incompatible { .. } | Self::Dimension { .. } => ErrorKind::Consistency,
            Self::Collection(_)
            | Self::Upsert(_)
            | Self::Search(_)
            | Self::Delete(_)
            | Self::Payload(_)
            | Self::Scroll(_)
            | Self::Serialization(_) => ErrorKind::Provider,
        }
    }

    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Similarity metric, fixed when a collection is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distance {
    #[default]
    Cosine,
    Dot,
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub must: Vec<FieldCondition>,
    pub must_not: Vec<FieldCondition>,
}

impl VectorFilter {
    #[must_use]
    pub fn field_eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            must: vec![FieldCondition {
                field: field.into(),
                value: FieldValue::Text(value.into()),
            }],
            must_not: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldCondition {
    pub field: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone)]
pub enum FieldValue {
    Integer(i64),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct ScoredVectorPoint {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionParams {
    pub vector_size: u64,
    pub distance: Distance,
    pub points_count: u64,
}

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type ScrollResult = HashMap<String, HashMap<String, serde_json::Value>>;

pub trait VectorStore: Send + Sync {
    /// Create the collection, or verify that an existing one was created with the same
    /// dimension and metric.
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
        distance: Distance,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>>;

    fn collection_params(
        &self,
        collection: &str,
    ) -> BoxFuture<'_, Result<CollectionParams, VectorStoreError>>;

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<VectorFilter>,
        score_threshold: Option<f32>,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>>;

    fn count(
        &self,
        collection: &str,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<u64, VectorStoreError>>;

    fn delete_by_filter(
        &self,
        collection: &str,
        filter: VectorFilter,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// Merge `payload` into every point matching `filter`; other payload fields are kept.
    fn set_payload(
        &self,
        collection: &str,
        filter: VectorFilter,
        payload: HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// Payloads of every point (or every point matching `filter`), keyed by a string field.
    fn scroll_all(
        &self,
        collection: &str,
        key_field: &str,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<ScrollResult, VectorStoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_provider_class() {
        let err = VectorStoreError::Unavailable("connection refused".into());
        assert!(err.is_unavailable());
        assert_eq!(err.kind(), ErrorKind::Provider);
    }

    #[test]
    fn metric_mismatch_is_consistency() {
        let err = VectorStoreError::Incompatible {
            collection: "docs".into(),
            expected_size: 4,
            expected_distance: Distance::Cosine,
            actual_size: 4,
            actual_distance: Distance::Dot,
        };
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert!(err.to_string().contains("Dot"));
    }

    #[test]
    fn field_eq_builds_single_must() {
        let f = VectorFilter::field_eq("file_path", "/docs/a.pdf");
        assert_eq!(f.must.len(), 1);
        assert!(f.must_not.is_empty());
        assert!(matches!(&f.must[0].value, FieldValue::Text(v) if v == "/docs/a.pdf"));
    }
}
