//! Document-level view over a [`VectorStore`] collection.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::document::{Chunk, DocumentMetadata, FileSignature};
use crate::vector_store::{
    Distance, FieldCondition, FieldValue, VectorFilter, VectorPoint, VectorStore,
    VectorStoreError,
};

pub const DOC_TYPE: &str = "pdf";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything stored next to a chunk vector, so a search hit needs no further lookups.
///
/// Optional fields serialize as `null` rather than being omitted, so a partial
/// payload update always overwrites them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub file_path: String,
    pub file_name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    pub doc_type: String,
    pub page_count: usize,
    pub page: usize,
    pub chunk_index: usize,
    pub content_hash: String,
    /// Empty until every chunk of the file version is stored.
    pub file_signature: String,
    pub text: String,
    /// RFC 3339, UTC, microsecond precision. Orders equal-score hits.
    pub indexed_at: String,
    /// Other files that contain this exact chunk text.
    #[serde(default)]
    pub shared_with: Vec<String>,
}

impl ChunkPayload {
    #[must_use]
    pub fn new(metadata: &DocumentMetadata, chunk: &Chunk, indexed_at: DateTime<Utc>) -> Self {
        Self {
            file_path: metadata.file_path.display().to_string(),
            file_name: metadata.file_name.clone(),
            title: metadata.title.clone(),
            author: metadata.author.clone(),
            doc_type: DOC_TYPE.to_owned(),
            page_count: metadata.page_count,
            page: chunk.page,
            chunk_index: chunk.chunk_index,
            content_hash: chunk.content_hash.clone(),
            file_signature: String::new(),
            text: chunk.text.clone(),
            indexed_at: indexed_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            shared_with: Vec::new(),
        }
    }

    fn into_map(self) -> Result<HashMap<String, serde_json::Value>, VectorStoreError> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => Ok(map.into_iter().collect()),
            Ok(other) => Err(VectorStoreError::Serialization(format!(
                "payload serialized to {other}"
            ))),
            Err(e) => Err(VectorStoreError::Serialization(e.to_string())),
        }
    }

    fn from_map(map: HashMap<String, serde_json::Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(map.into_iter().collect()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: ChunkPayload,
}

/// The parts of a stored point needed to rebuild the dedup index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    pub file_path: PathBuf,
    pub content_hash: String,
    pub file_signature: Option<String>,
    pub shared_with: Vec<PathBuf>,
}

/// A file with chunks in the collection, owned or shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedFile {
    pub file_path: PathBuf,
    pub file_name: String,
    pub chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionInfo {
    pub collection: String,
    pub points_count: u64,
    pub vector_size: u64,
    pub distance: String,
}

/// Stable point id for a chunk: UUIDv5 of its content hash.
///
/// Re-upserting identical content overwrites the same point.
#[must_use]
pub fn point_id_for_hash(content_hash: &str) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, content_hash.as_bytes()).to_string()
}

#[derive(Clone)]
pub struct DocumentStore {
    backend: Arc<dyn VectorStore>,
    collection: String,
    vector_size: u64,
    distance: Distance,
    timeout: Duration,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("collection", &self.collection)
            .field("vector_size", &self.vector_size)
            .field("distance", &self.distance)
            .finish_non_exhaustive()
    }
}

impl DocumentStore {
    #[must_use]
    pub fn new(
        backend: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        vector_size: u64,
        distance: Distance,
    ) -> Self {
        Self {
            backend,
            collection: collection.into(),
            vector_size,
            distance,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    async fn call<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, VectorStoreError>>,
    ) -> Result<T, VectorStoreError> {
        tokio::time::timeout(self.timeout, fut).await.map_err(|_| {
            VectorStoreError::Unavailable(format!("{op} timed out after {:?}", self.timeout))
        })?
    }

    /// Create the collection or verify its dimension and metric.
    ///
    /// # Errors
    ///
    /// Returns [`VectorStoreError::Incompatible`] when an existing collection differs.
    pub async fn ensure_collection(&self) -> Result<(), VectorStoreError> {
        self.call(
            "ensure_collection",
            self.backend
                .ensure_collection(&self.collection, self.vector_size, self.distance),
        )
        .await
    }

    /// Upsert chunk vectors, keyed by content hash.
    ///
    /// # Errors
    ///
    /// Fails on a vector of the wrong dimension before anything is written.
    pub async fn upsert_chunks(
        &self,
        chunks: Vec<(ChunkPayload, Vec<f32>)>,
    ) -> Result<(), VectorStoreError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut points = Vec::with_capacity(chunks.len());
        for (payload, vector) in chunks {
            if vector.len() as u64 != self.vector_size {
                return Err(VectorStoreError::Dimension {
                    expected: self.vector_size,
                    got: vector.len(),
                });
            }
            points.push(VectorPoint {
                id: point_id_for_hash(&payload.content_hash),
                vector,
                payload: payload.into_map()?,
            });
        }
        let count = points.len();
        self.call("upsert", self.backend.upsert(&self.collection, points))
            .await?;
        tracing::debug!(collection = %self.collection, count, "upserted chunks");
        Ok(())
    }

    /// Nearest chunks with `score >= score_threshold`, at most `limit`, best first.
    ///
    /// # Errors
    ///
    /// Returns the backend error; [`VectorStoreError::Unavailable`] when it cannot be reached.
    pub async fn search(
        &self,
        vector: Vec<f32>,
        limit: u64,
        score_threshold: f32,
    ) -> Result<Vec<SearchHit>, VectorStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        // Over-fetch so ties straddling the cut are ordered here, not by the backend.
        let points = self
            .call(
                "search",
                self.backend.search(
                    &self.collection,
                    vector,
                    limit.saturating_mul(2),
                    None,
                    Some(score_threshold),
                ),
            )
            .await?;

        let mut hits = Vec::with_capacity(points.len());
        for p in points {
            if p.score < score_threshold {
                continue;
            }
            match ChunkPayload::from_map(p.payload) {
                Ok(payload) => hits.push(SearchHit {
                    id: p.id,
                    score: p.score,
                    payload,
                }),
                Err(e) => tracing::warn!(id = %p.id, error = %e, "skipping point with malformed payload"),
            }
        }
        hits.sort_by(rank);
        #[expect(clippy::cast_possible_truncation)]
        hits.truncate(limit as usize);
        Ok(hits)
    }

    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn exists_by_hash(&self, content_hash: &str) -> Result<bool, VectorStoreError> {
        let filter = VectorFilter::field_eq("content_hash", content_hash);
        Ok(self
            .call("count", self.backend.count(&self.collection, Some(filter)))
            .await?
            > 0)
    }

    /// Whether chunks written for exactly this version of `file` are stored.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn exists_by_signature(
        &self,
        file: &Path,
        signature: &FileSignature,
    ) -> Result<bool, VectorStoreError> {
        let filter = VectorFilter {
            must: vec![
                text_condition("file_path", file.display().to_string()),
                text_condition("file_signature", signature.as_str()),
            ],
            must_not: Vec::new(),
        };
        Ok(self
            .call("count", self.backend.count(&self.collection, Some(filter)))
            .await?
            > 0)
    }

    /// Remove every chunk indexed from `file`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn delete_by_file(&self, file: &Path) -> Result<u64, VectorStoreError> {
        self.delete_matching(VectorFilter::field_eq("file_path", file.display().to_string()))
            .await
    }

    /// Remove every chunk whose `file_name` equals `name`, in any directory.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn delete_by_file_name(&self, name: &str) -> Result<u64, VectorStoreError> {
        self.delete_matching(VectorFilter::field_eq("file_name", name))
            .await
    }

    async fn delete_matching(&self, filter: VectorFilter) -> Result<u64, VectorStoreError> {
        let n = self
            .call(
                "count",
                self.backend.count(&self.collection, Some(filter.clone())),
            )
            .await?;
        if n > 0 {
            self.call(
                "delete",
                self.backend.delete_by_filter(&self.collection, filter),
            )
            .await?;
        }
        Ok(n)
    }

    /// Number of stored points; zero when the collection does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn point_count(&self) -> Result<u64, VectorStoreError> {
        if !self
            .call(
                "collection_exists",
                self.backend.collection_exists(&self.collection),
            )
            .await?
        {
            return Ok(0);
        }
        self.call("count", self.backend.count(&self.collection, None))
            .await
    }

    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn info(&self) -> Result<CollectionInfo, VectorStoreError> {
        let params = self
            .call(
                "collection_info",
                self.backend.collection_params(&self.collection),
            )
            .await?;
        Ok(CollectionInfo {
            collection: self.collection.clone(),
            points_count: params.points_count,
            vector_size: params.vector_size,
            distance: format!("{:?}", params.distance),
        })
    }

    /// Stamp `signature` on every chunk owned by `file`, marking that version complete.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn set_file_signature(
        &self,
        file: &Path,
        signature: &FileSignature,
    ) -> Result<(), VectorStoreError> {
        let fields = HashMap::from([(
            "file_signature".to_owned(),
            serde_json::Value::String(signature.as_str().to_owned()),
        )]);
        self.call(
            "set_payload",
            self.backend.set_payload(
                &self.collection,
                VectorFilter::field_eq("file_path", file.display().to_string()),
                fields,
            ),
        )
        .await
    }

    /// Record which other files contain the chunk with `content_hash`.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn set_shared_with(
        &self,
        content_hash: &str,
        files: &[PathBuf],
    ) -> Result<(), VectorStoreError> {
        let fields = HashMap::from([("shared_with".to_owned(), paths_json(files))]);
        self.call(
            "set_payload",
            self.backend.set_payload(
                &self.collection,
                VectorFilter::field_eq("content_hash", content_hash),
                fields,
            ),
        )
        .await
    }

    /// Move the chunk with `content_hash` to a new owning file.
    ///
    /// With the new owner's own payload the point is rewritten to it; otherwise only
    /// the file fields change and title and author are cleared.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn rehome(
        &self,
        content_hash: &str,
        owner: &Path,
        payload: Option<ChunkPayload>,
        signature: Option<&FileSignature>,
        shared_with: &[PathBuf],
    ) -> Result<(), VectorStoreError> {
        let signature = signature.map_or_else(String::new, |s| s.as_str().to_owned());
        let fields = match payload {
            Some(mut payload) => {
                payload.file_signature = signature;
                payload.shared_with = shared_with.iter().map(|p| p.display().to_string()).collect();
                payload.into_map()?
            }
            None => HashMap::from([
                ("file_path".to_owned(), serde_json::json!(owner.display().to_string())),
                ("file_name".to_owned(), serde_json::json!(file_name_of(owner))),
                ("title".to_owned(), serde_json::Value::Null),
                ("author".to_owned(), serde_json::Value::Null),
                ("file_signature".to_owned(), serde_json::json!(signature)),
                ("shared_with".to_owned(), paths_json(shared_with)),
            ]),
        };
        self.call(
            "set_payload",
            self.backend.set_payload(
                &self.collection,
                VectorFilter::field_eq("content_hash", content_hash),
                fields,
            ),
        )
        .await
    }

    /// File that owns the stored chunk with `content_hash`, if one is stored.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn chunk_owner(&self, content_hash: &str) -> Result<Option<PathBuf>, VectorStoreError> {
        let mut rows = self
            .call(
                "scroll",
                self.backend.scroll_all(
                    &self.collection,
                    "content_hash",
                    Some(VectorFilter::field_eq("content_hash", content_hash)),
                ),
            )
            .await?;
        Ok(rows
            .remove(content_hash)
            .and_then(|mut fields| fields.remove("file_path"))
            .and_then(|v| v.as_str().map(PathBuf::from)))
    }

    /// Hash, owner, signature and sharing files of every stored chunk.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn indexed_chunks(&self) -> Result<Vec<StoredChunk>, VectorStoreError> {
        if self.point_count().await? == 0 {
            return Ok(Vec::new());
        }
        let rows = self
            .call(
                "scroll",
                self.backend.scroll_all(&self.collection, "content_hash", None),
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(hash, fields)| {
                let file_path = PathBuf::from(fields.get("file_path")?.as_str()?);
                let file_signature = fields
                    .get("file_signature")
                    .and_then(serde_json::Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned);
                Some(StoredChunk {
                    file_path,
                    content_hash: hash,
                    file_signature,
                    shared_with: json_paths(fields.get("shared_with")),
                })
            })
            .collect())
    }

    /// Every file with stored chunks, sorted by path. A chunk shared by several files
    /// counts once for each of them.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn indexed_files(&self) -> Result<Vec<IndexedFile>, VectorStoreError> {
        let mut counts: BTreeMap<PathBuf, usize> = BTreeMap::new();
        for chunk in self.indexed_chunks().await? {
            *counts.entry(chunk.file_path).or_default() += 1;
            for shared in chunk.shared_with {
                *counts.entry(shared).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|(file_path, chunks)| IndexedFile {
                file_name: file_name_of(&file_path),
                file_path,
                chunks,
            })
            .collect())
    }

    /// Drop the collection and recreate it empty. Returns how many points were removed.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn clear(&self) -> Result<u64, VectorStoreError> {
        let removed = self.point_count().await?;
        if self
            .call(
                "collection_exists",
                self.backend.collection_exists(&self.collection),
            )
            .await?
        {
            self.call(
                "delete_collection",
                self.backend.delete_collection(&self.collection),
            )
            .await?;
        }
        self.ensure_collection().await?;
        tracing::info!(collection = %self.collection, removed, "collection cleared");
        Ok(removed)
    }
}

/// Best first; equal scores in the order the chunks were written.
fn rank(a: &SearchHit, b: &SearchHit) -> std::cmp::Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.payload.indexed_at.cmp(&b.payload.indexed_at))
        .then_with(|| a.payload.chunk_index.cmp(&b.payload.chunk_index))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn paths_json(paths: &[PathBuf]) -> serde_json::Value {
    paths
        .iter()
        .map(|p| serde_json::Value::String(p.display().to_string()))
        .collect()
}

fn json_paths(value: Option<&serde_json::Value>) -> Vec<PathBuf> {
    value
        .and_then(serde_json::Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default()
}

fn text_condition(field: &str, value: impl Into<String>) -> FieldCondition {
    FieldCondition {
        field: field.to_owned(),
        value: FieldValue::Text(value.into()),
    }
}
