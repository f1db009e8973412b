use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::vector_store::{
    BoxFuture, CollectionParams, Distance, FieldValue, ScoredVectorPoint, ScrollResult,
    VectorFilter, VectorPoint, VectorStore, VectorStoreError,
};

struct StoredPoint {
    seq: u64,
    vector: Vec<f32>,
    payload: HashMap<String, serde_json::Value>,
}

struct InMemoryCollection {
    vector_size: u64,
    distance: Distance,
    points: HashMap<String, StoredPoint>,
}

/// Process-local [`VectorStore`] used by tests and the offline CLI mode.
///
/// Ties in search scores are broken by insertion order, matching the order
/// in which chunks were first written.
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, InMemoryCollection>>,
    next_seq: AtomicU64,
    available: AtomicBool,
    upsert_calls: AtomicUsize,
    fail_upsert_on_call: Option<usize>,
}

impl InMemoryVectorStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            available: AtomicBool::new(true),
            upsert_calls: AtomicUsize::new(0),
            fail_upsert_on_call: None,
        }
    }

    /// Make the `call`-th upsert (1-based) fail without writing anything.
    #[must_use]
    pub fn fail_upsert_on_call(mut self, call: usize) -> Self {
        self.fail_upsert_on_call = Some(call);
        self
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), VectorStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(VectorStoreError::Unavailable(
                "in-memory store marked unavailable".into(),
            ))
        }
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryVectorStore")
            .field("available", &self.available.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn matches_filter(payload: &HashMap<String, serde_json::Value>, filter: &VectorFilter) -> bool {
    for cond in &filter.must {
        let Some(val) = payload.get(&cond.field) else {
            return false;
        };
        if !field_matches(val, &cond.value) {
            return false;
        }
    }
    for cond in &filter.must_not {
        if let Some(val) = payload.get(&cond.field)
            && field_matches(val, &cond.value)
        {
            return false;
        }
    }
    true
}

/// Like Qdrant, a condition on an array field matches when any element matches.
fn field_matches(val: &serde_json::Value, expected: &FieldValue) -> bool {
    if let Some(items) = val.as_array() {
        return items.iter().any(|item| field_matches(item, expected));
    }
    match expected {
        FieldValue::Integer(i) => val.as_i64() == Some(*i),
        FieldValue::Text(s) => val.as_str() == Some(s.as_str()),
    }
}

fn missing(collection: &str) -> String {
    format!("collection {collection} not found")
}

impl VectorStore for InMemoryVectorStore {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
        distance: Distance,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_available()?;
            let mut cols = self
                .collections
                .write()
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            let col = cols
                .entry(collection.clone())
                .or_insert_with(|| InMemoryCollection {
                    vector_size,
                    distance,
                    points: HashMap::new(),
                });
            if col.vector_size != vector_size || col.distance != distance {
                return Err(VectorStoreError::Incompatible {
                    collection,
                    expected_size: vector_size,
                    expected_distance: distance,
                    actual_size: col.vector_size,
                    actual_distance: col.distance,
                });
            }
            Ok(())
        })
    }

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_available()?;
            let cols = self
                .collections
                .read()
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            Ok(cols.contains_key(&collection))
        })
    }

    fn collection_params(
        &self,
        collection: &str,
    ) -> BoxFuture<'_, Result<CollectionParams, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_available()?;
            let cols = self
                .collections
                .read()
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            let col = cols
                .get(&collection)
                .ok_or_else(|| VectorStoreError::Collection(missing(&collection)))?;
            Ok(CollectionParams {
                vector_size: col.vector_size,
                distance: col.distance,
                points_count: col.points.len() as u64,
            })
        })
    }

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_available()?;
            let mut cols = self
                .collections
                .write()
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            cols.remove(&collection);
            Ok(())
        })
    }

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_available()?;
            let call = self.upsert_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_upsert_on_call == Some(call) {
                return Err(VectorStoreError::Upsert(format!("upsert {call} rejected")));
            }
            let mut cols = self
                .collections
                .write()
                .map_err(|e| VectorStoreError::Upsert(e.to_string()))?;
            let col = cols
                .get_mut(&collection)
                .ok_or_else(|| VectorStoreError::Upsert(missing(&collection)))?;
            if let Some(bad) = points
                .iter()
                .find(|p| p.vector.len() as u64 != col.vector_size)
            {
                return Err(VectorStoreError::Dimension {
                    expected: col.vector_size,
                    got: bad.vector.len(),
                });
            }
            for p in points {
                // Overwrites keep their original position for tie-breaking.
                let seq = col.points.get(&p.id).map_or_else(
                    || self.next_seq.fetch_add(1, Ordering::Relaxed),
                    |existing| existing.seq,
                );
                col.points.insert(
                    p.id,
                    StoredPoint {
                        seq,
                        vector: p.vector,
                        payload: p.payload,
                    },
                );
            }
            Ok(())
        })
    }

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<VectorFilter>,
        score_threshold: Option<f32>,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_available()?;
            let cols = self
                .collections
                .read()
                .map_err(|e| VectorStoreError::Search(e.to_string()))?;
            let col = cols
                .get(&collection)
                .ok_or_else(|| VectorStoreError::Search(missing(&collection)))?;

            let empty_filter = VectorFilter::default();
            let f = filter.as_ref().unwrap_or(&empty_filter);
            let score = |v: &[f32]| match col.distance {
                Distance::Cosine => cosine_similarity(&vector, v),
                Distance::Dot => dot_product(&vector, v),
            };

            let mut scored: Vec<(u64, ScoredVectorPoint)> = col
                .points
                .iter()
                .filter(|(_, sp)| matches_filter(&sp.payload, f))
                .map(|(id, sp)| {
                    (
                        sp.seq,
                        ScoredVectorPoint {
                            id: id.clone(),
                            score: score(&sp.vector),
                            payload: sp.payload.clone(),
                        },
                    )
                })
                .filter(|(_, p)| score_threshold.is_none_or(|t| p.score >= t))
                .collect();

            scored.sort_by(|(seq_a, a), (seq_b, b)| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(seq_a.cmp(seq_b))
            });
            #[expect(clippy::cast_possible_truncation)]
            scored.truncate(limit as usize);
            Ok(scored.into_iter().map(|(_, p)| p).collect())
        })
    }

    fn count(
        &self,
        collection: &str,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<u64, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_available()?;
            let cols = self
                .collections
                .read()
                .map_err(|e| VectorStoreError::Search(e.to_string()))?;
            let Some(col) = cols.get(&collection) else {
                return Ok(0);
            };
            let n = match &filter {
                Some(f) => col
                    .points
                    .values()
                    .filter(|sp| matches_filter(&sp.payload, f))
                    .count(),
                None => col.points.len(),
            };
            Ok(n as u64)
        })
    }

    fn delete_by_filter(
        &self,
        collection: &str,
        filter: VectorFilter,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_available()?;
            let mut cols = self
                .collections
                .write()
                .map_err(|e| VectorStoreError::Delete(e.to_string()))?;
            if let Some(col) = cols.get_mut(&collection) {
                col.points.retain(|_, sp| !matches_filter(&sp.payload, &filter));
            }
            Ok(())
        })
    }

    fn set_payload(
        &self,
        collection: &str,
        filter: VectorFilter,
        payload: HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_available()?;
            let mut cols = self
                .collections
                .write()
                .map_err(|e| VectorStoreError::Payload(e.to_string()))?;
            let col = cols
                .get_mut(&collection)
                .ok_or_else(|| VectorStoreError::Payload(missing(&collection)))?;
            for sp in col.points.values_mut() {
                if matches_filter(&sp.payload, &filter) {
                    sp.payload
                        .extend(payload.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
            Ok(())
        })
    }

    fn scroll_all(
        &self,
        collection: &str,
        key_field: &str,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<ScrollResult, VectorStoreError>> {
        let collection = collection.to_owned();
        let key_field = key_field.to_owned();
        Box::pin(async move {
            self.check_available()?;
            let cols = self
                .collections
                .read()
                .map_err(|e| VectorStoreError::Scroll(e.to_string()))?;
            let col = cols
                .get(&collection)
                .ok_or_else(|| VectorStoreError::Scroll(missing(&collection)))?;

            let mut result = HashMap::new();
            for sp in col.points.values() {
                if filter.as_ref().is_some_and(|f| !matches_filter(&sp.payload, f)) {
                    continue;
                }
                let Some(key_val) = sp.payload.get(&key_field).and_then(|v| v.as_str()) else {
                    continue;
                };
                result.insert(key_val.to_owned(), sp.payload.clone());
            }
            Ok(result)
        })
    }
}
