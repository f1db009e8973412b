//! Qdrant-backed [`VectorStore`].

use std::collections::HashMap;

use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Filter, PointId,
    PointStruct, ScoredPoint, ScrollPointsBuilder, SearchPointsBuilder, SetPayloadPointsBuilder,
    UpsertPointsBuilder, VectorParamsBuilder, value::Kind, vectors_config,
};

use crate::vector_store::{
    BoxFuture, CollectionParams, Distance, FieldCondition, FieldValue, ScoredVectorPoint,
    ScrollResult, VectorFilter, VectorPoint, VectorStore, VectorStoreError,
};

type QdrantResult<T> = Result<T, Box<qdrant_client::QdrantError>>;

/// Thin wrapper over [`Qdrant`] client encapsulating collection operations.
#[derive(Clone)]
pub struct QdrantOps {
    client: Qdrant,
}

impl std::fmt::Debug for QdrantOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantOps").finish_non_exhaustive()
    }
}

impl QdrantOps {
    /// Create a new `QdrantOps` connected to the given URL.
    ///
    /// No connection is made until the first request.
    ///
    /// # Errors
    ///
    /// Returns an error if the Qdrant client cannot be created.
    pub fn new(url: &str) -> QdrantResult<Self> {
        let client = Qdrant::from_url(url).build().map_err(Box::new)?;
        Ok(Self { client })
    }

    async fn params(&self, collection: &str) -> QdrantResult<Option<CollectionParams>> {
        let info = self
            .client
            .collection_info(collection)
            .await
            .map_err(Box::new)?;
        let Some(result) = info.result else {
            return Ok(None);
        };
        let vector_params = result
            .config
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config);
        let Some(vectors_config::Config::Params(vp)) = vector_params else {
            return Ok(None);
        };
        let distance = match qdrant_client::qdrant::Distance::try_from(vp.distance) {
            Ok(qdrant_client::qdrant::Distance::Dot) => Distance::Dot,
            _ => Distance::Cosine,
        };
        Ok(Some(CollectionParams {
            vector_size: vp.size,
            distance,
            points_count: result.points_count.unwrap_or(0),
        }))
    }

    async fn create(&self, collection: &str, vector_size: u64, distance: Distance) -> QdrantResult<()> {
        let distance = match distance {
            Distance::Cosine => qdrant_client::qdrant::Distance::Cosine,
            Distance::Dot => qdrant_client::qdrant::Distance::Dot,
        };
        self.client
            .create_collection(
                CreateCollectionBuilder::new(collection)
                    .vectors_config(VectorParamsBuilder::new(vector_size, distance)),
            )
            .await
            .map_err(Box::new)?;
        Ok(())
    }

    async fn search_points(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<Filter>,
        score_threshold: Option<f32>,
    ) -> QdrantResult<Vec<ScoredPoint>> {
        let mut builder = SearchPointsBuilder::new(collection, vector, limit).with_payload(true);
        if let Some(f) = filter {
            builder = builder.filter(f);
        }
        if let Some(t) = score_threshold {
            builder = builder.score_threshold(t);
        }
        let results = self.client.search_points(builder).await.map_err(Box::new)?;
        Ok(results.result)
    }

    async fn count_points(&self, collection: &str, filter: Option<Filter>) -> QdrantResult<u64> {
        let mut builder = CountPointsBuilder::new(collection).exact(true);
        if let Some(f) = filter {
            builder = builder.filter(f);
        }
        let response = self.client.count(builder).await.map_err(Box::new)?;
        Ok(response.result.map_or(0, |r| r.count))
    }

    /// Scroll all points matching `filter`, keyed by a string payload field.
    ///
    /// Returns a map of `key_field` value -> full payload.
    async fn scroll_points(
        &self,
        collection: &str,
        key_field: &str,
        filter: Option<Filter>,
    ) -> QdrantResult<ScrollResult> {
        let mut result = HashMap::new();
        let mut offset: Option<PointId> = None;

        loop {
            let mut builder = ScrollPointsBuilder::new(collection)
                .with_payload(true)
                .with_vectors(false)
                .limit(256);

            if let Some(ref f) = filter {
                builder = builder.filter(f.clone());
            }
            if let Some(ref off) = offset {
                builder = builder.offset(off.clone());
            }

            let response = self.client.scroll(builder).await.map_err(Box::new)?;

            for point in response.result {
                let key = match point.payload.get(key_field).and_then(|v| v.kind.as_ref()) {
                    Some(Kind::StringValue(key)) => key.clone(),
                    _ => continue,
                };
                result.insert(key, payload_to_json(point.payload));
            }

            match response.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        Ok(result)
    }
}

/// Map a client error onto [`VectorStoreError`], separating an unreachable
/// server from request-level failures.
fn classify(err: &qdrant_client::QdrantError, fallback: fn(String) -> VectorStoreError) -> VectorStoreError {
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();
    let unreachable = ["unavailable", "transport error", "connection refused", "deadline", "timed out"]
        .iter()
        .any(|needle| lower.contains(needle));
    if unreachable {
        VectorStoreError::Unavailable(msg)
    } else {
        fallback(msg)
    }
}

impl VectorStore for QdrantOps {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
        distance: Distance,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let exists = self
                .client
                .collection_exists(&collection)
                .await
                .map_err(|e| classify(&e, VectorStoreError::Collection))?;
            if !exists {
                tracing::info!(%collection, vector_size, ?distance, "creating collection");
                return self
                    .create(&collection, vector_size, distance)
                    .await
                    .map_err(|e| classify(&e, VectorStoreError::Collection));
            }
            let actual = self
                .params(&collection)
                .await
                .map_err(|e| classify(&e, VectorStoreError::Collection))?
                .ok_or_else(|| {
                    VectorStoreError::Collection(format!(
                        "collection {collection} has no single unnamed vector config"
                    ))
                })?;
            if actual.vector_size != vector_size || actual.distance != distance {
                return Err(VectorStoreError::Incompatible {
                    collection,
                    expected_size: vector_size,
                    expected_distance: distance,
                    actual_size: actual.vector_size,
                    actual_distance: actual.distance,
                });
            }
            Ok(())
        })
    }

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.client
                .collection_exists(&collection)
                .await
                .map_err(|e| classify(&e, VectorStoreError::Collection))
        })
    }

    fn collection_params(
        &self,
        collection: &str,
    ) -> BoxFuture<'_, Result<CollectionParams, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.params(&collection)
                .await
                .map_err(|e| classify(&e, VectorStoreError::Collection))?
                .ok_or_else(|| {
                    VectorStoreError::Collection(format!("no vector params for {collection}"))
                })
        })
    }

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.client
                .delete_collection(&collection)
                .await
                .map_err(|e| classify(&e, VectorStoreError::Collection))?;
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
            let mut qdrant_points = Vec::with_capacity(points.len());
            for p in points {
                qdrant_points.push(PointStruct::new(p.id, p.vector, json_to_payload(p.payload)?));
            }
            self.client
                .upsert_points(UpsertPointsBuilder::new(&collection, qdrant_points).wait(true))
                .await
                .map_err(|e| classify(&e, VectorStoreError::Upsert))?;
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
            let qdrant_filter = filter.map(vector_filter_to_qdrant);
            let results = self
                .search_points(&collection, vector, limit, qdrant_filter, score_threshold)
                .await
                .map_err(|e| classify(&e, VectorStoreError::Search))?;
            Ok(results.into_iter().map(scored_point_to_vector).collect())
        })
    }

    fn count(
        &self,
        collection: &str,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<u64, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.count_points(&collection, filter.map(vector_filter_to_qdrant))
                .await
                .map_err(|e| classify(&e, VectorStoreError::Search))
        })
    }

    fn delete_by_filter(
        &self,
        collection: &str,
        filter: VectorFilter,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.client
                .delete_points(
                    DeletePointsBuilder::new(&collection)
                        .points(vector_filter_to_qdrant(filter))
                        .wait(true),
                )
                .await
                .map_err(|e| classify(&e, VectorStoreError::Delete))?;
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
            let payload = json_to_payload(payload)?;
            self.client
                .set_payload(
                    SetPayloadPointsBuilder::new(&collection, payload)
                        .points_selector(vector_filter_to_qdrant(filter))
                        .wait(true),
                )
                .await
                .map_err(|e| classify(&e, VectorStoreError::Payload))?;
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
            self.scroll_points(&collection, &key_field, filter.map(vector_filter_to_qdrant))
                .await
                .map_err(|e| classify(&e, VectorStoreError::Scroll))
        })
    }
}

fn json_to_payload(
    payload: HashMap<String, serde_json::Value>,
) -> Result<HashMap<String, qdrant_client::qdrant::Value>, VectorStoreError> {
    serde_json::from_value(serde_json::Value::Object(payload.into_iter().collect()))
        .map_err(|e| VectorStoreError::Serialization(e.to_string()))
}

fn payload_to_json(
    payload: HashMap<String, qdrant_client::qdrant::Value>,
) -> HashMap<String, serde_json::Value> {
    payload
        .into_iter()
        .map(|(k, v)| (k, v.into_json()))
        .collect()
}

fn vector_filter_to_qdrant(filter: VectorFilter) -> Filter {
    let must: Vec<_> = filter
        .must
        .into_iter()
        .map(field_condition_to_qdrant)
        .collect();
    let must_not: Vec<_> = filter
        .must_not
        .into_iter()
        .map(field_condition_to_qdrant)
        .collect();

    let mut f = Filter::default();
    if !must.is_empty() {
        f.must = must;
    }
    if !must_not.is_empty() {
        f.must_not = must_not;
    }
    f
}

fn field_condition_to_qdrant(cond: FieldCondition) -> qdrant_client::qdrant::Condition {
    match cond.value {
        FieldValue::Integer(v) => qdrant_client::qdrant::Condition::matches(cond.field, v),
        FieldValue::Text(v) => qdrant_client::qdrant::Condition::matches(cond.field, v),
    }
}

fn scored_point_to_vector(point: ScoredPoint) -> ScoredVectorPoint {
    let payload = payload_to_json(point.payload);

    let id = match point.id.and_then(|pid| pid.point_id_options) {
        Some(qdrant_client::qdrant::point_id::PointIdOptions::Uuid(u)) => u,
        Some(qdrant_client::qdrant::point_id::PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    };

    ScoredVectorPoint {
        id,
        score: point.score,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_valid_url() {
        assert!(QdrantOps::new("http://localhost:6334").is_ok());
    }

    #[test]
    fn new_invalid_url() {
        assert!(QdrantOps::new("not a valid url").is_err());
    }

    #[test]
    fn debug_hides_client() {
        let ops = QdrantOps::new("http://localhost:6334").unwrap();
        assert_eq!(format!("{ops:?}"), "QdrantOps { .. }");
    }

    #[test]
    fn filter_conversion_keeps_both_clauses() {
        let filter = VectorFilter {
            must: vec![FieldCondition {
                field: "file_name".into(),
                value: FieldValue::Text("manual.pdf".into()),
            }],
            must_not: vec![FieldCondition {
                field: "page".into(),
                value: FieldValue::Integer(1),
            }],
        };
        let q = vector_filter_to_qdrant(filter);
        assert_eq!(q.must.len(), 1);
        assert_eq!(q.must_not.len(), 1);
        assert!(q.should.is_empty());
    }

    #[test]
    fn empty_filter_converts_to_default() {
        let q = vector_filter_to_qdrant(VectorFilter::default());
        assert!(q.must.is_empty());
        assert!(q.must_not.is_empty());
    }

    #[test]
    fn scored_point_payload_is_converted() {
        let mut payload = HashMap::new();
        payload.insert(
            "file_name".to_owned(),
            qdrant_client::qdrant::Value::from("a.pdf"),
        );
        payload.insert("page".to_owned(), qdrant_client::qdrant::Value::from(4_i64));
        let point = ScoredPoint {
            id: Some(PointId::from("6f1c2b1e-0000-5000-8000-000000000000".to_owned())),
            score: 0.91,
            payload,
            ..Default::default()
        };
        let converted = scored_point_to_vector(point);
        assert_eq!(converted.id, "6f1c2b1e-0000-5000-8000-000000000000");
        assert_eq!(converted.payload["file_name"], serde_json::json!("a.pdf"));
        assert_eq!(converted.payload["page"], serde_json::json!(4));
    }

    #[test]
    fn list_payload_values_survive_conversion() {
        let json = HashMap::from([(
            "shared_with".to_owned(),
            serde_json::json!(["/docs/b.pdf", "/docs/c.pdf"]),
        )]);
        let payload = json_to_payload(json).unwrap();
        assert!(matches!(
            payload["shared_with"].kind,
            Some(Kind::ListValue(_))
        ));
        let back = payload_to_json(payload);
        assert_eq!(
            back["shared_with"],
            serde_json::json!(["/docs/b.pdf", "/docs/c.pdf"])
        );
    }
}
