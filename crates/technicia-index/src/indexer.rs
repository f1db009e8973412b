//! Document indexing orchestrator: load → split → dedup → embed → store.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use technicia_llm::{EmbeddingProvider, ErrorKind, InputType};
use technicia_memory::document::{
    Chunk, DocumentLoader, DocumentMetadata, FileSignature, TextSplitter,
};
use technicia_memory::{
    ChunkPayload, Claim, CollectionInfo, DedupIndex, DocumentStore, EmbeddingGateway,
    IndexedFile,
};

use crate::error::{IndexError, Result};

const UPSERT_BATCH: usize = 64;
/// Rounds of waiting on chunks another file is indexing before giving up on them.
const SETTLE_ROUNDS: usize = 3;
const SETTLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    Success,
    /// Some chunks were stored, others were not; the file is retried on the next run.
    Partial,
    /// The file changed while it was being indexed; nothing was written.
    Superseded,
    Error,
}

/// Result of indexing one file.
#[derive(Debug, Clone, Serialize)]
pub struct IndexOutcome {
    pub status: IndexStatus,
    pub file: PathBuf,
    pub chunks_processed: usize,
    pub chunks_skipped: usize,
    /// The file signature matched the last indexed version.
    pub unchanged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DocumentMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub error_kind: Option<ErrorKind>,
}

impl IndexOutcome {
    fn new(status: IndexStatus, file: &Path) -> Self {
        Self {
            status,
            file: file.to_path_buf(),
            chunks_processed: 0,
            chunks_skipped: 0,
            unchanged: false,
            metadata: None,
            error: None,
            error_kind: None,
        }
    }

    fn failed(file: &Path, err: &IndexError) -> Self {
        Self {
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            ..Self::new(IndexStatus::Error, file)
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == IndexStatus::Success
    }
}

/// Summary of a directory scan.
#[derive(Debug, Default, Serialize)]
pub struct DirectoryReport {
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_failed: usize,
    pub chunks_processed: usize,
    pub results: Vec<IndexOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteAck {
    pub file_name: String,
    pub points_removed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearAck {
    pub collection: String,
    pub points_removed: u64,
}

/// Progress of one indexing run across claim rounds.
#[derive(Debug, Default)]
struct RunState {
    written: usize,
    skipped: usize,
    /// Hashes stored for other files that this file also contains.
    shared: HashSet<String>,
    /// Chunks still held by another task when waiting gave up.
    unresolved: usize,
    failure: Option<(String, ErrorKind)>,
}

impl RunState {
    fn fail(&mut self, message: String, kind: ErrorKind) {
        self.failure.get_or_insert((message, kind));
    }

    fn is_complete(&self) -> bool {
        self.failure.is_none() && self.unresolved == 0
    }
}

enum Round {
    /// Chunks another task held while this round ran.
    Waiting(Vec<Chunk>),
    Superseded,
}

/// Releases claims that were never committed, on every exit path.
struct ClaimGuard<'a> {
    dedup: &'a DedupIndex,
    hashes: Vec<String>,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.dedup.release(self.hashes.iter().map(String::as_str));
    }
}

/// Every file under `dir` for which `accept` returns true, in path order.
#[must_use]
pub fn supported_files(dir: &Path, accept: impl Fn(&Path) -> bool) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = ignore::WalkBuilder::new(dir)
        .hidden(true)
        .git_ignore(false)
        .build()
        .flatten()
        .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()) && accept(e.path()))
        .map(ignore::DirEntry::into_path)
        .collect();
    files.sort();
    files
}

pub struct DocumentIndexer<E> {
    loader: Box<dyn DocumentLoader>,
    splitter: TextSplitter,
    gateway: EmbeddingGateway<E>,
    store: DocumentStore,
    dedup: Arc<DedupIndex>,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl<E: EmbeddingProvider> DocumentIndexer<E> {
    #[must_use]
    pub fn new(
        loader: Box<dyn DocumentLoader>,
        splitter: TextSplitter,
        gateway: EmbeddingGateway<E>,
        store: DocumentStore,
        dedup: Arc<DedupIndex>,
    ) -> Self {
        Self {
            loader,
            splitter,
            gateway,
            store,
            dedup,
            locks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    #[must_use]
    pub fn dedup(&self) -> &Arc<DedupIndex> {
        &self.dedup
    }

    #[must_use]
    pub fn loader(&self) -> &dyn DocumentLoader {
        self.loader.as_ref()
    }

    /// Create or verify the collection, then warm the dedup index from it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or the collection is incompatible.
    pub async fn prepare(&self) -> Result<()> {
        self.store.ensure_collection().await?;
        self.dedup.rebuild(&self.store).await?;
        Ok(())
    }

    /// Index one file. Failures are reported in the outcome, never returned.
    pub async fn index_document(&self, path: &Path) -> IndexOutcome {
        match self.index_file(path).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "indexing failed");
                IndexOutcome::failed(path, &e)
            }
        }
    }

    /// Index one file.
    ///
    /// Runs for the same path are serialized. An unchanged file is reported as a
    /// success with no chunks processed. The file signature is stored only after
    /// every chunk of the version is stored, so an incomplete run is retried.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or the previous version cannot be
    /// removed. Embedding and upsert failures are reported as [`IndexStatus::Partial`]
    /// or [`IndexStatus::Error`].
    pub async fn index_file(&self, path: &Path) -> Result<IndexOutcome> {
        let lock = self.path_lock(path);
        let result = {
            let _guard = lock.lock().await;
            self.index_locked(path).await
        };
        self.drop_path_lock(path, lock);
        result
    }

    async fn index_locked(&self, path: &Path) -> Result<IndexOutcome> {
        let signature = FileSignature::of(path)
            .await
            .map_err(|e| IndexError::from_stat(path, e))?;

        if self.dedup.file_signature(path).as_ref() == Some(&signature)
            || self.store.exists_by_signature(path, &signature).await?
        {
            tracing::debug!(file = %path.display(), "unchanged, skipping");
            self.dedup.set_file_signature(path, signature);
            return Ok(IndexOutcome {
                unchanged: true,
                ..IndexOutcome::new(IndexStatus::Success, path)
            });
        }

        let document = self.loader.load(path).await?;
        let removed = self.drop_file_points(path).await?;
        if removed > 0 {
            tracing::debug!(file = %path.display(), removed, "dropped previous version");
        }

        let indexed_at = Utc::now();
        let mut run = RunState::default();
        let mut pending = self.splitter.split(&document);
        for round in 0..=SETTLE_ROUNDS {
            let waiting = match self
                .store_round(path, &signature, &document.metadata, indexed_at, pending, &mut run)
                .await?
            {
                Round::Waiting(waiting) => waiting,
                Round::Superseded => {
                    tracing::info!(file = %path.display(), "file changed during indexing, discarding run");
                    return Ok(IndexOutcome {
                        metadata: Some(document.metadata),
                        ..IndexOutcome::new(IndexStatus::Superseded, path)
                    });
                }
            };
            pending = Vec::new();
            if waiting.is_empty() || run.failure.is_some() || round == SETTLE_ROUNDS {
                run.unresolved += waiting.len();
                break;
            }
            for chunk in waiting {
                match tokio::time::timeout(SETTLE_TIMEOUT, self.dedup.settled(&chunk.content_hash))
                    .await
                {
                    Ok(Some(owner)) if owner == path => run.skipped += 1,
                    Ok(Some(_)) => {
                        let payload = ChunkPayload::new(&document.metadata, &chunk, indexed_at);
                        self.dedup.add_reference(&chunk.content_hash, payload);
                        run.shared.insert(chunk.content_hash);
                        run.skipped += 1;
                    }
                    // Released without being stored: claim it again next round.
                    Ok(None) => pending.push(chunk),
                    Err(_) => run.unresolved += 1,
                }
            }
        }

        self.sync_references(path, &mut run).await;
        if run.is_complete() {
            match self.store.set_file_signature(path, &signature).await {
                Ok(()) => self.dedup.set_file_signature(path, signature),
                Err(e) => run.fail(e.to_string(), e.kind()),
            }
        }

        let mut outcome = IndexOutcome {
            chunks_processed: run.written,
            chunks_skipped: run.skipped,
            metadata: Some(document.metadata),
            ..IndexOutcome::new(IndexStatus::Success, path)
        };
        if run.unresolved > 0 {
            run.fail(
                format!("{} chunks are still being indexed by another file", run.unresolved),
                ErrorKind::TransientIo,
            );
        }
        match run.failure {
            None => {
                tracing::info!(file = %path.display(), chunks = run.written, skipped = run.skipped, "indexed");
            }
            Some((message, kind)) => {
                outcome.status = if run.written > 0 || run.skipped > 0 {
                    IndexStatus::Partial
                } else {
                    IndexStatus::Error
                };
                tracing::warn!(file = %path.display(), chunks = run.written, error = %message, "indexing incomplete");
                outcome.error_kind = Some(kind);
                outcome.error = Some(message);
            }
        }
        Ok(outcome)
    }

    /// Claim, embed and store one round of chunks.
    ///
    /// Store and embedding failures are recorded in `run`; only the deduplication
    /// lookups propagate errors.
    async fn store_round(
        &self,
        path: &Path,
        signature: &FileSignature,
        metadata: &DocumentMetadata,
        indexed_at: DateTime<Utc>,
        chunks: Vec<Chunk>,
        run: &mut RunState,
    ) -> Result<Round> {
        let mut claims = ClaimGuard {
            dedup: &self.dedup,
            hashes: Vec::new(),
        };
        let mut fresh: Vec<Chunk> = Vec::new();
        let mut waiting: Vec<Chunk> = Vec::new();
        for chunk in chunks {
            let hash = chunk.content_hash.clone();
            match self.dedup.claim(&hash, path) {
                Claim::Acquired => {
                    claims.hashes.push(hash.clone());
                    match self.store.chunk_owner(&hash).await? {
                        None => fresh.push(chunk),
                        Some(owner) if owner == path => {
                            self.dedup.commit([hash.as_str()]);
                            run.skipped += 1;
                        }
                        // Stored by a file this index never saw, e.g. from another process.
                        Some(owner) => {
                            self.dedup.record(hash.clone(), &owner);
                            self.dedup
                                .add_reference(&hash, ChunkPayload::new(metadata, &chunk, indexed_at));
                            run.shared.insert(hash);
                            run.skipped += 1;
                        }
                    }
                }
                Claim::AlreadyIndexed => {
                    self.dedup
                        .add_reference(&hash, ChunkPayload::new(metadata, &chunk, indexed_at));
                    run.shared.insert(hash);
                    run.skipped += 1;
                }
                Claim::SameFile => run.skipped += 1,
                Claim::InFlight => waiting.push(chunk),
            }
        }
        if fresh.is_empty() {
            return Ok(Round::Waiting(waiting));
        }

        let texts: Vec<String> = fresh.iter().map(|c| c.text.clone()).collect();
        let embedded = self.gateway.embed(&texts, InputType::Document).await;

        let current = FileSignature::of(path).await.ok();
        if current.as_ref() != Some(signature) {
            return Ok(Round::Superseded);
        }

        if let Some(e) = &embedded.failure {
            run.fail(e.to_string(), e.kind());
        }
        // Stored without a signature; it is stamped once the whole version is in.
        let points: Vec<(ChunkPayload, Vec<f32>)> = embedded
            .vectors
            .into_iter()
            .map(|(i, vector)| (ChunkPayload::new(metadata, &fresh[i], indexed_at), vector))
            .collect();
        for batch in points.chunks(UPSERT_BATCH) {
            if let Err(e) = self.store.upsert_chunks(batch.to_vec()).await {
                run.fail(e.to_string(), e.kind());
                break;
            }
            self.dedup
                .commit(batch.iter().map(|(p, _)| p.content_hash.as_str()));
            run.written += batch.len();
        }
        drop(claims);
        Ok(Round::Waiting(waiting))
    }

    /// Persist which shared chunks `path` contains now, dropping references the new
    /// version no longer has.
    async fn sync_references(&self, path: &Path, run: &mut RunState) {
        let dropped = self.dedup.retain_references(path, &run.shared);
        let mut hashes: Vec<String> = run.shared.iter().cloned().chain(dropped).collect();
        hashes.sort();
        for hash in hashes {
            let files = self.dedup.references(&hash);
            if let Err(e) = self.store.set_shared_with(&hash, &files).await {
                run.fail(e.to_string(), e.kind());
                return;
            }
        }
    }

    /// Remove the chunks `path` owns, first moving every chunk another file also
    /// contains over to that file. Returns how many points were deleted.
    async fn drop_file_points(&self, path: &Path) -> Result<u64> {
        let handoffs = self.dedup.plan_handoff(path);
        for handoff in &handoffs {
            let signature = self.dedup.file_signature(&handoff.owner);
            self.store
                .rehome(
                    &handoff.content_hash,
                    &handoff.owner,
                    handoff.payload.clone(),
                    signature.as_ref(),
                    &handoff.shared_with,
                )
                .await?;
        }
        self.dedup.hand_off(&handoffs);
        if !handoffs.is_empty() {
            tracing::debug!(file = %path.display(), moved = handoffs.len(), "shared chunks handed off");
        }
        let removed = self.store.delete_by_file(path).await?;
        self.dedup.forget_file(path);
        Ok(removed)
    }

    /// Index every supported file under `dir`. One failing file never stops the scan.
    ///
    /// # Errors
    ///
    /// Returns an error only if `dir` is not a readable directory.
    pub async fn index_directory(&self, dir: &Path) -> Result<DirectoryReport> {
        tokio::fs::read_dir(dir).await?;
        let files = supported_files(dir, |p| self.loader.supports(p));
        tracing::info!(dir = %dir.display(), files = files.len(), "indexing directory");

        let mut report = DirectoryReport::default();
        for file in files {
            let outcome = self.index_document(&file).await;
            report.files_scanned += 1;
            report.chunks_processed += outcome.chunks_processed;
            match outcome.status {
                IndexStatus::Success if outcome.unchanged => report.files_unchanged += 1,
                IndexStatus::Success | IndexStatus::Partial => report.files_indexed += 1,
                IndexStatus::Error => report.files_failed += 1,
                IndexStatus::Superseded => {}
            }
            report.results.push(outcome);
        }
        Ok(report)
    }

    /// Remove every chunk of every file named `file_name`.
    ///
    /// Chunks that another file also contains stay searchable under that file.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn delete_by_filename(&self, file_name: &str) -> Result<DeleteAck> {
        let mut files: HashSet<PathBuf> = self.dedup.files_named(file_name).into_iter().collect();
        files.extend(
            self.store
                .indexed_files()
                .await?
                .into_iter()
                .filter(|f| f.file_name == file_name)
                .map(|f| f.file_path),
        );
        let mut files: Vec<PathBuf> = files.into_iter().collect();
        files.sort();

        let mut points_removed = 0;
        for file in &files {
            points_removed += self.remove_file(file).await?;
        }
        // Points from other processes whose owners this index never loaded.
        points_removed += self.store.delete_by_file_name(file_name).await?;
        tracing::info!(file_name, files = files.len(), points_removed, "deleted document");
        Ok(DeleteAck {
            file_name: file_name.to_owned(),
            points_removed,
        })
    }

    /// Remove the chunks of a file that no longer exists.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn remove_file(&self, path: &Path) -> Result<u64> {
        let lock = self.path_lock(path);
        let result = {
            let _guard = lock.lock().await;
            self.remove_locked(path).await
        };
        self.drop_path_lock(path, lock);
        result
    }

    async fn remove_locked(&self, path: &Path) -> Result<u64> {
        let removed = self.drop_file_points(path).await?;
        for hash in self.dedup.retain_references(path, &HashSet::new()) {
            let files = self.dedup.references(&hash);
            self.store.set_shared_with(&hash, &files).await?;
        }
        Ok(removed)
    }

    /// Every indexed file with its chunk count, sorted by path.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn list_files(&self) -> Result<Vec<IndexedFile>> {
        Ok(self.store.indexed_files().await?)
    }

    /// Remove every chunk of every file and forget all deduplication state.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn clear(&self) -> Result<ClearAck> {
        let points_removed = self.store.clear().await?;
        self.dedup.clear();
        Ok(ClearAck {
            collection: self.store.collection().to_owned(),
            points_removed,
        })
    }

    /// # Errors
    ///
    /// Returns the store error.
    pub async fn collection_info(&self) -> Result<CollectionInfo> {
        Ok(self.store.info().await?)
    }

    fn path_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    fn drop_path_lock(&self, path: &Path, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map plus ours: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::time::Duration;

    use technicia_llm::mock::MockProvider;
    use technicia_memory::document::{DocumentError, LoadedDocument, SplitterConfig};
    use technicia_memory::{Distance, EmbedConfig, InMemoryVectorStore};

    use super::*;

    /// Serves the file's bytes as UTF-8 text, pages separated by form feeds.
    struct TextLoader;

    impl DocumentLoader for TextLoader {
        fn load(
            &self,
            path: &Path,
        ) -> Pin<
            Box<
                dyn std::future::Future<Output = std::result::Result<LoadedDocument, DocumentError>>
                    + Send
                    + '_,
            >,
        > {
            let path = path.to_path_buf();
            Box::pin(async move {
                let text = tokio::fs::read_to_string(&path).await?;
                let pages: Vec<String> = text.split('\u{c}').map(str::to_owned).collect();
                Ok(LoadedDocument {
                    metadata: DocumentMetadata {
                        file_name: path.file_name().unwrap().to_string_lossy().into_owned(),
                        file_path: path,
                        title: None,
                        author: None,
                        page_count: pages.len(),
                        content_type: "text/plain".into(),
                    },
                    pages,
                })
            })
        }

        fn supported_extensions(&self) -> &[&str] {
            &["pdf"]
        }
    }

    fn indexer(provider: MockProvider) -> (Arc<MockProvider>, DocumentIndexer<MockProvider>) {
        indexer_with(provider, InMemoryVectorStore::new())
    }

    fn indexer_with(
        provider: MockProvider,
        backend: InMemoryVectorStore,
    ) -> (Arc<MockProvider>, DocumentIndexer<MockProvider>) {
        let provider = Arc::new(provider);
        let gateway = EmbeddingGateway::new(
            Arc::clone(&provider),
            EmbedConfig {
                batch_size: 2,
                batch_delay: Duration::ZERO,
                dimensions: 4,
                timeout: Duration::from_secs(5),
                max_retries: 0,
                retry_backoff: Duration::ZERO,
            },
        );
        let store = DocumentStore::new(Arc::new(backend), "docs", 4, Distance::Cosine);
        let splitter = TextSplitter::try_new(SplitterConfig {
            chunk_size: 40,
            chunk_overlap: 0,
        })
        .unwrap();
        let indexer = DocumentIndexer::new(
            Box::new(TextLoader),
            splitter,
            gateway,
            store,
            Arc::new(DedupIndex::new()),
        );
        (provider, indexer)
    }

    #[tokio::test]
    async fn unchanged_file_is_success_with_zero_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pdf");
        std::fs::write(&path, "Torque spec is 45 Nm. Check it twice.").unwrap();
        let (provider, indexer) = indexer(MockProvider::default());
        indexer.prepare().await.unwrap();

        let first = indexer.index_document(&path).await;
        assert!(first.is_success());
        assert!(first.chunks_processed > 0);
        let calls = provider.embed_calls();

        let second = indexer.index_document(&path).await;
        assert_eq!(second.status, IndexStatus::Success);
        assert!(second.unchanged);
        assert_eq!(second.chunks_processed, 0);
        assert_eq!(provider.embed_calls(), calls);
    }

    #[tokio::test]
    async fn missing_file_is_reported_not_raised() {
        let (_, indexer) = indexer(MockProvider::default());
        let outcome = indexer.index_document(Path::new("/nope/missing.pdf")).await;
        assert_eq!(outcome.status, IndexStatus::Error);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Input));
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn duplicate_chunks_across_files_are_embedded_once() {
        let dir = tempfile::tempdir().unwrap();
        let boilerplate = "Safety notice: disconnect power first.";
        std::fs::write(dir.path().join("a.pdf"), boilerplate).unwrap();
        std::fs::write(dir.path().join("b.pdf"), boilerplate).unwrap();
        let (provider, indexer) = indexer(MockProvider::default());
        indexer.prepare().await.unwrap();

        let report = indexer.index_directory(dir.path()).await.unwrap();
        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.chunks_processed, 1);
        assert_eq!(report.results[1].chunks_skipped, 1);
        assert_eq!(provider.embedded_texts(), 1);
        assert_eq!(indexer.store().point_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn modified_file_replaces_old_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pdf");
        std::fs::write(&path, "Old torque value is 30 Nm.").unwrap();
        let (_, indexer) = indexer(MockProvider::default());
        indexer.prepare().await.unwrap();
        indexer.index_document(&path).await;

        std::fs::write(&path, "New torque value is 45 Nm, revised.").unwrap();
        let outcome = indexer.index_document(&path).await;
        assert!(outcome.is_success());
        assert!(!outcome.unchanged);
        assert_eq!(indexer.store().point_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failing_batch_keeps_earlier_chunks_and_reports_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.pdf");
        let text = (0..6)
            .map(|i| format!("Section {i} has its own unique body text."))
            .collect::<Vec<_>>()
            .join(" ");
        std::fs::write(&path, text).unwrap();
        let (_, indexer) = indexer(MockProvider::default().fail_embed_on_call(2));
        indexer.prepare().await.unwrap();

        let outcome = indexer.index_document(&path).await;
        assert_eq!(outcome.status, IndexStatus::Partial);
        assert_eq!(outcome.chunks_processed, 2);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Provider));
        assert_eq!(indexer.store().point_count().await.unwrap(), 2);

        // The incomplete version is retried on the next run.
        assert!(indexer.dedup().file_signature(&path).is_none());
    }

    #[tokio::test]
    async fn delete_by_filename_forgets_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manual.pdf");
        std::fs::write(&path, "Keep pressure below 200 bar.").unwrap();
        let (provider, indexer) = indexer(MockProvider::default());
        indexer.prepare().await.unwrap();
        indexer.index_document(&path).await;

        let ack = indexer.delete_by_filename("manual.pdf").await.unwrap();
        assert_eq!(ack.points_removed, 1);
        assert_eq!(indexer.store().point_count().await.unwrap(), 0);

        let calls = provider.embed_calls();
        let again = indexer.index_document(&path).await;
        assert_eq!(again.chunks_processed, 1);
        assert!(provider.embed_calls() > calls);
    }

    #[tokio::test]
    async fn remove_file_drops_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pdf");
        std::fs::write(&path, "Bearing clearance 0.05 mm.").unwrap();
        let (_, indexer) = indexer(MockProvider::default());
        indexer.prepare().await.unwrap();
        indexer.index_document(&path).await;

        assert_eq!(indexer.remove_file(&path).await.unwrap(), 1);
        assert!(indexer.dedup().is_empty());
    }

    #[tokio::test]
    async fn shared_chunk_moves_to_other_file_when_owner_changes() {
        let dir = tempfile::tempdir().unwrap();
        let boilerplate = "Safety notice: disconnect power first.";
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("b.pdf");
        std::fs::write(&a, boilerplate).unwrap();
        std::fs::write(&b, boilerplate).unwrap();
        let (_, indexer) = indexer(MockProvider::default());
        indexer.prepare().await.unwrap();
        indexer.index_directory(dir.path()).await.unwrap();

        std::fs::write(&a, "Completely different wording now.").unwrap();
        let outcome = indexer.index_document(&a).await;
        assert!(outcome.is_success());
        assert!(indexer.index_document(&b).await.unchanged);

        assert_eq!(indexer.store().point_count().await.unwrap(), 2);
        let hits = indexer.store().search(vec![1.0, 0.0, 0.0, 0.0], 5, -1.0).await.unwrap();
        let shared = hits
            .iter()
            .find(|h| h.payload.text.contains("Safety notice"))
            .unwrap();
        assert_eq!(shared.payload.file_name, "b.pdf");
        assert!(shared.payload.shared_with.is_empty());
    }

    #[tokio::test]
    async fn shared_chunk_survives_owner_change_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let boilerplate = "Safety notice: disconnect power first.";
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("b.pdf");
        std::fs::write(&a, boilerplate).unwrap();
        std::fs::write(&b, boilerplate).unwrap();
        let (_, indexer) = indexer(MockProvider::default());
        indexer.prepare().await.unwrap();
        indexer.index_directory(dir.path()).await.unwrap();

        // Only what the store holds survives a restart.
        indexer.dedup().clear();
        indexer.prepare().await.unwrap();
        let stored = indexer.store().indexed_chunks().await.unwrap();
        assert_eq!(indexer.dedup().references(&stored[0].content_hash), [b.clone()]);

        std::fs::write(&a, "Completely different wording now.").unwrap();
        assert!(indexer.index_document(&a).await.is_success());
        let files = indexer.list_files().await.unwrap();
        let names: Vec<_> = files.iter().map(|f| (f.file_name.as_str(), f.chunks)).collect();
        assert_eq!(names, [("a.pdf", 1), ("b.pdf", 1)]);
    }

    #[tokio::test]
    async fn removing_the_owner_keeps_shared_chunk_for_other_file() {
        let dir = tempfile::tempdir().unwrap();
        let boilerplate = "Safety notice: disconnect power first.";
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("b.pdf");
        std::fs::write(&a, format!("{boilerplate}\u{c}Only in a, page two.")).unwrap();
        std::fs::write(&b, boilerplate).unwrap();
        let (_, indexer) = indexer(MockProvider::default());
        indexer.prepare().await.unwrap();
        indexer.index_directory(dir.path()).await.unwrap();
        assert_eq!(indexer.store().point_count().await.unwrap(), 2);

        let ack = indexer.delete_by_filename("a.pdf").await.unwrap();
        assert_eq!(ack.points_removed, 1);
        let files = indexer.list_files().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_path, b);
        assert_eq!(files[0].chunks, 1);

        assert_eq!(indexer.remove_file(&b).await.unwrap(), 1);
        assert_eq!(indexer.store().point_count().await.unwrap(), 0);
        assert!(indexer.dedup().is_empty());
    }

    #[tokio::test]
    async fn failed_upsert_leaves_file_unstamped_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.pdf");
        let text = (0..100)
            .map(|i| format!("Section {i:03} has its own unique body."))
            .collect::<Vec<_>>()
            .join(" ");
        std::fs::write(&path, text).unwrap();
        let (_, indexer) = indexer_with(
            MockProvider::default(),
            InMemoryVectorStore::new().fail_upsert_on_call(2),
        );
        indexer.prepare().await.unwrap();

        let outcome = indexer.index_document(&path).await;
        assert_eq!(outcome.status, IndexStatus::Partial);
        assert_eq!(outcome.chunks_processed, UPSERT_BATCH);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Provider));
        assert!(indexer.dedup().file_signature(&path).is_none());
        let signature = FileSignature::of(&path).await.unwrap();
        assert!(!indexer.store().exists_by_signature(&path, &signature).await.unwrap());

        let retry = indexer.index_document(&path).await;
        assert!(!retry.unchanged);
        assert_eq!(retry.status, IndexStatus::Success);
        assert!(retry.chunks_processed > UPSERT_BATCH);
        assert!(indexer.store().exists_by_signature(&path, &signature).await.unwrap());
    }

    #[tokio::test]
    async fn chunk_released_by_failed_run_is_indexed_by_waiting_file() {
        let dir = tempfile::tempdir().unwrap();
        let boilerplate = "Safety notice: disconnect power first.";
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("b.pdf");
        std::fs::write(&a, boilerplate).unwrap();
        std::fs::write(&b, boilerplate).unwrap();
        // Whichever file claims the chunk first fails to embed it.
        let (provider, indexer) =
            indexer(MockProvider::default().fail_embed_on_call(1).with_delay(200));
        indexer.prepare().await.unwrap();

        let (first, second) = tokio::join!(indexer.index_document(&a), indexer.index_document(&b));
        let mut statuses = [first.status, second.status];
        statuses.sort_by_key(|s| *s == IndexStatus::Success);
        assert_eq!(statuses, [IndexStatus::Error, IndexStatus::Success]);
        assert_eq!(first.chunks_processed + second.chunks_processed, 1);
        assert_eq!(provider.embedded_texts(), 1);
        assert_eq!(indexer.store().point_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_files_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.pdf"), "Bearing clearance 0.05 mm.").unwrap();
        std::fs::write(dir.path().join("b.pdf"), "Keep pressure below 200 bar.").unwrap();
        let (provider, indexer) = indexer(MockProvider::default());
        indexer.prepare().await.unwrap();
        indexer.index_directory(dir.path()).await.unwrap();

        let files = indexer.list_files().await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, ["a.pdf", "b.pdf"]);

        let ack = indexer.clear().await.unwrap();
        assert_eq!(ack.points_removed, 2);
        assert_eq!(ack.collection, "docs");
        assert!(indexer.list_files().await.unwrap().is_empty());
        assert!(indexer.dedup().is_empty());

        let calls = provider.embed_calls();
        let report = indexer.index_directory(dir.path()).await.unwrap();
        assert_eq!(report.files_unchanged, 0);
        assert!(provider.embed_calls() > calls);
    }

    #[tokio::test]
    async fn path_locks_are_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pdf");
        std::fs::write(&path, "x").unwrap();
        let (_, indexer) = indexer(MockProvider::default());
        indexer.prepare().await.unwrap();
        indexer.index_document(&path).await;
        assert!(indexer.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn supported_files_filters_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.pdf"), "").unwrap();
        std::fs::write(dir.path().join("sub/b.PDF"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        let files = supported_files(dir.path(), |p| TextLoader.supports(p));
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.pdf", "b.PDF"]);
    }
}
