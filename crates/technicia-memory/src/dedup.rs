//! Content-hash and file-signature bookkeeping shared by every indexing task.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::document::FileSignature;
use crate::store::{ChunkPayload, DocumentStore};
use crate::vector_store::VectorStoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum HashState {
    /// Reserved by a task that has not finished upserting it yet.
    Pending(PathBuf),
    Indexed(PathBuf),
}

/// Files other than the owner that contain a chunk, with the payload each would
/// store for it. The payload is unknown for references loaded from the store.
type References = BTreeMap<PathBuf, Option<ChunkPayload>>;

#[derive(Debug, Default)]
struct Inner {
    hashes: HashMap<String, HashState>,
    refs: HashMap<String, References>,
    signatures: HashMap<PathBuf, FileSignature>,
}

/// Result of [`DedupIndex::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns the hash and must `commit` or `release` it.
    Acquired,
    /// Stored for another file; record a reference instead.
    AlreadyIndexed,
    /// The same file already holds the hash, e.g. repeated text within one document.
    SameFile,
    /// Another task holds the hash; wait for it with [`DedupIndex::settled`].
    InFlight,
}

/// A stored chunk that must change owner before its current owner's points are deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct Handoff {
    pub content_hash: String,
    pub owner: PathBuf,
    pub payload: Option<ChunkPayload>,
    pub shared_with: Vec<PathBuf>,
}

/// Global (cross-document) deduplication index.
///
/// Created once at startup and shared as `Arc<DedupIndex>`. The lock is never held
/// across an `.await`, so two tasks can never both decide a hash is new.
///
/// Each stored chunk has one owning file; every other file containing the same
/// text is kept as a reference so the chunk can move to it when the owner goes away.
#[derive(Debug, Default)]
pub struct DedupIndex {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl DedupIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Whether `hash` is indexed or being indexed.
    #[must_use]
    pub fn seen(&self, hash: &str) -> bool {
        self.lock().hashes.contains_key(hash)
    }

    pub fn record(&self, hash: impl Into<String>, file: &Path) {
        self.lock()
            .hashes
            .insert(hash.into(), HashState::Indexed(file.to_path_buf()));
        self.changed.notify_waiters();
    }

    /// Atomically check and reserve `hash` for `file`.
    pub fn claim(&self, hash: &str, file: &Path) -> Claim {
        let mut inner = self.lock();
        match inner.hashes.get(hash) {
            Some(HashState::Indexed(f) | HashState::Pending(f)) if f == file => Claim::SameFile,
            Some(HashState::Indexed(_)) => Claim::AlreadyIndexed,
            Some(HashState::Pending(_)) => Claim::InFlight,
            None => {
                inner
                    .hashes
                    .insert(hash.to_owned(), HashState::Pending(file.to_path_buf()));
                Claim::Acquired
            }
        }
    }

    /// Mark claimed hashes as durably indexed.
    pub fn commit<'a>(&self, hashes: impl IntoIterator<Item = &'a str>) {
        let mut inner = self.lock();
        for hash in hashes {
            if let Some(state) = inner.hashes.get_mut(hash)
                && let HashState::Pending(file) = state
            {
                let file = std::mem::take(file);
                *state = HashState::Indexed(file);
            }
        }
        drop(inner);
        self.changed.notify_waiters();
    }

    /// Drop pending claims so another run can pick the hashes up.
    pub fn release<'a>(&self, hashes: impl IntoIterator<Item = &'a str>) {
        let mut inner = self.lock();
        for hash in hashes {
            if matches!(inner.hashes.get(hash), Some(HashState::Pending(_))) {
                inner.hashes.remove(hash);
            }
        }
        drop(inner);
        self.changed.notify_waiters();
    }

    /// Wait until no task holds a claim on `hash`.
    ///
    /// Returns the owning file once the hash is indexed, or `None` when the claim
    /// was released and the hash is free to claim again.
    pub async fn settled(&self, hash: &str) -> Option<PathBuf> {
        loop {
            let notified = self.changed.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();
            let state = self.lock().hashes.get(hash).cloned();
            match state {
                Some(HashState::Indexed(file)) => return Some(file),
                None => return None,
                Some(HashState::Pending(_)) => notified.await,
            }
        }
    }

    /// Owning file of an indexed hash.
    #[must_use]
    pub fn owner(&self, hash: &str) -> Option<PathBuf> {
        match self.lock().hashes.get(hash) {
            Some(HashState::Indexed(file)) => Some(file.clone()),
            _ => None,
        }
    }

    /// Note that the file in `payload` also contains the chunk with `hash`.
    pub fn add_reference(&self, hash: &str, payload: ChunkPayload) {
        let file = PathBuf::from(&payload.file_path);
        self.lock()
            .refs
            .entry(hash.to_owned())
            .or_default()
            .insert(file, Some(payload));
    }

    /// Files other than the owner that contain the chunk with `hash`.
    #[must_use]
    pub fn references(&self, hash: &str) -> Vec<PathBuf> {
        self.lock()
            .refs
            .get(hash)
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every reference `file` holds except those in `keep`.
    ///
    /// Returns the hashes whose reference list changed.
    pub fn retain_references(&self, file: &Path, keep: &HashSet<String>) -> Vec<String> {
        let mut inner = self.lock();
        let mut changed = Vec::new();
        inner.refs.retain(|hash, refs| {
            if !keep.contains(hash) && refs.remove(file).is_some() {
                changed.push(hash.clone());
            }
            !refs.is_empty()
        });
        changed
    }

    /// Chunks owned by `file` that another file also contains, with the file each
    /// should move to. Nothing changes until [`DedupIndex::hand_off`].
    #[must_use]
    pub fn plan_handoff(&self, file: &Path) -> Vec<Handoff> {
        let inner = self.lock();
        let mut plan: Vec<Handoff> = inner
            .hashes
            .iter()
            .filter(|(_, state)| matches!(state, HashState::Indexed(f) if f == file))
            .filter_map(|(hash, _)| {
                let refs = inner.refs.get(hash)?;
                let mut candidates = refs.iter().filter(|(f, _)| f.as_path() != file);
                let (owner, payload) = candidates.next()?;
                Some(Handoff {
                    content_hash: hash.clone(),
                    owner: owner.clone(),
                    payload: payload.clone(),
                    shared_with: candidates.map(|(f, _)| f.clone()).collect(),
                })
            })
            .collect();
        plan.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
        plan
    }

    /// Apply handoffs whose points have been moved in the store.
    pub fn hand_off(&self, handoffs: &[Handoff]) {
        let mut inner = self.lock();
        for handoff in handoffs {
            inner.hashes.insert(
                handoff.content_hash.clone(),
                HashState::Indexed(handoff.owner.clone()),
            );
            if let Some(refs) = inner.refs.get_mut(&handoff.content_hash) {
                refs.remove(&handoff.owner);
                if refs.is_empty() {
                    inner.refs.remove(&handoff.content_hash);
                }
            }
        }
        drop(inner);
        self.changed.notify_waiters();
    }

    #[must_use]
    pub fn file_signature(&self, file: &Path) -> Option<FileSignature> {
        self.lock().signatures.get(file).cloned()
    }

    pub fn set_file_signature(&self, file: &Path, signature: FileSignature) {
        self.lock()
            .signatures
            .insert(file.to_path_buf(), signature);
    }

    /// Forget everything `file` owns. Pending claims of running tasks are kept.
    pub fn forget_file(&self, file: &Path) {
        let mut inner = self.lock();
        inner.signatures.remove(file);
        let Inner { hashes, refs, .. } = &mut *inner;
        hashes.retain(|hash, state| {
            let owned = matches!(state, HashState::Indexed(f) if f == file);
            if owned {
                refs.remove(hash);
            }
            !owned
        });
        drop(inner);
        self.changed.notify_waiters();
    }

    /// Every known file whose final path component equals `name`, sorted.
    #[must_use]
    pub fn files_named(&self, name: &str) -> Vec<PathBuf> {
        let inner = self.lock();
        let owners = inner.hashes.values().map(|state| match state {
            HashState::Indexed(f) | HashState::Pending(f) => f,
        });
        let referencing = inner.refs.values().flat_map(BTreeMap::keys);
        let mut files: Vec<PathBuf> = owners
            .chain(referencing)
            .chain(inner.signatures.keys())
            .filter(|f| f.file_name().is_some_and(|n| n == name))
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        files.sort();
        files
    }

    /// Forget everything, including pending claims.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.hashes.clear();
        inner.refs.clear();
        inner.signatures.clear();
        drop(inner);
        self.changed.notify_waiters();
    }

    /// Replace the in-memory state with what the store holds.
    ///
    /// # Errors
    ///
    /// Returns the store error if the scroll fails; the current state is kept.
    pub async fn rebuild(&self, store: &DocumentStore) -> Result<usize, VectorStoreError> {
        let chunks = store.indexed_chunks().await?;
        let mut inner = self.lock();
        inner.hashes.clear();
        inner.refs.clear();
        inner.signatures.clear();
        for chunk in chunks {
            if let Some(sig) = chunk.file_signature {
                inner
                    .signatures
                    .insert(chunk.file_path.clone(), FileSignature::from_hex(sig));
            }
            if !chunk.shared_with.is_empty() {
                inner.refs.insert(
                    chunk.content_hash.clone(),
                    chunk.shared_with.into_iter().map(|f| (f, None)).collect(),
                );
            }
            inner
                .hashes
                .insert(chunk.content_hash, HashState::Indexed(chunk.file_path));
        }
        tracing::info!(
            hashes = inner.hashes.len(),
            shared = inner.refs.len(),
            files = inner.signatures.len(),
            "dedup index rebuilt"
        );
        Ok(inner.hashes.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().hashes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn record_then_seen() {
        let idx = DedupIndex::new();
        assert!(!idx.seen("h1"));
        idx.record("h1", Path::new("/a.pdf"));
        assert!(idx.seen("h1"));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn claim_is_exclusive_until_released() {
        let idx = DedupIndex::new();
        let a = Path::new("/a.pdf");
        let b = Path::new("/b.pdf");
        assert_eq!(idx.claim("h", a), Claim::Acquired);
        assert_eq!(idx.claim("h", b), Claim::InFlight);
        idx.release(["h"]);
        assert_eq!(idx.claim("h", b), Claim::Acquired);
        idx.commit(["h"]);
        assert_eq!(idx.claim("h", a), Claim::AlreadyIndexed);
    }

    #[test]
    fn release_does_not_drop_committed_hashes() {
        let idx = DedupIndex::new();
        idx.record("h", Path::new("/a.pdf"));
        idx.release(["h"]);
        assert!(idx.seen("h"));
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let idx = Arc::new(DedupIndex::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let idx = Arc::clone(&idx);
                std::thread::spawn(move || {
                    let file = PathBuf::from(format!("/doc{i}.pdf"));
                    idx.claim("shared", &file)
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|c| *c == Claim::Acquired)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn forget_file_only_touches_that_file() {
        let idx = DedupIndex::new();
        let a = Path::new("/docs/a.pdf");
        let b = Path::new("/docs/b.pdf");
        idx.record("ha", a);
        idx.record("hb", b);
        idx.set_file_signature(a, FileSignature::from_hex("sa"));
        idx.set_file_signature(b, FileSignature::from_hex("sb"));

        idx.forget_file(a);
        assert!(!idx.seen("ha"));
        assert!(idx.seen("hb"));
        assert!(idx.file_signature(a).is_none());
        assert_eq!(idx.file_signature(b), Some(FileSignature::from_hex("sb")));
    }

    #[test]
    fn forget_file_keeps_pending_claims() {
        let idx = DedupIndex::new();
        let a = Path::new("/docs/a.pdf");
        assert_eq!(idx.claim("h", a), Claim::Acquired);
        idx.forget_file(a);
        assert_eq!(idx.claim("h", a), Claim::SameFile);
        assert_eq!(idx.claim("h", Path::new("/docs/b.pdf")), Claim::InFlight);
    }

    fn reference(file: &str, hash: &str) -> ChunkPayload {
        ChunkPayload {
            file_path: file.into(),
            file_name: Path::new(file)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned(),
            title: None,
            author: None,
            doc_type: "pdf".into(),
            page_count: 1,
            page: 1,
            chunk_index: 0,
            content_hash: hash.into(),
            file_signature: String::new(),
            text: "shared".into(),
            indexed_at: "2026-01-01T00:00:00.000000Z".into(),
            shared_with: Vec::new(),
        }
    }

    #[test]
    fn repeated_text_in_one_file_is_same_file() {
        let idx = DedupIndex::new();
        let a = Path::new("/docs/a.pdf");
        assert_eq!(idx.claim("h", a), Claim::Acquired);
        assert_eq!(idx.claim("h", a), Claim::SameFile);
        idx.commit(["h"]);
        assert_eq!(idx.claim("h", a), Claim::SameFile);
    }

    #[test]
    fn handoff_moves_ownership_to_first_reference() {
        let idx = DedupIndex::new();
        let a = Path::new("/docs/a.pdf");
        idx.record("shared", a);
        idx.record("own", a);
        idx.add_reference("shared", reference("/docs/c.pdf", "shared"));
        idx.add_reference("shared", reference("/docs/b.pdf", "shared"));

        let plan = idx.plan_handoff(a);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].content_hash, "shared");
        assert_eq!(plan[0].owner, PathBuf::from("/docs/b.pdf"));
        assert_eq!(plan[0].shared_with, [PathBuf::from("/docs/c.pdf")]);
        assert!(plan[0].payload.is_some());
        // Planning alone changes nothing.
        assert_eq!(idx.owner("shared"), Some(a.to_path_buf()));

        idx.hand_off(&plan);
        idx.forget_file(a);
        assert_eq!(idx.owner("shared"), Some(PathBuf::from("/docs/b.pdf")));
        assert_eq!(idx.references("shared"), [PathBuf::from("/docs/c.pdf")]);
        assert!(!idx.seen("own"));
    }

    #[test]
    fn retain_references_reports_dropped_hashes() {
        let idx = DedupIndex::new();
        let b = Path::new("/docs/b.pdf");
        idx.record("h1", Path::new("/docs/a.pdf"));
        idx.record("h2", Path::new("/docs/a.pdf"));
        idx.add_reference("h1", reference("/docs/b.pdf", "h1"));
        idx.add_reference("h2", reference("/docs/b.pdf", "h2"));

        let keep = HashSet::from(["h1".to_owned()]);
        assert_eq!(idx.retain_references(b, &keep), ["h2"]);
        assert_eq!(idx.references("h1"), [b.to_path_buf()]);
        assert!(idx.references("h2").is_empty());
        assert!(idx.retain_references(b, &keep).is_empty());
    }

    #[test]
    fn files_named_finds_owners_and_references() {
        let idx = DedupIndex::new();
        idx.record("h1", Path::new("/docs/x/manual.pdf"));
        idx.add_reference("h1", reference("/docs/y/manual.pdf", "h1"));
        idx.record("h2", Path::new("/docs/other.pdf"));
        assert_eq!(
            idx.files_named("manual.pdf"),
            [PathBuf::from("/docs/x/manual.pdf"), PathBuf::from("/docs/y/manual.pdf")]
        );
        idx.clear();
        assert!(idx.is_empty());
        assert!(idx.files_named("manual.pdf").is_empty());
    }

    #[tokio::test]
    async fn settled_waits_for_commit_or_release() {
        let idx = Arc::new(DedupIndex::new());
        let a = Path::new("/docs/a.pdf");
        assert_eq!(idx.claim("h1", a), Claim::Acquired);
        assert_eq!(idx.claim("h2", a), Claim::Acquired);

        let waiter = {
            let idx = Arc::clone(&idx);
            tokio::spawn(async move { (idx.settled("h1").await, idx.settled("h2").await) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        idx.commit(["h1"]);
        idx.release(["h2"]);
        let (h1, h2) = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(h1, Some(a.to_path_buf()));
        assert_eq!(h2, None);
    }

    #[tokio::test]
    async fn rebuild_restores_owners_and_references() {
        let store = DocumentStore::new(
            Arc::new(crate::InMemoryVectorStore::new()),
            "docs",
            2,
            crate::Distance::Cosine,
        );
        store.ensure_collection().await.unwrap();
        let mut shared = reference("/docs/a.pdf", "h1");
        shared.shared_with = vec!["/docs/b.pdf".into()];
        store
            .upsert_chunks(vec![(shared, vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .set_file_signature(Path::new("/docs/a.pdf"), &FileSignature::from_hex("sa"))
            .await
            .unwrap();

        let idx = DedupIndex::new();
        assert_eq!(idx.rebuild(&store).await.unwrap(), 1);
        assert_eq!(idx.owner("h1"), Some(PathBuf::from("/docs/a.pdf")));
        assert_eq!(idx.references("h1"), [PathBuf::from("/docs/b.pdf")]);
        assert_eq!(
            idx.file_signature(Path::new("/docs/a.pdf")),
            Some(FileSignature::from_hex("sa"))
        );
        assert_eq!(idx.file_signature(Path::new("/docs/b.pdf")), None);

        let plan = idx.plan_handoff(Path::new("/docs/a.pdf"));
        assert_eq!(plan[0].owner, PathBuf::from("/docs/b.pdf"));
        assert!(plan[0].payload.is_none());
    }
}
