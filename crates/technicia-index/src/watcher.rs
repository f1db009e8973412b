//! Directory watcher that keeps the index in sync with the files on disk.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use technicia_llm::EmbeddingProvider;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::indexer::{DocumentIndexer, IndexOutcome, IndexStatus, supported_files};

/// What the watcher drives. Implemented by [`DocumentIndexer`].
pub trait Reindexer: Send + Sync + 'static {
    fn reindex(&self, path: &Path) -> impl Future<Output = IndexOutcome> + Send;

    /// Called for a queued path that no longer exists.
    fn remove(&self, path: &Path) -> impl Future<Output = ()> + Send;

    fn accepts(&self, path: &Path) -> bool;
}

impl<E: EmbeddingProvider + 'static> Reindexer for DocumentIndexer<E> {
    fn reindex(&self, path: &Path) -> impl Future<Output = IndexOutcome> + Send {
        self.index_document(path)
    }

    fn remove(&self, path: &Path) -> impl Future<Output = ()> + Send {
        async move {
            match self.remove_file(path).await {
                Ok(n) => tracing::info!(file = %path.display(), removed = n, "file deleted, chunks removed"),
                Err(e) => tracing::warn!(file = %path.display(), error = %e, "failed to remove chunks"),
            }
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        self.loader().supports(path)
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period after the last event for a path before it is processed.
    pub settle_delay: Duration,
    pub queue_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            queue_capacity: 256,
        }
    }
}

/// FIFO of paths waiting to be processed; a path is queued at most once.
#[derive(Debug, Default)]
struct ReindexQueue {
    order: VecDeque<PathBuf>,
    queued: HashSet<PathBuf>,
}

impl ReindexQueue {
    fn push(&mut self, path: PathBuf) -> bool {
        if !self.queued.insert(path.clone()) {
            return false;
        }
        self.order.push_back(path);
        true
    }

    fn pop(&mut self) -> Option<PathBuf> {
        let path = self.order.pop_front()?;
        self.queued.remove(&path);
        Some(path)
    }
}

pub struct IndexWatcher {
    handle: tokio::task::JoinHandle<()>,
}

impl IndexWatcher {
    /// Watch `root` recursively. Files already present are queued first.
    ///
    /// The debouncer thread only forwards paths; a single task processes them one at a time.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` cannot be created or the filesystem watcher cannot be initialized.
    pub fn start<R: Reindexer>(root: &Path, reindexer: Arc<R>, config: &WatcherConfig) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let (notify_tx, mut notify_rx) = mpsc::channel::<PathBuf>(config.queue_capacity.max(1));

        let filter = Arc::clone(&reindexer);
        let mut debouncer = new_debouncer(
            config.settle_delay,
            move |events: std::result::Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
                let events = match events {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!("index watcher error: {e}");
                        return;
                    }
                };

                // `AnyContinuous` means the file is still being written.
                let paths: HashSet<PathBuf> = events
                    .into_iter()
                    .filter(|e| e.kind == DebouncedEventKind::Any && filter.accepts(&e.path))
                    .map(|e| e.path)
                    .collect();

                for path in paths {
                    if notify_tx.blocking_send(path).is_err() {
                        return;
                    }
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(root, notify::RecursiveMode::Recursive)?;

        let mut queue = ReindexQueue::default();
        let queued = enqueue_existing(root, reindexer.as_ref(), &mut queue);
        tracing::info!(root = %root.display(), queued, "watching for changes");

        let handle = tokio::spawn(async move {
            let _debouncer = debouncer;

            loop {
                while let Ok(path) = notify_rx.try_recv() {
                    queue.push(path);
                }
                let Some(path) = queue.pop() else {
                    match notify_rx.recv().await {
                        Some(path) => {
                            queue.push(path);
                            continue;
                        }
                        None => break,
                    }
                };
                process(reindexer.as_ref(), &path).await;
            }
        });

        Ok(Self { handle })
    }

    /// Stop watching. A reindex in progress is cancelled at its next suspension point.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

/// Queue the files already under `root`, as if each had just been created.
fn enqueue_existing<R: Reindexer>(root: &Path, reindexer: &R, queue: &mut ReindexQueue) -> usize {
    supported_files(root, |p| reindexer.accepts(p))
        .into_iter()
        .filter(|path| queue.push(path.clone()))
        .count()
}

async fn process<R: Reindexer>(reindexer: &R, path: &Path) {
    if let Ok(false) = tokio::fs::try_exists(path).await {
        reindexer.remove(path).await;
        return;
    }
    let outcome = reindexer.reindex(path).await;
    match outcome.status {
        IndexStatus::Success if outcome.unchanged => {
            tracing::debug!(file = %path.display(), "unchanged");
        }
        IndexStatus::Success => {
            tracing::info!(file = %path.display(), chunks = outcome.chunks_processed, "reindexed");
        }
        IndexStatus::Superseded => {
            tracing::debug!(file = %path.display(), "superseded by a newer change");
        }
        IndexStatus::Partial | IndexStatus::Error => {
            tracing::warn!(
                file = %path.display(),
                chunks = outcome.chunks_processed,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "reindex incomplete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeReindexer {
        /// (file name, content at reindex time)
        reindexed: Mutex<Vec<(String, String)>>,
        removed: Mutex<Vec<String>>,
    }

    fn name_of(path: &Path) -> String {
        path.file_name().unwrap().to_string_lossy().into_owned()
    }

    impl FakeReindexer {
        fn reindexed(&self) -> Vec<(String, String)> {
            self.reindexed.lock().unwrap().clone()
        }

        fn removed(&self) -> Vec<String> {
            self.removed.lock().unwrap().clone()
        }
    }

    impl Reindexer for FakeReindexer {
        async fn reindex(&self, path: &Path) -> IndexOutcome {
            let content = std::fs::read_to_string(path).unwrap_or_default();
            self.reindexed
                .lock()
                .unwrap()
                .push((name_of(path), content));
            IndexOutcome {
                status: IndexStatus::Success,
                file: path.to_path_buf(),
                chunks_processed: 1,
                chunks_skipped: 0,
                unchanged: false,
                metadata: None,
                error: None,
                error_kind: None,
            }
        }

        async fn remove(&self, path: &Path) {
            self.removed.lock().unwrap().push(name_of(path));
        }

        fn accepts(&self, path: &Path) -> bool {
            path.extension().is_some_and(|e| e == "pdf")
        }
    }

    fn config() -> WatcherConfig {
        WatcherConfig {
            settle_delay: Duration::from_millis(200),
            queue_capacity: 16,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[test]
    fn queue_holds_each_path_once() {
        let mut q = ReindexQueue::default();
        assert!(q.push(PathBuf::from("/a.pdf")));
        assert!(!q.push(PathBuf::from("/a.pdf")));
        assert!(q.push(PathBuf::from("/b.pdf")));
        assert_eq!(q.pop(), Some(PathBuf::from("/a.pdf")));
        // Popped paths can be queued again.
        assert!(q.push(PathBuf::from("/a.pdf")));
        assert_eq!(q.pop(), Some(PathBuf::from("/b.pdf")));
        assert_eq!(q.pop(), Some(PathBuf::from("/a.pdf")));
        assert_eq!(q.pop(), None);
    }

    #[tokio::test]
    async fn start_creates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested/docs");
        let watcher = IndexWatcher::start(&root, Arc::new(FakeReindexer::default()), &config());
        assert!(watcher.is_ok());
        assert!(root.is_dir());
        watcher.unwrap().shutdown();
    }

    #[tokio::test]
    async fn existing_files_are_queued_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.pdf"), "a").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "n").unwrap();
        let fake = Arc::new(FakeReindexer::default());
        let watcher = IndexWatcher::start(dir.path(), Arc::clone(&fake), &config()).unwrap();

        wait_until(|| !fake.reindexed().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let names: Vec<_> = fake.reindexed().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["a.pdf"]);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn rapid_writes_yield_one_reindex_with_final_content() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeReindexer::default());
        let watcher = IndexWatcher::start(dir.path(), Arc::clone(&fake), &config()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let path = dir.path().join("c.pdf");
        std::fs::write(&path, "first draft").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        std::fs::write(&path, "final content").unwrap();

        wait_until(|| !fake.reindexed().is_empty()).await;
        // Well past the settle delay: no second run shows up.
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(
            fake.reindexed(),
            [("c.pdf".to_owned(), "final content".to_owned())]
        );
        watcher.shutdown();
    }

    #[tokio::test]
    async fn deleted_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.pdf");
        std::fs::write(&path, "d").unwrap();
        let fake = Arc::new(FakeReindexer::default());
        let watcher = IndexWatcher::start(dir.path(), Arc::clone(&fake), &config()).unwrap();
        wait_until(|| !fake.reindexed().is_empty()).await;

        std::fs::remove_file(&path).unwrap();
        wait_until(|| !fake.removed().is_empty()).await;
        assert_eq!(fake.removed(), ["d.pdf"]);
        watcher.shutdown();
    }

    #[tokio::test]
    async fn ignores_unsupported_files() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeReindexer::default());
        let watcher = IndexWatcher::start(dir.path(), Arc::clone(&fake), &config()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        std::fs::write(dir.path().join("readme.md"), "x").unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(fake.reindexed().is_empty());
        watcher.shutdown();
    }
}
