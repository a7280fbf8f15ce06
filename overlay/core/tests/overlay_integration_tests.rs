// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end tests of the overlay engine over a real sled index and object
//! store in a temporary source directory.
//!
//! Covers versioning, history, renames, corruption handling, metadata
//! transaction failures, read-time views and restart persistence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use eidetic_core::application::context::MountContext;
use eidetic_core::application::license::LicenseStatus;
use eidetic_core::application::overlay_engine::{OverlayEngine, OverlayError};
use eidetic_core::domain::events::{EventPublisher, OverlayEvent};
use eidetic_core::domain::file::{FileId, FileKind, FileRecord, TagSet, TodoItem, Version, VersionId};
use eidetic_core::domain::index::{IndexError, IndexStats, MetadataIndex};
use eidetic_core::domain::job::{AnalysisJob, JobKey, JobOutcome, JobStatus};
use eidetic_core::domain::mount_config::MountSpec;
use eidetic_core::domain::views::{FetchError, LinkFetcher};
use eidetic_core::infrastructure::analyzers::builtin_analyzers;
use eidetic_core::infrastructure::image_convert::ImageFormatConverter;
use eidetic_core::infrastructure::sled_index::SledMetadataIndex;
use eidetic_core::infrastructure::storage::{LocalBlobStore, SourceTree};
use eidetic_core::infrastructure::web_fetch::HttpLinkFetcher;

// ============================================================================
// Helpers
// ============================================================================

#[derive(Default)]
struct RecordingPublisher {
    events: Mutex<Vec<OverlayEvent>>,
}

impl RecordingPublisher {
    fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(OverlayEvent::name).collect()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: OverlayEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Never answers; the view's timeout has to fire.
struct HangingFetcher;

#[async_trait]
impl LinkFetcher for HangingFetcher {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
        std::future::pending::<()>().await;
        Ok(Vec::new())
    }
}

fn fast_spec(dir: &TempDir) -> MountSpec {
    let mut spec = MountSpec::for_source(dir.path());
    spec.analysis.retry_backoff = Duration::from_millis(1);
    spec
}

async fn start_with(
    spec: MountSpec,
    events: Arc<dyn EventPublisher>,
    fetcher: Arc<dyn LinkFetcher>,
) -> Arc<OverlayEngine> {
    let ctx = MountContext::open(spec, None, LicenseStatus::free("test"), events)
        .await
        .unwrap();
    OverlayEngine::start(
        Arc::new(ctx),
        builtin_analyzers(),
        fetcher,
        Arc::new(ImageFormatConverter::new()),
    )
    .await
    .unwrap()
}

async fn start(dir: &TempDir) -> Arc<OverlayEngine> {
    start_with(
        fast_spec(dir),
        Arc::new(RecordingPublisher::default()),
        Arc::new(HttpLinkFetcher::new(Duration::from_secs(1)).unwrap()),
    )
    .await
}

async fn wait_for_todos(engine: &OverlayEngine, path: &str, version: VersionId) -> Vec<TodoItem> {
    for _ in 0..300 {
        if let Some(todos) = engine.todos(path, Some(version)).await.unwrap() {
            return todos;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("TODO extraction for {}@{} never finished", path, version);
}

async fn wait_for_tag(engine: &OverlayEngine, path: &str, tag: &str) -> TagSet {
    for _ in 0..300 {
        let tags = engine.tags(path).await.unwrap();
        if tags.contains(tag) {
            return tags;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} was never tagged {}", path, tag);
}

// ============================================================================
// Versioning
// ============================================================================

#[tokio::test]
async fn test_todos_are_tracked_per_version() {
    let dir = TempDir::new().unwrap();
    let engine = start(&dir).await;

    let v1 = engine.write_all("/notes.txt", b"TODO: ship it").await.unwrap();
    assert_eq!(v1.id, VersionId(1));
    let todos = wait_for_todos(&engine, "/notes.txt", v1.id).await;
    assert_eq!(todos.len(), 1);
    assert_eq!(todos[0].text, "ship it");

    let v2 = engine.write_all("/notes.txt", b"all done").await.unwrap();
    assert_eq!(v2.id, VersionId(2));
    assert!(wait_for_todos(&engine, "/notes.txt", v2.id).await.is_empty());

    // the first version keeps its own analysis
    let old = engine.todos("/notes.txt", Some(v1.id)).await.unwrap().unwrap();
    assert_eq!(old.len(), 1);
    assert_eq!(old[0].text, "ship it");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_every_version_stays_readable() {
    let dir = TempDir::new().unwrap();
    let engine = start(&dir).await;

    for content in ["one", "two", "three"] {
        engine.write_all("/doc.txt", content.as_bytes()).await.unwrap();
    }

    let history = engine.history("/doc.txt").await.unwrap();
    let ids: Vec<VersionId> = history.iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![VersionId(1), VersionId(2), VersionId(3)]);
    assert_eq!(history[1].parent, Some(VersionId(1)));

    assert_eq!(engine.read_version("/doc.txt", VersionId(1)).await.unwrap(), b"one");
    assert_eq!(engine.read_version("/doc.txt", VersionId(2)).await.unwrap(), b"two");
    assert_eq!(engine.read_all("/doc.txt").await.unwrap(), b"three");

    // historical versions are also reachable by name
    assert_eq!(engine.read_all("/doc.txt@v1").await.unwrap(), b"one");
    assert!(engine.getattr("/doc.txt@v2").await.unwrap().read_only);
    assert!(matches!(
        engine.write_all("/doc.txt@v1", b"rewrite history").await,
        Err(OverlayError::PermissionDenied(_))
    ));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_writes_to_one_path_serialize() {
    let dir = TempDir::new().unwrap();
    let engine = start(&dir).await;
    engine.create("/shared.txt").await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .write_all("/shared.txt", format!("writer {}", i).as_bytes())
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let history = engine.history("/shared.txt").await.unwrap();
    assert_eq!(history.len(), 16);
    for (idx, version) in history.iter().enumerate() {
        assert_eq!(version.id, VersionId(idx as u64 + 1));
        let content = engine.read_version("/shared.txt", version.id).await.unwrap();
        assert!(String::from_utf8(content).unwrap().starts_with("writer "));
    }
    let current = engine.read_all("/shared.txt").await.unwrap();
    let last = engine.read_version("/shared.txt", VersionId(16)).await.unwrap();
    assert_eq!(current, last);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_writes_to_different_paths_proceed_independently() {
    let dir = TempDir::new().unwrap();
    let engine = start(&dir).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let path = format!("/file-{}.txt", i);
            engine.write_all(&path, path.as_bytes()).await.unwrap();
            path
        }));
    }
    for task in tasks {
        let path = task.await.unwrap();
        assert_eq!(engine.read_all(&path).await.unwrap(), path.as_bytes());
    }

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rename_then_read() {
    let dir = TempDir::new().unwrap();
    let engine = start(&dir).await;

    engine.write_all("/draft.txt", b"first").await.unwrap();
    engine.write_all("/draft.txt", b"second").await.unwrap();
    engine.mkdir("/docs").await.unwrap();

    let renamed = engine.rename("/draft.txt", "/docs/final.txt").await.unwrap();
    assert_eq!(renamed.path, "/docs/final.txt");
    assert_eq!(engine.read_all("/docs/final.txt").await.unwrap(), b"second");
    assert!(matches!(engine.read_all("/draft.txt").await, Err(OverlayError::NotFound(_))));

    // a move keeps the file's history
    let history = engine.history("/docs/final.txt").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(engine.read_version("/docs/final.txt", VersionId(1)).await.unwrap(), b"first");

    // and is mirrored into the source tree
    assert!(dir.path().join("docs/final.txt").exists());
    assert!(!dir.path().join("draft.txt").exists());

    let listing = engine.readdir("/docs").await.unwrap();
    assert!(listing.iter().any(|e| e.name == "final.txt" && e.kind == FileKind::Regular));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deleted_file_keeps_history() {
    let dir = TempDir::new().unwrap();
    let engine = start(&dir).await;

    engine.write_all("/old.txt", b"keep me").await.unwrap();
    engine.unlink("/old.txt").await.unwrap();

    assert!(matches!(engine.getattr("/old.txt").await, Err(OverlayError::NotFound(_))));
    assert_eq!(engine.history("/old.txt").await.unwrap().len(), 1);
    assert_eq!(engine.read_version("/old.txt", VersionId(1)).await.unwrap(), b"keep me");

    engine.shutdown().await.unwrap();
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_corrupted_object_is_reported() {
    let dir = TempDir::new().unwrap();
    let events = Arc::new(RecordingPublisher::default());
    let engine = start_with(
        fast_spec(&dir),
        events.clone(),
        Arc::new(HttpLinkFetcher::new(Duration::from_secs(1)).unwrap()),
    )
    .await;

    let version = engine.write_all("/ledger.txt", b"balance: 100").await.unwrap();

    let objects = LocalBlobStore::new(dir.path().join(".eidetic").join("objects")).unwrap();
    let object = objects.object_path(&version.content).unwrap();
    std::fs::write(&object, b"balance: 999").unwrap();

    assert!(matches!(
        engine.read_all("/ledger.txt").await,
        Err(OverlayError::Corruption(_))
    ));
    assert!(events.names().contains(&"corruption_detected"));

    engine.shutdown().await.unwrap();
}

/// Sled index that can be told to fail every version commit.
struct FlakyCommitIndex {
    inner: SledMetadataIndex,
    fail_commits: AtomicBool,
}

#[async_trait]
impl MetadataIndex for FlakyCommitIndex {
    async fn allocate_file_id(&self) -> Result<FileId, IndexError> {
        self.inner.allocate_file_id().await
    }

    async fn upsert_record(&self, record: &FileRecord) -> Result<(), IndexError> {
        self.inner.upsert_record(record).await
    }

    async fn get_record(&self, path: &str) -> Result<Option<FileRecord>, IndexError> {
        self.inner.get_record(path).await
    }

    async fn record_for_file(&self, file_id: FileId) -> Result<Option<FileRecord>, IndexError> {
        self.inner.record_for_file(file_id).await
    }

    async fn append_version(&self, path: &str, version: &Version) -> Result<FileRecord, IndexError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(IndexError::Transaction("disk full".to_string()));
        }
        self.inner.append_version(path, version).await
    }

    async fn current_version(&self, path: &str) -> Result<Option<Version>, IndexError> {
        self.inner.current_version(path).await
    }

    async fn get_version(&self, file_id: FileId, version: VersionId) -> Result<Option<Version>, IndexError> {
        self.inner.get_version(file_id, version).await
    }

    async fn list_versions(&self, file_id: FileId) -> Result<Vec<Version>, IndexError> {
        self.inner.list_versions(file_id).await
    }

    async fn rename_record(
        &self,
        from: &str,
        to: &str,
        vaulted: bool,
        replacement: Option<&Version>,
    ) -> Result<FileRecord, IndexError> {
        self.inner.rename_record(from, to, vaulted, replacement).await
    }

    async fn tombstone_record(&self, path: &str) -> Result<FileRecord, IndexError> {
        self.inner.tombstone_record(path).await
    }

    async fn list_children(&self, dir: &str) -> Result<Vec<FileRecord>, IndexError> {
        self.inner.list_children(dir).await
    }

    async fn list_live_records(&self) -> Result<Vec<FileRecord>, IndexError> {
        self.inner.list_live_records().await
    }

    async fn record_tags(&self, file_id: FileId, version: VersionId, tags: &TagSet) -> Result<bool, IndexError> {
        self.inner.record_tags(file_id, version, tags).await
    }

    async fn record_todos(&self, file_id: FileId, version: VersionId, todos: &[TodoItem]) -> Result<(), IndexError> {
        self.inner.record_todos(file_id, version, todos).await
    }

    async fn todos(&self, file_id: FileId, version: VersionId) -> Result<Option<Vec<TodoItem>>, IndexError> {
        self.inner.todos(file_id, version).await
    }

    async fn record_summary(&self, file_id: FileId, version: VersionId, summary: &str) -> Result<(), IndexError> {
        self.inner.record_summary(file_id, version, summary).await
    }

    async fn summary(&self, file_id: FileId, version: VersionId) -> Result<Option<String>, IndexError> {
        self.inner.summary(file_id, version).await
    }

    async fn enqueue_job(&self, job: &AnalysisJob) -> Result<bool, IndexError> {
        self.inner.enqueue_job(job).await
    }

    async fn get_job(&self, key: &JobKey) -> Result<Option<AnalysisJob>, IndexError> {
        self.inner.get_job(key).await
    }

    async fn claim_job(&self, key: &JobKey) -> Result<Option<AnalysisJob>, IndexError> {
        self.inner.claim_job(key).await
    }

    async fn record_retry(&self, key: &JobKey, error: &str) -> Result<AnalysisJob, IndexError> {
        self.inner.record_retry(key, error).await
    }

    async fn complete_job(&self, key: &JobKey, outcome: JobOutcome) -> Result<(), IndexError> {
        self.inner.complete_job(key, outcome).await
    }

    async fn discard_job(&self, key: &JobKey) -> Result<(), IndexError> {
        self.inner.discard_job(key).await
    }

    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<AnalysisJob>, IndexError> {
        self.inner.jobs_with_status(status).await
    }

    async fn requeue_stale_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<AnalysisJob>, IndexError> {
        self.inner.requeue_stale_jobs(cutoff).await
    }

    async fn stats(&self) -> Result<IndexStats, IndexError> {
        self.inner.stats().await
    }

    async fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, IndexError> {
        self.inner.get_meta(key).await
    }

    async fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), IndexError> {
        self.inner.put_meta(key, value).await
    }

    async fn flush(&self) -> Result<(), IndexError> {
        self.inner.flush().await
    }
}

#[tokio::test]
async fn test_failed_metadata_commit_keeps_previous_version() {
    let dir = TempDir::new().unwrap();
    let store_dir = dir.path().join(".eidetic");
    std::fs::create_dir_all(&store_dir).unwrap();

    let index = Arc::new(FlakyCommitIndex {
        inner: SledMetadataIndex::open(store_dir.join("index"), false).unwrap(),
        fail_commits: AtomicBool::new(false),
    });
    let ctx = MountContext::from_parts(
        fast_spec(&dir),
        SourceTree::new(dir.path()),
        index.clone(),
        Arc::new(LocalBlobStore::new(store_dir.join("objects")).unwrap()),
        None,
        Arc::new(RecordingPublisher::default()),
        LicenseStatus::free("test"),
    );
    let engine = OverlayEngine::start(
        Arc::new(ctx),
        builtin_analyzers(),
        Arc::new(HttpLinkFetcher::new(Duration::from_secs(1)).unwrap()),
        Arc::new(ImageFormatConverter::new()),
    )
    .await
    .unwrap();

    engine.write_all("/config.txt", b"stable").await.unwrap();
    index.fail_commits.store(true, Ordering::SeqCst);

    assert!(matches!(
        engine.write_all("/config.txt", b"half written").await,
        Err(OverlayError::StoreTransactionFailure(_))
    ));

    // neither the overlay nor the source tree moved
    assert_eq!(engine.read_all("/config.txt").await.unwrap(), b"stable");
    assert_eq!(engine.history("/config.txt").await.unwrap().len(), 1);
    assert_eq!(std::fs::read(dir.path().join("config.txt")).unwrap(), b"stable");

    index.fail_commits.store(false, Ordering::SeqCst);
    let next = engine.write_all("/config.txt", b"recovered").await.unwrap();
    assert_eq!(next.id, VersionId(2));

    engine.shutdown().await.unwrap();
}

// ============================================================================
// Views
// ============================================================================

#[tokio::test]
async fn test_web_link_timeout_surfaces_as_unavailable() {
    let dir = TempDir::new().unwrap();
    let events = Arc::new(RecordingPublisher::default());
    let mut spec = fast_spec(&dir);
    spec.views.web_fetch_timeout = Duration::from_millis(50);
    let engine = start_with(spec, events.clone(), Arc::new(HangingFetcher)).await;

    engine.write_all("/slow.url", b"https://example.com").await.unwrap();

    assert!(matches!(
        engine.read("/slow.url", 0, 4096).await,
        Err(OverlayError::Unavailable(_))
    ));
    assert!(events.names().contains(&"view_unavailable"));
    // other files are unaffected
    engine.write_all("/fine.txt", b"ok").await.unwrap();
    assert_eq!(engine.read_all("/fine.txt").await.unwrap(), b"ok");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_magic_tags_follow_classification() {
    let dir = TempDir::new().unwrap();
    let engine = start(&dir).await;

    engine.write_all("/bill.txt", b"Invoice total: 42 EUR").await.unwrap();
    wait_for_tag(&engine, "/bill.txt", "finance").await;

    let tags = engine.readdir("/.magic/tags").await.unwrap();
    assert!(tags.iter().any(|e| e.name == "finance" && e.kind == FileKind::Directory));

    let tagged = engine.readdir("/.magic/tags/finance").await.unwrap();
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].name, "bill.txt");
    assert_eq!(
        engine.read_all("/.magic/tags/finance/bill.txt").await.unwrap(),
        b"Invoice total: 42 EUR"
    );

    let stats = String::from_utf8(engine.read_all("/.magic/stats.md").await.unwrap()).unwrap();
    assert!(stats.contains("**#finance**: 1 files"));

    // views are read-only
    assert!(matches!(
        engine.write_all("/.magic/tags/finance/bill.txt", b"x").await,
        Err(OverlayError::PermissionDenied(_))
    ));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_context_bundle_lists_directory_text() {
    let dir = TempDir::new().unwrap();
    let engine = start(&dir).await;

    engine.mkdir("/project").await.unwrap();
    engine.write_all("/project/main.rs", b"fn main() {}").await.unwrap();
    engine.write_all("/project/notes.md", b"# Notes").await.unwrap();

    let bundle = String::from_utf8(engine.read_all("/project/.context").await.unwrap()).unwrap();
    assert!(bundle.starts_with("# Context for project"));
    assert!(bundle.contains("## main.rs\n```rs\nfn main() {}\n```"));
    assert!(bundle.contains("## notes.md"));

    engine.shutdown().await.unwrap();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();

    {
        let engine = start(&dir).await;
        engine.write_all("/journal.txt", b"day one").await.unwrap();
        engine.write_all("/journal.txt", b"day two").await.unwrap();
        engine.shutdown().await.unwrap();
    }

    let engine = start(&dir).await;
    let history = engine.history("/journal.txt").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(engine.read_version("/journal.txt", VersionId(1)).await.unwrap(), b"day one");
    assert_eq!(engine.read_all("/journal.txt").await.unwrap(), b"day two");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_existing_source_files_are_imported() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("docs")).unwrap();
    std::fs::write(dir.path().join("docs/readme.txt"), b"TODO: write docs").unwrap();

    let engine = start(&dir).await;
    assert_eq!(engine.read_all("/docs/readme.txt").await.unwrap(), b"TODO: write docs");
    assert_eq!(engine.history("/docs/readme.txt").await.unwrap().len(), 1);

    let todos = wait_for_todos(&engine, "/docs/readme.txt", VersionId(1)).await;
    assert_eq!(todos[0].text, "write docs");

    // the store directory never shows up in the mount
    let root = engine.readdir("/").await.unwrap();
    assert!(root.iter().all(|e| e.name != ".eidetic"));

    engine.shutdown().await.unwrap();
}
