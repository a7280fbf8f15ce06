// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the analysis pipeline as driven by the overlay
//! engine: backpressure, retries, failure isolation, auto-organization and
//! startup recovery of abandoned jobs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use eidetic_core::application::context::MountContext;
use eidetic_core::application::license::LicenseStatus;
use eidetic_core::application::overlay_engine::{OverlayEngine, OverlayError};
use eidetic_core::application::version_store::VersionStore;
use eidetic_core::domain::analysis::{AnalysisInput, AnalysisOutput, Analyzer, AnalyzerError, AnalyzerSet};
use eidetic_core::domain::events::{EventPublisher, NullEventPublisher, OverlayEvent};
use eidetic_core::domain::job::{AnalysisJob, JobKey, JobKind, JobStatus};
use eidetic_core::domain::mount_config::{MountSpec, OrganizeRule};
use eidetic_core::infrastructure::analyzers::builtin_analyzers;
use eidetic_core::infrastructure::image_convert::ImageFormatConverter;
use eidetic_core::infrastructure::web_fetch::HttpLinkFetcher;

#[derive(Default)]
struct RecordingPublisher {
    events: Mutex<Vec<OverlayEvent>>,
}

impl RecordingPublisher {
    fn count(&self, name: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.name() == name).count()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: OverlayEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Summarizer that waits for a permit per job.
struct GatedSummarizer {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Analyzer for GatedSummarizer {
    fn kind(&self) -> JobKind {
        JobKind::Summarize
    }

    async fn analyze(&self, _input: &AnalysisInput) -> Result<AnalysisOutput, AnalyzerError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| AnalyzerError::Failed("gate closed".to_string()))?;
        permit.forget();
        Ok(AnalysisOutput::Summary("gated".to_string()))
    }
}

struct BrokenSummarizer;

#[async_trait]
impl Analyzer for BrokenSummarizer {
    fn kind(&self) -> JobKind {
        JobKind::Summarize
    }

    async fn analyze(&self, _input: &AnalysisInput) -> Result<AnalysisOutput, AnalyzerError> {
        Err(AnalyzerError::Failed("model unavailable".to_string()))
    }
}

fn with_summarizer(summarizer: Arc<dyn Analyzer>) -> AnalyzerSet {
    let builtin = builtin_analyzers();
    AnalyzerSet::new(
        summarizer,
        builtin.analyzer_for(JobKind::ExtractTodos).clone(),
        builtin.analyzer_for(JobKind::Classify).clone(),
    )
}

async fn start(spec: MountSpec, analyzers: AnalyzerSet, events: Arc<dyn EventPublisher>) -> Arc<OverlayEngine> {
    let ctx = MountContext::open(spec, None, LicenseStatus::free("test"), events)
        .await
        .unwrap();
    OverlayEngine::start(
        Arc::new(ctx),
        analyzers,
        Arc::new(HttpLinkFetcher::new(Duration::from_secs(1)).unwrap()),
        Arc::new(ImageFormatConverter::new()),
    )
    .await
    .unwrap()
}

async fn wait_for_job(engine: &OverlayEngine, key: &JobKey, status: JobStatus) -> AnalysisJob {
    for _ in 0..300 {
        if let Some(job) = engine.context().index().get_job(key).await.unwrap() {
            if job.status == status {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {:?}", key, status);
}

#[tokio::test]
async fn test_backpressure_never_blocks_writes() {
    let dir = TempDir::new().unwrap();
    let mut spec = MountSpec::for_source(dir.path());
    spec.analysis.queue_capacity = 1;
    spec.analysis.workers = 1;
    spec.analysis.kinds = vec![JobKind::Summarize];

    let gate = Arc::new(Semaphore::new(0));
    let events = Arc::new(RecordingPublisher::default());
    let engine = start(
        spec,
        with_summarizer(Arc::new(GatedSummarizer { gate: gate.clone() })),
        events.clone(),
    )
    .await;

    // one job held by the worker, one queued, the rest must be dropped
    for i in 0..5 {
        let path = format!("/burst-{}.txt", i);
        let written = tokio::time::timeout(Duration::from_secs(2), engine.write_all(&path, b"payload")).await;
        assert!(written.expect("write stalled behind analysis").is_ok());
    }
    for i in 0..5 {
        let path = format!("/burst-{}.txt", i);
        assert_eq!(engine.read_all(&path).await.unwrap(), b"payload");
    }

    let dropped = events.count("analysis_backpressure");
    assert!(dropped >= 3, "expected at least 3 dropped jobs, got {}", dropped);

    gate.add_permits(16);
    let first = engine.history("/burst-0.txt").await.unwrap().remove(0);
    wait_for_job(
        &engine,
        &JobKey::new(first.file_id, first.id, JobKind::Summarize),
        JobStatus::Done,
    )
    .await;

    // dropped jobs are not left behind as pending work
    let last = engine.history("/burst-4.txt").await.unwrap().remove(0);
    let last_key = JobKey::new(last.file_id, last.id, JobKind::Summarize);
    assert!(engine.context().index().get_job(&last_key).await.unwrap().is_none());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_analysis_never_fails_the_file() {
    let dir = TempDir::new().unwrap();
    let mut spec = MountSpec::for_source(dir.path());
    spec.analysis.max_retries = 2;
    spec.analysis.retry_backoff = Duration::from_millis(1);

    let events = Arc::new(RecordingPublisher::default());
    let engine = start(spec, with_summarizer(Arc::new(BrokenSummarizer)), events.clone()).await;

    let version = engine.write_all("/report.txt", b"quarterly numbers").await.unwrap();
    let job = wait_for_job(
        &engine,
        &JobKey::new(version.file_id, version.id, JobKind::Summarize),
        JobStatus::Failed,
    )
    .await;
    assert_eq!(job.retry_count, 3);
    assert_eq!(job.last_error.as_deref(), Some("Analyzer failed: model unavailable"));
    assert_eq!(events.count("analysis_failed"), 1);

    // the file and its other analyses are unaffected
    assert_eq!(engine.read_all("/report.txt").await.unwrap(), b"quarterly numbers");
    assert!(engine.summary("/report.txt", None).await.unwrap().is_none());
    wait_for_job(
        &engine,
        &JobKey::new(version.file_id, version.id, JobKind::ExtractTodos),
        JobStatus::Done,
    )
    .await;

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_auto_organize_moves_without_reanalysis() {
    let dir = TempDir::new().unwrap();
    let mut spec = MountSpec::for_source(dir.path());
    spec.analysis.auto_organize = vec![OrganizeRule {
        tag: "finance".to_string(),
        folder: "Finance".to_string(),
    }];

    let events = Arc::new(RecordingPublisher::default());
    let engine = start(spec, builtin_analyzers(), events.clone()).await;

    let version = engine.write_all("/march.txt", b"Invoice total: 120 EUR").await.unwrap();

    let mut moved = None;
    for _ in 0..300 {
        if let Ok(attr) = engine.getattr("/Finance/march.txt").await {
            moved = Some(attr);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let moved = moved.expect("file was never organized");
    assert_eq!(moved.file_id, Some(version.file_id));
    assert!(matches!(engine.getattr("/march.txt").await, Err(OverlayError::NotFound(_))));
    assert_eq!(engine.read_all("/Finance/march.txt").await.unwrap(), b"Invoice total: 120 EUR");
    assert!(dir.path().join("Finance/march.txt").exists());

    for kind in JobKind::ALL {
        wait_for_job(&engine, &JobKey::new(version.file_id, version.id, kind), JobStatus::Done).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // the move produced no new version and no new jobs
    assert_eq!(engine.history("/Finance/march.txt").await.unwrap().len(), 1);
    assert!(engine
        .context()
        .index()
        .jobs_with_status(JobStatus::Pending)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(events.count("file_organized"), 1);
    assert!(engine.tags("/Finance/march.txt").await.unwrap().contains("finance"));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invoices_are_filed_by_default() {
    let dir = TempDir::new().unwrap();
    let engine = start(
        MountSpec::for_source(dir.path()),
        builtin_analyzers(),
        Arc::new(NullEventPublisher),
    )
    .await;

    engine.mkdir("/inbox").await.unwrap();
    engine.write_all("/inbox/invoice-0042.txt", b"Amount: 99 EUR").await.unwrap();

    let mut filed = false;
    for _ in 0..300 {
        if engine.getattr("/inbox/Finance/invoice-0042.txt").await.is_ok() {
            filed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(filed, "invoice was never filed");
    assert!(matches!(
        engine.getattr("/inbox/invoice-0042.txt").await,
        Err(OverlayError::NotFound(_))
    ));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_abandoned_jobs_resume_after_quick_restart() {
    let dir = TempDir::new().unwrap();
    // default liveness threshold: far longer than the restart takes
    let spec = MountSpec::for_source(dir.path());

    // a previous run committed a version and died mid-analysis
    let key = {
        let ctx = Arc::new(
            MountContext::open(spec.clone(), None, LicenseStatus::free("test"), Arc::new(NullEventPublisher))
                .await
                .unwrap(),
        );
        let store = VersionStore::new(ctx.clone());
        store.create_file("/crash.txt").await.unwrap();
        let version = store.write("/crash.txt", b"TODO: recover me").await.unwrap().version;

        let key = JobKey::new(version.file_id, version.id, JobKind::ExtractTodos);
        assert!(ctx.index().enqueue_job(&AnalysisJob::new(key, "/crash.txt")).await.unwrap());
        assert!(ctx.index().claim_job(&key).await.unwrap().is_some());
        ctx.index().flush().await.unwrap();
        key
    };

    let engine = start(spec, builtin_analyzers(), Arc::new(NullEventPublisher)).await;
    wait_for_job(&engine, &key, JobStatus::Done).await;

    let todos = engine.todos("/crash.txt", None).await.unwrap().unwrap();
    assert_eq!(todos.len(), 1);
    assert_eq!(todos[0].text, "recover me");

    engine.shutdown().await.unwrap();
}
