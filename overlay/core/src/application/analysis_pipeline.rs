// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Analysis Pipeline Application Service
//!
//! Bounded queue plus a fixed pool of tokio workers that turn committed
//! versions into derived metadata (summaries, TODO lists, tags).
//!
//! - Producers never wait: `submit_version` persists the job and hands it to
//!   the queue with `try_send`. A full queue drops the job with a
//!   backpressure warning, event and metric; the write is unaffected.
//! - Jobs are keyed by (file id, version, kind) in the index. A key is
//!   claimed before it runs and a finished key is never claimed again, so a
//!   job runs to completion at most once.
//! - Failures are retried with exponential back-off, then marked failed.
//!   They never reach a filesystem caller.
//! - A classification can trigger auto-organization, which re-enters the
//!   engine as a rename. Renames create no version, so nothing is
//!   re-analysed.
//! - Running jobs claimed before this pipeline started belong to a dead
//!   process and are requeued at startup. A periodic sweep retries pending
//!   jobs the queue had no room for and reclaims running jobs whose worker
//!   has held them longer than the liveness threshold.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::context::MountContext;
use crate::application::version_store::VersionStore;
use crate::domain::analysis::{AnalysisInput, AnalysisOutput, AnalyzerSet};
use crate::domain::events::OverlayEvent;
use crate::domain::file::{FileId, TagSet, Version};
use crate::domain::index::IndexError;
use crate::domain::job::{AnalysisJob, JobKey, JobOutcome};
use crate::domain::mount_config::AnalysisConfig;
use crate::domain::path_sanitizer::{file_name, parent_of};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Analysis queue is full")]
    Backpressure,

    #[error("Analysis pipeline is shut down")]
    Closed,

    #[error("Auto-organization failed: {0}")]
    Organize(String),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Moves a file into a classified folder. Implemented by the engine so the
/// move goes through the normal rename path.
#[async_trait]
pub trait FileMover: Send + Sync {
    /// Move the live file holding `file_id` into the sibling folder
    /// `folder`. Returns the new path, or `None` when nothing moved.
    async fn organize(&self, file_id: FileId, folder: &str) -> Result<Option<String>, PipelineError>;
}

/// Outcome of one submission attempt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReport {
    pub queued: usize,
    pub duplicates: usize,
    pub dropped: usize,
}

struct Shared {
    ctx: Arc<MountContext>,
    store: Arc<VersionStore>,
    analyzers: AnalyzerSet,
    config: AnalysisConfig,
    mover: Option<Weak<dyn FileMover>>,
    /// Claims older than this were made by a previous process.
    started_at: DateTime<Utc>,
}

pub struct AnalysisPipeline {
    shared: Arc<Shared>,
    sender: mpsc::Sender<JobKey>,
    cancel: CancellationToken,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl AnalysisPipeline {
    /// Spawn the worker pool and the stale-job sweep.
    pub fn start(
        ctx: Arc<MountContext>,
        store: Arc<VersionStore>,
        analyzers: AnalyzerSet,
        mover: Option<Weak<dyn FileMover>>,
    ) -> Self {
        let config = ctx.spec().analysis.clone();
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let cancel = CancellationToken::new();

        let shared = Arc::new(Shared {
            ctx,
            store,
            analyzers,
            config,
            mover,
            started_at: Utc::now(),
        });

        let mut handles = Vec::with_capacity(shared.config.workers + 1);
        for worker_id in 0..shared.config.workers {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                shared.clone(),
                receiver.clone(),
                cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(sweep_loop(shared.clone(), sender.clone(), cancel.clone())));

        info!(
            workers = shared.config.workers,
            capacity = shared.config.queue_capacity,
            "Analysis pipeline started"
        );

        Self {
            shared,
            sender,
            cancel,
            handles: parking_lot::Mutex::new(handles),
        }
    }

    /// Queue analysis of a freshly committed version. Never waits for a
    /// worker. Vaulted versions are not analysed: derived metadata is stored
    /// unencrypted.
    pub async fn submit_version(&self, path: &str, version: &Version) -> SubmitReport {
        let mut report = SubmitReport::default();
        if version.is_vaulted() {
            debug!(path = %path, "Skipping analysis of vaulted version");
            return report;
        }

        for kind in &self.shared.config.kinds {
            let key = JobKey::new(version.file_id, version.id, *kind);
            match self.submit(AnalysisJob::new(key, path)).await {
                Ok(true) => report.queued += 1,
                Ok(false) => report.duplicates += 1,
                Err(PipelineError::Backpressure) => report.dropped += 1,
                Err(e) => warn!(path = %path, kind = %kind, error = %e, "Failed to queue analysis job"),
            }
        }
        report
    }

    /// Persist and queue one job. `Ok(false)` when the key already exists.
    pub async fn submit(&self, job: AnalysisJob) -> Result<bool, PipelineError> {
        if !self.shared.ctx.index().enqueue_job(&job).await? {
            debug!(job = %job.key, "Analysis job already known");
            return Ok(false);
        }

        match self.sender.try_send(job.key) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(key)) => {
                warn!(path = %job.path, job = %key, "Analysis queue full, dropping job");
                metrics::counter!("eidetic_analysis_backpressure_total", "kind" => key.kind.label()).increment(1);
                if let Err(e) = self.shared.ctx.index().discard_job(&key).await {
                    error!(job = %key, error = %e, "Failed to discard dropped job");
                }
                self.shared.ctx.events().publish(OverlayEvent::AnalysisBackpressure {
                    path: job.path.clone(),
                    version: key.version,
                    kind: key.kind,
                    dropped_at: Utc::now(),
                });
                Err(PipelineError::Backpressure)
            }
            // Left pending in the index; picked up on the next start.
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PipelineError::Closed),
        }
    }

    /// Requeue jobs left pending or running by a previous process.
    pub async fn recover(&self) -> Result<usize, PipelineError> {
        let requeued = resubmit_stale(&self.shared, &self.sender, self.shared.started_at).await?;
        if requeued > 0 {
            info!(requeued, "Recovered analysis jobs");
        }
        Ok(requeued)
    }

    /// Stop the workers. In-flight jobs are abandoned and stay `running`
    /// until the next recovery.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!(error = %e, "Analysis worker panicked");
                }
            }
        }
        info!("Analysis pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<Shared>,
    receiver: Arc<Mutex<mpsc::Receiver<JobKey>>>,
    cancel: CancellationToken,
) {
    debug!(worker_id, "Analysis worker started");
    let mut processed = 0u64;

    loop {
        let key = tokio::select! {
            _ = cancel.cancelled() => break,
            key = async { receiver.lock().await.recv().await } => match key {
                Some(key) => key,
                None => break,
            },
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(worker_id, job = %key, "Abandoning in-flight job on shutdown");
                break;
            }
            result = shared.process(key) => {
                processed += 1;
                if let Err(e) = result {
                    error!(worker_id, job = %key, error = %e, "Analysis job bookkeeping failed");
                }
            }
        }
    }

    debug!(worker_id, processed, "Analysis worker stopped");
}

async fn sweep_loop(shared: Arc<Shared>, sender: mpsc::Sender<JobKey>, cancel: CancellationToken) {
    let period = shared.config.liveness_threshold.max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    // first tick completes immediately; startup recovery covers it
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let cutoff = Utc::now() - liveness_cutoff(&shared.config);
                if let Err(e) = resubmit_stale(&shared, &sender, cutoff).await {
                    warn!(error = %e, "Stale job sweep failed");
                }
            }
        }
    }
}

fn liveness_cutoff(config: &AnalysisConfig) -> chrono::Duration {
    chrono::Duration::from_std(config.liveness_threshold).unwrap_or_else(|_| chrono::Duration::seconds(300))
}

/// Queue every pending job plus running jobs claimed before `cutoff`.
async fn resubmit_stale(
    shared: &Shared,
    sender: &mpsc::Sender<JobKey>,
    cutoff: DateTime<Utc>,
) -> Result<usize, PipelineError> {
    let pending = shared.ctx.index().requeue_stale_jobs(cutoff).await?;
    queue_jobs(pending, sender)
}

fn queue_jobs(pending: Vec<AnalysisJob>, sender: &mpsc::Sender<JobKey>) -> Result<usize, PipelineError> {
    let mut queued = 0;
    for job in pending {
        match sender.try_send(job.key) {
            Ok(()) => queued += 1,
            // Still pending in the index; the next sweep tries again.
            Err(mpsc::error::TrySendError::Full(_)) => break,
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(PipelineError::Closed),
        }
    }
    Ok(queued)
}

impl Shared {
    async fn process(&self, key: JobKey) -> Result<(), PipelineError> {
        let index = self.ctx.index();
        let Some(job) = index.claim_job(&key).await? else {
            debug!(job = %key, "Job already claimed or finished");
            return Ok(());
        };

        // Prefer the live path; a renamed file keeps its file id.
        let path = match index.record_for_file(key.file_id).await? {
            Some(record) => record.path,
            None => job.path.clone(),
        };

        let Some(version) = index.get_version(key.file_id, key.version).await? else {
            return self.fail(&key, &path, 0, "version no longer exists".to_string()).await;
        };

        let analyzer = self.analyzers.analyzer_for(key.kind);
        loop {
            let attempt = async {
                let content = self
                    .store
                    .load(&path, &version)
                    .await
                    .map_err(|e| e.to_string())?;
                let input = AnalysisInput {
                    path: path.clone(),
                    file_id: key.file_id,
                    version: key.version,
                    content: Arc::new(content),
                };
                match tokio::time::timeout(self.config.job_timeout, analyzer.analyze(&input)).await {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {:?}", self.config.job_timeout)),
                }
            };

            match attempt.await {
                Ok(output) => {
                    self.apply(&key, &path, output).await?;
                    index.complete_job(&key, JobOutcome::Done).await?;
                    metrics::counter!("eidetic_analysis_jobs_total", "kind" => key.kind.label(), "outcome" => "done")
                        .increment(1);
                    self.ctx.events().publish(OverlayEvent::AnalysisCompleted {
                        path: path.clone(),
                        version: key.version,
                        kind: key.kind,
                        completed_at: Utc::now(),
                    });
                    debug!(job = %key, path = %path, "Analysis job done");
                    return Ok(());
                }
                Err(err) => {
                    let job = index.record_retry(&key, &err).await?;
                    if job.retry_count > self.config.max_retries {
                        return self.fail(&key, &path, job.retry_count, err).await;
                    }
                    let delay = self.backoff(job.retry_count);
                    debug!(job = %key, attempt = job.retry_count, delay = ?delay, error = %err, "Retrying analysis job");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        self.config.retry_backoff.saturating_mul(1u32 << exponent)
    }

    async fn fail(&self, key: &JobKey, path: &str, retries: u32, error: String) -> Result<(), PipelineError> {
        warn!(job = %key, path = %path, retries, error = %error, "Analysis job failed");
        self.ctx.index().complete_job(key, JobOutcome::Failed(error.clone())).await?;
        metrics::counter!("eidetic_analysis_jobs_total", "kind" => key.kind.label(), "outcome" => "failed").increment(1);
        self.ctx.events().publish(OverlayEvent::AnalysisFailed {
            path: path.to_string(),
            version: key.version,
            kind: key.kind,
            retries,
            error,
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn apply(&self, key: &JobKey, path: &str, output: AnalysisOutput) -> Result<(), PipelineError> {
        let index = self.ctx.index();
        match output {
            AnalysisOutput::Summary(summary) => {
                index.record_summary(key.file_id, key.version, &summary).await?;
            }
            AnalysisOutput::Todos(todos) => {
                index.record_todos(key.file_id, key.version, &todos).await?;
            }
            AnalysisOutput::Tags(tags) => {
                if index.record_tags(key.file_id, key.version, &tags).await? {
                    self.auto_organize(key.file_id, path, &tags).await;
                } else {
                    debug!(job = %key, "Classification is stale, tags not applied");
                }
            }
            AnalysisOutput::Skipped(reason) => {
                debug!(job = %key, kind = %key.kind, reason = %reason, "Analyzer skipped content");
            }
        }
        Ok(())
    }

    async fn auto_organize(&self, file_id: FileId, path: &str, tags: &TagSet) {
        let Some(rule) = self
            .config
            .auto_organize
            .iter()
            .find(|rule| tags.contains(&rule.tag))
        else {
            return;
        };
        if file_name(parent_of(path)) == rule.folder {
            return;
        }
        let Some(mover) = self.mover.as_ref().and_then(Weak::upgrade) else {
            debug!(path = %path, "Engine gone, skipping auto-organization");
            return;
        };

        match mover.organize(file_id, &rule.folder).await {
            Ok(Some(to)) => info!(from = %path, to = %to, tag = %rule.tag, "Auto-organized file"),
            Ok(None) => {}
            Err(e) => warn!(path = %path, folder = %rule.folder, error = %e, "Auto-organization failed"),
        }
    }
}
