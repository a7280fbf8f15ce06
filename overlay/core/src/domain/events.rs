// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Overlay domain events.
//!
//! Published after the fact; nothing on the filesystem path waits for a
//! subscriber.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::file::{FileId, FileKind, VersionId};
use crate::domain::job::JobKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverlayEvent {
    VersionCommitted {
        path: String,
        file_id: FileId,
        version: VersionId,
        length: u64,
        committed_at: DateTime<Utc>,
    },
    FileCreated {
        path: String,
        kind: FileKind,
        created_at: DateTime<Utc>,
    },
    FileDeleted {
        path: String,
        file_id: FileId,
        deleted_at: DateTime<Utc>,
    },
    FileRenamed {
        from: String,
        to: String,
        file_id: FileId,
        renamed_at: DateTime<Utc>,
    },
    FileOrganized {
        from: String,
        to: String,
        folder: String,
        organized_at: DateTime<Utc>,
    },
    AnalysisBackpressure {
        path: String,
        version: VersionId,
        kind: JobKind,
        dropped_at: DateTime<Utc>,
    },
    AnalysisCompleted {
        path: String,
        version: VersionId,
        kind: JobKind,
        completed_at: DateTime<Utc>,
    },
    AnalysisFailed {
        path: String,
        version: VersionId,
        kind: JobKind,
        retries: u32,
        error: String,
        failed_at: DateTime<Utc>,
    },
    CorruptionDetected {
        path: String,
        version: VersionId,
        detected_at: DateTime<Utc>,
    },
    IntegrityFailure {
        path: String,
        version: VersionId,
        detected_at: DateTime<Utc>,
    },
    ViewUnavailable {
        path: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl OverlayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OverlayEvent::VersionCommitted { .. } => "version_committed",
            OverlayEvent::FileCreated { .. } => "file_created",
            OverlayEvent::FileDeleted { .. } => "file_deleted",
            OverlayEvent::FileRenamed { .. } => "file_renamed",
            OverlayEvent::FileOrganized { .. } => "file_organized",
            OverlayEvent::AnalysisBackpressure { .. } => "analysis_backpressure",
            OverlayEvent::AnalysisCompleted { .. } => "analysis_completed",
            OverlayEvent::AnalysisFailed { .. } => "analysis_failed",
            OverlayEvent::CorruptionDetected { .. } => "corruption_detected",
            OverlayEvent::IntegrityFailure { .. } => "integrity_failure",
            OverlayEvent::ViewUnavailable { .. } => "view_unavailable",
        }
    }
}

/// Sink for overlay events.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: OverlayEvent);
}

/// Publisher that drops everything. Used when no bus is wired.
pub struct NullEventPublisher;

impl EventPublisher for NullEventPublisher {
    fn publish(&self, _event: OverlayEvent) {}
}
