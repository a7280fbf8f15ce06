// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Overlay Event Logger Application Service
//!
//! Subscribes to the event bus and turns every [`OverlayEvent`] into a
//! structured log line. Problems that never surface as filesystem errors
//! (analysis failures, dropped jobs, unreachable views) become visible here.
//!
//! The logger runs as a background task and never affects the mount: a
//! lagging receiver loses log lines, not data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::events::OverlayEvent;
use crate::infrastructure::event_bus::{EventBus, EventBusError};

#[derive(Default)]
struct Counters {
    events: AtomicU64,
    problems: AtomicU64,
}

/// Background consumer that logs overlay events.
///
/// The task holds only its receiver, so dropping the last bus handle ends
/// it.
pub struct OverlayEventLogger {
    event_bus: Arc<EventBus>,
    counters: Arc<Counters>,
}

impl OverlayEventLogger {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            event_bus,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn events_logged(&self) -> u64 {
        self.counters.events.load(Ordering::Relaxed)
    }

    /// Events logged at `warn!` or `error!`.
    pub fn warnings_logged(&self) -> u64 {
        self.counters.problems.load(Ordering::Relaxed)
    }

    /// Start the background logging task.
    pub fn start(&self) -> JoinHandle<()> {
        info!("Starting overlay event logger background task");
        let mut receiver = self.event_bus.subscribe();
        let counters = self.counters.clone();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let processed = counters.events.fetch_add(1, Ordering::Relaxed) + 1;
                        if log_event(&event) {
                            let problems = counters.problems.fetch_add(1, Ordering::Relaxed) + 1;
                            if problems % 10 == 0 {
                                warn!("Overlay has reported {} problem events", problems);
                            }
                        }
                        if processed % 100 == 0 {
                            debug!("Overlay event logger processed {} events", processed);
                        }
                    }
                    Err(EventBusError::Closed) => {
                        info!("Event bus closed, shutting down overlay event logger");
                        break;
                    }
                    Err(EventBusError::Lagged(n)) => {
                        warn!("Overlay event logger lagged by {} events", n);
                    }
                    Err(e) => {
                        error!(error = ?e, "Unexpected error receiving event from bus");
                    }
                }
            }

            info!(
                "Overlay event logger shut down ({} events, {} problems)",
                counters.events.load(Ordering::Relaxed),
                counters.problems.load(Ordering::Relaxed)
            );
        })
    }
}

/// Log one event. Returns true when it was a problem report.
fn log_event(event: &OverlayEvent) -> bool {
    let name = event.name();
    match event {
        OverlayEvent::VersionCommitted { path, version, length, .. } => {
            debug!(event = name, path = %path, version = %version, length, "Version committed");
            false
        }
        OverlayEvent::FileCreated { path, kind, .. } => {
            debug!(event = name, path = %path, kind = ?kind, "Entry created");
            false
        }
        OverlayEvent::FileDeleted { path, file_id, .. } => {
            info!(event = name, path = %path, file_id = %file_id, "Entry deleted");
            false
        }
        OverlayEvent::FileRenamed { from, to, .. } => {
            info!(event = name, from = %from, to = %to, "Entry renamed");
            false
        }
        OverlayEvent::FileOrganized { from, to, folder, .. } => {
            info!(event = name, from = %from, to = %to, folder = %folder, "File auto-organized");
            false
        }
        OverlayEvent::AnalysisCompleted { path, version, kind, .. } => {
            debug!(event = name, path = %path, version = %version, kind = ?kind, "Analysis completed");
            false
        }
        OverlayEvent::AnalysisBackpressure { path, version, kind, .. } => {
            warn!(event = name, path = %path, version = %version, kind = ?kind, "Analysis job dropped");
            true
        }
        OverlayEvent::AnalysisFailed {
            path,
            version,
            kind,
            retries,
            error,
            ..
        } => {
            warn!(
                event = name,
                path = %path,
                version = %version,
                kind = ?kind,
                retries,
                error = %error,
                "Analysis failed"
            );
            true
        }
        OverlayEvent::ViewUnavailable { path, reason, .. } => {
            warn!(event = name, path = %path, reason = %reason, "View unavailable");
            true
        }
        OverlayEvent::CorruptionDetected { path, version, .. } => {
            error!(event = name, path = %path, version = %version, "Stored content failed its hash check");
            true
        }
        OverlayEvent::IntegrityFailure { path, version, .. } => {
            error!(event = name, path = %path, version = %version, "Vault authentication failed");
            true
        }
    }
}
