// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Overlay Events
//
// In-memory event streaming using tokio broadcast channels. Feeds the event
// logger, tests and any in-process observer. Events are lost on restart;
// the index is the durable record.

use crate::domain::events::{EventPublisher, OverlayEvent};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to overlay events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<OverlayEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity.
    /// Slow subscribers lose the oldest events once the buffer is full.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish an event to all subscribers
    pub fn publish_event(&self, event: OverlayEvent) {
        debug!(event = event.name(), "Publishing event");

        // send() fails only when nobody is subscribed
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all overlay events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to events touching `path` or anything beneath it
    pub fn subscribe_path(&self, path: impl Into<String>) -> PathEventReceiver {
        PathEventReceiver {
            receiver: self.sender.subscribe(),
            prefix: path.into(),
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: OverlayEvent) {
        self.publish_event(event);
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all overlay events
pub struct EventReceiver {
    receiver: broadcast::Receiver<OverlayEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<OverlayEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<OverlayEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one subtree
pub struct PathEventReceiver {
    receiver: broadcast::Receiver<OverlayEvent>,
    prefix: String,
}

impl PathEventReceiver {
    pub async fn recv(&mut self) -> Result<OverlayEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    fn matches(&self, event: &OverlayEvent) -> bool {
        let under = |path: &str| crate::domain::path_sanitizer::is_within(path, &self.prefix);
        match event {
            OverlayEvent::VersionCommitted { path, .. }
            | OverlayEvent::FileCreated { path, .. }
            | OverlayEvent::FileDeleted { path, .. }
            | OverlayEvent::AnalysisBackpressure { path, .. }
            | OverlayEvent::AnalysisCompleted { path, .. }
            | OverlayEvent::AnalysisFailed { path, .. }
            | OverlayEvent::CorruptionDetected { path, .. }
            | OverlayEvent::IntegrityFailure { path, .. }
            | OverlayEvent::ViewUnavailable { path, .. } => under(path),
            OverlayEvent::FileRenamed { from, to, .. }
            | OverlayEvent::FileOrganized { from, to, .. } => under(from) || under(to),
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
