//! Confidence gate and ordered hand-off to the presentation context.

use std::{
    fmt,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use ml_core::{ClassificationResult, Recognition};
use serde::Serialize;
use tracing::debug;

/// Top recognitions must score strictly above this to be shown.
pub const CONFIDENCE_THRESHOLD: f32 = 0.5;

/// Top recognition of a frame that passed the confidence gate.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PublishedResult {
    pub recognition: Recognition,
    pub timestamp_ms: i64,
}

impl fmt::Display for PublishedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.recognition.fmt(f)
    }
}

/// Update delivered to the presentation context.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresentationEvent {
    Result(PublishedResult),
    /// Nothing confident enough for this frame; the display should be cleared.
    Clear { timestamp_ms: i64 },
}

impl PresentationEvent {
    pub fn timestamp_ms(&self) -> i64 {
        match self {
            PresentationEvent::Result(result) => result.timestamp_ms,
            PresentationEvent::Clear { timestamp_ms } => *timestamp_ms,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Cleared,
    /// Older than an event already delivered; suppressed.
    Stale,
    /// The presentation side has gone away.
    Disconnected,
}

pub struct ResultPublisher {
    threshold: f32,
    last_emitted: Mutex<Option<i64>>,
    tx: Sender<PresentationEvent>,
}

impl ResultPublisher {
    /// Create a publisher and the single consumer end for the presentation context.
    pub fn new(threshold: f32) -> (Self, PresentationReceiver) {
        let (tx, rx) = unbounded();
        let publisher = Self {
            threshold,
            last_emitted: Mutex::new(None),
            tx,
        };
        (publisher, PresentationReceiver { rx })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Gate `result` on confidence and deliver it unless it is older than the
    /// newest event already delivered.
    pub fn publish(&self, result: &ClassificationResult, timestamp_ms: i64) -> PublishOutcome {
        let event = match result.top() {
            Some(top) if top.confidence > self.threshold => {
                PresentationEvent::Result(PublishedResult {
                    recognition: top.clone(),
                    timestamp_ms,
                })
            }
            _ => PresentationEvent::Clear { timestamp_ms },
        };

        // Held across the send so concurrent publishers cannot reorder deliveries.
        let mut last = self
            .last_emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if matches!(*last, Some(newest) if timestamp_ms < newest) {
            debug!("Suppressing stale result for frame at {timestamp_ms}");
            metrics::counter!("classify_results_stale_total").increment(1);
            return PublishOutcome::Stale;
        }

        let outcome = match &event {
            PresentationEvent::Result(_) => PublishOutcome::Published,
            PresentationEvent::Clear { .. } => PublishOutcome::Cleared,
        };
        if self.tx.send(event).is_err() {
            return PublishOutcome::Disconnected;
        }
        *last = Some(timestamp_ms);
        outcome
    }
}

/// Consumer end owned by the presentation context.
pub struct PresentationReceiver {
    rx: Receiver<PresentationEvent>,
}

impl PresentationReceiver {
    /// Block for the next event. `None` once the publisher is gone.
    pub fn recv(&self) -> Option<PresentationEvent> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<PresentationEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Drain everything currently queued without blocking.
    pub fn try_iter(&self) -> impl Iterator<Item = PresentationEvent> + '_ {
        self.rx.try_iter()
    }

    /// Raw channel, for use in `crossbeam_channel::select!`.
    pub fn channel(&self) -> &Receiver<PresentationEvent> {
        &self.rx
    }
}
