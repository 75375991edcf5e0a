//! Fleet event distribution.
//!
//! Every component publishes through one shared emitter; consumers subscribe
//! to the broadcast channel, and an optional metrics sink mirrors the stream.

use std::sync::Arc;

use fleet_types::{EventSeverity, EventSource, FleetEvent, FleetEventEnvelope};
use tokio::sync::broadcast;
use tracing::warn;

use crate::collaborators::MetricsSink;

const DEFAULT_CAPACITY: usize = 1024;

/// Cloneable handle publishing fleet events.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<FleetEventEnvelope>,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, sink: None }
    }

    /// Mirror every event into a metrics sink.
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEventEnvelope> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: FleetEvent, source: EventSource, severity: EventSeverity) {
        let envelope = FleetEventEnvelope::new(event, source, severity);

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.emit(&envelope) {
                warn!(error = %e, kind = envelope.event.kind(), "Metrics sink rejected event");
            }
        }

        // No subscribers is fine
        let _ = self.tx.send(envelope);
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.tx.receiver_count())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FailingMetricsSink, RecordingMetricsSink};
    use fleet_types::JobId;

    fn cancelled() -> FleetEvent {
        FleetEvent::JobCancelled {
            job_id: JobId::generate(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_and_sink_see_events() {
        let sink = Arc::new(RecordingMetricsSink::new());
        let emitter = EventEmitter::default().with_sink(sink.clone());
        let mut rx = emitter.subscribe();

        emitter.emit(cancelled(), EventSource::Scheduler, EventSeverity::Info);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.source, EventSource::Scheduler);
        assert_eq!(sink.count("job_cancelled"), 1);
    }

    #[test]
    fn test_failing_sink_is_ignored() {
        let emitter = EventEmitter::default().with_sink(Arc::new(FailingMetricsSink));
        emitter.emit(cancelled(), EventSource::Scheduler, EventSeverity::Info);
    }
}
