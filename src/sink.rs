//! Live-update collaborator: fire-and-forget publication of captured samples.

use tokio::sync::broadcast;
use tracing::trace;

use crate::telemetry::Sample;

/// Receives every sample right after it is persisted.
pub trait SampleSink: Send + Sync {
    /// Publish `sample`. Must not block and never fails.
    fn publish(&self, sample: &Sample);
}

/// Discards everything.
#[derive(Debug, Clone, Default)]
pub struct NullSink;

impl SampleSink for NullSink {
    fn publish(&self, _sample: &Sample) {}
}

/// Fans samples out to any number of `tokio` broadcast receivers.
///
/// Slow receivers lag and lose the oldest samples; with no receivers the
/// sample is dropped.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Sample>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` samples per receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New receiver observing samples published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Sample> {
        self.tx.subscribe()
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl SampleSink for BroadcastSink {
    fn publish(&self, sample: &Sample) {
        if self.tx.send(sample.clone()).is_err() {
            trace!(test = %sample.test_name, "No subscribers, sample dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::telemetry_line;
    use crate::telemetry::TelemetryFrame;
    use chrono::Local;

    fn sample(test: &str) -> Sample {
        let frame = TelemetryFrame::parse(&telemetry_line(3)).unwrap();
        Sample::from_frame(frame, test, "AA", "1", Local::now())
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let sink = BroadcastSink::new(8);
        assert_eq!(sink.receiver_count(), 0);
        sink.publish(&sample("t1"));
    }

    #[test]
    fn test_subscribers_receive_in_order() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.publish(&sample("a"));
        sink.publish(&sample("b"));
        assert_eq!(rx.try_recv().unwrap().test_name, "a");
        assert_eq!(rx.try_recv().unwrap().test_name, "b");
    }
}
