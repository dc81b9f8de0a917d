//! The sink abstraction every telemetry channel implements.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::types::{EventId, LogRecord, Severity};

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One destination for telemetry.
///
/// `try_log` runs on the producer's thread and must only do in-memory work.
/// Sinks that persist or transmit do so from a background task started by
/// [`Sink::start`] and drain on [`Sink::flush`] / [`Sink::stop`].
///
/// Errors returned from any method are never seen by producers: the channel
/// that owns the sink reports them as diagnostics and carries on.
pub trait Sink: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &str;

    /// Handles one record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be accepted.
    fn try_log(&self, event_id: &EventId, severity: Severity, record: &LogRecord<'_>)
    -> Result<()>;

    /// Starts background work. Called once before the first record.
    ///
    /// # Errors
    ///
    /// Returns an error if the background task cannot be started.
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Drains buffered records once, directly, waiting at most `timeout`.
    fn flush(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        let _ = timeout;
        Box::pin(async { Ok(()) })
    }

    /// Stops background work and performs a final flush.
    fn stop(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        self.flush(timeout)
    }
}

impl<S: Sink + ?Sized> Sink for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn try_log(
        &self,
        event_id: &EventId,
        severity: Severity,
        record: &LogRecord<'_>,
    ) -> Result<()> {
        (**self).try_log(event_id, severity, record)
    }

    fn start(&self) -> Result<()> {
        (**self).start()
    }

    fn flush(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        (**self).flush(timeout)
    }

    fn stop(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        (**self).stop(timeout)
    }
}

/// A boxed sink.
pub type BoxedSink = Arc<dyn Sink>;

#[cfg(test)]
pub(crate) mod test_support {
    //! Sink doubles shared by the unit tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::error::TelemetryError;

    /// What a [`RecordingSink`] saw.
    #[derive(Debug, Clone)]
    pub struct Captured {
        pub event_id: EventId,
        pub severity: Severity,
        pub event: Option<crate::event::Event>,
        pub message: Option<String>,
    }

    /// Records every call.
    #[derive(Default)]
    pub struct RecordingSink {
        pub records: Mutex<Vec<Captured>>,
        pub flushes: AtomicUsize,
        pub starts: AtomicUsize,
        pub stops: AtomicUsize,
    }

    impl RecordingSink {
        pub fn count(&self) -> usize {
            self.records.lock().len()
        }

        pub fn names(&self) -> Vec<String> {
            self.records
                .lock()
                .iter()
                .map(|c| c.event_id.label().into_owned())
                .collect()
        }
    }

    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        fn try_log(
            &self,
            event_id: &EventId,
            severity: Severity,
            record: &LogRecord<'_>,
        ) -> Result<()> {
            let (event, message) = match record {
                LogRecord::Event(e) => (Some((*e).clone()), None),
                LogRecord::Message(m) => (None, Some((*m).to_string())),
            };
            self.records.lock().push(Captured {
                event_id: event_id.clone(),
                severity,
                event,
                message,
            });
            Ok(())
        }

        fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn flush(&self, _timeout: Duration) -> BoxFuture<'_, Result<()>> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn stop(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.flush(timeout)
        }
    }

    /// Fails every call.
    #[derive(Default)]
    pub struct FailingSink {
        pub attempts: AtomicUsize,
    }

    impl Sink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn try_log(&self, _: &EventId, _: Severity, _: &LogRecord<'_>) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TelemetryError::Stream("sink offline".to_string()))
        }

        fn flush(&self, _timeout: Duration) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Err(TelemetryError::Stream("sink offline".to_string())) })
        }
    }

    /// Panics on every record.
    pub struct PanickingSink;

    impl Sink for PanickingSink {
        fn name(&self) -> &str {
            "panicking"
        }

        #[allow(clippy::panic)]
        fn try_log(&self, _: &EventId, _: Severity, _: &LogRecord<'_>) -> Result<()> {
            panic!("sink bug")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use super::*;
    use crate::event::Event;
    use uuid::Uuid;

    #[tokio::test]
    async fn default_lifecycle_is_a_no_op() {
        struct Minimal;
        impl Sink for Minimal {
            fn name(&self) -> &str {
                "minimal"
            }
            fn try_log(&self, _: &EventId, _: Severity, _: &LogRecord<'_>) -> Result<()> {
                Ok(())
            }
        }

        let sink = Minimal;
        assert!(sink.start().is_ok());
        assert!(sink.flush(Duration::from_millis(10)).await.is_ok());
        assert!(sink.stop(Duration::from_millis(10)).await.is_ok());
    }

    #[test]
    fn arc_forwards_to_inner() {
        let sink = Arc::new(RecordingSink::default());
        let boxed: BoxedSink = Arc::clone(&sink) as BoxedSink;
        let event = Event::new(Uuid::new_v4());

        boxed
            .try_log(&EventId::named("A"), Severity::Information, &LogRecord::Event(&event))
            .expect("log");
        assert_eq!(sink.count(), 1);
        assert_eq!(boxed.name(), "recording");
    }

    #[test]
    fn sink_is_object_safe() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn Sink>();
    }
}
