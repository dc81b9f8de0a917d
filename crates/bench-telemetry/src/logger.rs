//! The logging front-end: one emission, every registered channel.
//!
//! This module provides:
//! - [`Channel`] — one registered sink with its route and severity filter
//! - [`TelemetryLogger`] — the fan-out handed to producers
//! - [`TelemetryLoggerBuilder`] — registration, frozen on `build()`

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::debug;

use crate::diagnostics::FailureReporter;
use crate::error::{Result, TelemetryError};
use crate::event::Event;
use crate::router::{Route, Routed};
use crate::traits::{BoxedSink, Sink};
use crate::types::{EventId, LogRecord, Severity};

/// Default time allowed for each sink to drain on flush or shutdown.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(60);

/// One registered sink.
///
/// The channel is the only place sink failures are handled: every `Err`
/// and every panic from the sink is reported through a rate-limited
/// [`FailureReporter`] and otherwise ignored.
pub struct Channel {
    sink: BoxedSink,
    min_severity: Option<Severity>,
    reporter: FailureReporter,
}

impl Channel {
    /// Registers a sink that sees every record.
    pub fn new(sink: impl Sink + 'static) -> Self {
        Self::from_arc(Arc::new(sink))
    }

    /// Registers an already shared sink.
    #[must_use]
    pub fn from_arc(sink: BoxedSink) -> Self {
        Self {
            sink,
            min_severity: None,
            reporter: FailureReporter::default(),
        }
    }

    /// Restricts the sink to records matching `route`.
    #[must_use]
    pub fn with_route(mut self, route: Route) -> Self {
        if !matches!(route, Route::All) {
            self.sink = Arc::new(Routed::wrap(self.sink, route));
        }
        self
    }

    /// Drops records below `severity`.
    #[must_use]
    pub const fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    /// Replaces the failure reporter.
    #[must_use]
    pub fn with_reporter(mut self, reporter: FailureReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Sink name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.sink.name()
    }

    /// Failures reported by this channel.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.reporter.total()
    }

    fn dispatch(&self, event_id: &EventId, severity: Severity, record: &LogRecord<'_>) {
        if self.min_severity.is_some_and(|min| severity < min) {
            return;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.sink.try_log(event_id, severity, record)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.reporter.report(self.sink.name(), "log", &err);
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.reporter
                    .report(self.sink.name(), "log", &format_args!("sink panicked: {message}"));
            }
        }
    }

    async fn flush(&self, timeout: Duration) {
        self.settle("flush", timeout, self.sink.flush(timeout)).await;
    }

    async fn stop(&self, timeout: Duration) {
        self.settle("stop", timeout, self.sink.stop(timeout)).await;
    }

    async fn settle<F>(&self, operation: &str, timeout: Duration, fut: F)
    where
        F: Future<Output = Result<()>>,
    {
        // Sinks bound their own work by `timeout`; the extra margin only
        // catches sinks that ignore it.
        let deadline = timeout.saturating_add(Duration::from_secs(1));
        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.reporter.report(self.sink.name(), operation, &err);
            }
            Err(_) => {
                self.reporter
                    .report(self.sink.name(), operation, &TelemetryError::Timeout(timeout));
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("sink", &self.sink.name())
            .field("min_severity", &self.min_severity)
            .finish_non_exhaustive()
    }
}

/// Fans every emission out to the registered channels.
///
/// Cheap to clone; clones share the same channels. The channel list is fixed
/// when the logger is built, so emission takes no lock of its own.
#[derive(Clone, Debug)]
pub struct TelemetryLogger {
    channels: Arc<[Channel]>,
    flush_timeout: Duration,
}

impl TelemetryLogger {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> TelemetryLoggerBuilder {
        TelemetryLoggerBuilder::default()
    }

    /// Emits a structured event to every channel.
    ///
    /// Never fails and never blocks on I/O.
    pub fn emit(&self, event_id: &EventId, severity: Severity, event: &Event) {
        self.dispatch(event_id, severity, &LogRecord::Event(event));
    }

    /// Emits a plain diagnostic line to every channel.
    pub fn emit_message(&self, event_id: &EventId, severity: Severity, message: &str) {
        self.dispatch(event_id, severity, &LogRecord::Message(message));
    }

    fn dispatch(&self, event_id: &EventId, severity: Severity, record: &LogRecord<'_>) {
        for channel in self.channels.iter() {
            channel.dispatch(event_id, severity, record);
        }
    }

    /// Starts every sink's background work.
    ///
    /// # Errors
    ///
    /// Returns the first sink startup error. Sinks started before the
    /// failing one keep running; call [`TelemetryLogger::shutdown`] to stop
    /// them.
    pub fn start(&self) -> Result<()> {
        for channel in self.channels.iter() {
            channel.sink.start()?;
            debug!(sink = channel.name(), "telemetry sink started");
        }
        Ok(())
    }

    /// Drains every sink once, concurrently.
    pub async fn flush(&self) {
        let timeout = self.flush_timeout;
        join_all(self.channels.iter().map(|c| c.flush(timeout))).await;
    }

    /// Stops every sink, each performing a final flush.
    pub async fn shutdown(&self) {
        let timeout = self.flush_timeout;
        join_all(self.channels.iter().map(|c| c.stop(timeout))).await;
        debug!(channels = self.channels.len(), "telemetry shut down");
    }

    /// Registered channels, in registration order.
    #[must_use]
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Sink failures reported across all channels.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.channels.iter().map(Channel::failures).sum()
    }
}

/// Collects channels for a [`TelemetryLogger`].
#[derive(Debug)]
pub struct TelemetryLoggerBuilder {
    channels: Vec<Channel>,
    flush_timeout: Duration,
}

impl Default for TelemetryLoggerBuilder {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

impl TelemetryLoggerBuilder {
    /// Registers a channel.
    #[must_use]
    pub fn channel(mut self, channel: Channel) -> Self {
        self.channels.push(channel);
        self
    }

    /// Sets the per-sink flush and shutdown timeout.
    #[must_use]
    pub const fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Freezes the registrations.
    #[must_use]
    pub fn build(self) -> TelemetryLogger {
        TelemetryLogger {
            channels: self.channels.into(),
            flush_timeout: self.flush_timeout,
        }
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
