//! The real-time trace channel.
//!
//! Every record is serialized within the transport's byte budget by a
//! [`SizeBudget`] and written synchronously to a [`TraceTransport`]. If the
//! transport still rejects the record as oversized, one minimal record
//! (fixed fields only) is tried before giving up.

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::event::Event;
use crate::size_budget::{MAX_TRACE_EVENT_BYTES, SizeBudget, TraceRecord};
use crate::traits::Sink;
use crate::types::{EventId, LogRecord, Severity};

/// Target used by [`TracingTransport`].
pub const REALTIME_TARGET: &str = "bench_telemetry::realtime";

/// Errors reported by a real-time transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The record exceeds the transport's own limit.
    #[error("record of {size} bytes exceeds transport limit of {limit} bytes")]
    Oversized {
        /// Payload size.
        size: usize,
        /// Transport limit.
        limit: usize,
    },

    /// The transport cannot accept records right now.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// A fixed-capacity, single-record transport.
pub trait TraceTransport: Send + Sync {
    /// Writes one record.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Oversized`] if the record is too large for
    /// the transport, or another error if it could not be written.
    fn write(&self, record: &TraceRecord) -> std::result::Result<(), TransportError>;
}

/// Writes trace records as structured `tracing` events.
#[derive(Debug, Clone, Copy)]
pub struct TracingTransport {
    max_bytes: usize,
}

impl Default for TracingTransport {
    fn default() -> Self {
        Self::new(MAX_TRACE_EVENT_BYTES)
    }
}

impl TracingTransport {
    /// Creates a transport that rejects payloads above `max_bytes`.
    #[must_use]
    pub const fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl TraceTransport for TracingTransport {
    fn write(&self, record: &TraceRecord) -> std::result::Result<(), TransportError> {
        if record.size() > self.max_bytes {
            return Err(TransportError::Oversized {
                size: record.size(),
                limit: self.max_bytes,
            });
        }

        let activity_id = record.activity_id;
        let parent_activity_id = record.parent_activity_id.unwrap_or_else(Uuid::nil);
        let name = record.event_name.as_str();
        let payload = record.payload.as_str();
        let constrained = record.constrained;
        let constrain_failed = record.constrain_failed;

        match record.severity {
            Severity::Trace => tracing::trace!(
                target: REALTIME_TARGET,
                %activity_id, %parent_activity_id, name, payload, constrained, constrain_failed,
                "telemetry"
            ),
            Severity::Information => tracing::info!(
                target: REALTIME_TARGET,
                %activity_id, %parent_activity_id, name, payload, constrained, constrain_failed,
                "telemetry"
            ),
            Severity::Warning => tracing::warn!(
                target: REALTIME_TARGET,
                %activity_id, %parent_activity_id, name, payload, constrained, constrain_failed,
                "telemetry"
            ),
            Severity::Error | Severity::Critical => tracing::error!(
                target: REALTIME_TARGET,
                %activity_id, %parent_activity_id, name, payload, constrained, constrain_failed,
                "telemetry"
            ),
        }
        Ok(())
    }
}

/// Sink for the real-time trace channel.
pub struct RealTimeSink<T> {
    transport: T,
    budget: SizeBudget,
}

impl<T: TraceTransport> RealTimeSink<T> {
    /// Creates a sink with the default budget.
    pub fn new(transport: T) -> Self {
        Self::with_budget(transport, SizeBudget::default())
    }

    /// Creates a sink with a custom budget.
    pub const fn with_budget(transport: T, budget: SizeBudget) -> Self {
        Self { transport, budget }
    }

    /// The underlying transport.
    pub const fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: TraceTransport> Sink for RealTimeSink<T> {
    fn name(&self) -> &str {
        "realtime"
    }

    fn try_log(
        &self,
        event_id: &EventId,
        severity: Severity,
        record: &LogRecord<'_>,
    ) -> Result<()> {
        let name = event_id.label();
        let text_event;
        let event = match record {
            LogRecord::Event(event) => *event,
            LogRecord::Message(message) => {
                text_event = Event::new(Uuid::nil()).with_property("message", *message);
                &text_event
            }
        };

        let trace = self.budget.serialize(&name, severity, event);
        match self.transport.write(&trace) {
            Ok(()) => Ok(()),
            Err(TransportError::Oversized { size, limit }) => {
                let minimal = self.budget.minimal(&name, severity, event);
                if let Err(err) = self.transport.write(&minimal) {
                    debug!(event = %name, size, limit, error = %err, "dropping oversized trace record");
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
