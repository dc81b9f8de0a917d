//! Predicate-gated sinks.
//!
//! A [`Route`] is attached to a sink when it is registered and decides, per
//! record, whether the sink sees it at all. Lifecycle calls always pass
//! through.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::traits::{BoxFuture, BoxedSink, Sink};
use crate::types::{EventId, LogRecord, LogType, Severity};

/// Custom routing predicate.
pub type RoutePredicate = Arc<dyn Fn(&EventId, Severity, &LogRecord<'_>) -> bool + Send + Sync>;

/// Which records a sink receives.
#[derive(Clone, Default)]
pub enum Route {
    /// Every record.
    #[default]
    All,
    /// Structured telemetry events only.
    Telemetry,
    /// Records whose event id carries exactly this category.
    LogType(LogType),
    /// Trace and error categories, plus uncategorized records.
    Traces,
    /// Arbitrary predicate.
    Custom(RoutePredicate),
}

impl Route {
    /// Builds a custom route from a closure.
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&EventId, Severity, &LogRecord<'_>) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    /// Returns true if a record should reach the sink.
    #[must_use]
    pub fn matches(&self, event_id: &EventId, severity: Severity, record: &LogRecord<'_>) -> bool {
        match self {
            Self::All => true,
            Self::Telemetry => record.is_telemetry(),
            Self::LogType(log_type) => event_id.is(*log_type),
            Self::Traces => event_id.id <= LogType::Error.id(),
            Self::Custom(predicate) => predicate(event_id, severity, record),
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Telemetry => f.write_str("Telemetry"),
            Self::LogType(t) => f.debug_tuple("LogType").field(t).finish(),
            Self::Traces => f.write_str("Traces"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A sink that only sees records matching its route.
pub struct Routed {
    inner: BoxedSink,
    route: Route,
}

impl Routed {
    /// Wraps `sink` so it only receives records matching `route`.
    #[must_use]
    pub fn wrap(sink: BoxedSink, route: Route) -> Self {
        Self { inner: sink, route }
    }

    /// The route this sink applies.
    #[must_use]
    pub const fn route(&self) -> &Route {
        &self.route
    }
}

impl Sink for Routed {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn try_log(
        &self,
        event_id: &EventId,
        severity: Severity,
        record: &LogRecord<'_>,
    ) -> Result<()> {
        if self.route.matches(event_id, severity, record) {
            self.inner.try_log(event_id, severity, record)
        } else {
            Ok(())
        }
    }

    fn start(&self) -> Result<()> {
        self.inner.start()
    }

    fn flush(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        self.inner.flush(timeout)
    }

    fn stop(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        self.inner.stop(timeout)
    }
}
