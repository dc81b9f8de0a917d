//! # bench-telemetry
//!
//! Multi-channel telemetry pipeline for benchmarking agents.
//!
//! This crate provides:
//!
//! - [`Event`] — Structured telemetry events with a case-insensitive property bag
//! - [`TelemetryLogger`] — Synchronous fan-out to registered channels
//! - [`Route`] — Per-channel filtering by category, kind or predicate
//! - [`RealTimeSink`] — Size-bounded trace records for a real-time session
//! - [`RollingCsvSink`] — Buffered, rotating CSV files with retried flushes
//! - [`MarkerFileSink`] — One-time host and agent metadata snapshot
//! - [`StreamingSink`] — Batched delivery through a [`StreamClient`]
//! - [`SummaryFileSink`] — Readable run summary with component outcomes and metric tables
//! - [`SamplingOptions`] — Deterministic 1-in-N sampling of wrapped operations
//! - [`TelemetryConfig`] — JSON configuration and logger assembly
//!
//! ## Example
//!
//! ```rust
//! use bench_telemetry::{Event, EventId, LogType, Severity, TelemetryLogger};
//! use uuid::Uuid;
//!
//! let logger = TelemetryLogger::builder().build();
//!
//! let event = Event::new(Uuid::new_v4())
//!     .with_property("metricName", "iops")
//!     .with_property("metricValue", 1250.5);
//!
//! logger.emit(&EventId::new(LogType::Metric, "Measure"), Severity::Information, &event);
//!
//! let outcome: Result<u32, std::io::Error> =
//!     logger.log_telemetry(&EventId::named("RunWorkload"), &event, None, || Ok(42));
//! assert_eq!(outcome.ok(), Some(42));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod activity;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod fs;
pub mod logger;
pub mod marker_file;
pub mod metadata;
pub mod properties;
pub mod realtime;
pub mod retry;
pub mod rolling_csv;
pub mod router;
pub mod sampling;
pub mod size_budget;
pub mod streaming;
pub mod summary_file;
pub mod traits;
pub mod types;

// Re-export main types
pub use config::TelemetryConfig;
pub use diagnostics::FailureReporter;
pub use error::{Result, TelemetryError};
pub use event::{Event, EventBuilder};
pub use fs::{FileAccess, LocalFileSystem};
pub use logger::{Channel, TelemetryLogger, TelemetryLoggerBuilder};
pub use marker_file::{MarkerFileConfig, MarkerFileSink};
pub use metadata::{AgentMetadata, HostMetadata};
pub use properties::{Properties, PropertyValue};
pub use realtime::{RealTimeSink, TraceTransport, TracingTransport, TransportError};
pub use retry::{RetryPolicy, RetryableError};
pub use rolling_csv::{RollingCsvConfig, RollingCsvSink};
pub use router::Route;
pub use sampling::{SamplingOptions, SamplingRegistry};
pub use size_budget::{SizeBudget, TraceRecord};
pub use streaming::{ChannelDiagnostics, StreamClient, StreamEvent, StreamingConfig, StreamingSink};
pub use summary_file::{SummaryFileConfig, SummaryFileSink};
pub use traits::{BoxFuture, BoxedSink, Sink};
pub use types::{EventId, LogRecord, LogType, Severity};
