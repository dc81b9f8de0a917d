//! Batched streaming sink.
//!
//! Records are rendered to JSON envelopes on the producer's thread and queued
//! in memory. A background task hands them to a [`StreamClient`] in batches
//! every auto-flush interval. A batch stays at the front of the queue until
//! the client accepts it, so a rejected or timed-out send is retried on the
//! next tick.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::diagnostics::FailureReporter;
use crate::error::{Result, TelemetryError};
use crate::event::Event;
use crate::metadata::{APP_NAME, APP_VERSION, HostMetadata};
use crate::properties::Properties;
use crate::traits::{BoxFuture, Sink};
use crate::types::{EventId, LogRecord, Severity};

/// Largest envelope, and largest batch, the stream accepts.
pub const MAX_STREAM_EVENT_BYTES: usize = 700_000;

/// Smallest allowed queue capacity.
pub const MIN_QUEUE_CAPACITY: usize = 1001;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000_000;

/// Default interval between background transmissions.
pub const DEFAULT_AUTO_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Dimension keys owned by the envelope. Properties with these names are left out.
const RESERVED_DIMENSIONS: [&str; 4] = [
    "transactionId",
    "durationMs",
    "bufferInfo",
    "exceededSizeLimits",
];

/// One serialized envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    /// UTF-8 JSON body.
    pub body: Vec<u8>,
}

impl StreamEvent {
    /// Body length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Returns true if the body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Delivers batches to the remote stream.
pub trait StreamClient: Send + Sync {
    /// Sends one batch. The whole batch is retried if this fails.
    fn send_batch<'a>(&'a self, batch: &'a [StreamEvent]) -> BoxFuture<'a, Result<()>>;
}

/// Counters describing what the channel did with its events.
#[derive(Debug, Default)]
pub struct ChannelDiagnostics {
    expected: AtomicU64,
    transmitted: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelDiagnostics {
    /// Events handed to the sink.
    pub fn expected(&self) -> u64 {
        self.expected.load(Ordering::Relaxed)
    }

    /// Events delivered to the client.
    pub fn transmitted(&self) -> u64 {
        self.transmitted.load(Ordering::Relaxed)
    }

    /// Event deliveries that failed (an event may fail more than once).
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Events discarded for size or capacity.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn snapshot(&self, queued: usize) -> BufferInfo {
        BufferInfo {
            expected: self.expected(),
            transmitted: self.transmitted(),
            failed: self.failed(),
            dropped: self.dropped(),
            queued: queued as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
struct BufferInfo {
    expected: u64,
    transmitted: u64,
    failed: u64,
    dropped: u64,
    queued: u64,
}

#[derive(Serialize)]
struct Envelope<'a> {
    timestamp: String,
    message: &'a str,
    #[serde(rename = "severityLevel")]
    severity_level: u8,
    #[serde(rename = "itemType")]
    item_type: &'static str,
    #[serde(rename = "operation_Id")]
    operation_id: Uuid,
    #[serde(rename = "operation_ParentId", skip_serializing_if = "Option::is_none")]
    operation_parent_id: Option<Uuid>,
    #[serde(rename = "appName")]
    app_name: &'static str,
    #[serde(rename = "appHost")]
    app_host: &'a str,
    #[serde(rename = "sdkVersion")]
    sdk_version: &'static str,
    #[serde(rename = "customDimensions")]
    custom_dimensions: Dimensions<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Dimensions<'a> {
    transaction_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    buffer_info: Option<BufferInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exceeded_size_limits: Option<&'static str>,
    #[serde(flatten)]
    properties: EventProperties<'a>,
}

struct EventProperties<'a>(&'a Properties);

impl Serialize for EventProperties<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (key, value) in self.0.iter() {
            if RESERVED_DIMENSIONS
                .iter()
                .any(|reserved| reserved.eq_ignore_ascii_case(key))
            {
                continue;
            }
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Configuration for a [`StreamingSink`].
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Queue capacity; raised to [`MIN_QUEUE_CAPACITY`] if lower.
    pub max_capacity: usize,
    /// Interval between background transmissions.
    pub auto_flush_interval: Duration,
    /// Attach channel counters to every envelope as `bufferInfo`.
    pub diagnostics: bool,
    /// Largest envelope and batch size in bytes.
    pub max_bytes: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_capacity: DEFAULT_QUEUE_CAPACITY,
            auto_flush_interval: DEFAULT_AUTO_FLUSH_INTERVAL,
            diagnostics: false,
            max_bytes: MAX_STREAM_EVENT_BYTES,
        }
    }
}

impl StreamingConfig {
    /// Sets the queue capacity.
    #[must_use]
    pub fn with_max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = max_capacity.max(MIN_QUEUE_CAPACITY);
        self
    }

    /// Sets the auto-flush interval.
    #[must_use]
    pub const fn with_auto_flush_interval(mut self, interval: Duration) -> Self {
        self.auto_flush_interval = interval;
        self
    }

    /// Enables or disables `bufferInfo`.
    #[must_use]
    pub const fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics = enabled;
        self
    }

    /// Sets the envelope and batch size limit.
    #[must_use]
    pub const fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

struct Shared {
    config: StreamingConfig,
    client: Arc<dyn StreamClient>,
    app_host: String,
    queue: Mutex<VecDeque<StreamEvent>>,
    transmission: tokio::sync::Mutex<()>,
    diagnostics: ChannelDiagnostics,
    reporter: FailureReporter,
}

impl Shared {
    fn envelope(
        &self,
        name: &str,
        severity: Severity,
        item_type: &'static str,
        event: &Event,
        exceeded: bool,
    ) -> Result<Vec<u8>> {
        let buffer_info = self
            .config
            .diagnostics
            .then(|| self.diagnostics.snapshot(self.queue.lock().len()));
        let envelope = Envelope {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            message: name,
            severity_level: severity.level(),
            item_type,
            operation_id: event.activity_id(),
            operation_parent_id: event.parent_activity_id(),
            app_name: APP_NAME,
            app_host: &self.app_host,
            sdk_version: APP_VERSION,
            custom_dimensions: Dimensions {
                transaction_id: event.transaction_id(),
                duration_ms: event.duration_ms(),
                buffer_info,
                exceeded_size_limits: exceeded.then_some("True"),
                properties: EventProperties(event.properties()),
            },
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn enqueue(&self, event: StreamEvent) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.max_capacity {
            drop(queue);
            self.diagnostics.dropped.fetch_add(1, Ordering::Relaxed);
            self.reporter.report(
                "streaming",
                "enqueue",
                &format_args!("queue full at {} events", self.config.max_capacity),
            );
            return;
        }
        queue.push_back(event);
    }

    /// Copies the next byte-capped batch off the front of the queue.
    ///
    /// The events stay queued until the send succeeds, so a send that fails
    /// or is abandoned mid-flight loses nothing.
    fn peek_batch(&self) -> Vec<StreamEvent> {
        let queue = self.queue.lock();
        let mut batch = Vec::new();
        let mut bytes = 0;
        for next in queue.iter() {
            if !batch.is_empty() && bytes + next.len() > self.config.max_bytes {
                break;
            }
            bytes += next.len();
            batch.push(next.clone());
        }
        batch
    }

    /// Sends one batch. Returns the number of events delivered.
    async fn transmit_once(&self) -> Result<usize> {
        // Only the transmission lock holder removes from the front; producers
        // only append, so the peeked prefix is still at the front afterwards.
        let _guard = self.transmission.lock().await;
        let batch = self.peek_batch();
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        match self.client.send_batch(&batch).await {
            Ok(()) => {
                self.queue.lock().drain(..count);
                self.diagnostics
                    .transmitted
                    .fetch_add(count as u64, Ordering::Relaxed);
                Ok(count)
            }
            Err(err) => {
                self.diagnostics
                    .failed
                    .fetch_add(count as u64, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    async fn transmit_all(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            match self.transmit_once().await? {
                0 => return Ok(total),
                sent => total += sent,
            }
        }
    }
}

struct BackgroundTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Streams envelopes to a remote endpoint in batches.
pub struct StreamingSink {
    shared: Arc<Shared>,
    task: Mutex<Option<BackgroundTask>>,
}

impl StreamingSink {
    /// Creates a sink for the current host.
    #[must_use]
    pub fn new(config: StreamingConfig, client: Arc<dyn StreamClient>) -> Self {
        Self::with_host(config, client, HostMetadata::current())
    }

    /// Creates a sink reporting the given host.
    #[must_use]
    pub fn with_host(
        mut config: StreamingConfig,
        client: Arc<dyn StreamClient>,
        host: &HostMetadata,
    ) -> Self {
        config.max_capacity = config.max_capacity.max(MIN_QUEUE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                client,
                app_host: host.machine_name.clone(),
                queue: Mutex::new(VecDeque::new()),
                transmission: tokio::sync::Mutex::new(()),
                diagnostics: ChannelDiagnostics::default(),
                reporter: FailureReporter::default(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Channel counters.
    #[must_use]
    pub fn diagnostics(&self) -> &ChannelDiagnostics {
        &self.shared.diagnostics
    }

    /// Number of queued envelopes.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Sink for StreamingSink {
    fn name(&self) -> &str {
        "streaming"
    }

    fn try_log(
        &self,
        event_id: &EventId,
        severity: Severity,
        record: &LogRecord<'_>,
    ) -> Result<()> {
        let shared = &self.shared;
        shared.diagnostics.expected.fetch_add(1, Ordering::Relaxed);

        let name = event_id.label();
        let text_event;
        let (event, item_type) = match record {
            LogRecord::Event(event) => (*event, "event"),
            LogRecord::Message(message) => {
                text_event = Event::new(Uuid::nil()).with_property("message", *message);
                (&text_event, "trace")
            }
        };

        let mut body = shared.envelope(&name, severity, item_type, event, false)?;
        if body.len() > shared.config.max_bytes {
            let trimmed = event.without_properties();
            body = shared.envelope(&name, severity, item_type, &trimmed, true)?;
        }
        if body.len() > shared.config.max_bytes {
            shared.diagnostics.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(event = %name, size = body.len(), "dropping oversized stream envelope");
            return Ok(());
        }

        shared.enqueue(StreamEvent { body });
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TelemetryError::RuntimeUnavailable(self.name().to_string()))?;
        if self.shared.config.auto_flush_interval.is_zero() {
            return Err(TelemetryError::InvalidConfiguration(
                "streaming auto-flush interval must be positive".to_string(),
            ));
        }
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let shared = Arc::clone(&self.shared);
        let handle = runtime.spawn(async move {
            let mut ticker = interval(shared.config.auto_flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = shared.transmit_all().await {
                            shared.reporter.report("streaming", "transmit", &err);
                        }
                    }
                }
            }
        });
        *task = Some(BackgroundTask { token, handle });
        Ok(())
    }

    fn flush(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.shared.transmit_all()).await {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(TelemetryError::Timeout(timeout)),
            }
        })
    }

    fn stop(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let task = self.task.lock().take();
            if let Some(task) = task {
                task.token.cancel();
                let _ = task.handle.await;
            }
            self.flush(timeout).await
        })
    }
}
