//! Durable rolling CSV file sink.
//!
//! This module provides:
//! - [`RollingCsvConfig`] — target path, rotation size, flush cadence, retry policy
//! - [`RollingCsvSink`] — buffered writer with a single background flush task
//! - [`create_message`] / [`header_row`] — the fixed CSV layout
//!
//! Emission only appends a rendered row to an in-memory buffer. A background
//! task drains the buffer into the current file every flush interval. The
//! buffer is cleared only after the file write has succeeded, so a failed
//! flush is retried on the next tick with nothing lost. When a write pushes
//! the file past its size limit, the *next* flush goes to a new file
//! (`metrics.csv`, `metrics_1.csv`, `metrics_2.csv`, …).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::diagnostics::FailureReporter;
use crate::error::{Result, TelemetryError};
use crate::event::Event;
use crate::fs::{FileAccess, LocalFileSystem};
use crate::metadata::{APP_NAME, APP_VERSION, HostMetadata};
use crate::properties::PropertyValue;
use crate::retry::RetryPolicy;
use crate::traits::{BoxFuture, Sink};
use crate::types::{EventId, LogRecord, Severity};

/// Default interval between background flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(300);

/// Default size at which the sink moves on to the next file.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024; // 10 MB

#[cfg(windows)]
const NEWLINE: &str = "\r\n";
#[cfg(not(windows))]
const NEWLINE: &str = "\n";

/// Where a CSV column takes its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    /// Event property with this key.
    Property(&'static str),
    /// `timestamp` property, or the time of rendering.
    Timestamp,
    /// `severityLevel` property as a numeric level.
    SeverityLevel,
    /// Host machine name.
    AppHost,
    /// Application name.
    AppName,
    /// Application version.
    AppVersion,
    /// Activity id.
    OperationId,
    /// Parent activity id.
    OperationParentId,
    /// Nested map property rendered as `key=value;key=value`.
    Map(&'static str),
}

const COLUMNS: &[(&str, Column)] = &[
    ("Timestamp", Column::Timestamp),
    ("ExperimentId", Column::Property("experimentId")),
    ("ExecutionSystem", Column::Property("executionSystem")),
    ("ProfileName", Column::Property("executionProfileName")),
    ("ClientId", Column::Property("clientId")),
    ("ToolName", Column::Property("toolName")),
    ("ToolVersion", Column::Property("toolVersion")),
    ("ScenarioName", Column::Property("scenarioName")),
    ("ScenarioStartTime", Column::Property("scenarioStartTime")),
    ("ScenarioEndTime", Column::Property("scenarioEndTime")),
    ("MetricName", Column::Property("metricName")),
    ("MetricValue", Column::Property("metricValue")),
    ("MetricUnit", Column::Property("metricUnit")),
    ("MetricCategorization", Column::Property("metricCategorization")),
    ("MetricDescription", Column::Property("metricDescription")),
    ("MetricRelativity", Column::Property("metricRelativity")),
    ("MetricVerbosity", Column::Property("metricVerbosity")),
    ("AppHost", Column::AppHost),
    ("AppName", Column::AppName),
    ("AppVersion", Column::AppVersion),
    ("OperatingSystemPlatform", Column::Property("operatingSystemPlatform")),
    ("PlatformArchitecture", Column::Property("platformArchitecture")),
    ("SeverityLevel", Column::SeverityLevel),
    ("OperationId", Column::OperationId),
    ("OperationParentId", Column::OperationParentId),
    ("Metadata", Column::Map("metadata")),
    ("Metadata_Host", Column::Map("metadata_host")),
    ("ToolResults", Column::Property("toolResults")),
    ("Tags", Column::Property("tags")),
];

/// Column names, in file order.
pub fn column_names() -> impl Iterator<Item = &'static str> {
    COLUMNS.iter().map(|(name, _)| *name)
}

/// The header row, without a line terminator.
#[must_use]
pub fn header_row() -> String {
    let fields: Vec<String> = column_names().map(quote).collect();
    fields.join(",")
}

/// Renders one event as a CSV row, preceded by a line terminator.
///
/// Every column is always present; columns whose property is missing
/// render as `""`.
#[must_use]
pub fn create_message(event: &Event) -> String {
    let fields: Vec<String> = COLUMNS
        .iter()
        .map(|(_, column)| quote(&column_value(*column, event)))
        .collect();
    format!("{NEWLINE}{}", fields.join(","))
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn column_value(column: Column, event: &Event) -> String {
    match column {
        Column::Property(key) => event.property(key).map(ToString::to_string).unwrap_or_default(),
        Column::Timestamp => match event.property("timestamp") {
            Some(PropertyValue::String(s)) => s.clone(),
            Some(PropertyValue::Timestamp(ts)) => ts.to_rfc3339_opts(SecondsFormat::Micros, true),
            _ => Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        },
        Column::SeverityLevel => severity_level(event.property("severityLevel")).to_string(),
        Column::AppHost => HostMetadata::current().machine_name.clone(),
        Column::AppName => APP_NAME.to_string(),
        Column::AppVersion => APP_VERSION.to_string(),
        Column::OperationId => event.activity_id().to_string(),
        Column::OperationParentId => event
            .parent_activity_id()
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
        Column::Map(key) => match event.property(key) {
            Some(PropertyValue::Map(map)) => {
                let pairs: Vec<String> = map
                    .iter()
                    .filter(|(_, v)| v.is_primitive())
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                pairs.join(";")
            }
            Some(other) => other.to_string(),
            None => String::new(),
        },
    }
}

fn severity_level(value: Option<&PropertyValue>) -> u8 {
    let parsed = match value {
        Some(PropertyValue::Integer(level)) => Severity::from_level(*level),
        Some(PropertyValue::String(text)) => text
            .parse::<i64>()
            .ok()
            .and_then(Severity::from_level)
            .or_else(|| text.parse::<Severity>().ok()),
        _ => None,
    };
    parsed.unwrap_or(Severity::Information).level()
}

/// Configuration for a [`RollingCsvSink`].
#[derive(Debug, Clone)]
pub struct RollingCsvConfig {
    /// First file of the rotation set, e.g. `logs/metrics.csv`.
    pub path: PathBuf,
    /// Size at which the next flush moves to a new file (bytes).
    pub max_file_size: u64,
    /// Interval between background flushes.
    pub flush_interval: Duration,
    /// Retry policy for each flush.
    pub retry: RetryPolicy,
}

impl Default for RollingCsvConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logs/metrics.csv"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

impl RollingCsvConfig {
    /// Creates a config writing to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Sets the rotation size.
    #[must_use]
    pub const fn with_max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Sets the flush interval.
    #[must_use]
    pub const fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Rotation state, created by the first flush.
enum FileState {
    Uninitialized,
    Active {
        /// Files of the rotation set, oldest first. The last is current.
        paths: Vec<PathBuf>,
        next_ordinal: u32,
    },
}

struct RotationName<'a> {
    dir: &'a Path,
    stem: String,
    ext: String,
}

impl<'a> RotationName<'a> {
    fn of(path: &'a Path) -> Self {
        Self {
            dir: path.parent().unwrap_or_else(|| Path::new("")),
            stem: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ext: path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default(),
        }
    }

    fn path(&self, ordinal: u32) -> PathBuf {
        if ordinal == 0 {
            self.dir.join(format!("{}{}", self.stem, self.ext))
        } else {
            self.dir.join(format!("{}_{ordinal}{}", self.stem, self.ext))
        }
    }

    /// Ordinal of a file in this rotation set, if it belongs to it.
    ///
    /// Only names that [`RotationName::path`] would produce are accepted, so
    /// `metrics_01.csv` and `metrics_+1.csv` are not part of the set.
    fn ordinal(&self, path: &Path) -> Option<u32> {
        let name = path.file_name()?.to_str()?;
        let middle = name.strip_prefix(&self.stem)?.strip_suffix(&self.ext)?;
        if middle.is_empty() {
            return Some(0);
        }
        let digits = middle.strip_prefix('_')?;
        let ordinal: u32 = digits.parse().ok()?;
        (ordinal > 0 && ordinal.to_string() == digits).then_some(ordinal)
    }
}

struct Shared {
    config: RollingCsvConfig,
    fs: Arc<dyn FileAccess>,
    buffer: Mutex<String>,
    file: Mutex<FileState>,
    reporter: FailureReporter,
}

impl Shared {
    /// One write attempt. Holds the file lock for the whole attempt so only
    /// one writer touches the files; the buffer lock is only taken briefly.
    fn write_pending(&self) -> Result<usize> {
        let mut state = self.file.lock();
        let pending = {
            let buffer = self.buffer.lock();
            if buffer.is_empty() {
                return Ok(0);
            }
            buffer.clone()
        };

        if matches!(*state, FileState::Uninitialized) {
            *state = self.initialize()?;
        }
        let FileState::Active {
            paths,
            next_ordinal,
        } = &mut *state
        else {
            return Ok(0);
        };
        let Some(current) = paths.last().cloned() else {
            return Ok(0);
        };

        let existing = self.fs.file_len(&current)?;
        let mut bytes = String::with_capacity(pending.len() + 512);
        if existing == 0 {
            bytes.push_str(&header_row());
        }
        bytes.push_str(&pending);
        self.fs.append(&current, bytes.as_bytes())?;

        if existing + bytes.len() as u64 > self.config.max_file_size {
            let next = RotationName::of(&self.config.path).path(*next_ordinal);
            info!(
                current = %current.display(),
                next = %next.display(),
                size = existing + bytes.len() as u64,
                "rotating metrics file"
            );
            paths.push(next);
            *next_ordinal += 1;
        }

        self.buffer.lock().replace_range(..pending.len(), "");
        Ok(pending.len())
    }

    fn initialize(&self) -> Result<FileState> {
        let naming = RotationName::of(&self.config.path);
        if !naming.dir.as_os_str().is_empty() {
            self.fs.create_dir_all(naming.dir)?;
        }

        let list_dir = if naming.dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            naming.dir
        };
        let mut existing: Vec<(u32, PathBuf)> = self
            .fs
            .list_files(list_dir)?
            .into_iter()
            .filter_map(|p| naming.ordinal(&p).map(|ordinal| (ordinal, naming.path(ordinal))))
            .collect();
        existing.sort_by_key(|(ordinal, _)| *ordinal);

        let next_ordinal = existing.last().map_or(1, |(ordinal, _)| ordinal + 1);
        let paths = if existing.is_empty() {
            vec![self.config.path.clone()]
        } else {
            existing.into_iter().map(|(_, p)| p).collect()
        };
        debug!(files = paths.len(), current = ?paths.last(), "metrics file set initialized");
        Ok(FileState::Active {
            paths,
            next_ordinal,
        })
    }

    async fn flush_with_retry(&self) -> Result<usize> {
        self.config
            .retry
            .run("rolling-csv flush", || async move { self.write_pending() })
            .await
    }
}

struct BackgroundTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Buffered, rotating CSV file sink for metric events.
pub struct RollingCsvSink {
    shared: Arc<Shared>,
    task: Mutex<Option<BackgroundTask>>,
}

impl RollingCsvSink {
    /// Creates a sink writing to the local file system.
    #[must_use]
    pub fn new(config: RollingCsvConfig) -> Self {
        Self::with_file_access(config, Arc::new(LocalFileSystem))
    }

    /// Creates a sink using the given file access.
    #[must_use]
    pub fn with_file_access(config: RollingCsvConfig, fs: Arc<dyn FileAccess>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                fs,
                buffer: Mutex::new(String::new()),
                file: Mutex::new(FileState::Uninitialized),
                reporter: FailureReporter::default(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Bytes waiting to be written.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.shared.buffer.lock().len()
    }

    /// Files of the rotation set, oldest first. Empty before the first flush.
    #[must_use]
    pub fn file_paths(&self) -> Vec<PathBuf> {
        match &*self.shared.file.lock() {
            FileState::Uninitialized => Vec::new(),
            FileState::Active { paths, .. } => paths.clone(),
        }
    }
}

impl Sink for RollingCsvSink {
    fn name(&self) -> &str {
        "rolling-csv"
    }

    fn try_log(&self, _: &EventId, _: Severity, record: &LogRecord<'_>) -> Result<()> {
        if let Some(event) = record.as_event() {
            let row = create_message(event);
            self.shared.buffer.lock().push_str(&row);
        }
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TelemetryError::RuntimeUnavailable(self.name().to_string()))?;
        if self.shared.config.flush_interval.is_zero() {
            return Err(TelemetryError::InvalidConfiguration(
                "rolling-csv flush interval must be positive".to_string(),
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
            let mut ticker = interval(shared.config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = shared.flush_with_retry().await {
                            shared.reporter.report("rolling-csv", "flush", &err);
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
            match tokio::time::timeout(timeout, self.shared.flush_with_retry()).await {
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
