//! Pipeline configuration.
//!
//! Configuration for the telemetry pipeline, including:
//! - Rolling CSV file settings
//! - Marker file location and overrides
//! - Summary file location and cadence
//! - Real-time trace budget
//! - Streaming queue and cadence
//! - Retry policy and named sampling rates

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TelemetryError};
use crate::logger::{Channel, DEFAULT_FLUSH_TIMEOUT, TelemetryLogger};
use crate::marker_file::{DEFAULT_MARKER_FILE, MarkerFileConfig, MarkerFileSink};
use crate::metadata::AgentMetadata;
use crate::realtime::{RealTimeSink, TracingTransport};
use crate::retry::RetryPolicy;
use crate::rolling_csv::{
    DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_FILE_SIZE, RollingCsvConfig, RollingCsvSink,
};
use crate::router::Route;
use crate::sampling::SamplingRegistry;
use crate::size_budget::{MAX_TRACE_EVENT_BYTES, MIN_TRACE_EVENT_BYTES, SizeBudget};
use crate::streaming::{
    DEFAULT_AUTO_FLUSH_INTERVAL, DEFAULT_QUEUE_CAPACITY, StreamClient, StreamingConfig,
    StreamingSink,
};
use crate::summary_file::{self, DEFAULT_SUMMARY_FILE, SummaryFileConfig, SummaryFileSink};
use crate::types::{LogType, Severity};

/// Rolling CSV file settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RollingCsvSection {
    /// Whether the sink is registered.
    pub enabled: bool,
    /// Base file path; rotated files get `_<n>` before the extension.
    pub path: PathBuf,
    /// Size after which the next flush moves to a new file.
    pub max_file_size_bytes: u64,
    /// Interval between background flushes in milliseconds.
    pub flush_interval_ms: u64,
    /// Records below this severity are skipped.
    pub min_severity: Severity,
}

impl Default for RollingCsvSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("logs/metrics.csv"),
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL.as_millis() as u64,
            min_severity: Severity::Trace,
        }
    }
}

/// Marker file settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MarkerFileSection {
    /// Whether the sink is registered.
    pub enabled: bool,
    /// File path; relative paths resolve against the CSV log directory.
    pub path: PathBuf,
    /// Entries added to, or replacing, the detected metadata.
    pub overrides: BTreeMap<String, String>,
}

impl Default for MarkerFileSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(DEFAULT_MARKER_FILE),
            overrides: BTreeMap::new(),
        }
    }
}

/// Summary file settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SummaryFileSection {
    /// Whether the sink is registered.
    pub enabled: bool,
    /// File path; relative paths resolve against the CSV log directory.
    pub path: PathBuf,
    /// Interval between background flushes in milliseconds.
    pub flush_interval_ms: u64,
}

impl Default for SummaryFileSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(DEFAULT_SUMMARY_FILE),
            flush_interval_ms: summary_file::DEFAULT_FLUSH_INTERVAL.as_millis() as u64,
        }
    }
}

/// Real-time trace settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RealtimeSection {
    /// Whether the sink is registered.
    pub enabled: bool,
    /// Records below this severity are skipped.
    pub min_severity: Severity,
    /// Byte budget per trace record.
    pub max_event_bytes: usize,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            enabled: true,
            min_severity: Severity::Information,
            max_event_bytes: MAX_TRACE_EVENT_BYTES,
        }
    }
}

/// Streaming settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamingSection {
    /// Whether the sink is registered. Requires a stream client.
    pub enabled: bool,
    /// Records below this severity are skipped.
    pub min_severity: Severity,
    /// Queue capacity.
    pub max_capacity: usize,
    /// Interval between background transmissions in milliseconds.
    pub auto_flush_interval_ms: u64,
    /// Attach channel counters to envelopes.
    pub diagnostics: bool,
}

impl Default for StreamingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            min_severity: Severity::Information,
            max_capacity: DEFAULT_QUEUE_CAPACITY,
            auto_flush_interval_ms: DEFAULT_AUTO_FLUSH_INTERVAL.as_millis() as u64,
            diagnostics: false,
        }
    }
}

/// Retry settings for file I/O.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySection {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base backoff in milliseconds; retry `n` waits `n * backoff_ms`.
    pub backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            backoff_ms: policy.backoff.as_millis() as u64,
        }
    }
}

impl RetrySection {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.backoff_ms))
    }
}

/// Main pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Per-sink deadline for flush and shutdown in milliseconds.
    pub flush_timeout_ms: u64,
    /// Rolling CSV settings.
    pub rolling_csv: RollingCsvSection,
    /// Marker file settings.
    pub marker_file: MarkerFileSection,
    /// Summary file settings.
    pub summary_file: SummaryFileSection,
    /// Real-time trace settings.
    pub realtime: RealtimeSection,
    /// Streaming settings.
    pub streaming: StreamingSection,
    /// Retry settings.
    pub retry: RetrySection,
    /// Named sampling rates.
    pub sampling: BTreeMap<String, u64>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT.as_millis() as u64,
            rolling_csv: RollingCsvSection::default(),
            marker_file: MarkerFileSection::default(),
            summary_file: SummaryFileSection::default(),
            realtime: RealtimeSection::default(),
            streaming: StreamingSection::default(),
            retry: RetrySection::default(),
            sampling: BTreeMap::new(),
        }
    }
}

impl TelemetryConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TelemetryError::InvalidConfiguration(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| TelemetryError::InvalidConfiguration(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(TelemetryError::InvalidConfiguration(msg.to_string()));

        if self.flush_timeout_ms == 0 {
            return invalid("flush_timeout_ms must be greater than 0");
        }

        if self.rolling_csv.enabled {
            if self.rolling_csv.path.file_stem().is_none() {
                return invalid("rolling_csv.path must name a file");
            }
            if self.rolling_csv.max_file_size_bytes == 0 {
                return invalid("rolling_csv.max_file_size_bytes must be greater than 0");
            }
            if self.rolling_csv.flush_interval_ms == 0 {
                return invalid("rolling_csv.flush_interval_ms must be greater than 0");
            }
        }

        if self.marker_file.enabled && self.marker_file.path.as_os_str().is_empty() {
            return invalid("marker_file.path cannot be empty");
        }

        if self.summary_file.enabled {
            if self.summary_file.path.as_os_str().is_empty() {
                return invalid("summary_file.path cannot be empty");
            }
            if self.summary_file.flush_interval_ms == 0 {
                return invalid("summary_file.flush_interval_ms must be greater than 0");
            }
        }

        if self.realtime.enabled && self.realtime.max_event_bytes < MIN_TRACE_EVENT_BYTES {
            return Err(TelemetryError::InvalidConfiguration(format!(
                "realtime.max_event_bytes must be at least {MIN_TRACE_EVENT_BYTES}"
            )));
        }

        if self.streaming.enabled && self.streaming.auto_flush_interval_ms == 0 {
            return invalid("streaming.auto_flush_interval_ms must be greater than 0");
        }

        if let Some((name, _)) = self.sampling.iter().find(|(_, rate)| **rate == 0) {
            return Err(TelemetryError::InvalidConfiguration(format!(
                "sampling rate for '{name}' must be greater than 0"
            )));
        }

        Ok(())
    }

    /// Directory holding the CSV files and, by default, the marker file.
    #[must_use]
    pub fn log_directory(&self) -> PathBuf {
        self.rolling_csv
            .path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }

    /// Builds a logger with every enabled sink on its default route.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails, or if streaming is enabled
    /// without a client.
    pub fn build_logger(
        &self,
        agent: AgentMetadata,
        stream_client: Option<Arc<dyn StreamClient>>,
    ) -> Result<TelemetryLogger> {
        self.validate()?;
        let retry = self.retry.policy();
        let mut builder = TelemetryLogger::builder()
            .flush_timeout(Duration::from_millis(self.flush_timeout_ms));

        if self.rolling_csv.enabled {
            let config = RollingCsvConfig::new(&self.rolling_csv.path)
                .with_max_file_size(self.rolling_csv.max_file_size_bytes)
                .with_flush_interval(Duration::from_millis(self.rolling_csv.flush_interval_ms))
                .with_retry(retry);
            builder = builder.channel(
                Channel::new(RollingCsvSink::new(config))
                    .with_route(Route::LogType(LogType::Metric))
                    .with_min_severity(self.rolling_csv.min_severity),
            );
        }

        if self.marker_file.enabled {
            let mut config = MarkerFileConfig::new(self.log_directory())
                .with_file(&self.marker_file.path)
                .with_retry(retry);
            for (key, value) in &self.marker_file.overrides {
                config = config.with_override(key.as_str(), value.as_str());
            }
            builder = builder.channel(Channel::new(MarkerFileSink::new(config, agent)));
        }

        if self.summary_file.enabled {
            let config = SummaryFileConfig::new(self.log_directory())
                .with_file(&self.summary_file.path)
                .with_flush_interval(Duration::from_millis(self.summary_file.flush_interval_ms))
                .with_retry(retry);
            builder = builder.channel(
                Channel::new(SummaryFileSink::new(config)).with_route(summary_file::route()),
            );
        }

        if self.realtime.enabled {
            let max_bytes = self.realtime.max_event_bytes;
            let sink = RealTimeSink::with_budget(
                TracingTransport::new(max_bytes),
                SizeBudget::new(max_bytes),
            );
            builder = builder.channel(
                Channel::new(sink)
                    .with_route(Route::Traces)
                    .with_min_severity(self.realtime.min_severity),
            );
        }

        if self.streaming.enabled {
            let client = stream_client.ok_or_else(|| {
                TelemetryError::InvalidConfiguration(
                    "streaming is enabled but no stream client was provided".to_string(),
                )
            })?;
            let config = StreamingConfig::default()
                .with_max_capacity(self.streaming.max_capacity)
                .with_auto_flush_interval(Duration::from_millis(
                    self.streaming.auto_flush_interval_ms,
                ))
                .with_diagnostics(self.streaming.diagnostics);
            builder = builder.channel(
                Channel::new(StreamingSink::new(config, client))
                    .with_route(Route::Telemetry)
                    .with_min_severity(self.streaming.min_severity),
            );
        }

        Ok(builder.build())
    }

    /// A registry pre-populated with the configured sampling rates.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured rate is zero.
    pub fn sampling_registry(&self) -> Result<SamplingRegistry> {
        let registry = SamplingRegistry::new();
        for (name, rate) in &self.sampling {
            registry.get_or_create(name, *rate)?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::StreamEvent;
    use crate::traits::BoxFuture;
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct NullClient;

    impl StreamClient for NullClient {
        fn send_batch<'a>(&'a self, _: &'a [StreamEvent]) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn names(logger: &TelemetryLogger) -> Vec<String> {
        logger
            .channels()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    #[test]
    fn empty_json_uses_defaults() {
        let config = TelemetryConfig::from_json("{}").expect("should parse");
        assert_eq!(config, TelemetryConfig::default());
        assert!(config.rolling_csv.enabled);
        assert!(!config.streaming.enabled);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff_ms, 1000);
        assert_eq!(config.realtime.max_event_bytes, MAX_TRACE_EVENT_BYTES);
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "flush_timeout_ms": 5000,
            "rolling_csv": {
                "path": "/var/log/bench/metrics.csv",
                "max_file_size_bytes": 1048576,
                "flush_interval_ms": 100,
                "min_severity": "warning"
            },
            "marker_file": { "path": "marker.txt", "overrides": { "region": "westus2" } },
            "realtime": { "enabled": false },
            "streaming": { "enabled": true, "diagnostics": true, "max_capacity": 5000 },
            "retry": { "max_retries": 2, "backoff_ms": 10 },
            "sampling": { "DiskIO": 10 }
        }"#;

        let config = TelemetryConfig::from_json(json).expect("should parse");
        assert_eq!(config.flush_timeout_ms, 5000);
        assert_eq!(config.rolling_csv.max_file_size_bytes, 1_048_576);
        assert_eq!(config.rolling_csv.min_severity, Severity::Warning);
        assert_eq!(config.marker_file.overrides["region"], "westus2");
        assert!(!config.realtime.enabled);
        assert!(config.streaming.diagnostics);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.sampling["DiskIO"], 10);
        assert_eq!(config.log_directory(), PathBuf::from("/var/log/bench"));
    }

    #[test]
    fn invalid_json_is_rejected() {
        let err = TelemetryConfig::from_json("{ not json").expect_err("should fail");
        assert!(matches!(err, TelemetryError::InvalidConfiguration(_)));
    }

    #[test]
    fn validation_errors() {
        let mut config = TelemetryConfig::default();
        config.rolling_csv.flush_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = TelemetryConfig::default();
        config.rolling_csv.max_file_size_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = TelemetryConfig::default();
        config.realtime.max_event_bytes = 10;
        assert!(config.validate().is_err());

        let mut config = TelemetryConfig::default();
        config.realtime.max_event_bytes = MIN_TRACE_EVENT_BYTES - 1;
        assert!(config.validate().is_err());
        config.realtime.max_event_bytes = MIN_TRACE_EVENT_BYTES;
        assert!(config.validate().is_ok());

        let err = TelemetryConfig::from_json(r#"{ "realtime": { "max_event_bytes": 128 } }"#)
            .expect_err("budget below the fixed section");
        assert!(err.to_string().contains("max_event_bytes"));

        let mut config = TelemetryConfig::default();
        config.sampling.insert("never".to_string(), 0);
        let err = config.validate().expect_err("zero rate");
        assert!(err.to_string().contains("never"));

        let mut config = TelemetryConfig::default();
        config.summary_file.flush_interval_ms = 0;
        assert!(config.validate().is_err());
        config.summary_file.enabled = false;
        assert!(config.validate().is_ok());

        let mut config = TelemetryConfig::default();
        config.rolling_csv.enabled = false;
        config.rolling_csv.flush_interval_ms = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_file_reads_json() {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(br#"{ "retry": { "max_retries": 1 } }"#)
            .expect("failed to write temp file");

        let config = TelemetryConfig::from_file(file.path()).expect("should load");
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.backoff_ms, 1000);

        let err = TelemetryConfig::from_file("/nonexistent/telemetry.json").expect_err("missing");
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn build_logger_registers_enabled_sinks() {
        let logger = TelemetryConfig::default()
            .build_logger(AgentMetadata::new("agent", "exp"), None)
            .expect("build");
        assert_eq!(
            names(&logger),
            vec!["rolling-csv", "marker-file", "summary-file", "realtime"]
        );

        let mut config = TelemetryConfig::default();
        config.streaming.enabled = true;
        config.rolling_csv.enabled = false;
        let logger = config
            .build_logger(AgentMetadata::default(), Some(Arc::new(NullClient)))
            .expect("build");
        assert_eq!(
            names(&logger),
            vec!["marker-file", "summary-file", "realtime", "streaming"]
        );
    }

    #[test]
    fn streaming_requires_client() {
        let mut config = TelemetryConfig::default();
        config.streaming.enabled = true;
        let err = config
            .build_logger(AgentMetadata::default(), None)
            .expect_err("should fail");
        assert!(matches!(err, TelemetryError::InvalidConfiguration(_)));
    }

    #[test]
    fn sampling_registry_is_prepopulated() {
        let mut config = TelemetryConfig::default();
        config.sampling.insert("DiskIO".to_string(), 10);
        config.sampling.insert("Network".to_string(), 3);

        let registry = config.sampling_registry().expect("registry");
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("DiskIO").expect("defined").rate(), 10);
    }
}
