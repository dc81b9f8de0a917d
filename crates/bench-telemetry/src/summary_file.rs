//! Human-readable run summary.
//!
//! [`SummaryFileSink`] turns a handful of well-known events into a plain text
//! report (`summary.txt` by default):
//! - `ProfileExecution.Begin` traces — agent version, client, profile, experiment
//! - `*.ProcessDetails` traces — command, exit code and clipped process output
//! - `*SucceededOrFailed` metrics — one outcome block per component
//! - `*ScenarioResult` metrics — critical metrics, cached until the next table
//! - `*LogMetricsEnd` collections — a table of the cached metrics
//! - error records — error type, message and call stack
//! - `Exit Code: *` traces — a closing table of every component outcome
//!
//! Every line starts with a UTC timestamp and is wrapped at
//! [`MAX_LINE_LENGTH`] characters. The report lives in memory and the whole
//! file is rewritten by the background task whenever it has changed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::diagnostics::FailureReporter;
use crate::error::{Result, TelemetryError};
use crate::event::Event;
use crate::fs::{FileAccess, LocalFileSystem};
use crate::properties::PropertyValue;
use crate::retry::RetryPolicy;
use crate::router::Route;
use crate::traits::{BoxFuture, Sink};
use crate::types::{EventId, LogRecord, LogType, Severity};

/// Default summary file name.
pub const DEFAULT_SUMMARY_FILE: &str = "summary.txt";

/// Longest line written to the summary, timestamp prefix included.
pub const MAX_LINE_LENGTH: usize = 250;

/// Default interval between background flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(300);

/// Categories the summary reacts to.
pub const SUMMARY_CATEGORIES: [LogType; 4] = [
    LogType::Metric,
    LogType::MetricsCollection,
    LogType::Error,
    LogType::Trace,
];

const TAB: &str = "    ";
const OUTPUT_TAB: &str = "        ";
const OUTPUT_LINE_LENGTH: usize = 150;
const OUTPUT_EDGE_LINES: usize = 3;
const RULE_WIDTH: usize = 100;

/// The route a summary sink is registered with.
#[must_use]
pub fn route() -> Route {
    Route::custom(|event_id, _, record| {
        record.is_telemetry() && SUMMARY_CATEGORIES.iter().any(|t| event_id.is(*t))
    })
}

/// Configuration for a [`SummaryFileSink`].
#[derive(Debug, Clone)]
pub struct SummaryFileConfig {
    /// Directory relative file names resolve against.
    pub directory: PathBuf,
    /// File name, or an absolute path.
    pub file: PathBuf,
    /// Interval between background flushes.
    pub flush_interval: Duration,
    /// Retry policy for file writes.
    pub retry: RetryPolicy,
}

impl Default for SummaryFileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            file: PathBuf::from(DEFAULT_SUMMARY_FILE),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

impl SummaryFileConfig {
    /// Creates a config writing `summary.txt` into `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }

    /// Sets the file name or absolute path.
    #[must_use]
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = file.into();
        self
    }

    /// Sets the flush interval.
    #[must_use]
    pub const fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resolved file path.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        if self.file.is_absolute() {
            self.file.clone()
        } else {
            self.directory.join(&self.file)
        }
    }
}

/// Appends `message` to `out` one line at a time, each prefixed with the
/// timestamp and wrapped at [`MAX_LINE_LENGTH`] characters. Continuation
/// lines are indented to the prefix width. Empty lines are skipped.
pub fn append_message(out: &mut String, message: &str, at: DateTime<Utc>) {
    let prefix = format!("{}  |  ", at.format("%Y-%m-%d %H:%M:%S%.3f"));
    let indent = " ".repeat(prefix.len());
    let width = MAX_LINE_LENGTH.saturating_sub(prefix.len()).max(1);

    for line in message.lines() {
        let chars: Vec<char> = line.chars().collect();
        for (idx, segment) in chars.chunks(width).enumerate() {
            out.push_str(if idx == 0 { &prefix } else { &indent });
            out.extend(segment);
            out.push('\n');
        }
    }
}

/// Collects the lines of one report section.
struct Section {
    out: String,
    at: DateTime<Utc>,
}

impl Section {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            out: String::new(),
            at,
        }
    }

    fn line(&mut self, message: &str) {
        append_message(&mut self.out, message, self.at);
    }

    fn blank(&mut self) {
        self.out.push('\n');
    }

    fn finish(self) -> String {
        self.out
    }
}

fn ends_with_ignore_case(s: &str, suffix: &str) -> bool {
    s.len() >= suffix.len()
        && s.as_bytes()[s.len() - suffix.len()..].eq_ignore_ascii_case(suffix.as_bytes())
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn text(event: &Event, key: &str) -> String {
    event
        .property(key)
        .map(ToString::to_string)
        .unwrap_or_default()
}

fn nested_text(value: Option<&PropertyValue>, key: &str) -> String {
    value
        .and_then(PropertyValue::as_map)
        .and_then(|map| map.get(key))
        .map(ToString::to_string)
        .unwrap_or_default()
}

fn timestamp(value: Option<&PropertyValue>) -> Option<DateTime<Utc>> {
    match value? {
        PropertyValue::Timestamp(ts) => Some(*ts),
        PropertyValue::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        _ => None,
    }
}

fn format_elapsed(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let ms = (end - start).num_milliseconds().max(0);
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        ms / 3_600_000,
        ms / 60_000 % 60,
        ms / 1000 % 60,
        ms % 1000
    )
}

/// `a,b,c` from either a plain value or a map of entries carrying a `type`.
fn component_types(value: &PropertyValue) -> String {
    match value {
        PropertyValue::Map(entries) => entries
            .iter()
            .map(|(key, entry)| {
                entry
                    .as_map()
                    .and_then(|inner| inner.get("type"))
                    .map_or_else(|| key.to_string(), ToString::to_string)
            })
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

/// Splits process output into display lines of at most
/// `OUTPUT_LINE_LENGTH` characters, keeping only the first and last few.
fn clip_output(output: &str) -> Vec<String> {
    let mut lines = Vec::new();
    for line in output.lines() {
        let chars: Vec<char> = line.chars().collect();
        if chars.is_empty() {
            lines.push(String::new());
        }
        lines.extend(chars.chunks(OUTPUT_LINE_LENGTH).map(|c| c.iter().collect()));
    }

    if lines.is_empty() {
        return vec![format!("{OUTPUT_TAB}(none)")];
    }
    if lines.len() <= 2 * OUTPUT_EDGE_LINES {
        return lines.iter().map(|l| format!("{OUTPUT_TAB}{l}")).collect();
    }

    let mut clipped: Vec<String> = lines[..OUTPUT_EDGE_LINES]
        .iter()
        .map(|l| format!("{OUTPUT_TAB}{l}"))
        .collect();
    clipped.push(format!("{OUTPUT_TAB}{OUTPUT_TAB}... (output truncated) ..."));
    clipped.extend(
        lines[lines.len() - OUTPUT_EDGE_LINES..]
            .iter()
            .map(|l| format!("{OUTPUT_TAB}{l}")),
    );
    clipped
}

#[derive(Debug, Clone)]
struct ComponentOutcome {
    component: String,
    scenario: String,
    outcome: &'static str,
}

#[derive(Debug, Clone)]
struct CachedMetric {
    scenario: String,
    name: String,
    value: String,
    unit: String,
}

/// The report and the state needed to extend it.
#[derive(Debug, Default)]
struct Report {
    text: String,
    revision: u64,
    components: Vec<ComponentOutcome>,
    metrics: Vec<CachedMetric>,
}

impl Report {
    fn apply(&mut self, event_id: &EventId, event: &Event, at: DateTime<Utc>) {
        let name = event_id.label();
        let section = if event_id.is(LogType::Metric) {
            if ends_with_ignore_case(&name, "SucceededOrFailed") {
                Some(self.component_outcome(event, at))
            } else {
                if ends_with_ignore_case(&name, "ScenarioResult") {
                    self.cache_metric(event);
                }
                None
            }
        } else if event_id.is(LogType::MetricsCollection) {
            ends_with_ignore_case(&name, "LogMetricsEnd")
                .then(|| self.metrics_table(at))
                .flatten()
        } else if event_id.is(LogType::Error) {
            Some(error_block(&name, event, at))
        } else if event_id.is(LogType::Trace) {
            if name.eq_ignore_ascii_case("ProfileExecution.Begin") {
                Some(profile_header(event, at))
            } else if ends_with_ignore_case(&name, ".ProcessDetails") {
                Some(process_block(event, at))
            } else if starts_with_ignore_case(&name, "Exit Code: ") {
                Some(self.final_summary(&name, at))
            } else {
                None
            }
        } else {
            None
        };

        if let Some(section) = section.filter(|s| !s.is_empty()) {
            self.text.push_str(&section);
            self.revision += 1;
        }
    }

    fn component_outcome(&mut self, event: &Event, at: DateTime<Utc>) -> String {
        let component = text(event, "toolName");
        let scenario = text(event, "scenarioName");
        let outcome = if text(event, "metricName") == "Succeeded" {
            "PASS"
        } else {
            "* Failed *"
        };
        let duration = match (
            timestamp(event.property("scenarioStartTime")),
            timestamp(event.property("scenarioEndTime")),
        ) {
            (Some(start), Some(end)) => format_elapsed(start, end),
            _ => "unknown".to_string(),
        };

        let mut section = Section::new(at);
        section.blank();
        section.line(&format!("Component : {component} -> {scenario}"));
        section.line(&"-".repeat(RULE_WIDTH));
        section.line(&format!("Duration  : {duration}"));
        section.line(&format!("Outcome   : {outcome}"));
        section.blank();

        self.components.push(ComponentOutcome {
            component,
            scenario,
            outcome,
        });
        section.finish()
    }

    /// Only critical (verbosity 0) metrics are kept.
    fn cache_metric(&mut self, event: &Event) {
        let critical = match event.property("metricVerbosity") {
            Some(PropertyValue::Integer(level)) => *level == 0,
            Some(PropertyValue::String(level)) => level.trim() == "0",
            _ => false,
        };
        if critical {
            self.metrics.push(CachedMetric {
                scenario: text(event, "scenarioName"),
                name: text(event, "metricName"),
                value: text(event, "metricValue"),
                unit: text(event, "metricUnit"),
            });
        }
    }

    /// Renders and clears the cached metrics. Nothing is rendered if no
    /// metric was cached since the last table.
    fn metrics_table(&mut self, at: DateTime<Utc>) -> Option<String> {
        const HEADERS: [&str; 4] = ["Scenario", "Name", "Value", "Unit"];

        if self.metrics.is_empty() {
            return None;
        }
        let metrics = std::mem::take(&mut self.metrics);
        let rows: Vec<[&str; 4]> = metrics
            .iter()
            .map(|m| [m.scenario.as_str(), m.name.as_str(), m.value.as_str(), m.unit.as_str()])
            .collect();
        let widths: Vec<usize> = (0..HEADERS.len())
            .map(|col| {
                rows.iter()
                    .map(|row| row[col].chars().count())
                    .chain([HEADERS[col].len()])
                    .max()
                    .unwrap_or(0)
            })
            .collect();
        let render = |cells: &[&str; 4]| {
            let mut line = String::from(TAB);
            for (cell, width) in cells.iter().zip(&widths) {
                line.push_str("| ");
                line.push_str(cell);
                line.push_str(&" ".repeat(width - cell.chars().count() + 1));
            }
            line.push('|');
            line
        };

        let mut section = Section::new(at);
        section.blank();
        section.line("Metrics:");
        section.line(&render(&HEADERS));
        // Three characters of framing per column plus the closing pipe.
        let rule_width = widths.iter().sum::<usize>() + 3 * HEADERS.len() + 1;
        section.line(&format!("{TAB}{}", "-".repeat(rule_width)));
        for row in &rows {
            section.line(&render(row));
        }
        section.blank();
        Some(section.finish())
    }

    fn final_summary(&self, exit_line: &str, at: DateTime<Utc>) -> String {
        let mut section = Section::new(at);
        section.line(&"*".repeat(RULE_WIDTH));

        let width = self
            .components
            .iter()
            .map(|c| c.component.chars().count() + c.scenario.chars().count())
            .max()
            .unwrap_or(0)
            + 10;
        for c in &self.components {
            let used = c.component.chars().count() + c.scenario.chars().count();
            section.line(&format!(
                "Component: {} -> {} {} | {} |",
                c.component,
                c.scenario,
                " ".repeat(width - used),
                c.outcome
            ));
        }

        section.line(exit_line);
        section.line(&"*".repeat(RULE_WIDTH));
        section.finish()
    }
}

fn profile_header(event: &Event, at: DateTime<Utc>) -> String {
    let mut section = Section::new(at);
    section.line(&format!("Agent Version: {}", text(event, "appVersion")));
    section.line(&format!("Client Id: {}", text(event, "clientId")));
    section.line(&format!("Profile: {}", text(event, "executionProfile")));
    section.line(&format!("Execution Arguments: {}", text(event, "executionArguments")));
    section.line(&format!("Experiment Id: {}", text(event, "experimentId")));
    for (label, key) in [
        ("Dependencies", "executionProfileDependencies"),
        ("Actions", "executionProfileActions"),
        ("Monitors", "executionProfileMonitors"),
    ] {
        if let Some(value) = event.property(key) {
            section.line(&format!("{label}: {}", component_types(value)));
        }
    }
    section.finish()
}

fn process_block(event: &Event, at: DateTime<Utc>) -> String {
    let process = event.property("process");
    let mut section = Section::new(at);
    section.line(&"-".repeat(RULE_WIDTH));
    section.line("Process Details");
    section.line(&format!("{TAB}PID          : {}", nested_text(process, "id")));
    section.line(&format!("{TAB}Working Dir  : {}", nested_text(process, "workingDir")));
    section.line(&format!("{TAB}Command      : {}", nested_text(process, "command")));
    section.line(&format!("{TAB}Exit Code    : {}", nested_text(process, "exitCode")));

    section.line(&format!("{TAB}Standard Output:"));
    for line in clip_output(&nested_text(process, "standardOutput")) {
        section.line(&line);
    }
    section.line(&format!("{TAB}Standard Error:"));
    for line in clip_output(&nested_text(process, "standardError")) {
        section.line(&line);
    }
    section.finish()
}

fn error_block(name: &str, event: &Event, at: DateTime<Utc>) -> String {
    let error = event.property("error");
    let error_type = nested_text(error, "errorType");
    let mut message = nested_text(error, "errorMessage");
    if message.is_empty() {
        message = name.to_string();
    }

    let mut section = Section::new(at);
    section.line("*** Error ***");
    section.line(&format!("{TAB}Error Type: {error_type}"));
    section.line(&format!("{TAB}Error Message: {message}"));
    if let Some(callstack) = event.property("errorCallstack") {
        section.line(&format!("{TAB}Error Call Stack: {callstack}"));
    }
    section.blank();
    section.finish()
}

struct Shared {
    config: SummaryFileConfig,
    path: PathBuf,
    fs: Arc<dyn FileAccess>,
    report: Mutex<Report>,
    // Revision last written to disk; held for the whole write.
    written: Mutex<u64>,
    reporter: FailureReporter,
}

impl Shared {
    /// One write attempt. Returns false if the file was already current.
    fn write_pending(&self) -> Result<bool> {
        let mut written = self.written.lock();
        let (contents, revision) = {
            let report = self.report.lock();
            if report.revision == *written {
                return Ok(false);
            }
            (report.text.clone(), report.revision)
        };

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            self.fs.create_dir_all(dir)?;
        }
        self.fs.write(&self.path, contents.as_bytes())?;
        *written = revision;
        debug!(path = %self.path.display(), revision, "summary file written");
        Ok(true)
    }

    async fn flush_with_retry(&self) -> Result<bool> {
        self.config
            .retry
            .run("summary-file flush", || async move { self.write_pending() })
            .await
    }
}

struct BackgroundTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Writes a readable summary of the run to a text file.
pub struct SummaryFileSink {
    shared: Arc<Shared>,
    task: Mutex<Option<BackgroundTask>>,
}

impl SummaryFileSink {
    /// Creates a sink writing to the local file system.
    #[must_use]
    pub fn new(config: SummaryFileConfig) -> Self {
        Self::with_file_access(config, Arc::new(LocalFileSystem))
    }

    /// Creates a sink using the given file access.
    #[must_use]
    pub fn with_file_access(config: SummaryFileConfig, fs: Arc<dyn FileAccess>) -> Self {
        let path = config.path();
        Self {
            shared: Arc::new(Shared {
                config,
                path,
                fs,
                report: Mutex::new(Report::default()),
                written: Mutex::new(0),
                reporter: FailureReporter::default(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Resolved file path.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.shared.path
    }

    /// The report as it stands.
    #[must_use]
    pub fn contents(&self) -> String {
        self.shared.report.lock().text.clone()
    }
}

impl Sink for SummaryFileSink {
    fn name(&self) -> &str {
        "summary-file"
    }

    fn try_log(&self, event_id: &EventId, _: Severity, record: &LogRecord<'_>) -> Result<()> {
        if let Some(event) = record.as_event() {
            self.shared.report.lock().apply(event_id, event, Utc::now());
        }
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TelemetryError::RuntimeUnavailable(self.name().to_string()))?;
        if self.shared.config.flush_interval.is_zero() {
            return Err(TelemetryError::InvalidConfiguration(
                "summary-file flush interval must be positive".to_string(),
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
                            shared.reporter.report("summary-file", "flush", &err);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::Properties;
    use chrono::TimeZone;
    use std::io;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use uuid::Uuid;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .single()
            .expect("valid time")
    }

    fn event() -> Event {
        Event::new(Uuid::new_v4())
    }

    fn outcome(tool: &str, scenario: &str, result: &str) -> Event {
        let start = at();
        event()
            .with_property("toolName", tool)
            .with_property("scenarioName", scenario)
            .with_property("metricName", result)
            .with_property("scenarioStartTime", start)
            .with_property("scenarioEndTime", start + chrono::Duration::milliseconds(83_250))
    }

    fn scenario_metric(scenario: &str, name: &str, value: f64, verbosity: i64) -> Event {
        event()
            .with_property("scenarioName", scenario)
            .with_property("metricName", name)
            .with_property("metricValue", value)
            .with_property("metricUnit", "ops/s")
            .with_property("metricVerbosity", verbosity)
    }

    fn apply(report: &mut Report, log_type: LogType, name: &'static str, event: &Event) {
        report.apply(&EventId::new(log_type, name), event, at());
    }

    fn lines(text: &str) -> Vec<&str> {
        text.lines().filter(|l| !l.is_empty()).collect()
    }

    /// Fails the first `failures` writes with a sharing violation.
    struct FlakyFileSystem {
        failures: AtomicUsize,
        writes: AtomicUsize,
    }

    impl FlakyFileSystem {
        fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(failures),
                writes: AtomicUsize::new(0),
            })
        }
    }

    impl FileAccess for FlakyFileSystem {
        fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
            LocalFileSystem.create_dir_all(dir)
        }

        fn list_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
            LocalFileSystem.list_files(dir)
        }

        fn file_len(&self, path: &Path) -> io::Result<u64> {
            LocalFileSystem.file_len(path)
        }

        fn append(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
            LocalFileSystem.append(path, bytes)
        }

        fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(io::Error::other("file is being used by another process"));
            }
            LocalFileSystem.write(path, bytes)
        }
    }

    fn fast_config(dir: &TempDir) -> SummaryFileConfig {
        SummaryFileConfig::new(dir.path().join("logs"))
            .with_flush_interval(Duration::from_millis(10))
            .with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
    }

    // ===== Line Format Tests =====

    #[test]
    fn lines_carry_timestamp_prefix() {
        let mut out = String::new();
        append_message(&mut out, "first\n\nsecond", at());
        assert_eq!(
            out,
            "2024-03-09 14:05:07.000  |  first\n2024-03-09 14:05:07.000  |  second\n"
        );
    }

    #[test]
    fn long_lines_wrap_under_the_prefix() {
        let mut out = String::new();
        append_message(&mut out, &"x".repeat(500), at());

        let wrapped: Vec<&str> = out.lines().collect();
        assert_eq!(wrapped.len(), 3);
        assert!(wrapped.iter().all(|l| l.chars().count() <= MAX_LINE_LENGTH));
        assert_eq!(wrapped[0].chars().count(), MAX_LINE_LENGTH);
        assert!(wrapped[1].starts_with(&" ".repeat(28)));
        assert_eq!(out.matches('x').count(), 500);
    }

    #[test]
    fn config_path_resolution() {
        assert_eq!(
            SummaryFileConfig::new("/var/logs").path(),
            PathBuf::from("/var/logs/summary.txt")
        );
        assert_eq!(
            SummaryFileConfig::new("/var/logs").with_file("/tmp/run.txt").path(),
            PathBuf::from("/tmp/run.txt")
        );
    }

    // ===== Report Tests =====

    #[test]
    fn component_outcomes_and_final_summary() {
        let mut report = Report::default();
        apply(&mut report, LogType::Metric, "FioExecutor.SucceededOrFailed", &outcome("fio", "randread", "Succeeded"));
        apply(&mut report, LogType::Metric, "NtttcpExecutor.SucceededOrFailed", &outcome("ntttcp", "tcp_4k", "Failed"));
        apply(&mut report, LogType::Trace, "Exit Code: 0", &event());

        let text = &report.text;
        assert!(text.contains("Component : fio -> randread"));
        assert!(text.contains("Duration  : 00:01:23.250"));
        assert!(text.contains("Outcome   : PASS"));
        assert!(text.contains("Outcome   : * Failed *"));

        let closing: Vec<&str> = lines(text)
            .into_iter()
            .filter(|l| l.contains("Component: "))
            .collect();
        assert_eq!(closing.len(), 2);
        assert!(closing[0].ends_with("| PASS |"));
        assert!(closing[1].ends_with("| * Failed * |"));
        // Outcome columns line up.
        let column = |l: &str| {
            let start = l.find("Component: ").expect("label");
            start + l[start..].find(" | ").expect("separator")
        };
        assert_eq!(column(closing[0]), column(closing[1]));
        assert!(text.contains("Exit Code: 0"));
        assert_eq!(text.matches(&"*".repeat(RULE_WIDTH)).count(), 2);
    }

    #[test]
    fn metrics_table_holds_critical_metrics_only() {
        let mut report = Report::default();
        apply(&mut report, LogType::Metric, "fio.ScenarioResult", &scenario_metric("randread", "iops", 1250.5, 0));
        apply(&mut report, LogType::Metric, "fio.ScenarioResult", &scenario_metric("randread", "latency_p99", 3.2, 2));
        apply(&mut report, LogType::Metric, "fio.ScenarioResult", &scenario_metric("randwrite", "iops", 800.0, 0));
        assert!(report.text.is_empty());

        apply(&mut report, LogType::MetricsCollection, "randread.LogMetricsEnd", &event());
        let rows: Vec<&str> = lines(&report.text)
            .into_iter()
            .filter(|l| l.ends_with(" |"))
            .collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].contains("| Scenario  | Name | Value  | Unit  |"));
        assert!(rows[1].contains("| randread  | iops | 1250.5 | ops/s |"));
        assert!(rows[2].contains("| randwrite | iops | 800    | ops/s |"));
        assert!(!report.text.contains("latency_p99"));

        // The cache is drained by each table.
        let revision = report.revision;
        apply(&mut report, LogType::MetricsCollection, "randread.LogMetricsEnd", &event());
        assert_eq!(report.revision, revision);
        assert_eq!(report.text.matches("Metrics:").count(), 1);
    }

    #[test]
    fn process_output_is_clipped() {
        let stdout: Vec<String> = (1..=10).map(|i| format!("line {i}")).collect();
        let mut process = Properties::new();
        process.insert("id", 4321);
        process.insert("command", "fio --name=randread");
        process.insert("exitCode", 0);
        process.insert("standardOutput", stdout.join("\n"));
        process.insert("standardError", "");
        let mut report = Report::default();
        apply(
            &mut report,
            LogType::Trace,
            "FioExecutor.ProcessDetails",
            &event().with_property("process", process),
        );

        let text = &report.text;
        assert!(text.contains("PID          : 4321"));
        assert!(text.contains("Command      : fio --name=randread"));
        for kept in ["line 1", "line 3", "line 8", "line 10"] {
            assert!(text.contains(kept), "{kept} should be kept");
        }
        assert!(!text.contains("line 5"));
        assert!(text.contains("... (output truncated) ..."));
        assert!(text.contains("(none)"));
    }

    #[test]
    fn long_output_lines_are_split() {
        let clipped = clip_output(&"y".repeat(320));
        assert_eq!(clipped.len(), 3);
        assert_eq!(clipped[0], format!("{OUTPUT_TAB}{}", "y".repeat(OUTPUT_LINE_LENGTH)));
        assert_eq!(clipped[2], format!("{OUTPUT_TAB}{}", "y".repeat(20)));
    }

    #[test]
    fn profile_header_and_errors() {
        let mut actions = Properties::new();
        let mut fio = Properties::new();
        fio.insert("type", "FioExecutor");
        actions.insert("0", fio);
        actions.insert("1", "plain");
        let begin = event()
            .with_property("appVersion", "1.16.0")
            .with_property("clientId", "agent-01")
            .with_property("executionProfile", "PERF-IO-FIO.json")
            .with_property("experimentId", "exp-42")
            .with_property("executionProfileActions", actions);
        let failure = event()
            .with_error("TimeoutError", "workload did not finish")
            .with_property("errorCallstack", "at run_workload");

        let mut report = Report::default();
        apply(&mut report, LogType::Trace, "ProfileExecution.Begin", &begin);
        apply(&mut report, LogType::Error, "FioExecutor.ExecuteError", &failure);

        let text = &report.text;
        assert!(text.contains("Client Id: agent-01"));
        assert!(text.contains("Profile: PERF-IO-FIO.json"));
        assert!(text.contains("Actions: FioExecutor,1"));
        assert!(!text.contains("Monitors:"));
        assert!(text.contains("*** Error ***"));
        assert!(text.contains("Error Type: TimeoutError"));
        assert!(text.contains("Error Message: workload did not finish"));
        assert!(text.contains("Error Call Stack: at run_workload"));
    }

    #[test]
    fn unrelated_events_leave_report_untouched() {
        let mut report = Report::default();
        apply(&mut report, LogType::Metric, "fio.Measure", &scenario_metric("r", "iops", 1.0, 0));
        apply(&mut report, LogType::Trace, "FioExecutor.ExecuteStart", &event());
        apply(&mut report, LogType::SystemEvent, "Exit Code: 0", &event());
        assert!(report.text.is_empty());
        assert_eq!(report.revision, 0);
    }

    #[test]
    fn route_selects_summary_categories() {
        let route = route();
        let e = event();
        let record = LogRecord::Event(&e);
        assert!(route.matches(&EventId::new(LogType::Metric, "m"), Severity::Information, &record));
        assert!(route.matches(&EventId::new(LogType::Error, "e"), Severity::Error, &record));
        assert!(!route.matches(&EventId::new(LogType::SystemEvent, "s"), Severity::Information, &record));
        assert!(!route.matches(
            &EventId::new(LogType::Trace, "t"),
            Severity::Information,
            &LogRecord::Message("text")
        ));
    }

    // ===== Flush Tests =====

    #[tokio::test]
    async fn nothing_logged_writes_nothing() {
        let dir = TempDir::new().expect("temp dir");
        let sink = SummaryFileSink::new(fast_config(&dir));
        sink.flush(TIMEOUT).await.expect("flush");
        assert!(!sink.path().exists());
    }

    #[tokio::test]
    async fn flush_rewrites_whole_report_and_skips_unchanged() {
        let dir = TempDir::new().expect("temp dir");
        let fs = FlakyFileSystem::failing(0);
        let sink = SummaryFileSink::with_file_access(fast_config(&dir), Arc::clone(&fs) as Arc<dyn FileAccess>);

        let id = EventId::new(LogType::Metric, "FioExecutor.SucceededOrFailed");
        let first = outcome("fio", "randread", "Succeeded");
        sink.try_log(&id, Severity::Information, &LogRecord::Event(&first)).expect("log");
        sink.flush(TIMEOUT).await.expect("flush");
        sink.flush(TIMEOUT).await.expect("flush");
        assert_eq!(fs.writes.load(Ordering::SeqCst), 1);

        let second = outcome("fio", "randwrite", "Failed");
        sink.try_log(&id, Severity::Information, &LogRecord::Event(&second)).expect("log");
        sink.flush(TIMEOUT).await.expect("flush");

        let written = std::fs::read_to_string(sink.path()).expect("read");
        assert_eq!(written, sink.contents());
        assert!(written.contains("-> randread"));
        assert!(written.contains("-> randwrite"));
        assert_eq!(fs.writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_write_failures_are_retried() {
        let dir = TempDir::new().expect("temp dir");
        let fs = FlakyFileSystem::failing(2);
        let sink = SummaryFileSink::with_file_access(fast_config(&dir), Arc::clone(&fs) as Arc<dyn FileAccess>);

        let id = EventId::new(LogType::Trace, "Exit Code: 3");
        sink.try_log(&id, Severity::Information, &LogRecord::Event(&event())).expect("log");
        sink.flush(TIMEOUT).await.expect("flush");

        assert_eq!(fs.writes.load(Ordering::SeqCst), 3);
        assert!(std::fs::read_to_string(sink.path()).expect("read").contains("Exit Code: 3"));
    }

    #[tokio::test]
    async fn exhausted_retries_keep_report_pending() {
        let dir = TempDir::new().expect("temp dir");
        let fs = FlakyFileSystem::failing(10);
        let config = fast_config(&dir).with_retry(RetryPolicy::new(1, Duration::from_millis(1)));
        let sink = SummaryFileSink::with_file_access(config, Arc::clone(&fs) as Arc<dyn FileAccess>);

        let id = EventId::new(LogType::Trace, "Exit Code: 1");
        sink.try_log(&id, Severity::Information, &LogRecord::Event(&event())).expect("log");
        assert!(sink.flush(TIMEOUT).await.is_err());

        fs.failures.store(0, Ordering::SeqCst);
        sink.flush(TIMEOUT).await.expect("flush");
        assert!(std::fs::read_to_string(sink.path()).expect("read").contains("Exit Code: 1"));
    }

    // ===== Lifecycle Tests =====

    #[tokio::test]
    async fn background_task_writes_and_stop_drains() {
        let dir = TempDir::new().expect("temp dir");
        let sink = SummaryFileSink::new(fast_config(&dir));
        sink.start().expect("start");

        let id = EventId::new(LogType::Metric, "FioExecutor.SucceededOrFailed");
        let first = outcome("fio", "randread", "Succeeded");
        sink.try_log(&id, Severity::Information, &LogRecord::Event(&first)).expect("log");
        for _ in 0..200 {
            if sink.path().exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sink.path().exists());

        let exit = EventId::new(LogType::Trace, "Exit Code: 0");
        sink.try_log(&exit, Severity::Information, &LogRecord::Event(&event())).expect("log");
        sink.stop(TIMEOUT).await.expect("stop");
        assert!(std::fs::read_to_string(sink.path()).expect("read").contains("Exit Code: 0"));
    }

    #[test]
    fn start_requires_runtime() {
        let dir = TempDir::new().expect("temp dir");
        let sink = SummaryFileSink::new(fast_config(&dir));
        assert!(matches!(sink.start(), Err(TelemetryError::RuntimeUnavailable(_))));
    }
}
