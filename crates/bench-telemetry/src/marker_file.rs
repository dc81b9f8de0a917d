//! Write-once metadata marker file.
//!
//! The first record of any kind captures a snapshot of host and agent
//! metadata; the sink's background task writes it to disk once. Later
//! records are ignored. Output is one `key : value` line per entry with the
//! keys padded to the same width:
//!
//! ```text
//! clientId                   : agent-01
//! experimentId               : 5c3e…
//! machineName                : bench-host-3
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::diagnostics::FailureReporter;
use crate::error::{Result, TelemetryError};
use crate::fs::{FileAccess, LocalFileSystem};
use crate::metadata::{AgentMetadata, HostMetadata};
use crate::properties::{Properties, PropertyValue};
use crate::retry::RetryPolicy;
use crate::traits::{BoxFuture, Sink};
use crate::types::{EventId, LogRecord, Severity};

/// Default marker file name.
pub const DEFAULT_MARKER_FILE: &str = "metadata.log";

/// Configuration for a [`MarkerFileSink`].
#[derive(Debug, Clone)]
pub struct MarkerFileConfig {
    /// Directory relative file names resolve against.
    pub directory: PathBuf,
    /// File name or path; absolute paths are used as-is.
    pub file: PathBuf,
    /// Extra entries, replacing detected ones with the same key.
    pub overrides: Properties,
    /// Retry policy for directory creation and the write.
    pub retry: RetryPolicy,
}

impl Default for MarkerFileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file: PathBuf::from(DEFAULT_MARKER_FILE),
            overrides: Properties::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl MarkerFileConfig {
    /// Creates a config writing `metadata.log` under `directory`.
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

    /// Adds an override entry.
    #[must_use]
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.overrides.insert(key, value);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resolved path of the marker file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        if self.file.is_absolute() {
            self.file.clone()
        } else {
            self.directory.join(&self.file)
        }
    }
}

/// Renders entries as aligned `key : value` lines.
#[must_use]
pub fn render(entries: &Properties) -> String {
    let width = entries.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    let mut out = String::new();
    for (key, value) in entries.iter() {
        out.push_str(&format!("{key:<width$} : {value}\n"));
    }
    out
}

struct Shared {
    config: MarkerFileConfig,
    agent: AgentMetadata,
    host: HostMetadata,
    fs: Arc<dyn FileAccess>,
    captured: AtomicBool,
    pending: Mutex<Option<String>>,
    writes: AtomicUsize,
    notify: Notify,
    reporter: FailureReporter,
}

impl Shared {
    fn snapshot(&self) -> Properties {
        let mut entries = Properties::new();
        entries.insert("clientId", self.agent.agent_id.as_str());
        entries.insert("experimentId", self.agent.experiment_id.as_str());
        entries.insert("machineName", self.host.machine_name.as_str());
        entries.insert("platformArchitecture", self.host.platform_architecture.as_str());
        entries.insert("operatingSystemVersion", self.host.os_version.as_str());
        entries.insert("operatingSystemDescription", self.host.os_description.as_str());
        entries.insert(
            "timestamp",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        entries.insert("timezone", self.host.timezone.as_str());
        for (key, value) in self.config.overrides.iter() {
            entries.insert(key, value.clone());
        }
        entries
    }

    /// Captures the snapshot on the first call only.
    fn capture(&self) {
        if self.captured.load(Ordering::Acquire) {
            return;
        }
        let mut pending = self.pending.lock();
        if self.captured.load(Ordering::Acquire) {
            return;
        }
        *pending = Some(render(&self.snapshot()));
        self.captured.store(true, Ordering::Release);
        drop(pending);
        self.notify.notify_one();
    }

    async fn write_pending(&self) -> Result<()> {
        let Some(content) = self.pending.lock().take() else {
            return Ok(());
        };
        let path = self.config.path();
        let result = self
            .config
            .retry
            .run("marker file write", || {
                let path = &path;
                let content = &content;
                async move {
                    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                        self.fs.create_dir_all(dir)?;
                    }
                    self.fs.write(path, content.as_bytes())?;
                    Ok::<(), TelemetryError>(())
                }
            })
            .await;

        match result {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                debug!(path = %path.display(), "marker file written");
                Ok(())
            }
            Err(err) => {
                // Keep the snapshot for the final attempt on stop.
                self.pending.lock().get_or_insert(content);
                Err(err)
            }
        }
    }
}

struct BackgroundTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Writes a metadata snapshot once, on the first record.
pub struct MarkerFileSink {
    shared: Arc<Shared>,
    task: Mutex<Option<BackgroundTask>>,
}

impl MarkerFileSink {
    /// Creates a sink for the current host.
    #[must_use]
    pub fn new(config: MarkerFileConfig, agent: AgentMetadata) -> Self {
        Self::with_parts(
            config,
            agent,
            HostMetadata::current().clone(),
            Arc::new(LocalFileSystem),
        )
    }

    /// Creates a sink with explicit host metadata and file access.
    #[must_use]
    pub fn with_parts(
        config: MarkerFileConfig,
        agent: AgentMetadata,
        host: HostMetadata,
        fs: Arc<dyn FileAccess>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                agent,
                host,
                fs,
                captured: AtomicBool::new(false),
                pending: Mutex::new(None),
                writes: AtomicUsize::new(0),
                notify: Notify::new(),
                reporter: FailureReporter::default(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Number of completed file writes (zero or one).
    #[must_use]
    pub fn writes(&self) -> usize {
        self.shared.writes.load(Ordering::SeqCst)
    }
}

impl Sink for MarkerFileSink {
    fn name(&self) -> &str {
        "marker-file"
    }

    fn try_log(&self, _: &EventId, _: Severity, _: &LogRecord<'_>) -> Result<()> {
        self.shared.capture();
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TelemetryError::RuntimeUnavailable(self.name().to_string()))?;
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let shared = Arc::clone(&self.shared);
        let handle = runtime.spawn(async move {
            tokio::select! {
                () = cancelled.cancelled() => {}
                () = shared.notify.notified() => {
                    if let Err(err) = shared.write_pending().await {
                        shared.reporter.report("marker-file", "write", &err);
                    }
                }
            }
        });
        *task = Some(BackgroundTask { token, handle });
        Ok(())
    }

    fn flush(&self, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tokio::time::timeout(timeout, self.shared.write_pending())
                .await
                .map_err(|_| TelemetryError::Timeout(timeout))?
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
