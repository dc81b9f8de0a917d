//! Core identifiers shared by the front-end, routes, and sinks.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Severity of an emitted record, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Fine-grained diagnostic detail.
    Trace = 0,
    /// Normal operation.
    #[default]
    #[serde(alias = "info")]
    Information = 1,
    /// Something unexpected but recoverable.
    Warning = 2,
    /// An operation failed.
    Error = 3,
    /// The agent cannot continue.
    Critical = 4,
}

impl Severity {
    /// Returns true if this severity is at least as severe as `other`.
    #[must_use]
    pub fn is_at_least(self, other: Self) -> bool {
        self >= other
    }

    /// Returns the severity name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Information => "information",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Numeric level used in persisted output.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }

    /// Maps a numeric level back to a severity.
    #[must_use]
    pub const fn from_level(level: i64) -> Option<Self> {
        match level {
            0 => Some(Self::Trace),
            1 => Some(Self::Information),
            2 => Some(Self::Warning),
            3 => Some(Self::Error),
            4 => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "info" | "information" => Ok(Self::Information),
            "warn" | "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" | "fatal" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Numeric categories carried in [`EventId::id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogType {
    /// No category.
    Undefined = 0,
    /// Diagnostic trace.
    Trace = 101,
    /// Error record.
    Error = 102,
    /// Host/system event.
    SystemEvent = 103,
    /// Single measurement.
    Metric = 105,
    /// Batch of measurements.
    MetricsCollection = 106,
}

impl LogType {
    /// The numeric id for this category.
    #[must_use]
    pub const fn id(self) -> i32 {
        self as i32
    }
}

/// Identifies what was emitted: a numeric category plus an optional name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventId {
    /// Numeric category, usually a [`LogType`].
    pub id: i32,
    /// Event name.
    pub name: Option<Cow<'static, str>>,
}

impl EventId {
    /// Creates an id with a category and a name.
    #[must_use]
    pub fn new(log_type: LogType, name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            id: log_type.id(),
            name: Some(name.into()),
        }
    }

    /// Creates an uncategorized, named id.
    #[must_use]
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            id: LogType::Undefined.id(),
            name: Some(name.into()),
        }
    }

    /// Returns true if the id carries the given category.
    #[must_use]
    pub fn is(&self, log_type: LogType) -> bool {
        self.id == log_type.id()
    }

    /// The name if present, otherwise the numeric id as text.
    #[must_use]
    pub fn label(&self) -> Cow<'_, str> {
        match &self.name {
            Some(name) => Cow::Borrowed(name.as_ref()),
            None => Cow::Owned(self.id.to_string()),
        }
    }

    /// Derives a new id with the same category and `label() + suffix` as its name.
    #[must_use]
    pub fn suffixed(&self, suffix: &str) -> Self {
        Self {
            id: self.id,
            name: Some(Cow::Owned(format!("{}{suffix}", self.label()))),
        }
    }
}

impl From<&'static str> for EventId {
    fn from(name: &'static str) -> Self {
        Self::named(name)
    }
}

impl From<String> for EventId {
    fn from(name: String) -> Self {
        Self::named(name)
    }
}

impl From<i32> for EventId {
    fn from(id: i32) -> Self {
        Self { id, name: None }
    }
}

impl From<LogType> for EventId {
    fn from(log_type: LogType) -> Self {
        Self {
            id: log_type.id(),
            name: None,
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// What the front-end hands to a sink.
///
/// Structured telemetry and plain diagnostic lines share the same fan-out;
/// routes use this distinction to keep text out of telemetry-only sinks.
#[derive(Debug, Clone, Copy)]
pub enum LogRecord<'a> {
    /// A structured telemetry event.
    Event(&'a Event),
    /// A plain diagnostic message.
    Message(&'a str),
}

impl<'a> LogRecord<'a> {
    /// Returns the event if this record is structured telemetry.
    #[must_use]
    pub const fn as_event(&self) -> Option<&'a Event> {
        match self {
            Self::Event(event) => Some(event),
            Self::Message(_) => None,
        }
    }

    /// Returns true if this record is a structured telemetry event.
    #[must_use]
    pub const fn is_telemetry(&self) -> bool {
        matches!(self, Self::Event(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Trace < Severity::Information);
        assert!(Severity::Information < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
        assert!(Severity::Error.is_at_least(Severity::Warning));
        assert!(!Severity::Trace.is_at_least(Severity::Information));
    }

    #[test_case("trace", Severity::Trace; "trace")]
    #[test_case("Info", Severity::Information; "info alias")]
    #[test_case("information", Severity::Information; "information")]
    #[test_case("WARNING", Severity::Warning; "uppercase")]
    #[test_case("error", Severity::Error; "error")]
    #[test_case("critical", Severity::Critical; "critical")]
    fn severity_from_str(input: &str, expected: Severity) {
        assert_eq!(input.parse::<Severity>(), Ok(expected));
    }

    #[test]
    fn severity_from_str_rejects_unknown() {
        assert!("loud".parse::<Severity>().is_err());
    }

    #[test]
    fn severity_level_round_trip() {
        for severity in [
            Severity::Trace,
            Severity::Information,
            Severity::Warning,
            Severity::Error,
            Severity::Critical,
        ] {
            assert_eq!(Severity::from_level(i64::from(severity.level())), Some(severity));
        }
        assert_eq!(Severity::from_level(9), None);
    }

    #[test]
    fn severity_serde_lowercase() {
        let json = serde_json::to_string(&Severity::Warning).expect("serialize");
        assert_eq!(json, "\"warning\"");
        let parsed: Severity = serde_json::from_str("\"info\"").expect("deserialize");
        assert_eq!(parsed, Severity::Information);
    }

    #[test]
    fn log_type_ids() {
        assert_eq!(LogType::Undefined.id(), 0);
        assert_eq!(LogType::Trace.id(), 101);
        assert_eq!(LogType::Error.id(), 102);
        assert_eq!(LogType::Metric.id(), 105);
        assert_eq!(LogType::MetricsCollection.id(), 106);
    }

    #[test]
    fn event_id_label_prefers_name() {
        let named = EventId::new(LogType::Metric, "FioMetric");
        assert_eq!(named.label(), "FioMetric");
        assert!(named.is(LogType::Metric));

        let numeric = EventId::from(42);
        assert_eq!(numeric.label(), "42");
        assert_eq!(numeric.to_string(), "42");
    }

    #[test]
    fn suffixed_keeps_category() {
        let id = EventId::new(LogType::Trace, "ProcessExecute");
        let start = id.suffixed("Start");
        assert_eq!(start.id, LogType::Trace.id());
        assert_eq!(start.label(), "ProcessExecuteStart");

        let numeric = EventId::from(7).suffixed("Stop");
        assert_eq!(numeric.label(), "7Stop");
        assert_eq!(numeric.id, 7);
    }

    #[test]
    fn log_record_telemetry_detection() {
        let record = LogRecord::Message("plain text");
        assert!(!record.is_telemetry());
        assert!(record.as_event().is_none());
    }
}
