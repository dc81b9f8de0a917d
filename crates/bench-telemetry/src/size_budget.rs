//! Byte-budgeted serialization for the real-time trace channel.
//!
//! The real-time transport carries one event per record with a hard ceiling
//! on payload size. [`SizeBudget`] always produces a payload within that
//! ceiling: the fixed identifier fields are never touched, and only the
//! `context` object (the event properties) is shortened when needed.
//!
//! Payload layout:
//!
//! ```text
//! {"eventName":..,"severity":..,"activityId":..,"parentActivityId":..,
//!  "transactionId":..,"durationMs":..,"userIdentity":..,"context":{..}}
//! ```

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Result, TelemetryError};
use crate::event::Event;
use crate::properties::{Properties, PropertyValue};
use crate::types::Severity;

/// Hard ceiling on a real-time trace payload, in bytes.
pub const MAX_TRACE_EVENT_BYTES: usize = 65_356;

/// Longest escaped length kept for free-text fixed fields.
pub const MAX_FIXED_TEXT_BYTES: usize = 1024;

/// Smallest context budget worth serializing into.
pub const MIN_CONTEXT_BYTES: usize = 64;

const CONTEXT_KEY: &str = "context";
const CONSTRAIN_ERROR_KEY: &str = "constrainError";

/// Upper bound on the fixed section: two free-text fields at their cap plus
/// the keys, identifiers, severity and duration.
pub const MAX_FIXED_SECTION_BYTES: usize = 2 * MAX_FIXED_TEXT_BYTES + 512;

/// Smallest budget that always leaves [`MIN_CONTEXT_BYTES`] of context after
/// the largest possible fixed section.
pub const MIN_TRACE_EVENT_BYTES: usize =
    MAX_FIXED_SECTION_BYTES + CONTEXT_KEY.len() + 4 + MIN_CONTEXT_BYTES;

/// A serialized record ready for the real-time transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    /// Activity the event belongs to.
    pub activity_id: Uuid,
    /// Parent activity, if any.
    pub parent_activity_id: Option<Uuid>,
    /// Severity of the event.
    pub severity: Severity,
    /// Event name.
    pub event_name: String,
    /// JSON payload.
    pub payload: String,
    /// The context was shortened to fit the budget.
    pub constrained: bool,
    /// Shortening failed and the payload carries only a diagnostic.
    pub constrain_failed: bool,
}

impl TraceRecord {
    /// Payload size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FixedFields<'a> {
    event_name: &'a str,
    severity: &'a str,
    activity_id: Uuid,
    parent_activity_id: Uuid,
    transaction_id: Uuid,
    duration_ms: Option<i64>,
    user_identity: Option<&'a str>,
}

/// Serializes events within a byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeBudget {
    max_bytes: usize,
}

impl Default for SizeBudget {
    fn default() -> Self {
        Self::new(MAX_TRACE_EVENT_BYTES)
    }
}

impl SizeBudget {
    /// Creates a budget of `max_bytes` per payload.
    #[must_use]
    pub const fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    /// The budget in bytes.
    #[must_use]
    pub const fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Serializes `event`, shortening its context if it would not fit.
    #[must_use]
    pub fn serialize(&self, event_name: &str, severity: Severity, event: &Event) -> TraceRecord {
        let fixed = fixed_section(event_name, severity, event);

        let full = serde_json::to_string(event.properties())
            .map(|context| append_field(&fixed, CONTEXT_KEY, &context));
        if let Ok(payload) = full {
            if payload.len() <= self.max_bytes {
                return record(event_name, severity, event, payload, false, false);
            }
        }

        let remaining = self
            .max_bytes
            .saturating_sub(fixed.len() + field_overhead(CONTEXT_KEY));
        match serialize_bounded(event.properties(), remaining) {
            Ok(context) => {
                let payload = append_field(&fixed, CONTEXT_KEY, &context);
                record(event_name, severity, event, payload, true, false)
            }
            Err(err) => {
                let payload = self.diagnostic_payload(&fixed, &err.to_string());
                record(event_name, severity, event, payload, true, true)
            }
        }
    }

    /// Serializes only the fixed fields of `event`.
    #[must_use]
    pub fn minimal(&self, event_name: &str, severity: Severity, event: &Event) -> TraceRecord {
        let fixed = fixed_section(event_name, severity, event);
        record(event_name, severity, event, fixed, true, false)
    }

    fn diagnostic_payload(&self, fixed: &str, diagnostic: &str) -> String {
        // `"…"` around the value.
        let overhead = field_overhead(CONSTRAIN_ERROR_KEY) + 2;
        match self.max_bytes.checked_sub(fixed.len() + overhead) {
            Some(room) => {
                let text = truncate_escaped(diagnostic, room);
                append_field(fixed, CONSTRAIN_ERROR_KEY, &json_string(text))
            }
            None => fixed.to_string(),
        }
    }
}

fn record(
    event_name: &str,
    severity: Severity,
    event: &Event,
    payload: String,
    constrained: bool,
    constrain_failed: bool,
) -> TraceRecord {
    TraceRecord {
        activity_id: event.activity_id(),
        parent_activity_id: event.parent_activity_id(),
        severity,
        event_name: event_name.to_string(),
        payload,
        constrained,
        constrain_failed,
    }
}

fn fixed_section(event_name: &str, severity: Severity, event: &Event) -> String {
    let fields = FixedFields {
        event_name: truncate_escaped(event_name, MAX_FIXED_TEXT_BYTES),
        severity: severity.as_str(),
        activity_id: event.activity_id(),
        parent_activity_id: event.parent_activity_id().unwrap_or_else(Uuid::nil),
        transaction_id: event.transaction_id(),
        duration_ms: event.duration_ms(),
        user_identity: event
            .user_identity()
            .map(|u| truncate_escaped(u, MAX_FIXED_TEXT_BYTES)),
    };
    // Plain data with string keys; serializing it cannot fail.
    serde_json::to_string(&fields).unwrap_or_else(|_| "{}".to_string())
}

/// Bytes added by `,"key":` when appending a field.
fn field_overhead(key: &str) -> usize {
    key.len() + 4
}

/// Appends `"key":raw_json` to a serialized JSON object.
fn append_field(object: &str, key: &str, raw_json: &str) -> String {
    let body = object.strip_suffix('}').unwrap_or(object);
    let sep = if body.ends_with('{') { "" } else { "," };
    format!("{body}{sep}\"{key}\":{raw_json}}}")
}

/// Serializes properties as a JSON object of at most `limit` bytes.
///
/// Properties are written in order while they fit. The first one that does
/// not fit is collapsed to a string, truncated on a character boundary to
/// fill the remaining space, and serialization stops there.
///
/// # Errors
///
/// Returns [`TelemetryError::ConstrainFailed`] if `limit` is below
/// [`MIN_CONTEXT_BYTES`].
pub fn serialize_bounded(properties: &Properties, limit: usize) -> Result<String> {
    if limit < MIN_CONTEXT_BYTES {
        return Err(TelemetryError::ConstrainFailed(format!(
            "fixed fields leave {limit} bytes for context"
        )));
    }

    let mut out = String::from("{");
    for (key, value) in properties.iter() {
        let sep = if out.len() > 1 { "," } else { "" };
        let key_json = json_string(key);
        let value_json = serde_json::to_string(value)?;

        let entry_len = sep.len() + key_json.len() + 1 + value_json.len();
        if out.len() + entry_len + 1 <= limit {
            out.push_str(sep);
            out.push_str(&key_json);
            out.push(':');
            out.push_str(&value_json);
            continue;
        }

        // Separator, colon, two pairs of quotes and the closing brace.
        let framing = sep.len() + 1 + 4 + 1;
        if let Some(room) = limit.checked_sub(out.len() + framing) {
            if room > 0 {
                let key_text = truncate_escaped(key, room);
                let value_room = room - escaped_len(key_text);
                let value_text = collapse(value);
                let value_text = truncate_escaped(&value_text, value_room);
                out.push_str(sep);
                out.push_str(&json_string(key_text));
                out.push(':');
                out.push_str(&json_string(value_text));
            }
        }
        break;
    }
    out.push('}');
    Ok(out)
}

fn collapse(value: &PropertyValue) -> String {
    match value {
        PropertyValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn escaped_char_len(c: char) -> usize {
    match c {
        '"' | '\\' | '\n' | '\r' | '\t' | '\u{08}' | '\u{0c}' => 2,
        c if (c as u32) < 0x20 => 6,
        c => c.len_utf8(),
    }
}

fn escaped_len(s: &str) -> usize {
    s.chars().map(escaped_char_len).sum()
}

/// Longest prefix of `s` whose JSON-escaped form fits in `max` bytes.
fn truncate_escaped(s: &str, max: usize) -> &str {
    let mut used = 0;
    for (idx, c) in s.char_indices() {
        used += escaped_char_len(c);
        if used > max {
            return &s[..idx];
        }
    }
    s
}
