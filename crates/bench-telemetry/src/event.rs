//! The structured telemetry event.

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Result, TelemetryError};
use crate::properties::{Properties, PropertyValue};

/// A structured telemetry event.
///
/// Events are built once by a producer and then only borrowed by the
/// front-end and the sinks. A sink that needs a redacted or truncated copy
/// derives one with the consuming `with_*` methods on a clone.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    activity_id: Uuid,
    parent_activity_id: Uuid,
    transaction_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<i64>,
    properties: Properties,
}

impl Event {
    /// Creates an event for the given activity with no properties.
    #[must_use]
    pub fn new(activity_id: Uuid) -> Self {
        Self {
            activity_id,
            parent_activity_id: Uuid::nil(),
            transaction_id: Uuid::new_v4(),
            user_identity: None,
            duration_ms: None,
            properties: Properties::new(),
        }
    }

    /// Creates a builder.
    #[must_use]
    pub fn builder() -> EventBuilder {
        EventBuilder::default()
    }

    /// Correlates all events of one logical operation.
    #[must_use]
    pub const fn activity_id(&self) -> Uuid {
        self.activity_id
    }

    /// Parent operation, if any.
    #[must_use]
    pub fn parent_activity_id(&self) -> Option<Uuid> {
        (!self.parent_activity_id.is_nil()).then_some(self.parent_activity_id)
    }

    /// Groups a subset of events within an activity.
    #[must_use]
    pub const fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }

    /// Identity of the user the operation ran as.
    #[must_use]
    pub fn user_identity(&self) -> Option<&str> {
        self.user_identity.as_deref()
    }

    /// Measured duration in milliseconds.
    #[must_use]
    pub const fn duration_ms(&self) -> Option<i64> {
        self.duration_ms
    }

    /// The property bag.
    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Looks up a property, ignoring key case.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Byte length of the serialized event.
    ///
    /// Computed on every call; the value changes whenever a derived copy
    /// changes its properties.
    #[must_use]
    pub fn event_size(&self) -> usize {
        serde_json::to_vec(self).map_or(0, |bytes| bytes.len())
    }

    /// Returns a copy with the duration set.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Returns a copy with one property added or replaced.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key, value);
        self
    }

    /// Returns a copy with no properties and the same identifiers.
    #[must_use]
    pub fn without_properties(&self) -> Self {
        Self {
            activity_id: self.activity_id,
            parent_activity_id: self.parent_activity_id,
            transaction_id: self.transaction_id,
            user_identity: self.user_identity.clone(),
            duration_ms: self.duration_ms,
            properties: Properties::new(),
        }
    }

    /// Returns a copy carrying an `error` property describing `error`.
    #[must_use]
    pub fn with_error(self, error_type: &str, message: &str) -> Self {
        let mut detail = Properties::new();
        detail.insert("errorType", error_type);
        detail.insert("errorMessage", message);
        self.with_property("error", detail)
    }
}

/// Builder for [`Event`].
#[derive(Debug, Default)]
pub struct EventBuilder {
    activity_id: Option<Uuid>,
    parent_activity_id: Option<Uuid>,
    transaction_id: Option<Uuid>,
    user_identity: Option<String>,
    duration_ms: Option<i64>,
    properties: Properties,
}

impl EventBuilder {
    /// Sets the activity id.
    #[must_use]
    pub const fn activity_id(mut self, id: Uuid) -> Self {
        self.activity_id = Some(id);
        self
    }

    /// Sets the parent activity id.
    #[must_use]
    pub const fn parent_activity_id(mut self, id: Uuid) -> Self {
        self.parent_activity_id = Some(id);
        self
    }

    /// Overrides the generated transaction id.
    #[must_use]
    pub const fn transaction_id(mut self, id: Uuid) -> Self {
        self.transaction_id = Some(id);
        self
    }

    /// Sets the user identity.
    #[must_use]
    pub fn user_identity(mut self, user: impl Into<String>) -> Self {
        self.user_identity = Some(user.into());
        self
    }

    /// Sets the duration.
    #[must_use]
    pub const fn duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Adds a property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key, value);
        self
    }

    /// Adds every property from `properties`.
    #[must_use]
    pub fn properties(mut self, properties: &Properties) -> Self {
        self.properties
            .extend(properties.iter().map(|(k, v)| (k.to_string(), v.clone())));
        self
    }

    /// Builds the event.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::MissingField`] if no activity id was set.
    pub fn build(self) -> Result<Event> {
        Ok(Event {
            activity_id: self
                .activity_id
                .ok_or(TelemetryError::MissingField("activity_id"))?,
            parent_activity_id: self.parent_activity_id.unwrap_or_else(Uuid::nil),
            transaction_id: self.transaction_id.unwrap_or_else(Uuid::new_v4),
            user_identity: self.user_identity,
            duration_ms: self.duration_ms,
            properties: self.properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event() -> Event {
        Event::builder()
            .activity_id(Uuid::new_v4())
            .parent_activity_id(Uuid::new_v4())
            .property("toolName", "fio")
            .property("metricValue", 1200.5)
            .build()
            .expect("valid event")
    }

    #[test]
    fn builder_requires_activity_id() {
        let err = Event::builder().build().expect_err("should fail");
        assert!(matches!(err, TelemetryError::MissingField("activity_id")));
    }

    #[test]
    fn builder_defaults() {
        let activity = Uuid::new_v4();
        let event = Event::builder().activity_id(activity).build().expect("valid");
        assert_eq!(event.activity_id(), activity);
        assert_eq!(event.parent_activity_id(), None);
        assert!(!event.transaction_id().is_nil());
        assert_eq!(event.duration_ms(), None);
        assert!(event.properties().is_empty());
    }

    #[test]
    fn property_lookup_ignores_case() {
        let event = make_event();
        assert_eq!(event.property("TOOLNAME"), Some(&PropertyValue::from("fio")));
        assert!(event.property("missing").is_none());
    }

    #[test]
    fn event_size_tracks_serialized_length() {
        let event = make_event();
        let expected = serde_json::to_vec(&event).expect("serialize").len();
        assert_eq!(event.event_size(), expected);

        let bigger = event.clone().with_property("toolResults", "x".repeat(1000));
        assert!(bigger.event_size() > event.event_size() + 1000);
    }

    #[test]
    fn derived_copies_leave_original_untouched() {
        let event = make_event();
        let stopped = event.clone().with_duration_ms(25);
        assert_eq!(stopped.duration_ms(), Some(25));
        assert_eq!(event.duration_ms(), None);

        let stripped = event.without_properties();
        assert!(stripped.properties().is_empty());
        assert_eq!(stripped.activity_id(), event.activity_id());
        assert_eq!(stripped.transaction_id(), event.transaction_id());
        assert_eq!(event.properties().len(), 2);
    }

    #[test]
    fn with_error_adds_nested_detail() {
        let event = make_event().with_error("std::io::Error", "disk full");
        let detail = event
            .property("error")
            .and_then(PropertyValue::as_map)
            .expect("error map");
        assert_eq!(detail.get("errorType"), Some(&PropertyValue::from("std::io::Error")));
        assert_eq!(detail.get("errorMessage"), Some(&PropertyValue::from("disk full")));
    }

    #[test]
    fn serializes_camel_case() {
        let event = make_event().with_duration_ms(10);
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"activityId\""));
        assert!(json.contains("\"parentActivityId\""));
        assert!(json.contains("\"transactionId\""));
        assert!(json.contains("\"durationMs\":10"));
        assert!(!json.contains("userIdentity"));
    }
}
