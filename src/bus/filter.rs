//! Subscription filters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::bus::event::{Event, EventType};

/// Conjunctive filter over events: every populated field must match, and
/// within a field any listed value matches.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub types: Vec<EventType>,
    pub sources: Vec<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    /// Every entry must be present on the event with an equal value.
    pub metadata: HashMap<String, String>,
}

impl EventFilter {
    /// Matches everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.types = types.into_iter().collect();
        self
    }

    pub fn with_sources<S: Into<String>>(mut self, sources: impl IntoIterator<Item = S>) -> Self {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.types.is_empty() && !self.types.contains(&event.event_type) {
            return false;
        }
        if !self.sources.is_empty() && !self.sources.iter().any(|s| s == &event.source) {
            return false;
        }
        if self.after.is_some_and(|t| event.timestamp < t) {
            return false;
        }
        if self.before.is_some_and(|t| event.timestamp > t) {
            return false;
        }
        self.metadata
            .iter()
            .all(|(k, v)| event.metadata.get(k) == Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::event::{AlertSeverity, EventPayload};

    fn alert(source: &str) -> Event {
        Event::new(
            source,
            EventPayload::Alert {
                severity: AlertSeverity::Info,
                message: "hello".to_string(),
            },
        )
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(EventFilter::all().matches(&alert("queue")));
    }

    #[test]
    fn type_mismatch_rejects() {
        let filter = EventFilter::all().with_types([EventType::TaskProgress]);
        assert!(!filter.matches(&alert("queue")));
    }

    #[test]
    fn values_within_a_field_are_disjunctive() {
        let filter = EventFilter::all().with_sources(["engine", "queue"]);
        assert!(filter.matches(&alert("queue")));
        assert!(filter.matches(&alert("engine")));
        assert!(!filter.matches(&alert("hub")));
    }

    #[test]
    fn fields_are_conjunctive() {
        let filter = EventFilter::all()
            .with_types([EventType::Alert])
            .with_sources(["engine"]);
        assert!(!filter.matches(&alert("queue")), "source must also match");
    }

    #[test]
    fn metadata_requires_equality() {
        let filter = EventFilter::all().with_metadata("experiment_id", "abc");
        assert!(!filter.matches(&alert("queue")));
        assert!(filter.matches(&alert("queue").with_metadata("experiment_id", "abc")));
        assert!(!filter.matches(&alert("queue").with_metadata("experiment_id", "xyz")));
    }

    #[test]
    fn time_range_bounds() {
        let event = alert("queue");
        let earlier = event.timestamp - chrono::Duration::seconds(10);
        let later = event.timestamp + chrono::Duration::seconds(10);

        let mut filter = EventFilter::all();
        filter.after = Some(earlier);
        filter.before = Some(later);
        assert!(filter.matches(&event));

        filter.after = Some(later);
        assert!(!filter.matches(&event));
    }
}
