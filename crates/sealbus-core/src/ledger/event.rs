//! Ledger events and subscription filters.

use serde::{Deserialize, Serialize};

/// Attribute carrying the state address a transaction wrote to
pub const ADDRESS_ATTRIBUTE: &str = "address";

/// An event fired by the ledger when a transaction is applied.
///
/// `event_type` is the clear-text group name and `data` the full payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub event_type: String,
    pub attributes: Vec<(String, String)>,
    pub data: Vec<u8>,
}

impl LedgerEvent {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Match on one event attribute.
///
/// A pattern ending in `*` matches any value with that prefix; anything else
/// must match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub key: String,
    pub pattern: String,
}

impl EventFilter {
    pub fn new(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            pattern: pattern.into(),
        }
    }

    /// Addresses inside the namespace `prefix`
    pub fn address_prefix(prefix: &str) -> Self {
        Self::new(ADDRESS_ATTRIBUTE, format!("{}*", prefix))
    }

    pub fn matches(&self, event: &LedgerEvent) -> bool {
        event
            .attributes
            .iter()
            .filter(|(k, _)| *k == self.key)
            .any(|(_, v)| match self.pattern.strip_suffix('*') {
                Some(prefix) => v.starts_with(prefix),
                None => *v == self.pattern,
            })
    }
}

/// Interest in one event type, narrowed by attribute filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub event_type: String,
    pub filters: Vec<EventFilter>,
}

impl EventSubscription {
    /// Events of type `group` written inside the namespace `prefix`
    pub fn for_group(group: &str, prefix: &str) -> Self {
        Self {
            event_type: group.to_string(),
            filters: vec![EventFilter::address_prefix(prefix)],
        }
    }

    /// Type matches and every filter matches.
    pub fn matches(&self, event: &LedgerEvent) -> bool {
        self.event_type == event.event_type && self.filters.iter().all(|f| f.matches(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: &str, address: &str) -> LedgerEvent {
        LedgerEvent {
            event_type: kind.to_string(),
            attributes: vec![(ADDRESS_ATTRIBUTE.to_string(), address.to_string())],
            data: b"g,blob".to_vec(),
        }
    }

    #[test]
    fn test_prefix_filter() {
        let filter = EventFilter::address_prefix("2f9d35");
        assert!(filter.matches(&event("g", "2f9d35abcdef")));
        assert!(!filter.matches(&event("g", "ffffffabcdef")));
    }

    #[test]
    fn test_exact_filter() {
        let filter = EventFilter::new(ADDRESS_ATTRIBUTE, "2f9d35aa");
        assert!(filter.matches(&event("g", "2f9d35aa")));
        assert!(!filter.matches(&event("g", "2f9d35aab")));
    }

    #[test]
    fn test_missing_attribute_does_not_match() {
        let filter = EventFilter::new("other", "*");
        assert!(!filter.matches(&event("g", "2f9d35aa")));
    }

    #[test]
    fn test_subscription_checks_type() {
        let sub = EventSubscription::for_group("g", "2f9d35");
        assert!(sub.matches(&event("g", "2f9d35aa")));
        assert!(!sub.matches(&event("h", "2f9d35aa")));
        assert_eq!(event("g", "x").attribute(ADDRESS_ATTRIBUTE), Some("x"));
    }
}
