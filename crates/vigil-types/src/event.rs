//! Engine events.
//!
//! Every significant state transition emits an [`Event`]. The kind follows
//! the `+type` / `-type` convention; the body starts with the instance
//! identifier prefix `<role> <name> <ip> <port>`, extended with
//! `@ <primary-name> <primary-ip> <primary-port>` for children.

use std::fmt::{self, Display};

/// Severity of an event.
///
/// Warning-level events bound to a primary additionally schedule the
/// primary's notification script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
}

/// A state-transition event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub level: EventLevel,

    /// Event type, e.g. `+sdown`, `-odown`, `+switch-master`.
    pub kind: String,

    /// Human-readable body, normally starting with the instance identifier.
    pub body: String,

    /// Name of the primary this event is bound to, when any.
    pub primary: Option<String>,
}

impl Event {
    pub fn new(
        level: EventLevel,
        kind: impl Into<String>,
        body: impl Into<String>,
        primary: Option<String>,
    ) -> Self {
        Self {
            level,
            kind: kind.into(),
            body: body.into(),
            primary,
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_kind_and_body() {
        let ev = Event::new(
            EventLevel::Warning,
            "+sdown",
            "primary cache 10.0.0.1 6379",
            Some("cache".into()),
        );
        assert_eq!(ev.to_string(), "+sdown primary cache 10.0.0.1 6379");
    }

    #[test]
    fn levels_are_ordered() {
        assert!(EventLevel::Debug < EventLevel::Info);
        assert!(EventLevel::Info < EventLevel::Warning);
    }
}
