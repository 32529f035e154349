//! Per-instance trace logging.
//!
//! Attributes and device connections each own a [`Tracer`]. It is off by
//! default; once enabled, the object's I/O events are emitted at `TRACE` level
//! on the `fastcs::trace` target. Filters narrow the output further: with any
//! filter set, an event is only emitted if one of its fields matches one of
//! the allowed values for that key.
//!
//! ```rust,ignore
//! controller.ramp_rate().enable_tracing();
//! connection.enable_tracing();
//! connection.add_tracing_filter("query", "V?");
//! ```
//!
//! The subscriber must let `TRACE` through for `fastcs::trace`
//! (e.g. `RUST_LOG=fastcs::trace=trace`).

use indexmap::IndexMap;
use parking_lot::RwLock;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};

/// Target of every event emitted through a [`Tracer`].
pub const TRACE_TARGET: &str = "fastcs::trace";

/// Conditional event logger owned by one object.
pub struct Tracer {
    name: &'static str,
    enabled: AtomicBool,
    filters: RwLock<IndexMap<String, Vec<String>>>,
}

impl Tracer {
    /// Disabled tracer whose events carry `logger = name`.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            enabled: AtomicBool::new(false),
            filters: RwLock::new(IndexMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Allow events whose `key` field renders as `value`.
    pub fn add_filter(&self, key: &str, value: impl Into<String>) {
        self.filters
            .write()
            .entry(key.to_string())
            .or_default()
            .push(value.into());
    }

    /// Remove one allowed value. A key with no values left is dropped.
    pub fn remove_filter(&self, key: &str, value: &str) {
        let mut filters = self.filters.write();
        let Some(values) = filters.get_mut(key) else {
            return;
        };
        if let Some(index) = values.iter().position(|v| v == value) {
            values.remove(index);
        }
        if values.is_empty() {
            filters.shift_remove(key);
        }
    }

    /// Allow every event again.
    pub fn clear_filters(&self) {
        self.filters.write().clear();
    }

    /// Emit `event` if tracing is enabled and the filters accept `fields`.
    ///
    /// Field values are only rendered when the event is going to be logged.
    pub fn log_event(&self, event: &str, fields: &[(&str, &dyn fmt::Display)]) {
        if !self.is_enabled() {
            return;
        }
        let rendered: Vec<(&str, String)> = fields
            .iter()
            .map(|(key, value)| (*key, value.to_string()))
            .collect();

        {
            let filters = self.filters.read();
            if !filters.is_empty() {
                let matched = rendered.iter().any(|(key, value)| {
                    filters
                        .get(*key)
                        .is_some_and(|allowed| allowed.iter().any(|a| a == value))
                });
                if !matched {
                    return;
                }
            }
        }

        let mut line = String::new();
        for (key, value) in &rendered {
            if !line.is_empty() {
                line.push(' ');
            }
            let _ = write!(line, "{key}={value}");
        }
        tracing::trace!(target: TRACE_TARGET, logger = self.name, fields = %line, "{event}");
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("name", &self.name)
            .field("enabled", &self.is_enabled())
            .field("filters", &*self.filters.read())
            .finish()
    }
}

/// Objects that own a [`Tracer`].
pub trait Traced {
    fn tracer(&self) -> &Tracer;

    /// Start logging this object's trace events.
    fn enable_tracing(&self) {
        self.tracer().enable();
    }

    fn disable_tracing(&self) {
        self.tracer().disable();
    }

    /// Only log events whose `key` field equals `value` (or another value
    /// added for any key).
    fn add_tracing_filter(&self, key: &str, value: &str) {
        self.tracer().add_filter(key, value);
    }

    fn remove_tracing_filter(&self, key: &str, value: &str) {
        self.tracer().remove_filter(key, value);
    }

    fn clear_tracing_filters(&self) {
        self.tracer().clear_filters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn disabled_tracer_is_silent() {
        let tracer = Tracer::new("unit");
        tracer.log_event("Silent event", &[]);
        assert!(!logs_contain("Silent event"));

        tracer.enable();
        tracer.log_event("Loud event", &[("query", &"T?")]);
        assert!(logs_contain("Loud event"));
        assert!(logs_contain("query=T?"));
    }

    #[traced_test]
    #[test]
    fn filters_select_matching_events() {
        let tracer = Tracer::new("unit");
        tracer.enable();
        tracer.add_filter("query", "V?");

        tracer.log_event("Power query", &[("query", &"P?")]);
        tracer.log_event("Voltage query", &[("query", &"V?")]);
        assert!(!logs_contain("Power query"));
        assert!(logs_contain("Voltage query"));

        tracer.remove_filter("query", "V?");
        tracer.log_event("Any query", &[("query", &"P?")]);
        assert!(logs_contain("Any query"));
    }

    #[test]
    fn removing_last_value_drops_key() {
        let tracer = Tracer::new("unit");
        tracer.add_filter("query", "A");
        tracer.add_filter("query", "B");
        tracer.remove_filter("query", "A");
        tracer.remove_filter("missing", "A");
        assert_eq!(tracer.filters.read().get("query").map(Vec::len), Some(1));

        tracer.remove_filter("query", "B");
        assert!(tracer.filters.read().is_empty());
    }
}
