//! Per-request routing diagnostics, surfaced as response headers when
//! routing debug is enabled.
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use http::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;

pub const TRACE_HEADER: HeaderName = HeaderName::from_static("x-routing-trace");

#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Disabled traces drop every record without formatting it.
#[derive(Debug, Clone, Default)]
pub struct RouteTrace {
    enabled: bool,
    entries: Arc<Mutex<Vec<TraceEntry>>>,
}

impl RouteTrace {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Arc::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&self, message: impl FnOnce() -> String) {
        if !self.enabled {
            return;
        }
        self.entries.lock().push(TraceEntry {
            at: Utc::now(),
            message: message(),
        });
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.lock().clone()
    }

    /// Append one header per entry, in recording order.
    pub fn apply(&self, headers: &mut HeaderMap) {
        for entry in self.entries.lock().iter() {
            let line = format!(
                "{} {}",
                entry.at.to_rfc3339_opts(SecondsFormat::Millis, true),
                entry.message
            );
            if let Ok(value) = HeaderValue::from_str(&line) {
                headers.append(TRACE_HEADER, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_trace_records_nothing() {
        let trace = RouteTrace::new(false);
        trace.record(|| unreachable!("message built for a disabled trace"));
        assert!(trace.entries().is_empty());
    }

    #[test]
    fn test_entries_become_headers() {
        let trace = RouteTrace::new(true);
        trace.record(|| "filter /a matched".to_string());
        trace.record(|| "route GET /a matched".to_string());
        let mut headers = HeaderMap::new();
        trace.apply(&mut headers);
        let values: Vec<_> = headers.get_all(TRACE_HEADER).iter().collect();
        assert_eq!(values.len(), 2);
        assert!(values[1].to_str().unwrap().ends_with("route GET /a matched"));
    }
}
