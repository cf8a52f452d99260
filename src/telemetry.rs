//! Telemetry utilities for probe timing and span construction.

use std::time::Instant;

/// Guard for timing a runtime probe and recording metrics.
///
/// Records the latency under the current result label when dropped. The
/// label starts as `error` so an early return through `?` is counted.
pub struct ProbeTimer {
    result: &'static str,
    start: Instant,
}

impl ProbeTimer {
    /// Start timing a probe.
    pub fn new() -> Self {
        Self {
            result: "error",
            start: Instant::now(),
        }
    }

    /// Set the result label recorded on drop.
    pub fn finish(&mut self, result: &'static str) {
        self.result = result;
    }
}

impl Default for ProbeTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProbeTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        crate::metrics::record_probe(self.result, duration);
    }
}

/// Standardized span constructors.
pub mod spans {
    use tracing::{Span, info_span};

    /// Span for work scoped to one jail.
    pub fn jail(name: &str) -> Span {
        info_span!("jail", jail = %name)
    }

    /// Span for a control action.
    pub fn action(kind: &str, jail: Option<&str>, request_id: &str) -> Span {
        if let Some(jail) = jail {
            info_span!("action", kind = %kind, jail = %jail, request_id = %request_id)
        } else {
            info_span!("action", kind = %kind, request_id = %request_id)
        }
    }

    /// Span for an agent push.
    pub fn agent(id: &str, addr: Option<&str>) -> Span {
        if let Some(addr) = addr {
            info_span!("agent", id = %id, addr = %addr)
        } else {
            info_span!("agent", id = %id)
        }
    }
}
