//! Optional observability side channel.
//!
//! Every component accepts a [`Telemetry`] handle. A disabled handle drops
//! events, and handler panics are contained, so correctness never depends on
//! whether anything is listening.

use std::fmt;
use std::sync::Arc;

use crate::{FailureKind, InvocationMetrics, InvocationState, TrimReport};

/// Event sink signature shared by every emitter.
pub type TelemetrySink = Arc<dyn Fn(&TelemetryEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
/// Memory-injection outcome for one issue.
pub struct MemoryRetrievalReport {
    pub issue_id: u64,
    pub cache_hit: bool,
    pub cases_retrieved: usize,
    pub avg_similarity: f32,
    pub symptom_terms: usize,
    pub context_chars: usize,
}

#[derive(Debug, Clone, PartialEq)]
/// Enumerates supported `TelemetryEvent` values.
pub enum TelemetryEvent {
    HistoryTrim(TrimReport),
    InvocationAttempt {
        attempt: usize,
        state: InvocationState,
        failure: Option<FailureKind>,
    },
    Invocation(InvocationMetrics),
    MemoryRetrieval(MemoryRetrievalReport),
}

#[derive(Clone, Default)]
/// Cloneable handle to an optional event sink.
pub struct Telemetry {
    sink: Option<TelemetrySink>,
}

impl Telemetry {
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&TelemetryEvent) + Send + Sync + 'static,
    {
        Self {
            sink: Some(Arc::new(handler)),
        }
    }

    pub fn from_sink(sink: TelemetrySink) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn emit(&self, event: TelemetryEvent) {
        let Some(sink) = &self.sink else {
            return;
        };
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink(&event))).is_err() {
            tracing::warn!("telemetry handler panicked; event dropped");
        }
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
