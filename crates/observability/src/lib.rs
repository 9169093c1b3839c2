use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

#[derive(Debug, Default)]
pub struct AppMetrics {
    turns_total: AtomicU64,
    tool_calls_total: AtomicU64,
    tool_failures_total: AtomicU64,
    stream_errors_total: AtomicU64,
    timeouts_total: AtomicU64,
    consents_total: AtomicU64,
    total_turn_latency_millis: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub turns_total: u64,
    pub tool_calls_total: u64,
    pub tool_failures_total: u64,
    pub stream_errors_total: u64,
    pub timeouts_total: u64,
    pub consents_total: u64,
    pub avg_turn_latency_millis: f64,
}

impl AppMetrics {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_turn(&self) {
        self.turns_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("wayfarer_turns_total").increment(1);
    }

    pub fn inc_tool_call(&self, tool: &str) {
        self.tool_calls_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("wayfarer_tool_calls_total", "tool" => tool.to_string()).increment(1);
    }

    pub fn inc_tool_failure(&self, tool: &str, kind: &'static str) {
        self.tool_failures_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "wayfarer_tool_failures_total",
            "tool" => tool.to_string(),
            "kind" => kind
        )
        .increment(1);
    }

    pub fn inc_stream_error(&self) {
        self.stream_errors_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("wayfarer_stream_errors_total").increment(1);
    }

    pub fn inc_timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("wayfarer_turn_timeouts_total").increment(1);
    }

    pub fn inc_consent(&self) {
        self.consents_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("wayfarer_payment_consents_total").increment(1);
    }

    pub fn observe_turn_latency(&self, duration: Duration) {
        self.total_turn_latency_millis
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        metrics::histogram!("wayfarer_turn_latency_seconds").record(duration.as_secs_f64());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let turns = self.turns_total.load(Ordering::Relaxed);
        let latency = self.total_turn_latency_millis.load(Ordering::Relaxed);

        MetricsSnapshot {
            turns_total: turns,
            tool_calls_total: self.tool_calls_total.load(Ordering::Relaxed),
            tool_failures_total: self.tool_failures_total.load(Ordering::Relaxed),
            stream_errors_total: self.stream_errors_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            consents_total: self.consents_total.load(Ordering::Relaxed),
            avg_turn_latency_millis: if turns == 0 {
                0.0
            } else {
                latency as f64 / turns as f64
            },
        }
    }
}

pub fn init_tracing(service_name: &str) {
    TRACING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}=info,wayfarer_api=info,wayfarer_agents=info",
                service_name
            ))
        });

        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_span_list(true)
            .init();
    });
}

/// A structured record of something the booking core decided: a tool
/// outcome, a state transition, a consent signal.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub session_id: String,
    pub kind: String,
    pub detail: Value,
}

impl AuditEvent {
    pub fn new(session_id: impl Into<String>, kind: impl Into<String>, detail: Value) -> Self {
        Self {
            at: Utc::now(),
            session_id: session_id.into(),
            kind: kind.into(),
            detail,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Forwards audit events into the tracing pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: AuditEvent) {
        info!(
            session_id = %event.session_id,
            kind = %event.kind,
            detail = %event.detail,
            "audit event"
        );
    }
}

#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryEventSink {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|event| event.kind.clone())
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}
