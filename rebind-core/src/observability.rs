/*!
Observability for the rebind subsystem.

- Structured logging setup through `tracing-subscriber`
- Activity metrics for rebind and persistence, reported by
  [`RebindMetrics::snapshot`] as an ordered name to value map
- Optional Prometheus counters and histograms (feature `metrics`)
*/

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry as TracingRegistry};

use crate::error::Failure;
use crate::{PersistError, Result};

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_DIRECTIVES: &str = "rebind_core=info,rebind_retry=info";

/// Number of recent failure messages kept per activity
const MAX_FAILURE_MESSAGES: usize = 10;

/// Initialize the global tracing subscriber
///
/// `json` selects machine-readable JSON lines; otherwise a compact
/// human-readable format is used. `RUST_LOG` overrides the default filter.
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    let _ = PrometheusMetrics::global();

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(DEFAULT_LOG_DIRECTIVES)
            .map_err(|e| PersistError::validation(format!("Invalid log directives: {e}")))?,
    };

    let json_layer = json.then(|| fmt::layer().json().with_current_span(false));
    let text_layer = (!json).then(|| fmt::layer().compact());

    let subscriber = TracingRegistry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer);

    set_global_default(subscriber).map_err(|e| {
        PersistError::invalid_state(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("observability initialized");
    Ok(())
}

/// Success and failure history of one recurring activity (rebind or persist)
#[derive(Debug, Clone, Default)]
pub struct PersistenceActivityMetrics {
    pub count: u64,
    pub failure_count: u64,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_duration: Option<Duration>,
    pub last_failure_messages: VecDeque<String>,
}

impl PersistenceActivityMetrics {
    pub fn note_success(&mut self, duration: Duration) {
        self.count += 1;
        self.last_success_time = Some(Utc::now());
        self.last_duration = Some(duration);
    }

    pub fn note_failure(&mut self, duration: Duration, message: impl Into<String>) {
        self.count += 1;
        self.failure_count += 1;
        self.last_failure_time = Some(Utc::now());
        self.last_duration = Some(duration);
        if self.last_failure_messages.len() == MAX_FAILURE_MESSAGES {
            self.last_failure_messages.pop_front();
        }
        self.last_failure_messages.push_back(message.into());
    }

    pub fn to_json(&self) -> Value {
        json!({
            "count": self.count,
            "failureCount": self.failure_count,
            "lastSuccessTime": self.last_success_time.map(|t| t.to_rfc3339()),
            "lastFailureTime": self.last_failure_time.map(|t| t.to_rfc3339()),
            "lastDurationMs": self.last_duration.map(|d| d.as_millis() as u64),
            "lastFailureMessages": self.last_failure_messages,
        })
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    rebind: PersistenceActivityMetrics,
    persist: PersistenceActivityMetrics,
    failures: BTreeMap<&'static str, u64>,
    read_only_rebinds: u64,
}

/// Operational counters shared by the engine, driver and controller
#[derive(Debug, Default)]
pub struct RebindMetrics {
    state: Mutex<MetricsState>,
}

impl RebindMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_rebind_success(&self, duration: Duration, read_only: bool) {
        let mut state = self.state.lock();
        state.rebind.note_success(duration);
        if read_only {
            state.read_only_rebinds += 1;
        }
        #[cfg(feature = "metrics")]
        if let Some(prom) = PrometheusMetrics::global() {
            prom.rebinds_total.inc();
            prom.rebind_duration_seconds.observe(duration.as_secs_f64());
        }
    }

    pub fn note_rebind_failure(&self, duration: Duration, message: impl Into<String>) {
        self.state.lock().rebind.note_failure(duration, message);
        #[cfg(feature = "metrics")]
        if let Some(prom) = PrometheusMetrics::global() {
            prom.rebinds_total.inc();
            prom.rebind_failures_total.inc();
            prom.rebind_duration_seconds.observe(duration.as_secs_f64());
        }
    }

    pub fn note_persist_success(&self, duration: Duration) {
        self.state.lock().persist.note_success(duration);
        #[cfg(feature = "metrics")]
        if let Some(prom) = PrometheusMetrics::global() {
            prom.persists_total.inc();
            prom.persist_duration_seconds.observe(duration.as_secs_f64());
        }
    }

    pub fn note_persist_failure(&self, duration: Duration, message: impl Into<String>) {
        self.state.lock().persist.note_failure(duration, message);
        #[cfg(feature = "metrics")]
        if let Some(prom) = PrometheusMetrics::global() {
            prom.persists_total.inc();
            prom.persist_failures_total.inc();
            prom.persist_duration_seconds.observe(duration.as_secs_f64());
        }
    }

    /// Count one failure under its taxonomy category
    pub fn note_failure(&self, failure: &Failure) {
        *self
            .state
            .lock()
            .failures
            .entry(failure.category())
            .or_insert(0) += 1;
        #[cfg(feature = "metrics")]
        if let Some(prom) = PrometheusMetrics::global() {
            prom.failures_total
                .with_label_values(&[failure.category()])
                .inc();
        }
    }

    pub fn rebind(&self) -> PersistenceActivityMetrics {
        self.state.lock().rebind.clone()
    }

    pub fn persist(&self) -> PersistenceActivityMetrics {
        self.state.lock().persist.clone()
    }

    pub fn failure_count(&self, category: &str) -> u64 {
        self.state.lock().failures.get(category).copied().unwrap_or(0)
    }

    /// Ordered name to value map of every counter
    pub fn snapshot(&self) -> Map<String, Value> {
        let state = self.state.lock();
        let mut out = Map::new();
        out.insert("rebind".to_string(), state.rebind.to_json());
        out.insert("persist".to_string(), state.persist.to_json());
        out.insert(
            "lastRebindDurationMs".to_string(),
            json!(state.rebind.last_duration.map(|d| d.as_millis() as u64)),
        );
        out.insert(
            "lastPersistDurationMs".to_string(),
            json!(state.persist.last_duration.map(|d| d.as_millis() as u64)),
        );
        out.insert("readOnlyRebindCount".to_string(), json!(state.read_only_rebinds));
        let failures: Map<String, Value> = state
            .failures
            .iter()
            .map(|(category, count)| (category.to_string(), json!(count)))
            .collect();
        out.insert("failures".to_string(), Value::Object(failures));
        out
    }
}

/// Prometheus instruments for rebind and persistence
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct PrometheusMetrics {
    pub rebinds_total: IntCounter,
    pub rebind_failures_total: IntCounter,
    pub persists_total: IntCounter,
    pub persist_failures_total: IntCounter,
    pub failures_total: IntCounterVec,
    pub rebind_duration_seconds: Histogram,
    pub persist_duration_seconds: Histogram,
    registry: Registry,
}

#[cfg(feature = "metrics")]
static PROMETHEUS: Lazy<Option<PrometheusMetrics>> = Lazy::new(|| match PrometheusMetrics::new() {
    Ok(metrics) => Some(metrics),
    Err(e) => {
        tracing::error!(error = %e, "failed to initialize prometheus metrics");
        None
    }
});

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> PersistError {
    PersistError::invalid_state(format!("Failed to set up metric {name}: {e}"))
}

#[cfg(feature = "metrics")]
impl PrometheusMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::new(name, help).map_err(|e| metric_error(name, e))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| metric_error(name, e))?;
            Ok(counter)
        };
        let histogram = |name: &str, help: &str| -> Result<Histogram> {
            let histogram = Histogram::with_opts(HistogramOpts::new(name, help))
                .map_err(|e| metric_error(name, e))?;
            registry
                .register(Box::new(histogram.clone()))
                .map_err(|e| metric_error(name, e))?;
            Ok(histogram)
        };

        let rebinds_total = counter("rebind_rebinds_total", "Rebind passes run")?;
        let rebind_failures_total =
            counter("rebind_rebind_failures_total", "Rebind passes that raised")?;
        let persists_total = counter("rebind_persists_total", "Persistence runs")?;
        let persist_failures_total = counter(
            "rebind_persist_failures_total",
            "Persistence runs with at least one failure",
        )?;
        let rebind_duration_seconds =
            histogram("rebind_rebind_duration_seconds", "Duration of rebind passes")?;
        let persist_duration_seconds = histogram(
            "rebind_persist_duration_seconds",
            "Duration of persistence runs",
        )?;

        let failures_total = IntCounterVec::new(
            Opts::new("rebind_failures_total", "Failures by category"),
            &["category"],
        )
        .map_err(|e| metric_error("rebind_failures_total", e))?;
        registry
            .register(Box::new(failures_total.clone()))
            .map_err(|e| metric_error("rebind_failures_total", e))?;

        Ok(Self {
            rebinds_total,
            rebind_failures_total,
            persists_total,
            persist_failures_total,
            failures_total,
            rebind_duration_seconds,
            persist_duration_seconds,
            registry,
        })
    }

    /// Process-wide instance, `None` if registration failed
    pub fn global() -> Option<&'static PrometheusMetrics> {
        PROMETHEUS.as_ref()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| PersistError::invalid_state(format!("Failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| PersistError::invalid_format(format!("Metrics are not UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memento::ObjectKind;

    #[test]
    fn test_activity_keeps_bounded_messages() {
        let mut activity = PersistenceActivityMetrics::default();
        for i in 0..15 {
            activity.note_failure(Duration::from_millis(i), format!("failure {i}"));
        }
        activity.note_success(Duration::from_millis(3));

        assert_eq!(activity.count, 16);
        assert_eq!(activity.failure_count, 15);
        assert_eq!(activity.last_failure_messages.len(), MAX_FAILURE_MESSAGES);
        assert_eq!(activity.last_failure_messages.front().unwrap(), "failure 5");
        assert_eq!(activity.last_duration, Some(Duration::from_millis(3)));
    }

    #[test]
    fn test_snapshot_is_ordered_and_counts_failures() {
        let metrics = RebindMetrics::new();
        metrics.note_rebind_success(Duration::from_millis(12), true);
        metrics.note_persist_success(Duration::from_millis(4));
        metrics.note_failure(&Failure::NotFound {
            kind: ObjectKind::Entity,
            id: "e1".to_string(),
        });
        metrics.note_failure(&Failure::NotFound {
            kind: ObjectKind::Entity,
            id: "e2".to_string(),
        });

        let snapshot = metrics.snapshot();
        let keys: Vec<_> = snapshot.keys().cloned().collect();
        assert_eq!(keys[0], "rebind");
        assert_eq!(snapshot["lastRebindDurationMs"], json!(12));
        assert_eq!(snapshot["lastPersistDurationMs"], json!(4));
        assert_eq!(snapshot["readOnlyRebindCount"], json!(1));
        assert_eq!(snapshot["failures"]["not_found"], json!(2));
        assert_eq!(metrics.failure_count("not_found"), 2);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_prometheus_gathering() {
        let metrics = RebindMetrics::new();
        metrics.note_persist_failure(Duration::from_millis(1), "disk full");

        let text = PrometheusMetrics::global().unwrap().gather_metrics().unwrap();
        assert!(text.contains("rebind_persist_failures_total"));
    }
}
