/*!
Observability infrastructure for snapkeep.

- Structured logging through `tracing`, installed by [`init_logging`]
- Prometheus counters for the run's outcomes (feature `metrics`)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry as TracingRegistry};

use crate::{Result, SnapkeepError};

/// Outcomes counted across a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    SnapshotCreated,
    SnapshotDeleted,
    VolumeFiltered,
    Failure,
}

/// Count one event. A no-op unless the `metrics` feature is enabled.
pub fn record(event: RunEvent) {
    #[cfg(feature = "metrics")]
    SnapkeepMetrics::global().record(event);
    #[cfg(not(feature = "metrics"))]
    let _ = event;
}

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<SnapkeepMetrics> = OnceLock::new();

/// Prometheus counters for snapkeep runs
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct SnapkeepMetrics {
    pub snapshots_created_total: Counter,
    pub snapshots_deleted_total: Counter,
    pub volumes_filtered_total: Counter,
    pub failures_total: Counter,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| SnapkeepError::config(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| SnapkeepError::config(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
impl SnapkeepMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        Ok(Self {
            snapshots_created_total: counter(
                &registry,
                "snapkeep_snapshots_created_total",
                "Snapshots created by snapkeep",
            )?,
            snapshots_deleted_total: counter(
                &registry,
                "snapkeep_snapshots_deleted_total",
                "Expired snapshots deleted by snapkeep",
            )?,
            volumes_filtered_total: counter(
                &registry,
                "snapkeep_volumes_filtered_total",
                "Discovered volumes excluded by the volume tag filter",
            )?,
            failures_total: counter(
                &registry,
                "snapkeep_failures_total",
                "Per-volume and per-snapshot failures",
            )?,
            registry,
        })
    }

    /// Get or initialize global metrics instance
    pub fn global() -> &'static SnapkeepMetrics {
        METRICS.get_or_init(|| Self::new().expect("Failed to initialize snapkeep metrics"))
    }

    pub fn record(&self, event: RunEvent) {
        match event {
            RunEvent::SnapshotCreated => self.snapshots_created_total.inc(),
            RunEvent::SnapshotDeleted => self.snapshots_deleted_total.inc(),
            RunEvent::VolumeFiltered => self.volumes_filtered_total.inc(),
            RunEvent::Failure => self.failures_total.inc(),
        }
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| SnapkeepError::config(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer).map_err(|e| {
            SnapkeepError::config(format!("Failed to convert metrics to string: {e}"))
        })
    }
}

/// Gather the global metrics in Prometheus text format.
#[cfg(feature = "metrics")]
pub fn gather_metrics() -> Result<String> {
    SnapkeepMetrics::global().gather_metrics()
}

/// Install the global tracing subscriber.
///
/// Level is `info`, or `debug` for the snapkeep crates when `debug` is set.
/// `RUST_LOG` takes precedence over both. `json` switches the output to JSON
/// lines.
pub fn init_logging(debug: bool, json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    SnapkeepMetrics::global();

    let default_directives = if debug {
        "info,snapkeep=debug,snapkeep_core=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false)
    });
    let text_layer = (!json).then(|| fmt::layer().with_target(debug));

    let subscriber = TracingRegistry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer);

    set_global_default(subscriber).map_err(|e| {
        SnapkeepError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("Logging initialized");
    Ok(())
}
