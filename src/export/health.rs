use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for pipeline health and observability.
///
/// All metrics use the "metrika" namespace. Organized into tiers:
/// - Core: essential operational counters/gauges
/// - Diagnostics: latency and batch-size distributions
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Core Metrics ===
    /// Total frames received from the bus consumer boundary.
    pub frames_received: Counter,
    /// Total frames dropped, by drop reason.
    pub frames_dropped: CounterVec,
    /// Total classified events written to the counter table.
    pub events_written: Counter,
    /// Total single-event write failures.
    pub write_errors: Counter,
    /// Total presence pings buffered for aggregation.
    pub presence_pings: Counter,
    /// Total presence flush cycles completed.
    pub presence_flushes: Counter,
    /// Total presence flush cycles that failed whole-batch.
    pub presence_flush_errors: Counter,
    /// Store connection state (1=connected, 0=disconnected).
    pub store_connected: Gauge,
    /// Number of metric types currently registered.
    pub taxonomy_types: Gauge,
    /// Number of customers currently loaded.
    pub customers_loaded: Gauge,

    // === Diagnostics ===
    /// Per-frame classify+write duration.
    pub frame_processing_duration: Histogram,
    /// Presence flush duration per cycle.
    pub presence_flush_duration: Histogram,
    /// Presence pings per flushed cycle.
    pub presence_batch_size: Histogram,
    /// Store write errors by table.
    pub store_write_errors: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Core Metrics ===
        let frames_received = Counter::with_opts(
            Opts::new(
                "frames_received_total",
                "Total frames received from the bus consumer boundary.",
            )
            .namespace("metrika"),
        )?;
        let frames_dropped = CounterVec::new(
            Opts::new("frames_dropped_total", "Total frames dropped by reason.")
                .namespace("metrika"),
            &["reason"],
        )?;
        let events_written = Counter::with_opts(
            Opts::new(
                "events_written_total",
                "Total classified events written to the counter table.",
            )
            .namespace("metrika"),
        )?;
        let write_errors = Counter::with_opts(
            Opts::new("write_errors_total", "Total single-event write failures.")
                .namespace("metrika"),
        )?;
        let presence_pings = Counter::with_opts(
            Opts::new(
                "presence_pings_total",
                "Total presence pings buffered for aggregation.",
            )
            .namespace("metrika"),
        )?;
        let presence_flushes = Counter::with_opts(
            Opts::new(
                "presence_flushes_total",
                "Total presence flush cycles completed.",
            )
            .namespace("metrika"),
        )?;
        let presence_flush_errors = Counter::with_opts(
            Opts::new(
                "presence_flush_errors_total",
                "Total presence flush cycles that failed whole-batch.",
            )
            .namespace("metrika"),
        )?;
        let store_connected = Gauge::with_opts(
            Opts::new(
                "store_connected",
                "Whether the store connection is established (1=yes, 0=no).",
            )
            .namespace("metrika"),
        )?;
        let taxonomy_types = Gauge::with_opts(
            Opts::new(
                "taxonomy_types",
                "Number of metric types currently registered.",
            )
            .namespace("metrika"),
        )?;
        let customers_loaded = Gauge::with_opts(
            Opts::new("customers_loaded", "Number of customers currently loaded.")
                .namespace("metrika"),
        )?;

        // === Diagnostics ===
        let frame_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "frame_processing_duration_seconds",
                "Time to classify and write a single frame.",
            )
            .namespace("metrika")
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;
        let presence_flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "presence_flush_duration_seconds",
                "Time to flush one presence aggregation cycle.",
            )
            .namespace("metrika")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        let presence_batch_size = Histogram::with_opts(
            HistogramOpts::new(
                "presence_batch_size",
                "Number of pings per flushed aggregation cycle.",
            )
            .namespace("metrika")
            .buckets(vec![10.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0, 50000.0]),
        )?;
        let store_write_errors = CounterVec::new(
            Opts::new(
                "store_write_errors_total",
                "Total store write errors by table.",
            )
            .namespace("metrika"),
            &["table"],
        )?;

        // Register all metrics with the custom registry.
        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(events_written.clone()))?;
        registry.register(Box::new(write_errors.clone()))?;
        registry.register(Box::new(presence_pings.clone()))?;
        registry.register(Box::new(presence_flushes.clone()))?;
        registry.register(Box::new(presence_flush_errors.clone()))?;
        registry.register(Box::new(store_connected.clone()))?;
        registry.register(Box::new(taxonomy_types.clone()))?;
        registry.register(Box::new(customers_loaded.clone()))?;
        registry.register(Box::new(frame_processing_duration.clone()))?;
        registry.register(Box::new(presence_flush_duration.clone()))?;
        registry.register(Box::new(presence_batch_size.clone()))?;
        registry.register(Box::new(store_write_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            frames_received,
            frames_dropped,
            events_written,
            write_errors,
            presence_pings,
            presence_flushes,
            presence_flush_errors,
            store_connected,
            taxonomy_types,
            customers_loaded,
            frame_processing_duration,
            presence_flush_duration,
            presence_batch_size,
            store_write_errors,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
