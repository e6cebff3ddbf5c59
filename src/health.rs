//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (is the operator ready to serve?)
//! - `/metrics` - Prometheus metrics

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Labels for per-controller metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ControllerLabels {
    pub controller: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ControllerLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("controller", self.controller.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for installation phase metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub phase: String,
}

impl prometheus_client::encoding::EncodeLabelSet for PhaseLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("phase", self.phase.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Total reconciliations per controller
    pub reconciliations_total: Family<ControllerLabels, Counter>,
    /// Failed reconciliations per controller
    pub reconciliation_errors_total: Family<ControllerLabels, Counter>,
    /// Reconciliation duration histogram per controller
    pub reconcile_duration_seconds: Family<ControllerLabels, Histogram>,
    /// Installation phase transitions
    pub phase_transitions_total: Family<PhaseLabels, Counter>,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "che_operator_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "che_operator_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ControllerLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "che_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let phase_transitions_total = Family::<PhaseLabels, Counter>::default();
        registry.register(
            "che_operator_phase_transitions",
            "Installation phase observations per reconcile pass",
            phase_transitions_total.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            phase_transitions_total,
            registry,
        }
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, controller: &str, duration_secs: f64) {
        let labels = ControllerLabels {
            controller: controller.to_string(),
        };
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, controller: &str) {
        let labels = ControllerLabels {
            controller: controller.to_string(),
        };
        self.reconciliation_errors_total
            .get_or_create(&labels)
            .inc();
    }

    /// Record the installation phase observed by a reconcile pass
    pub fn record_phase(&self, phase: &str) {
        let labels = PhaseLabels {
            phase: phase.to_string(),
        };
        self.phase_transitions_total.get_or_create(&labels).inc();
    }

    /// Encode metrics to Prometheus text format
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (leader elected, controllers running)
    pub ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    /// Mark the operator as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server
///
/// Binds to 0.0.0.0:8080 and serves health/metrics endpoints.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = TcpListener::bind("0.0.0.0:8080").await?;
    tracing::info!("Health server listening on 0.0.0.0:8080");

    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        metrics.record_reconcile("checluster", 0.5);
        metrics.record_error("checlusterbackup");

        let encoded = metrics.encode();
        assert!(encoded.contains("che_operator_reconciliations"));
        assert!(encoded.contains("che_operator_reconciliation_errors"));
        assert!(encoded.contains("che_operator_reconcile_duration_seconds"));
    }

    #[test]
    fn test_phase_metrics() {
        let metrics = Metrics::new();
        metrics.record_phase("Active");
        metrics.record_phase("Inactive");

        let encoded = metrics.encode();
        assert!(encoded.contains("che_operator_phase_transitions"));
        assert!(encoded.contains("Active"));
    }

    #[tokio::test]
    async fn test_ready_state() {
        let state = HealthState::new();
        assert!(!state.is_ready().await);
        state.set_ready(true).await;
        assert!(state.is_ready().await);
    }
}
