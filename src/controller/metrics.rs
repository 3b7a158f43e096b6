//! Prometheus metrics for the mesh federation controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `meshfed_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `meshfed_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `meshfed_reconcile_outcomes_total` (counter): reconcile results labeled by controller and outcome.
//! - `meshfed_discovery_sessions` (gauge): live discovery sessions labeled by role (client/server).

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "serviceexposition"
    pub controller: String,
}

/// Labels for reconcile error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, e.g. "conflict", "not_ready"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub controller: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SessionLabels {
    /// "client" or "server"
    pub role: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RECONCILE_OUTCOMES_TOTAL: Lazy<Family<OutcomeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static DISCOVERY_SESSIONS: Lazy<Family<SessionLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "meshfed_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "meshfed_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "meshfed_reconcile_outcomes_total",
        "Total number of completed reconciles by outcome",
        RECONCILE_OUTCOMES_TOTAL.clone(),
    );
    registry.register(
        "meshfed_discovery_sessions",
        "Number of live discovery stream sessions",
        DISCOVERY_SESSIONS.clone(),
    );

    registry
});

pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    RECONCILE_DURATION_SECONDS
        .get_or_create(&ReconcileLabels {
            controller: controller.to_string(),
        })
        .observe(seconds);
}

pub fn inc_reconcile_error(controller: &str, kind: &str) {
    RECONCILE_ERRORS_TOTAL
        .get_or_create(&ErrorLabels {
            controller: controller.to_string(),
            kind: kind.to_string(),
        })
        .inc();
}

pub fn inc_reconcile_outcome(controller: &str, outcome: &str) {
    RECONCILE_OUTCOMES_TOTAL
        .get_or_create(&OutcomeLabels {
            controller: controller.to_string(),
            outcome: outcome.to_string(),
        })
        .inc();
}

pub fn add_discovery_sessions(role: &str, delta: i64) {
    DISCOVERY_SESSIONS
        .get_or_create(&SessionLabels {
            role: role.to_string(),
        })
        .inc_by(delta);
}
