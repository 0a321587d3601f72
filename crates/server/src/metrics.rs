//! Prometheus metrics for the ferry server.
//!
//! Counters cover part admission, completion and verification on the upload
//! side, and object deletion and job broadcast on the download side.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static PARTS_ADMITTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_parts_admitted_total",
        "Parts admitted for upload and handed a signed URL",
    )
    .expect("metric creation failed")
});

pub static PARTS_SKIPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_parts_skipped_total",
        "Part announcements answered with upload-exists",
    )
    .expect("metric creation failed")
});

pub static PARTS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("ferry_parts_completed_total", "Parts reported complete")
        .expect("metric creation failed")
});

pub static FILES_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_files_completed_total",
        "Files whose completed parts cover every byte",
    )
    .expect("metric creation failed")
});

pub static FILES_VERIFIED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_files_verified_total",
        "Files confirmed by a whole-file SHA-256 check",
    )
    .expect("metric creation failed")
});

pub static OBJECTS_DELETED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ferry_objects_deleted_total",
            "Transient storage objects deleted",
        ),
        &["reason"],
    )
    .expect("metric creation failed")
});

pub static DOWNLOAD_JOBS_BROADCAST: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_download_jobs_broadcast_total",
        "Download jobs acknowledged by at least one subscriber",
    )
    .expect("metric creation failed")
});

pub static RECONCILE_RUNS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("ferry_reconcile_runs_total", "Reconciliation passes run")
        .expect("metric creation failed")
});

pub static RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_reconcile_errors_total",
        "Objects or providers skipped because of an error during reconciliation",
    )
    .expect("metric creation failed")
});

pub static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "ferry_reconcile_duration_seconds",
            "Time taken by one reconciliation pass",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
    )
    .expect("metric creation failed")
});

pub static ACTIVE_SESSIONS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new("ferry_active_sessions", "Open duplex sessions"),
        &["role"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(PARTS_ADMITTED.clone()),
            Box::new(PARTS_SKIPPED.clone()),
            Box::new(PARTS_COMPLETED.clone()),
            Box::new(FILES_COMPLETED.clone()),
            Box::new(FILES_VERIFIED.clone()),
            Box::new(OBJECTS_DELETED.clone()),
            Box::new(DOWNLOAD_JOBS_BROADCAST.clone()),
            Box::new(RECONCILE_RUNS.clone()),
            Box::new(RECONCILE_ERRORS.clone()),
            Box::new(RECONCILE_DURATION.clone()),
            Box::new(ACTIVE_SESSIONS.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// Handler for `GET /metrics`.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Count a deleted transient object.
pub fn record_deletion(reason: &str) {
    OBJECTS_DELETED.with_label_values(&[reason]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        register_metrics();
        register_metrics();
        record_deletion("orphaned");
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&REGISTRY.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("ferry_objects_deleted_total{reason=\"orphaned\"}"));
    }
}
