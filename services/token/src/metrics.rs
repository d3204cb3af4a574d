//! Prometheus metrics for the rotation authority.

use crate::refresh::record::RevocationReason;
use once_cell::sync::Lazy;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};

/// Tokens issued counter.
pub static TOKENS_ISSUED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "token_rotation_tokens_issued_total",
        "Total number of tokens issued",
        &["token_type", "origin"]
    )
    .expect("Failed to register tokens_issued metric")
});

/// Rotation attempts by outcome.
pub static ROTATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "token_rotation_rotations_total",
        "Total number of refresh token rotation attempts",
        &["outcome"]
    )
    .expect("Failed to register rotations metric")
});

/// Tokens revoked counter.
pub static TOKENS_REVOKED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "token_rotation_tokens_revoked_total",
        "Total number of refresh tokens revoked",
        &["reason"]
    )
    .expect("Failed to register tokens_revoked metric")
});

/// Security events counter.
pub static SECURITY_EVENTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "token_rotation_security_events_total",
        "Total number of security events",
        &["event_type"]
    )
    .expect("Failed to register security_events metric")
});

/// Authority operation latency histogram.
pub static OPERATION_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "token_rotation_operation_latency_seconds",
        "Authority operation latency in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register operation_latency metric")
});

/// Record a token issuance. `origin` is `login` or `rotation`.
pub fn record_token_issued(token_type: &str, origin: &str) {
    TOKENS_ISSUED.with_label_values(&[token_type, origin]).inc();
}

/// Record the outcome of a rotation attempt.
pub fn record_rotation(outcome: &str) {
    ROTATIONS.with_label_values(&[outcome]).inc();
}

/// Record `count` tokens revoked for `reason`.
pub fn record_tokens_revoked(reason: &RevocationReason, count: u64) {
    if count > 0 {
        #[allow(clippy::cast_precision_loss)]
        TOKENS_REVOKED
            .with_label_values(&[reason.metric_label()])
            .inc_by(count as f64);
    }
}

/// Record a security event.
pub fn record_security_event(event_type: &str) {
    SECURITY_EVENTS.with_label_values(&[event_type]).inc();
}

/// Record authority operation latency.
pub fn record_operation_latency(operation: &str, duration_secs: f64) {
    OPERATION_LATENCY
        .with_label_values(&[operation])
        .observe(duration_secs);
}
