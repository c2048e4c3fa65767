//! Counters emitted through the `metrics` facade, served in Prometheus
//! format once [`init_metrics`] has run. Before that they are no-ops.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder with its own `/metrics` listener on
/// `port`. Call once at startup, inside the tokio runtime.
pub fn init_metrics(port: u16) -> Result<(), anyhow::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

pub fn tokens_issued() {
    metrics::counter!("identity_tokens_issued_total").increment(1);
}

pub fn tokens_rotated() {
    metrics::counter!("identity_tokens_rotated_total").increment(1);
}

pub fn token_reuse_detected() {
    metrics::counter!("identity_token_reuse_detected_total").increment(1);
}

pub fn otp_sent(purpose: &'static str) {
    metrics::counter!("identity_otp_sent_total", "purpose" => purpose).increment(1);
}

pub fn otp_verification(purpose: &'static str, outcome: &'static str) {
    metrics::counter!(
        "identity_otp_verifications_total",
        "purpose" => purpose,
        "outcome" => outcome
    )
    .increment(1);
}

pub fn rate_limited(action: &str) {
    metrics::counter!("identity_rate_limit_rejections_total", "action" => action.to_string())
        .increment(1);
}

pub fn permission_cache(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!("identity_permission_cache_total", "result" => result).increment(1);
}
