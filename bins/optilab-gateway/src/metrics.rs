// Prometheus metrics for the gateway
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref EXECUTIONS_STARTED: IntCounter = register_int_counter!(
        "optilab_executions_started_total",
        "Executions accepted and handed to the orchestrator"
    )
    .expect("metric registration");
    pub static ref EXECUTIONS_FINISHED: IntCounterVec = register_int_counter_vec!(
        "optilab_executions_finished_total",
        "Executions that reached a terminal state, by outcome",
        &["outcome"]
    )
    .expect("metric registration");
    pub static ref ACTIVE_CONNECTIONS: IntGauge = register_int_gauge!(
        "optilab_active_connections",
        "Live streaming channels"
    )
    .expect("metric registration");
    pub static ref MESSAGES_SENT: IntCounter = register_int_counter!(
        "optilab_channel_messages_sent_total",
        "Envelopes written to streaming channels"
    )
    .expect("metric registration");
    pub static ref LOG_EVENTS_STREAMED: IntCounter = register_int_counter!(
        "optilab_log_events_streamed_total",
        "Classified log events emitted to channels"
    )
    .expect("metric registration");
}

/// Render the default registry in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}
