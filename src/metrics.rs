// Numan Thabit 2025
// metrics.rs - Prometheus and tracing
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub attach_attempts: IntCounter,
    pub attach_success: IntCounter,
    pub attach_duration_ms: Histogram,
    pub role_changes: IntCounterVec,
    pub role_current: IntGauge,
    pub parent_changes: IntCounter,
    pub parent_responses: IntCounter,
    pub parent_responses_rejected: IntCounter,
    pub rx_dropped: IntCounterVec,
    pub replay_drops: IntCounter,
    pub aead_failures: IntCounter,
    pub epoch_adoptions: IntCounter,
    pub epoch_reestablish: IntCounter,
    pub child_update_retries: IntCounter,
    pub data_request_retries: IntCounter,
    pub forced_detach: IntCounter,
    pub delayed_sends: IntCounterVec,
    pub announce_switches: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("numimesh".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_counter_vec {
            ($name:expr, $help:expr, $labels:expr) => {{
                let counter = IntCounterVec::new(prometheus::Opts::new($name, $help), $labels)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        macro_rules! register_histogram {
            ($name:expr, $help:expr, $buckets:expr) => {{
                let opts = HistogramOpts::new($name, $help).buckets($buckets.to_vec());
                let hist = Histogram::with_opts(opts)?;
                registry.register(Box::new(hist.clone()))?;
                hist
            }};
        }

        let attach_attempts = register_counter!("attach_attempts_total", "Attach cycles started");
        let attach_success = register_counter!("attach_success_total", "Attach cycles completed");
        let attach_duration_ms = register_histogram!(
            "attach_duration_ms",
            "Time from attach start to child promotion",
            [50.0, 250.0, 1000.0, 5000.0, 30000.0, 120000.0]
        );
        let role_changes = register_counter_vec!(
            "role_changes_total",
            "Role transitions by new role",
            &["role"]
        );
        let role_current = register_gauge!("role_current", "Current role as a numeric code");
        let parent_changes =
            register_counter!("parent_changes_total", "Times the device switched parents");
        let parent_responses =
            register_counter!("parent_responses_total", "Parent Responses considered");
        let parent_responses_rejected = register_counter!(
            "parent_responses_rejected_total",
            "Parent Responses failing acceptance criteria"
        );
        let rx_dropped = register_counter_vec!(
            "rx_dropped_total",
            "Inbound datagrams dropped by reason",
            &["reason"]
        );
        let replay_drops = register_counter!("replay_drops_total", "Duplicate frame counters");
        let aead_failures = register_counter!("aead_failures_total", "Authentication tag failures");
        let epoch_adoptions = register_counter!("epoch_adoptions_total", "Key epochs adopted");
        let epoch_reestablish = register_counter!(
            "epoch_reestablish_total",
            "Link re-establishments from epoch jumps"
        );
        let child_update_retries =
            register_counter!("child_update_retries_total", "Child Update retransmissions");
        let data_request_retries =
            register_counter!("data_request_retries_total", "Data Request retransmissions");
        let forced_detach = register_counter!(
            "forced_detach_total",
            "Detaches forced by retry exhaustion or rejection"
        );
        let delayed_sends = register_counter_vec!(
            "delayed_sends_total",
            "Delayed transmissions by message kind",
            &["kind"]
        );
        let announce_switches =
            register_counter!("announce_switches_total", "Channel switches from Announce");

        Ok(Self {
            registry,
            attach_attempts,
            attach_success,
            attach_duration_ms,
            role_changes,
            role_current,
            parent_changes,
            parent_responses,
            parent_responses_rejected,
            rx_dropped,
            replay_drops,
            aead_failures,
            epoch_adoptions,
            epoch_reestablish,
            child_update_retries,
            data_request_retries,
            forced_detach,
            delayed_sends,
            announce_switches,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_metrics_registry() {
        let metrics = Metrics::new().expect("metrics");
        metrics.attach_attempts.inc();
        metrics.role_changes.with_label_values(&["child"]).inc();
        metrics.rx_dropped.with_label_values(&["replay"]).inc();
        metrics.role_current.set(2);
        metrics.attach_duration_ms.observe(800.0);
        assert!(!metrics.gather().is_empty());
    }
}
