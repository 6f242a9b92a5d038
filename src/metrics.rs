//! Prometheus metrics.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    pub events_ingested_total: IntCounter,
    pub burn_blocks_total: IntCounter,
    pub expired_closures_total: IntCounter,
    pub signature_state_upserts_total: IntCounter,
    pub signature_state_rejections_total: IntCounter,
    pub cosign_requests_total: IntCounter,
    pub cosign_failures_total: IntCounter,
    pub closures_active: IntGauge,
    pub dispute_attempts: IntGauge,
    pub registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_ingested_total = IntCounter::new(
            "watchtower_events_ingested_total",
            "Pipe events accepted from the chain observer feed",
        )
        .expect("constant metric name is valid");
        let burn_blocks_total = IntCounter::new(
            "watchtower_burn_blocks_total",
            "Burn block notifications processed",
        )
        .expect("constant metric name is valid");
        let expired_closures_total = IntCounter::new(
            "watchtower_expired_closures_total",
            "Closures swept after their waiting period elapsed",
        )
        .expect("constant metric name is valid");
        let signature_state_upserts_total = IntCounter::new(
            "watchtower_signature_state_upserts_total",
            "Signature states stored or replaced",
        )
        .expect("constant metric name is valid");
        let signature_state_rejections_total = IntCounter::new(
            "watchtower_signature_state_rejections_total",
            "Signature state submissions rejected",
        )
        .expect("constant metric name is valid");
        let cosign_requests_total = IntCounter::new(
            "watchtower_cosign_requests_total",
            "Counterparty co-sign requests received",
        )
        .expect("constant metric name is valid");
        let cosign_failures_total = IntCounter::new(
            "watchtower_cosign_failures_total",
            "Counterparty co-sign requests rejected or failed",
        )
        .expect("constant metric name is valid");
        let closures_active = IntGauge::new(
            "watchtower_closures_active",
            "Closures currently in their waiting period",
        )
        .expect("constant metric name is valid");
        let dispute_attempts = IntGauge::new(
            "watchtower_dispute_attempts",
            "Dispute attempts recorded since the database was created",
        )
        .expect("constant metric name is valid");

        for collector in [
            &events_ingested_total,
            &burn_blocks_total,
            &expired_closures_total,
            &signature_state_upserts_total,
            &signature_state_rejections_total,
            &cosign_requests_total,
            &cosign_failures_total,
        ] {
            registry
                .register(Box::new(collector.clone()))
                .expect("metric registration must not be called twice");
        }
        registry
            .register(Box::new(closures_active.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(dispute_attempts.clone()))
            .expect("metric registration must not be called twice");

        Self {
            events_ingested_total,
            burn_blocks_total,
            expired_closures_total,
            signature_state_upserts_total,
            signature_state_rejections_total,
            cosign_requests_total,
            cosign_failures_total,
            closures_active,
            dispute_attempts,
            registry,
        }
    }

    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_render() {
        let metrics = Metrics::new();
        metrics.events_ingested_total.inc();
        metrics.closures_active.set(3);
        let output = String::from_utf8(metrics.render().unwrap()).unwrap();
        assert!(output.contains("watchtower_events_ingested_total 1"));
        assert!(output.contains("watchtower_closures_active 3"));
    }
}
