//! Prometheus metrics for the control plane.
//!
//! Per-agent gauges mirror the last reported `MetricsSummary`; counters
//! track heartbeats and streamed samples.
//!
//! - `fleet_agent_rx_packets{agent_id}`
//! - `fleet_agent_tx_packets{agent_id}`
//! - `fleet_agent_drop_count{agent_id}`
//! - `fleet_agent_uptime_seconds{agent_id}`
//! - `fleet_heartbeat_total{agent_id}`
//! - `fleet_stream_samples_total{credential_id, result}`
//! - `fleet_active_agents`
//! - `fleet_uptime_seconds`

use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

use crate::heartbeat::MetricsSummary;

/// Content type of the text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const NAMESPACE: &str = "fleet";

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("metrics output is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub struct FleetMetrics {
    registry: Registry,
    rx_packets: IntGaugeVec,
    tx_packets: IntGaugeVec,
    drop_count: IntGaugeVec,
    agent_uptime: IntGaugeVec,
    heartbeats: IntCounterVec,
    stream_samples: IntCounterVec,
    active_agents: IntGauge,
    uptime_seconds: IntGauge,
}

fn agent_gauge(name: &str, help: &str) -> Result<IntGaugeVec, prometheus::Error> {
    IntGaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), &["agent_id"])
}

impl FleetMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let rx_packets = agent_gauge("agent_rx_packets", "Received packets reported by agent")?;
        let tx_packets = agent_gauge("agent_tx_packets", "Transmitted packets reported by agent")?;
        let drop_count = agent_gauge("agent_drop_count", "Dropped packets reported by agent")?;
        let agent_uptime = agent_gauge("agent_uptime_seconds", "Agent uptime in seconds")?;

        let heartbeats = IntCounterVec::new(
            Opts::new("heartbeat_total", "Heartbeats received").namespace(NAMESPACE),
            &["agent_id"],
        )?;
        let stream_samples = IntCounterVec::new(
            Opts::new("stream_samples_total", "Streamed metric samples by outcome")
                .namespace(NAMESPACE),
            &["credential_id", "result"],
        )?;
        let active_agents = IntGauge::with_opts(
            Opts::new("active_agents", "Agents that sent a heartbeat in the last 5 minutes")
                .namespace(NAMESPACE),
        )?;
        let uptime_seconds = IntGauge::with_opts(
            Opts::new("uptime_seconds", "Control plane uptime in seconds").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(rx_packets.clone()))?;
        registry.register(Box::new(tx_packets.clone()))?;
        registry.register(Box::new(drop_count.clone()))?;
        registry.register(Box::new(agent_uptime.clone()))?;
        registry.register(Box::new(heartbeats.clone()))?;
        registry.register(Box::new(stream_samples.clone()))?;
        registry.register(Box::new(active_agents.clone()))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            registry,
            rx_packets,
            tx_packets,
            drop_count,
            agent_uptime,
            heartbeats,
            stream_samples,
            active_agents,
            uptime_seconds,
        })
    }

    /// Count a heartbeat and, when it carries a summary, replace the agent's gauges.
    pub fn record_heartbeat(&self, agent_id: &str, summary: Option<&MetricsSummary>) {
        self.heartbeats.with_label_values(&[agent_id]).inc();

        if let Some(summary) = summary {
            self.rx_packets.with_label_values(&[agent_id]).set(clamp(summary.rx_packets));
            self.tx_packets.with_label_values(&[agent_id]).set(clamp(summary.tx_packets));
            self.drop_count.with_label_values(&[agent_id]).set(clamp(summary.drop_count));
            self.agent_uptime
                .with_label_values(&[agent_id])
                .set(clamp(summary.uptime_seconds));
        }
    }

    pub fn record_stream_samples(&self, credential_id: &str, accepted: u64, rejected: u64) {
        self.stream_samples
            .with_label_values(&[credential_id, "accepted"])
            .inc_by(accepted);
        self.stream_samples
            .with_label_values(&[credential_id, "rejected"])
            .inc_by(rejected);
    }

    pub fn set_active_agents(&self, count: usize) {
        self.active_agents.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn set_uptime(&self, seconds: u64) {
        self.uptime_seconds.set(clamp(seconds));
    }

    /// Everything in the registry, in the text exposition format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_updates_agent_gauges() {
        let metrics = FleetMetrics::new().unwrap();
        let summary = MetricsSummary {
            rx_packets: 1200,
            tx_packets: 800,
            drop_count: 3,
            uptime_seconds: 3600,
        };

        metrics.record_heartbeat("agent-42", Some(&summary));
        metrics.record_heartbeat("agent-42", None);

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"fleet_agent_rx_packets{agent_id="agent-42"} 1200"#));
        assert!(text.contains(r#"fleet_agent_drop_count{agent_id="agent-42"} 3"#));
        assert!(text.contains(r#"fleet_agent_uptime_seconds{agent_id="agent-42"} 3600"#));
        assert!(text.contains(r#"fleet_heartbeat_total{agent_id="agent-42"} 2"#));
    }

    #[test]
    fn test_stream_samples_by_outcome() {
        let metrics = FleetMetrics::new().unwrap();
        metrics.record_stream_samples("0a1b2c3d4e5f", 4, 1);
        metrics.record_stream_samples("0a1b2c3d4e5f", 2, 0);

        let text = metrics.encode().unwrap();
        assert!(text.contains(
            r#"fleet_stream_samples_total{credential_id="0a1b2c3d4e5f",result="accepted"} 6"#
        ));
        assert!(text.contains(
            r#"fleet_stream_samples_total{credential_id="0a1b2c3d4e5f",result="rejected"} 1"#
        ));
    }

    #[test]
    fn test_counts_saturate_instead_of_wrapping() {
        let metrics = FleetMetrics::new().unwrap();
        metrics.record_heartbeat(
            "agent-7",
            Some(&MetricsSummary {
                rx_packets: u64::MAX,
                ..MetricsSummary::default()
            }),
        );
        metrics.set_active_agents(1);

        let text = metrics.encode().unwrap();
        let expected = format!(r#"fleet_agent_rx_packets{{agent_id="agent-7"}} {}"#, i64::MAX);
        assert!(text.contains(&expected));
        assert!(text.contains("fleet_active_agents 1"));
    }
}
