// Agent heartbeat handling: version check, upgrade command and fleet status
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::clock::Clock;
use crate::metrics::FleetMetrics;
use crate::security::auth::AuthenticatedAgent;

/// Agents heard from within this window count as active.
pub const ACTIVE_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSummary {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub drop_count: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub current_version: String,
    pub metrics: Option<MetricsSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    #[serde(rename = "COMMAND_NOOP")]
    Noop,
    #[serde(rename = "COMMAND_UPGRADE")]
    Upgrade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub command: Command,
    pub latest_version: String,
    pub config_hash: String,
}

/// Totals returned when a metrics stream closes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub samples_accepted: u64,
    pub samples_rejected: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub drop_count: u64,
}

impl StreamSummary {
    pub fn record(&mut self, sample: &MetricsSummary) {
        self.samples_accepted += 1;
        self.rx_packets = self.rx_packets.saturating_add(sample.rx_packets);
        self.tx_packets = self.tx_packets.saturating_add(sample.tx_packets);
        self.drop_count = self.drop_count.saturating_add(sample.drop_count);
    }
}

/// Last known state of one agent, refreshed by every heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub version: String,
    pub credential_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub heartbeats: u64,
    pub metrics: Option<MetricsSummary>,
}

pub struct HeartbeatService {
    latest_version: String,
    config_hash: String,
    clock: Arc<dyn Clock>,
    metrics: Arc<FleetMetrics>,
    agents: RwLock<HashMap<String, AgentStatus>>,
}

impl HeartbeatService {
    pub fn new(
        latest_version: impl Into<String>,
        clock: Arc<dyn Clock>,
        metrics: Arc<FleetMetrics>,
    ) -> Self {
        let latest_version = latest_version.into();
        Self {
            config_hash: config_hash(&latest_version),
            latest_version,
            clock,
            metrics,
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn metrics(&self) -> &FleetMetrics {
        &self.metrics
    }

    /// Known agents, most recently seen first.
    pub fn agents(&self) -> Vec<AgentStatus> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<AgentStatus> = agents.values().cloned().collect();
        list.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        list
    }

    /// Agents with a heartbeat inside the active window. Also refreshes the gauge.
    pub fn active_agents(&self) -> usize {
        let cutoff = self.clock.now() - Duration::seconds(ACTIVE_WINDOW_SECS);
        let count = self
            .agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|agent| agent.last_seen >= cutoff)
            .count();
        self.metrics.set_active_agents(count);
        count
    }

    fn record(&self, agent: &AuthenticatedAgent, request: &HeartbeatRequest) {
        let now = self.clock.now();
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        let status = agents
            .entry(request.agent_id.clone())
            .or_insert_with(|| AgentStatus {
                agent_id: request.agent_id.clone(),
                version: String::new(),
                credential_id: String::new(),
                first_seen: now,
                last_seen: now,
                heartbeats: 0,
                metrics: None,
            });
        status.version = request.current_version.clone();
        status.credential_id = agent.credential_id.clone();
        status.last_seen = now;
        status.heartbeats += 1;
        if request.metrics.is_some() {
            status.metrics = request.metrics.clone();
        }
    }

    pub fn latest_version(&self) -> &str {
        &self.latest_version
    }

    pub fn handle(&self, agent: &AuthenticatedAgent, request: &HeartbeatRequest) -> HeartbeatResponse {
        info!(
            "💓 Heartbeat from agent {} (v{}) via credential {}",
            request.agent_id, request.current_version, agent.credential_id
        );
        if let Some(metrics) = &request.metrics {
            debug!(
                "   rx={} tx={} drops={} uptime={}s",
                metrics.rx_packets, metrics.tx_packets, metrics.drop_count, metrics.uptime_seconds
            );
        }
        self.metrics.record_heartbeat(&request.agent_id, request.metrics.as_ref());
        self.record(agent, request);

        let command = if !request.current_version.is_empty()
            && needs_upgrade(&request.current_version, &self.latest_version)
        {
            info!(
                "⬆️  Agent version {} < {}, issuing upgrade",
                request.current_version, self.latest_version
            );
            Command::Upgrade
        } else {
            Command::Noop
        };

        HeartbeatResponse {
            command,
            latest_version: self.latest_version.clone(),
            config_hash: self.config_hash.clone(),
        }
    }
}

/// Hex of the first 8 bytes of SHA-256 over the version string.
pub fn config_hash(version: &str) -> String {
    let digest = Sha256::digest(version.as_bytes());
    hex::encode(&digest[..8])
}

/// Numeric components of a dotted version. Non-digit characters are skipped.
fn parse_version(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|part| {
            part.chars()
                .filter_map(|c| c.to_digit(10))
                .fold(0u64, |acc, d| acc.saturating_mul(10).saturating_add(u64::from(d)))
        })
        .collect()
}

/// True when `current` is older than `latest`, comparing major.minor.patch.
pub fn needs_upgrade(current: &str, latest: &str) -> bool {
    let current = parse_version(current);
    let latest = parse_version(latest);

    for i in 0..3 {
        let c = current.get(i).copied().unwrap_or(0);
        let l = latest.get(i).copied().unwrap_or(0);
        if c != l {
            return c < l;
        }
    }
    false
}
