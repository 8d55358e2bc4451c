//! Peer telemetry
//!
//! Traffic counters and handshake times come from a Prometheus server scraping
//! a WireGuard exporter. Telemetry only enriches listings; callers treat any
//! error here as "no metrics".

use crate::config::TelemetryConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Traffic and liveness of one peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerStats {
    pub public_key: String,
    pub interface: String,
    pub allowed_ips: String,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub last_handshake: Option<DateTime<Utc>>,
    pub time_since_handshake: Option<String>,
    pub is_active: bool,
}

/// Source of per-peer metrics, keyed by public key
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn peer_stats(&self, public_key: &str) -> Result<Option<PeerStats>>;
}

// ============================================================================
// Prometheus
// ============================================================================

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<Sample>,
}

#[derive(Debug, Clone, Deserialize)]
struct Sample {
    #[serde(default)]
    metric: std::collections::HashMap<String, String>,
    /// `[timestamp, "value"]`
    value: (f64, String),
}

impl Sample {
    fn as_u64(&self) -> u64 {
        self.value.1.parse::<f64>().map(|v| v.max(0.0) as u64).unwrap_or(0)
    }

    fn label(&self, name: &str) -> String {
        self.metric.get(name).cloned().unwrap_or_default()
    }
}

/// Prometheus-backed telemetry
pub struct PrometheusTelemetry {
    client: reqwest::Client,
    base_url: String,
    active_window_secs: i64,
}

impl PrometheusTelemetry {
    pub fn new(base_url: impl Into<String>, config: &TelemetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            active_window_secs: config.active_window_secs,
        })
    }

    /// Build from config, `None` when no URL is configured
    pub fn from_config(config: &TelemetryConfig) -> Result<Option<Self>> {
        config
            .prometheus_url
            .as_deref()
            .map(|url| Self::new(url, config))
            .transpose()
    }

    async fn query(&self, promql: &str) -> Result<Vec<Sample>> {
        debug!("PromQL: {}", promql);
        let response: QueryResponse = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", promql)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.status != "success" {
            return Err(Error::Unavailable(
                response.error.unwrap_or_else(|| "Prometheus query failed".to_string()),
            ));
        }
        Ok(response.data.map(|d| d.result).unwrap_or_default())
    }

    /// Whether Prometheus reports itself healthy
    pub async fn health(&self) -> bool {
        match self
            .client
            .get(format!("{}/-/healthy", self.base_url))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

fn selector(metric: &str, public_key: &str) -> String {
    let escaped = public_key.replace('\\', "\\\\").replace('"', "\\\"");
    format!("{}{{public_key=\"{}\"}}", metric, escaped)
}

#[async_trait]
impl TelemetrySource for PrometheusTelemetry {
    async fn peer_stats(&self, public_key: &str) -> Result<Option<PeerStats>> {
        let sent = self
            .query(&selector("wireguard_sent_bytes_total", public_key))
            .await?;
        let received = self
            .query(&selector("wireguard_received_bytes_total", public_key))
            .await?;
        let handshake = self
            .query(&selector("wireguard_latest_handshake_seconds", public_key))
            .await?;

        Ok(build_stats(
            public_key,
            sent.first(),
            received.first(),
            handshake.first(),
            Utc::now().timestamp(),
            self.active_window_secs,
        ))
    }
}

fn build_stats(
    public_key: &str,
    sent: Option<&Sample>,
    received: Option<&Sample>,
    handshake: Option<&Sample>,
    now: i64,
    active_window_secs: i64,
) -> Option<PeerStats> {
    if sent.is_none() && received.is_none() && handshake.is_none() {
        return None;
    }

    let sent_bytes = sent.map(Sample::as_u64).unwrap_or(0);
    let received_bytes = received.map(Sample::as_u64).unwrap_or(0);
    let handshake_ts = handshake.map(|s| s.as_u64() as i64).unwrap_or(0);

    let (last_handshake, time_since_handshake, is_active) = if handshake_ts > 0 {
        let since = (now - handshake_ts).max(0);
        (
            Utc.timestamp_opt(handshake_ts, 0).single(),
            Some(format_since(since)),
            since < active_window_secs,
        )
    } else {
        (None, None, false)
    };

    Some(PeerStats {
        public_key: public_key.to_string(),
        interface: sent.map(|s| s.label("interface")).unwrap_or_default(),
        allowed_ips: sent.map(|s| s.label("allowed_ips")).unwrap_or_default(),
        sent_bytes,
        received_bytes,
        total_bytes: sent_bytes + received_bytes,
        last_handshake,
        time_since_handshake,
        is_active,
    })
}

/// `42s`, `3m 5s`, `2h 10m`
pub fn format_since(seconds: i64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
