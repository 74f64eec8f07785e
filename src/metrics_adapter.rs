//! # Metrics Adapter Trait
//!
//! Queries a time-series backend for bytes transmitted on a device over a time
//! window, so link history can record `actual_bandwidth` alongside the
//! promised one. This is a read-only outbound client — distinct from the
//! ambient observability layer in `metrics.rs`, which emits DMM's own
//! operational telemetry.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::MetricsError;

#[async_trait]
pub trait MetricsAdapter: Send + Sync {
    /// Total bytes transmitted by the device owning `ipv6` at site `rse_name`,
    /// between `t_start` and `t_end`.
    async fn total_bytes_transmitted(
        &self,
        ipv6: &str,
        rse_name: &str,
        t_start: DateTime<Utc>,
        t_end: DateTime<Utc>,
    ) -> Result<u64, MetricsError>;

    /// `total_bytes_transmitted(..) / (t_end - t_start)`, in bytes/second.
    /// Returns 0.0 when `t_end <= t_start`.
    async fn average_throughput(
        &self,
        ipv6: &str,
        rse_name: &str,
        t_start: DateTime<Utc>,
        t_end: DateTime<Utc>,
    ) -> Result<f64, MetricsError> {
        let elapsed = (t_end - t_start).num_milliseconds();
        if elapsed <= 0 {
            return Ok(0.0);
        }
        let bytes = self.total_bytes_transmitted(ipv6, rse_name, t_start, t_end).await?;
        Ok(bytes as f64 / (elapsed as f64 / 1000.0))
    }
}

/// Real adapter: a Prometheus instant-query client. Bytes-on-the-wire are kept
/// behind `node_network_address_info{address=ipv6}` → device name, then a
/// range query of `node_network_transmit_bytes_total{device=...}` resolves the
/// counter delta across the window.
pub struct PrometheusMetricsAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl PrometheusMetricsAdapter {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("http://{}:{}", host, port),
        }
    }

    async fn resolve_device(&self, ipv6: &str, rse_name: &str) -> Result<String, MetricsError> {
        let query = format!("node_network_address_info{{address=\"{}\"}}", ipv6);
        let url = format!("{}/api/v1/query", self.base_url);
        let resp = self.client.get(&url).query(&[("query", query.as_str())]).send().await?;
        let body: serde_json::Value = resp.json().await?;
        body["data"]["result"][0]["metric"]["device"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| MetricsError::DeviceNotFound(format!("{ipv6}@{rse_name}")))
    }

    async fn counter_at(&self, device: &str, at: DateTime<Utc>) -> Result<u64, MetricsError> {
        let query = format!("node_network_transmit_bytes_total{{device=\"{}\"}}", device);
        let url = format!("{}/api/v1/query", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("query", query.as_str()), ("time", &at.timestamp().to_string())])
            .send()
            .await?;
        let body: serde_json::Value = resp.json().await?;
        body["data"]["result"][0]["value"][1]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .map(|v| v as u64)
            .ok_or_else(|| MetricsError::Query(format!("no samples for device {device}")))
    }
}

#[async_trait]
impl MetricsAdapter for PrometheusMetricsAdapter {
    async fn total_bytes_transmitted(
        &self,
        ipv6: &str,
        rse_name: &str,
        t_start: DateTime<Utc>,
        t_end: DateTime<Utc>,
    ) -> Result<u64, MetricsError> {
        let device = self.resolve_device(ipv6, rse_name).await?;
        let start_bytes = self.counter_at(&device, t_start).await?;
        let end_bytes = self.counter_at(&device, t_end).await?;
        Ok(end_bytes.saturating_sub(start_bytes))
    }
}

/// In-memory mock: returns a canned transmitted-bytes figure per (ipv6, rse)
/// pair, or 0 when unset. Used by integration tests with monitoring disabled
/// or with deterministic fixtures.
#[derive(Default)]
pub struct MockMetricsAdapter {
    fixtures: HashMap<(String, String), u64>,
}

impl MockMetricsAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fixture(mut self, ipv6: impl Into<String>, rse_name: impl Into<String>, bytes: u64) -> Self {
        self.fixtures.insert((ipv6.into(), rse_name.into()), bytes);
        self
    }
}

#[async_trait]
impl MetricsAdapter for MockMetricsAdapter {
    async fn total_bytes_transmitted(
        &self,
        ipv6: &str,
        rse_name: &str,
        _t_start: DateTime<Utc>,
        _t_end: DateTime<Utc>,
    ) -> Result<u64, MetricsError> {
        Ok(self
            .fixtures
            .get(&(ipv6.to_string(), rse_name.to_string()))
            .copied()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn average_throughput_divides_by_elapsed_seconds() {
        let adapter = MockMetricsAdapter::new().with_fixture("2001:db8::1", "XRD1", 1000);
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);
        let rate = adapter.average_throughput("2001:db8::1", "XRD1", t0, t1).await.unwrap();
        assert_eq!(rate, 100.0);
    }

    #[tokio::test]
    async fn average_throughput_zero_window_is_zero() {
        let adapter = MockMetricsAdapter::new();
        let t0 = Utc::now();
        let rate = adapter.average_throughput("2001:db8::1", "XRD1", t0, t0).await.unwrap();
        assert_eq!(rate, 0.0);
    }
}
