//! # SDN Adapter Trait
//!
//! This module defines the contract between DMM's core (site/request/orchestrator
//! logic) and the SDN controller that actually provisions bandwidth-guaranteed
//! circuits. The core never talks to the controller directly; it only calls
//! through [`SdnAdapter`], so a real HTTP-backed implementation and an in-memory
//! mock can both satisfy the same call sites.
//!
//! ## Implementing a new adapter
//!
//! 1. Implement [`SdnAdapter`] for your controller client.
//! 2. Wire it into the coordinator in place of [`HttpSdnAdapter`].
//!
//! See [`MockSdnAdapter`] for a minimal reference implementation used by tests.

use anyhow::Result;
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::SdnError;

/// Outcome of staging a new circuit: an opaque link id plus the controller's
/// best estimate of the link's theoretical capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub link_id: String,
    pub theoretical_bandwidth: f64,
}

/// The main trait for all SDN controller integrations.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: orchestrator jobs call through a
/// shared `Arc<dyn SdnAdapter>` from multiple worker tasks concurrently.
#[async_trait]
pub trait SdnAdapter: Send + Sync {
    /// Resolve an RSE name to the controller's URI for that site.
    async fn discover_uri(&self, rse_name: &str) -> Result<String, SdnError>;

    /// Fetch the IPv6 subnet blocks assigned to a site's uplink port.
    async fn discover_ipv6_pool(&self, sense_uri: &str) -> Result<Vec<String>, SdnError>;

    /// Fetch the uplink port's total capacity, in Mb/s.
    async fn discover_uplink_capacity(&self, sense_uri: &str) -> Result<f64, SdnError>;

    /// Stage a new circuit between two endpoints. Returns the controller's link
    /// id and its theoretical bandwidth; neither bandwidth is reserved yet.
    async fn stage(
        &self,
        src_uri: &str,
        dst_uri: &str,
        src_ipv6: &str,
        dst_ipv6: &str,
        profile_uuid: &Uuid,
        alias: &str,
    ) -> Result<StageResult, SdnError>;

    /// Reserve `bandwidth` Mb/s on an already-staged circuit.
    async fn provision(
        &self,
        link_id: &str,
        src_uri: &str,
        dst_uri: &str,
        src_ipv6: &str,
        dst_ipv6: &str,
        bandwidth: u64,
        alias: &str,
    ) -> Result<(), SdnError>;

    /// Equivalent to delete + stage + provision at a new bandwidth; the
    /// returned link id supersedes `old_link_id` and must replace it wherever
    /// it was cached (never across a reprovision).
    async fn reprovision(
        &self,
        old_link_id: &str,
        src_uri: &str,
        dst_uri: &str,
        src_ipv6: &str,
        dst_ipv6: &str,
        new_bandwidth: u64,
        alias: &str,
    ) -> Result<String, SdnError>;

    /// Tear down a circuit. Implementations must check the circuit's current
    /// status first and issue a "cancel" (forced if not already READY) before
    /// the "delete", surfacing `SdnError::InvalidState` if the circuit is in a
    /// state that cannot be cancelled.
    async fn delete(&self, link_id: &str) -> Result<(), SdnError>;
}

/// Real adapter: talks to a SENSE-style REST API over HTTPS.
pub struct HttpSdnAdapter {
    client: reqwest::Client,
    base_url: String,
    limiter: RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl HttpSdnAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        // The controller API is conservative about concurrent mutating calls;
        // cap our outbound rate rather than let the worker pool burst into it.
        let quota = Quota::per_second(NonZeroU32::new(10).expect("10 > 0"));
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            limiter: RateLimiter::direct(quota),
        }
    }

    async fn retrying<T, F, Fut>(&self, op: F) -> Result<T, SdnError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, SdnError>>,
    {
        self.limiter.until_ready().await;
        let strategy = ExponentialBackoff::from_millis(200).map(jitter).take(3);
        Retry::spawn(strategy, op).await
    }
}

#[async_trait]
impl SdnAdapter for HttpSdnAdapter {
    async fn discover_uri(&self, rse_name: &str) -> Result<String, SdnError> {
        let url = format!("{}/discover/uri/{}", self.base_url, rse_name);
        self.retrying(|| async {
            let resp = self.client.get(&url).send().await?;
            let body: HashMap<String, String> = resp.json().await?;
            body.get("sense_uri").cloned().ok_or_else(|| SdnError::Discovery {
                rse_name: rse_name.to_string(),
                reason: "response missing sense_uri".into(),
            })
        })
        .await
    }

    async fn discover_ipv6_pool(&self, sense_uri: &str) -> Result<Vec<String>, SdnError> {
        let url = format!("{}/discover/ipv6_pool", self.base_url);
        self.retrying(|| async {
            let resp = self.client.get(&url).query(&[("uri", sense_uri)]).send().await?;
            let body: HashMap<String, Vec<String>> = resp.json().await?;
            Ok(body.get("blocks").cloned().unwrap_or_default())
        })
        .await
    }

    async fn discover_uplink_capacity(&self, sense_uri: &str) -> Result<f64, SdnError> {
        let url = format!("{}/discover/uplink_capacity", self.base_url);
        self.retrying(|| async {
            let resp = self.client.get(&url).query(&[("uri", sense_uri)]).send().await?;
            let body: HashMap<String, f64> = resp.json().await?;
            Ok(body.get("capacity_mbps").copied().unwrap_or(0.0))
        })
        .await
    }

    async fn stage(
        &self,
        src_uri: &str,
        dst_uri: &str,
        src_ipv6: &str,
        dst_ipv6: &str,
        profile_uuid: &Uuid,
        alias: &str,
    ) -> Result<StageResult, SdnError> {
        let url = format!("{}/circuits/stage", self.base_url);
        let body = serde_json::json!({
            "src_uri": src_uri, "dst_uri": dst_uri,
            "src_ipv6": src_ipv6, "dst_ipv6": dst_ipv6,
            "profile_uuid": profile_uuid, "alias": alias,
        });
        self.retrying(|| async {
            let resp = self.client.post(&url).json(&body).send().await?;
            let parsed: serde_json::Value = resp.json().await?;
            let link_id = parsed["link_id"]
                .as_str()
                .ok_or_else(|| SdnError::Request {
                    operation: "stage",
                    reason: "response missing link_id".into(),
                })?
                .to_string();
            let theoretical_bandwidth = parsed["theoretical_bandwidth"].as_f64().unwrap_or(0.0);
            Ok(StageResult { link_id, theoretical_bandwidth })
        })
        .await
    }

    async fn provision(
        &self,
        link_id: &str,
        src_uri: &str,
        dst_uri: &str,
        src_ipv6: &str,
        dst_ipv6: &str,
        bandwidth: u64,
        alias: &str,
    ) -> Result<(), SdnError> {
        let url = format!("{}/circuits/{}/provision", self.base_url, link_id);
        let body = serde_json::json!({
            "src_uri": src_uri, "dst_uri": dst_uri,
            "src_ipv6": src_ipv6, "dst_ipv6": dst_ipv6,
            "bandwidth": bandwidth, "alias": alias,
        });
        self.retrying(|| async {
            self.client.post(&url).json(&body).send().await?.error_for_status()?;
            Ok(())
        })
        .await
    }

    async fn reprovision(
        &self,
        old_link_id: &str,
        src_uri: &str,
        dst_uri: &str,
        src_ipv6: &str,
        dst_ipv6: &str,
        new_bandwidth: u64,
        alias: &str,
    ) -> Result<String, SdnError> {
        // The controller has no atomic "reprovision" endpoint: delete the old
        // circuit, then stage+provision a fresh one at the new bandwidth.
        self.delete(old_link_id).await?;
        let profile_uuid = Uuid::nil();
        let staged = self
            .stage(src_uri, dst_uri, src_ipv6, dst_ipv6, &profile_uuid, alias)
            .await?;
        self.provision(
            &staged.link_id,
            src_uri,
            dst_uri,
            src_ipv6,
            dst_ipv6,
            new_bandwidth,
            alias,
        )
        .await?;
        Ok(staged.link_id)
    }

    async fn delete(&self, link_id: &str) -> Result<(), SdnError> {
        let status_url = format!("{}/circuits/{}/status", self.base_url, link_id);
        let status: String = self
            .retrying(|| async {
                let resp = self.client.get(&status_url).send().await?;
                let body: HashMap<String, String> = resp.json().await?;
                Ok(body.get("status").cloned().unwrap_or_default())
            })
            .await?;

        let cancellable = matches!(status.as_str(), "CREATE" | "REINSTATE" | "MODIFY" | "READY");
        if !cancellable {
            return Err(SdnError::InvalidState {
                link_id: link_id.to_string(),
                status,
            });
        }

        let force = status != "READY";
        let cancel_url = format!("{}/circuits/{}/cancel", self.base_url, link_id);
        self.retrying(|| async {
            self.client
                .post(&cancel_url)
                .query(&[("force", &force.to_string())])
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
        .await?;

        let delete_url = format!("{}/circuits/{}", self.base_url, link_id);
        self.retrying(|| async {
            self.client.delete(&delete_url).send().await?.error_for_status()?;
            Ok(())
        })
        .await
    }
}

/// In-memory mock used by integration tests and the scenario suite. Never
/// issues a network call; staged/provisioned circuits are tracked so `delete`
/// can exercise the same status-check-then-cancel-then-delete state machine.
pub struct MockSdnAdapter {
    uris: HashMap<String, String>,
    ipv6_pools: HashMap<String, Vec<String>>,
    uplink_capacities: HashMap<String, f64>,
    default_theoretical_bandwidth: f64,
    circuits: Mutex<HashMap<String, &'static str>>,
}

impl MockSdnAdapter {
    pub fn new() -> Self {
        Self {
            uris: HashMap::new(),
            ipv6_pools: HashMap::new(),
            uplink_capacities: HashMap::new(),
            default_theoretical_bandwidth: 1_000_000_000_000_000.0,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_site(
        mut self,
        rse_name: impl Into<String>,
        uri: impl Into<String>,
        ipv6_pool: Vec<String>,
        uplink_capacity: f64,
    ) -> Self {
        let rse_name = rse_name.into();
        self.uris.insert(rse_name.clone(), uri.into());
        self.ipv6_pools.insert(rse_name.clone(), ipv6_pool);
        self.uplink_capacities.insert(rse_name, uplink_capacity);
        self
    }

    pub fn with_theoretical_bandwidth(mut self, bw: f64) -> Self {
        self.default_theoretical_bandwidth = bw;
        self
    }

    /// Count of circuits currently tracked as provisioned (for test assertions).
    pub fn open_circuit_count(&self) -> usize {
        self.circuits.lock().expect("mock sdn mutex poisoned").len()
    }
}

impl Default for MockSdnAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SdnAdapter for MockSdnAdapter {
    async fn discover_uri(&self, rse_name: &str) -> Result<String, SdnError> {
        self.uris.get(rse_name).cloned().ok_or_else(|| SdnError::Discovery {
            rse_name: rse_name.to_string(),
            reason: "site not configured in mock adapter".into(),
        })
    }

    async fn discover_ipv6_pool(&self, sense_uri: &str) -> Result<Vec<String>, SdnError> {
        for (rse, uri) in &self.uris {
            if uri == sense_uri {
                return Ok(self.ipv6_pools.get(rse).cloned().unwrap_or_default());
            }
        }
        Ok(Vec::new())
    }

    async fn discover_uplink_capacity(&self, sense_uri: &str) -> Result<f64, SdnError> {
        for (rse, uri) in &self.uris {
            if uri == sense_uri {
                return Ok(self.uplink_capacities.get(rse).copied().unwrap_or(0.0));
            }
        }
        Ok(0.0)
    }

    async fn stage(
        &self,
        _src_uri: &str,
        _dst_uri: &str,
        _src_ipv6: &str,
        _dst_ipv6: &str,
        _profile_uuid: &Uuid,
        _alias: &str,
    ) -> Result<StageResult, SdnError> {
        let link_id = Uuid::new_v4().to_string();
        self.circuits
            .lock()
            .expect("mock sdn mutex poisoned")
            .insert(link_id.clone(), "CREATE");
        Ok(StageResult {
            link_id,
            theoretical_bandwidth: self.default_theoretical_bandwidth,
        })
    }

    async fn provision(
        &self,
        link_id: &str,
        _src_uri: &str,
        _dst_uri: &str,
        _src_ipv6: &str,
        _dst_ipv6: &str,
        _bandwidth: u64,
        _alias: &str,
    ) -> Result<(), SdnError> {
        self.circuits
            .lock()
            .expect("mock sdn mutex poisoned")
            .insert(link_id.to_string(), "READY");
        Ok(())
    }

    async fn reprovision(
        &self,
        old_link_id: &str,
        src_uri: &str,
        dst_uri: &str,
        src_ipv6: &str,
        dst_ipv6: &str,
        new_bandwidth: u64,
        alias: &str,
    ) -> Result<String, SdnError> {
        self.delete(old_link_id).await?;
        let staged = self
            .stage(src_uri, dst_uri, src_ipv6, dst_ipv6, &Uuid::nil(), alias)
            .await?;
        self.provision(
            &staged.link_id,
            src_uri,
            dst_uri,
            src_ipv6,
            dst_ipv6,
            new_bandwidth,
            alias,
        )
        .await?;
        Ok(staged.link_id)
    }

    async fn delete(&self, link_id: &str) -> Result<(), SdnError> {
        let mut circuits = self.circuits.lock().expect("mock sdn mutex poisoned");
        let status = circuits.get(link_id).copied().ok_or_else(|| SdnError::InvalidState {
            link_id: link_id.to_string(),
            status: "UNKNOWN".into(),
        })?;
        if !matches!(status, "CREATE" | "REINSTATE" | "MODIFY" | "READY") {
            return Err(SdnError::InvalidState {
                link_id: link_id.to_string(),
                status: status.to_string(),
            });
        }
        circuits.remove(link_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stage_then_provision_then_delete_round_trips() {
        let adapter = MockSdnAdapter::new().with_site("XRD1", "uri1", vec!["a".into()], 100_000.0);
        let staged = adapter
            .stage("uri1", "uri2", "a", "b", &Uuid::nil(), "alias")
            .await
            .unwrap();
        adapter
            .provision(&staged.link_id, "uri1", "uri2", "a", "b", 1000, "alias")
            .await
            .unwrap();
        assert_eq!(adapter.open_circuit_count(), 1);
        adapter.delete(&staged.link_id).await.unwrap();
        assert_eq!(adapter.open_circuit_count(), 0);
    }

    #[tokio::test]
    async fn delete_unknown_link_is_invalid_state() {
        let adapter = MockSdnAdapter::new();
        let err = adapter.delete("nonexistent").await.unwrap_err();
        assert!(matches!(err, SdnError::InvalidState { .. }));
    }
}
