//! Ties the Site/Request registries, the RPC listener, and the orchestrator
//! together. This is the only module that knows about all the others; §4.4
//! (the three RPC handlers) and §4.5 (recompute-and-dispatch) both live here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Mutex as StdMutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::error::CoordinatorError;
use crate::metrics;
use crate::metrics_adapter::MetricsAdapter;
use crate::orchestrator::Orchestrator;
use crate::persistence::{AsyncPersistenceWriter, PersistenceStore, RequestRow};
use crate::protocol::{
    self, pair_id, split_pair_id, Envelope, FinisherPayload, PreparerPayload, SubmitterPayload, SubmitterReply,
};
use crate::request::{request_id, Request};
use crate::sdn_adapter::SdnAdapter;
use crate::settings::{Settings, SiteConfig};
use crate::site::Site;

type SharedSite = Arc<StdMutex<Site>>;
type SharedRequest = Arc<AsyncMutex<Request>>;

/// The running DMM daemon: registries, adapters, and the RPC listener.
pub struct Coordinator {
    sites: DashMap<String, SharedSite>,
    requests: DashMap<String, SharedRequest>,
    site_configs: HashMap<String, SiteConfig>,
    sdn: Arc<dyn SdnAdapter>,
    metrics: Arc<dyn MetricsAdapter>,
    store: Arc<dyn PersistenceStore>,
    persistence: AsyncPersistenceWriter,
    orchestrator: Orchestrator,
    profile_uuid: Uuid,
    monitoring: bool,
    authkey: Vec<u8>,
    host: String,
    port: u16,
}

impl Coordinator {
    pub fn new(
        settings: &Settings,
        sdn: Arc<dyn SdnAdapter>,
        metrics: Arc<dyn MetricsAdapter>,
        store: Arc<dyn PersistenceStore>,
        n_workers: usize,
    ) -> Result<Self, CoordinatorError> {
        let profile_uuid = Uuid::parse_str(&settings.sense.profile_uuid)
            .map_err(|e| CoordinatorError::Protocol(format!("invalid sense.profile_uuid: {e}")))?;
        let authkey = auth::read_authkey(std::path::Path::new(&settings.dmm.authkey))
            .map_err(|_| CoordinatorError::Auth)?;

        Ok(Self {
            sites: DashMap::new(),
            requests: DashMap::new(),
            site_configs: settings.sites.clone(),
            sdn,
            metrics,
            persistence: AsyncPersistenceWriter::new(store.clone()),
            store,
            orchestrator: Orchestrator::new(n_workers),
            profile_uuid,
            monitoring: settings.dmm.monitoring,
            authkey,
            host: settings.dmm.host.clone(),
            port: settings.dmm.port,
        })
    }

    /// Rebuild in-memory Site/Request state from persistence on startup.
    /// Sites are reconstructed lazily as their rows reference them; each
    /// block a rehydrated Request held is marked used directly rather than
    /// popped from the free queue, since it was already reserved in a
    /// previous run.
    pub async fn rehydrate(&self) -> anyhow::Result<()> {
        let rows = self.store.load_all().await?;
        info!(count = rows.len(), "rehydrating requests from persistence");
        for row in rows {
            if let Err(e) = self.rehydrate_one(row).await {
                error!(error = %e, "failed to rehydrate a persisted request; skipping it");
            }
        }
        Ok(())
    }

    async fn rehydrate_one(&self, row: RequestRow) -> anyhow::Result<()> {
        let src_site = self.get_or_create_site(&row.src_site).await?;
        let dst_site = self.get_or_create_site(&row.dst_site).await?;

        let priority = row.priority.max(0) as u64;
        src_site.lock().expect("site mutex poisoned").add_request(&row.dst_site, priority);
        dst_site.lock().expect("site mutex poisoned").add_request(&row.src_site, priority);
        // Best-effort requests are bound to each site's default_ipv6 (register()'s
        // best-effort branch), which must never enter used_ipv6_pool.
        if priority > 0 {
            if let Some(ipv6) = &row.src_ipv6 {
                src_site.lock().expect("site mutex poisoned").mark_reserved(ipv6);
            }
            if let Some(ipv6) = &row.dst_ipv6 {
                dst_site.lock().expect("site mutex poisoned").mark_reserved(ipv6);
            }
        }

        let transfer_ids = row.transfer_ids.split(',').filter(|s| !s.is_empty()).map(String::from).collect();
        let mut request = Request::new(
            row.rule_id,
            row.src_site,
            row.dst_site,
            src_site,
            dst_site,
            transfer_ids,
            priority,
            row.n_bytes_total.max(0) as u64,
            row.n_transfers_total.max(0) as u64,
        );
        request.src_ipv6 = row.src_ipv6;
        request.dst_ipv6 = row.dst_ipv6;
        request.n_bytes_transferred = row.n_bytes_transferred.max(0) as u64;
        request.n_transfers_submitted = row.n_transfers_submitted.max(0) as u64;
        request.n_transfers_finished = row.n_transfers_finished.max(0) as u64;
        request.bandwidth = row.bandwidth.max(0) as u64;
        request.sense_link_id = row.sense_link_id;

        self.requests.insert(request.request_id.clone(), Arc::new(AsyncMutex::new(request)));
        Ok(())
    }

    /// Construct a Site on first reference: SDN discovery for its URI and
    /// uplink capacity, static configuration for its externally-assigned
    /// IPv6 pool and best-effort default (§4.1). `discover_ipv6_pool` is
    /// still called so a configuration drift is logged, but the static
    /// configuration is always what's actually handed out.
    async fn get_or_create_site(&self, rse_name: &str) -> Result<SharedSite, CoordinatorError> {
        if let Some(existing) = self.sites.get(rse_name) {
            return Ok(existing.value().clone());
        }

        let cfg = self
            .site_configs
            .get(rse_name)
            .cloned()
            .ok_or_else(|| CoordinatorError::Protocol(format!("no static site configuration for {rse_name}")))?;

        let sense_uri = self
            .sdn
            .discover_uri(rse_name)
            .await
            .map_err(|e| CoordinatorError::Protocol(e.to_string()))?;
        let uplink_capacity = self
            .sdn
            .discover_uplink_capacity(&sense_uri)
            .await
            .map_err(|e| CoordinatorError::Protocol(e.to_string()))?;

        if let Ok(discovered) = self.sdn.discover_ipv6_pool(&sense_uri).await {
            let configured: HashSet<&String> = cfg.ipv6_pool.iter().map(|e| &e.ipv6).collect();
            if discovered.iter().any(|b| !configured.contains(b)) {
                warn!(rse_name, "SDN-discovered IPv6 pool differs from static configuration; using the static one");
            }
        }

        let ipv6_pool: Vec<String> = cfg.ipv6_pool.iter().map(|e| e.ipv6.clone()).collect();
        let site = Arc::new(StdMutex::new(Site::new(rse_name, sense_uri, uplink_capacity, ipv6_pool, cfg.best_effort_ipv6)));
        self.sites.insert(rse_name.to_string(), site.clone());
        Ok(site)
    }

    /// Accept connections one at a time: at most one RPC is ever mid-flight
    /// at a time, matching the single dispatcher context the handlers below
    /// assume (they touch the registries without their own locking).
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        info!(host = %self.host, port = self.port, "DMM coordinator listening");
        loop {
            let (socket, peer) = listener.accept().await?;
            info!(%peer, "accepted connection");
            if let Err(e) = self.handle_connection(socket).await {
                warn!(%peer, error = %e, "connection handling failed");
            }
        }
    }

    async fn handle_connection(&self, mut socket: TcpStream) -> anyhow::Result<()> {
        if !auth::server_challenge(&mut socket, &self.authkey).await? {
            warn!("HMAC challenge failed; closing connection");
            metrics::counter!("dmm_rpc_auth_failures_total", 1);
            return Ok(());
        }

        let envelope: Envelope = protocol::read_framed(&mut socket).await?;
        match envelope {
            Envelope::Preparer(payload) => {
                metrics::counter!("dmm_rpc_requests_total", 1, "kind" => "preparer");
                self.handle_preparer(payload).await;
            }
            Envelope::Submitter(payload) => {
                metrics::counter!("dmm_rpc_requests_total", 1, "kind" => "submitter");
                let reply = self.handle_submitter(payload).await;
                protocol::write_framed(&mut socket, &reply).await?;
            }
            Envelope::Finisher(payload) => {
                metrics::counter!("dmm_rpc_requests_total", 1, "kind" => "finisher");
                self.handle_finisher(payload).await;
            }
        }
        Ok(())
    }

    /// §4.4 PREPARER: construct and register a Request per (rule, src, dst)
    /// entry not already known, then recompute-and-dispatch once for the
    /// whole batch.
    pub async fn handle_preparer(&self, payload: PreparerPayload) {
        let mut any_inserted = false;

        for (rule_id, pairs) in payload {
            for (pair, entry) in pairs {
                let Some((src_rse, dst_rse)) = split_pair_id(&pair) else {
                    warn!(pair, "malformed pair id in PREPARER payload");
                    continue;
                };
                let req_id = request_id(&rule_id, src_rse, dst_rse);
                if self.requests.contains_key(&req_id) {
                    error!(request_id = %req_id, "PREPARER named a request that already exists; ignoring");
                    continue;
                }

                let src_site = match self.get_or_create_site(src_rse).await {
                    Ok(s) => s,
                    Err(e) => {
                        error!(rse = src_rse, error = %e, "could not construct source site");
                        continue;
                    }
                };
                let dst_site = match self.get_or_create_site(dst_rse).await {
                    Ok(s) => s,
                    Err(e) => {
                        error!(rse = dst_rse, error = %e, "could not construct destination site");
                        continue;
                    }
                };

                let mut request = Request::new(
                    rule_id.clone(),
                    src_rse,
                    dst_rse,
                    src_site,
                    dst_site,
                    entry.transfer_ids,
                    entry.priority,
                    entry.n_bytes_total,
                    entry.n_transfers_total,
                );
                if let Err(e) = request.register() {
                    error!(request_id = %req_id, error = %e, "could not register request; dropping it");
                    continue;
                }

                self.persistence.upsert(row_for(&request));
                self.requests.insert(req_id, Arc::new(AsyncMutex::new(request)));
                any_inserted = true;
                metrics::counter!("dmm_requests_registered_total", 1);
            }
        }

        if any_inserted {
            self.recompute_and_dispatch("accommodating for new requests").await;
        }
    }

    /// §4.4 SUBMITTER: update submitted-transfer counts, apply a priority
    /// change by moving both sites' prio_sums, and reply with each entry's
    /// reserved IPv6 addresses. Recompute-and-dispatch runs once, before the
    /// reply is sent, if any priority changed.
    pub async fn handle_submitter(&self, payload: SubmitterPayload) -> SubmitterReply {
        let mut reply: SubmitterReply = HashMap::new();
        let mut any_priority_changed = false;

        for (rule_id, pairs) in payload {
            let reply_pairs = reply.entry(rule_id.clone()).or_default();
            for (pair, entry) in pairs {
                let Some((src_rse, dst_rse)) = split_pair_id(&pair) else {
                    warn!(pair, "malformed pair id in SUBMITTER payload");
                    continue;
                };
                let req_id = request_id(&rule_id, src_rse, dst_rse);
                let Some(req_arc) = self.requests.get(&req_id).map(|r| r.value().clone()) else {
                    error!(request_id = %req_id, "SUBMITTER named an unknown request");
                    continue;
                };

                let (src_ipv6, dst_ipv6) = {
                    let mut req = req_arc.lock().await;
                    req.n_transfers_submitted += entry.n_transfers_submitted;

                    if entry.priority != req.priority {
                        let old_priority = req.priority;
                        req.src_site.lock().expect("site mutex poisoned").remove_request(dst_rse, old_priority);
                        req.dst_site.lock().expect("site mutex poisoned").remove_request(src_rse, old_priority);
                        req.src_site.lock().expect("site mutex poisoned").add_request(dst_rse, entry.priority);
                        req.dst_site.lock().expect("site mutex poisoned").add_request(src_rse, entry.priority);
                        req.set_priority(entry.priority);
                        any_priority_changed = true;
                    }

                    self.persistence.upsert(row_for(&req));
                    (req.src_ipv6.clone().unwrap_or_default(), req.dst_ipv6.clone().unwrap_or_default())
                };

                let mut ipv6_by_rse = HashMap::new();
                ipv6_by_rse.insert(src_rse.to_string(), src_ipv6);
                ipv6_by_rse.insert(dst_rse.to_string(), dst_ipv6);
                reply_pairs.insert(pair_id(src_rse, dst_rse), ipv6_by_rse);
            }
        }

        if any_priority_changed {
            self.recompute_and_dispatch("adjusting for priority update").await;
        }
        reply
    }

    /// §4.4 FINISHER: update finished-transfer counters; once a request's
    /// `n_transfers_finished` reaches its total, deregister it, drop any
    /// queued (not running) orchestrator jobs for its key, enqueue a
    /// `close_link` job, and remove it from the registry. Recompute-and-
    /// dispatch runs once if anything closed.
    pub async fn handle_finisher(&self, payload: FinisherPayload) {
        let mut any_closed = false;

        for (rule_id, pairs) in payload {
            for (pair, entry) in pairs {
                let Some((src_rse, dst_rse)) = split_pair_id(&pair) else {
                    warn!(pair, "malformed pair id in FINISHER payload");
                    continue;
                };
                let req_id = request_id(&rule_id, src_rse, dst_rse);
                let Some(req_arc) = self.requests.get(&req_id).map(|r| r.value().clone()) else {
                    error!(request_id = %req_id, "FINISHER named an unknown request");
                    continue;
                };

                let completed = {
                    let mut req = req_arc.lock().await;
                    req.n_transfers_finished += entry.n_transfers_finished;
                    req.n_bytes_transferred += entry.n_bytes_transferred;
                    let done = req.n_transfers_finished >= req.n_transfers_total;
                    self.persistence.upsert(row_for(&req));
                    done
                };

                if !completed {
                    continue;
                }

                {
                    let mut req = req_arc.lock().await;
                    if let Err(e) = req.deregister() {
                        error!(request_id = %req_id, error = %e, "deregister failed during completion");
                    }
                }
                self.orchestrator.clear(req_id.clone());

                let sdn = self.sdn.clone();
                let close_req = req_arc.clone();
                self.orchestrator.put(
                    req_id.clone(),
                    Box::pin(async move {
                        let mut req = close_req.lock().await;
                        req.close_link(&*sdn).await
                    }),
                );

                self.requests.remove(&req_id);
                self.persistence.delete(req_id.clone());
                any_closed = true;
                metrics::counter!("dmm_requests_completed_total", 1);
            }
        }

        if any_closed {
            self.recompute_and_dispatch("adjusting for request deletion").await;
        }
    }

    /// §4.5: enqueue one orchestrator job per live request. Each job opens
    /// the link if it isn't open yet, else reprovisions it only if the
    /// recomputed bandwidth actually changed, then appends a history entry
    /// (optionally backed by a real measurement from the metrics adapter).
    async fn recompute_and_dispatch(&self, message: &str) {
        let request_ids: Vec<String> = self.requests.iter().map(|e| e.key().clone()).collect();
        info!(count = request_ids.len(), message, "recompute-and-dispatch");

        for req_id in request_ids {
            let Some(req_arc) = self.requests.get(&req_id).map(|r| r.value().clone()) else { continue };
            let sdn = self.sdn.clone();
            let metrics = self.metrics.clone();
            let monitoring = self.monitoring;
            let profile_uuid = self.profile_uuid;
            let message = message.to_string();
            let persistence_row_sink = self.persistence.clone();

            self.orchestrator.put(
                req_id.clone(),
                Box::pin(async move {
                    let mut req = req_arc.lock().await;
                    // Capture before open/reprovision push this cycle's history
                    // entry, so the window spans the previous cycle instead of
                    // collapsing to the instant just recorded.
                    let window_start = req.history().last().map(|h| h.t);

                    if !req.link_is_open {
                        req.open_link(&*sdn, &profile_uuid).await?;
                    } else {
                        req.reprovision_link(&*sdn).await?;
                    }

                    let actual_bandwidth = if monitoring {
                        let window_start = window_start.unwrap_or_else(Utc::now);
                        let now = Utc::now();
                        if let Some(ipv6) = req.src_ipv6.clone() {
                            metrics
                                .average_throughput(&ipv6, &req.src_rse, window_start, now)
                                .await
                                .map(|v| v as i64)
                                .unwrap_or(-1)
                        } else {
                            -1
                        }
                    } else {
                        -1
                    };
                    req.record_history(actual_bandwidth, message);
                    persistence_row_sink.upsert(row_for(&req));
                    Ok(())
                }),
            );
        }
    }

    pub async fn shutdown(&self) {
        self.orchestrator.stop().await;
        self.persistence.flush().await;
    }

    /// Current promised bandwidth for a live request, or `None` if it isn't registered.
    pub async fn request_bandwidth(&self, request_id: &str) -> Option<u64> {
        let req_arc = self.requests.get(request_id)?.value().clone();
        Some(req_arc.lock().await.bandwidth)
    }

    /// Whether `request_id` is currently registered.
    pub fn has_request(&self, request_id: &str) -> bool {
        self.requests.contains_key(request_id)
    }

    /// Number of currently registered requests.
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// A site's priority contribution from requests toward `partner`, or
    /// `None` if the site hasn't been constructed yet.
    pub fn site_prio_sum(&self, rse_name: &str, partner: &str) -> Option<u64> {
        let site = self.sites.get(rse_name)?.value().clone();
        let sum = site.lock().expect("site mutex poisoned").prio_sum_for(partner);
        if sum == 0 {
            None
        } else {
            Some(sum)
        }
    }

    /// A site's total priority sum across all partners, or `None` if the
    /// site hasn't been constructed yet.
    pub fn site_all_prios_sum(&self, rse_name: &str) -> Option<u64> {
        let site = self.sites.get(rse_name)?.value().clone();
        Some(site.lock().expect("site mutex poisoned").all_prios_sum())
    }
}

fn row_for(req: &Request) -> RequestRow {
    RequestRow {
        request_id: req.request_id.clone(),
        rule_id: req.rule_id.clone(),
        src_site: req.src_rse.clone(),
        dst_site: req.dst_rse.clone(),
        transfer_ids: req.transfer_ids.join(","),
        priority: req.priority as i64,
        n_bytes_total: req.n_bytes_total as i64,
        n_bytes_transferred: req.n_bytes_transferred as i64,
        n_transfers_total: req.n_transfers_total as i64,
        n_transfers_submitted: req.n_transfers_submitted as i64,
        n_transfers_finished: req.n_transfers_finished as i64,
        src_ipv6: req.src_ipv6.clone(),
        dst_ipv6: req.dst_ipv6.clone(),
        bandwidth: req.bandwidth as i64,
        sense_link_id: req.sense_link_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_adapter::MockMetricsAdapter;
    use crate::persistence::MockPersistenceStore;
    use crate::sdn_adapter::MockSdnAdapter;
    use crate::settings::{DmmSection, Ipv6PoolEntry, PrometheusSection, SenseSection, SqlDbSection};
    use std::io::Write as _;

    fn test_settings(authkey_path: &std::path::Path) -> Settings {
        let mut sites = HashMap::new();
        sites.insert(
            "XRD1".to_string(),
            SiteConfig {
                best_effort_ipv6: "2001:db8:1::best/128".into(),
                ipv6_pool: vec![
                    Ipv6PoolEntry { block: "b1".into(), ipv6: "2001:db8:1::1/128".into() },
                    Ipv6PoolEntry { block: "b2".into(), ipv6: "2001:db8:1::2/128".into() },
                ],
            },
        );
        sites.insert(
            "XRD3".to_string(),
            SiteConfig {
                best_effort_ipv6: "2001:db8:3::best/128".into(),
                ipv6_pool: vec![Ipv6PoolEntry { block: "b1".into(), ipv6: "2001:db8:3::1/128".into() }],
            },
        );

        Settings {
            dmm: DmmSection {
                host: "127.0.0.1".into(),
                port: 0,
                authkey: authkey_path.to_string_lossy().to_string(),
                monitoring: false,
            },
            sites,
            sense: SenseSection { profile_uuid: Uuid::nil().to_string(), base_url: "http://localhost".into() },
            prometheus: PrometheusSection { host: "localhost".into(), port: 9090 },
            sql_db: SqlDbSection { host: "localhost".into(), port: 5432, database: "dmm".into(), user: "dmm".into() },
        }
    }

    fn test_coordinator() -> Coordinator {
        let dir = tempfile::tempdir().unwrap();
        let authkey_path = dir.path().join("authkey");
        let mut f = std::fs::File::create(&authkey_path).unwrap();
        f.write_all(b"secret").unwrap();
        let settings = test_settings(&authkey_path);

        let sdn = Arc::new(
            MockSdnAdapter::new()
                .with_site("XRD1", "uri-xrd1", vec![], 100_000.0)
                .with_site("XRD3", "uri-xrd3", vec![], 100_000.0),
        );
        let metrics = Arc::new(MockMetricsAdapter::new());
        let store = Arc::new(MockPersistenceStore::new());
        Coordinator::new(&settings, sdn, metrics, store, 4).unwrap()
    }

    fn preparer_payload(priority: u64) -> PreparerPayload {
        let mut inner = HashMap::new();
        inner.insert(
            "XRD1&XRD3".to_string(),
            crate::protocol::PreparerEntry {
                transfer_ids: vec!["t1".into()],
                priority,
                n_bytes_total: 1024,
                n_transfers_total: 1,
            },
        );
        let mut payload = HashMap::new();
        payload.insert("R".to_string(), inner);
        payload
    }

    #[tokio::test]
    async fn preparer_registers_a_new_request() {
        let coord = test_coordinator();
        coord.handle_preparer(preparer_payload(3)).await;
        assert!(coord.requests.contains_key("R_XRD1_XRD3"));
        assert!(coord.sites.contains_key("XRD1"));
        assert!(coord.sites.contains_key("XRD3"));
    }

    #[tokio::test]
    async fn preparer_ignores_duplicate_request() {
        let coord = test_coordinator();
        coord.handle_preparer(preparer_payload(3)).await;
        coord.handle_preparer(preparer_payload(3)).await;
        assert_eq!(coord.requests.len(), 1);
    }

    #[tokio::test]
    async fn submitter_reports_reserved_ipv6_addresses() {
        let coord = test_coordinator();
        coord.handle_preparer(preparer_payload(3)).await;

        let mut inner = HashMap::new();
        inner.insert(
            "XRD1&XRD3".to_string(),
            crate::protocol::SubmitterEntry { priority: 3, n_transfers_submitted: 1 },
        );
        let mut payload = HashMap::new();
        payload.insert("R".to_string(), inner);

        let reply = coord.handle_submitter(payload).await;
        let entry = &reply["R"]["XRD1&XRD3"];
        assert!(entry.contains_key("XRD1"));
        assert!(entry.contains_key("XRD3"));
    }

    #[tokio::test]
    async fn finisher_removes_fully_finished_request() {
        let coord = test_coordinator();
        coord.handle_preparer(preparer_payload(3)).await;

        let mut inner = HashMap::new();
        inner.insert(
            "XRD1&XRD3".to_string(),
            crate::protocol::FinisherEntry { n_transfers_finished: 1, n_bytes_transferred: 1024 },
        );
        let mut payload = HashMap::new();
        payload.insert("R".to_string(), inner);

        coord.handle_finisher(payload).await;
        assert!(!coord.requests.contains_key("R_XRD1_XRD3"));
    }

    #[tokio::test]
    async fn rehydrate_restores_prio_sums_and_reservations() {
        let dir = tempfile::tempdir().unwrap();
        let authkey_path = dir.path().join("authkey");
        std::fs::write(&authkey_path, "secret").unwrap();
        let settings = test_settings(&authkey_path);

        let sdn = Arc::new(
            MockSdnAdapter::new()
                .with_site("XRD1", "uri-xrd1", vec![], 100_000.0)
                .with_site("XRD3", "uri-xrd3", vec![], 100_000.0),
        );
        let metrics = Arc::new(MockMetricsAdapter::new());
        let store = Arc::new(MockPersistenceStore::new());
        store
            .upsert_request(RequestRow {
                request_id: "R_XRD1_XRD3".into(),
                rule_id: "R".into(),
                src_site: "XRD1".into(),
                dst_site: "XRD3".into(),
                transfer_ids: "t1".into(),
                priority: 3,
                n_bytes_total: 1024,
                n_bytes_transferred: 0,
                n_transfers_total: 1,
                n_transfers_submitted: 0,
                n_transfers_finished: 0,
                src_ipv6: Some("2001:db8:1::1/128".into()),
                dst_ipv6: Some("2001:db8:3::1/128".into()),
                bandwidth: 0,
                sense_link_id: None,
            })
            .await
            .unwrap();

        let coord = Coordinator::new(&settings, sdn, metrics, store, 4).unwrap();
        coord.rehydrate().await.unwrap();

        assert!(coord.requests.contains_key("R_XRD1_XRD3"));
        let site = coord.sites.get("XRD1").unwrap().value().clone();
        assert_eq!(site.lock().unwrap().prio_sum_for("XRD3"), 3);
        assert!(site.lock().unwrap().used_pool_contains("2001:db8:1::1/128"));
    }
}
