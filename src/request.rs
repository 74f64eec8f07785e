//! The Request/Link entity: per-request accounting plus circuit lifecycle control.
//!
//! A single type owns both halves because they are never meaningfully
//! separate in practice — the bandwidth share a request is owed and the
//! circuit that carries it are recomputed together on every `register`,
//! `reprovision_link`, and `close_link` call. See `dmm::coordinator` for how
//! the registry hands these out to orchestrator jobs behind `Arc<Mutex<_>>>`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::SiteError;
use crate::sdn_adapter::SdnAdapter;
use crate::site::Site;

const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// One lifecycle-relevant event: `(t, promised_bandwidth, actual_bandwidth, message)`.
/// `actual_bandwidth` is `-1` when monitoring is disabled or hasn't run yet.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub t: DateTime<Utc>,
    pub promised_bandwidth: u64,
    pub actual_bandwidth: i64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Init,
    Registered,
    Open,
    Closed,
}

/// Builds the `request_id = rule_id || "_" || src_rse || "_" || dst_rse` key.
pub fn request_id(rule_id: &str, src_rse: &str, dst_rse: &str) -> String {
    format!("{rule_id}_{src_rse}_{dst_rse}")
}

pub struct Request {
    pub request_id: String,
    pub rule_id: String,
    pub src_rse: String,
    pub dst_rse: String,
    pub src_site: Arc<Mutex<Site>>,
    pub dst_site: Arc<Mutex<Site>>,

    pub transfer_ids: Vec<String>,
    pub priority: u64,
    pub n_bytes_total: u64,
    pub n_bytes_transferred: u64,
    pub n_transfers_total: u64,
    pub n_transfers_submitted: u64,
    pub n_transfers_finished: u64,

    pub src_ipv6: Option<String>,
    pub dst_ipv6: Option<String>,
    pub bandwidth: u64,
    pub sense_link_id: Option<String>,
    pub theoretical_bandwidth: f64,
    pub link_is_open: bool,
    pub state: LinkState,

    history: VecDeque<HistoryEntry>,
    history_capacity: usize,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rule_id: impl Into<String>,
        src_rse: impl Into<String>,
        dst_rse: impl Into<String>,
        src_site: Arc<Mutex<Site>>,
        dst_site: Arc<Mutex<Site>>,
        transfer_ids: Vec<String>,
        priority: u64,
        n_bytes_total: u64,
        n_transfers_total: u64,
    ) -> Self {
        let rule_id = rule_id.into();
        let src_rse = src_rse.into();
        let dst_rse = dst_rse.into();
        let request_id = request_id(&rule_id, &src_rse, &dst_rse);
        Self {
            request_id,
            rule_id,
            src_rse,
            dst_rse,
            src_site,
            dst_site,
            transfer_ids,
            priority,
            n_bytes_total,
            n_bytes_transferred: 0,
            n_transfers_total,
            n_transfers_submitted: 0,
            n_transfers_finished: 0,
            src_ipv6: None,
            dst_ipv6: None,
            bandwidth: 0,
            sense_link_id: None,
            theoretical_bandwidth: 0.0,
            link_is_open: false,
            state: LinkState::Init,
            history: VecDeque::new(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    pub fn best_effort(&self) -> bool {
        self.priority == 0
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    /// Time-weighted average of promised and actual bandwidth across retained
    /// history, weighting each entry by the interval to the next one (or to
    /// `now` for the most recent entry). Returns `(promised, actual)`; `actual`
    /// is `None` if no sample ever had monitoring enabled.
    pub fn get_summary(&self) -> (f64, Option<f64>) {
        if self.history.is_empty() {
            return (0.0, None);
        }
        let now = Utc::now();
        let mut weighted_promised = 0.0;
        let mut weighted_actual = 0.0;
        let mut actual_weight = 0.0;
        let mut total_weight = 0.0;

        for (i, entry) in self.history.iter().enumerate() {
            let next_t = self.history.get(i + 1).map(|e| e.t).unwrap_or(now);
            let weight = (next_t - entry.t).num_milliseconds().max(0) as f64;
            total_weight += weight;
            weighted_promised += entry.promised_bandwidth as f64 * weight;
            if entry.actual_bandwidth >= 0 {
                weighted_actual += entry.actual_bandwidth as f64 * weight;
                actual_weight += weight;
            }
        }

        let promised = if total_weight > 0.0 { weighted_promised / total_weight } else { 0.0 };
        let actual = if actual_weight > 0.0 { Some(weighted_actual / actual_weight) } else { None };
        (promised, actual)
    }

    fn push_history(&mut self, promised: u64, actual: i64, message: impl Into<String>) {
        if self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            t: Utc::now(),
            promised_bandwidth: promised,
            actual_bandwidth: actual,
            message: message.into(),
        });
    }

    /// `max_bandwidth = min(src.uplink_provision(dst), dst.uplink_provision(src), theoretical_bandwidth)`.
    pub fn get_max_bandwidth(&self) -> f64 {
        let src_provision = self.src_site.lock().expect("site mutex poisoned").get_uplink_provision(&self.dst_rse);
        let dst_provision = self.dst_site.lock().expect("site mutex poisoned").get_uplink_provision(&self.src_rse);
        src_provision.min(dst_provision).min(self.theoretical_bandwidth)
    }

    /// `fraction = priority / src.prio_sums[dst]`; by design, only the
    /// src-side prio_sum is used — symmetry is restored by `get_max_bandwidth`
    /// already taking the min of both sides' provisions.
    pub fn get_bandwidth_fraction(&self) -> f64 {
        if self.best_effort() {
            return 0.0;
        }
        let src_prio_sum = self.src_site.lock().expect("site mutex poisoned").prio_sum_for(&self.dst_rse);
        if src_prio_sum == 0 {
            return 0.0;
        }
        self.priority as f64 / src_prio_sum as f64
    }

    /// `⌊ max_bandwidth * fraction ⌋`, 0 for best-effort.
    pub fn compute_new_bandwidth(&self) -> u64 {
        if self.best_effort() {
            return 0;
        }
        (self.get_max_bandwidth() * self.get_bandwidth_fraction()).floor().max(0.0) as u64
    }

    /// INIT→REGISTERED: add priority at both sites; bind default IPv6s for
    /// best-effort, else reserve one block at each site. Rolls back the src
    /// reservation if the dst reservation fails, so a partial register never
    /// leaks a held block.
    pub fn register(&mut self) -> Result<(), SiteError> {
        {
            let mut src = self.src_site.lock().expect("site mutex poisoned");
            src.add_request(&self.dst_rse, self.priority);
        }
        {
            let mut dst = self.dst_site.lock().expect("site mutex poisoned");
            dst.add_request(&self.src_rse, self.priority);
        }

        if self.best_effort() {
            self.src_ipv6 = Some(self.src_site.lock().expect("site mutex poisoned").default_ipv6.clone());
            self.dst_ipv6 = Some(self.dst_site.lock().expect("site mutex poisoned").default_ipv6.clone());
        } else {
            let src_ipv6 = self.src_site.lock().expect("site mutex poisoned").reserve_ipv6()?;
            match self.dst_site.lock().expect("site mutex poisoned").reserve_ipv6() {
                Ok(dst_ipv6) => {
                    self.src_ipv6 = Some(src_ipv6);
                    self.dst_ipv6 = Some(dst_ipv6);
                }
                Err(e) => {
                    let _ = self.src_site.lock().expect("site mutex poisoned").free_ipv6(&src_ipv6);
                    return Err(e);
                }
            }
        }
        self.state = LinkState::Registered;
        Ok(())
    }

    /// REGISTERED→OPEN. No SDN call for best-effort; otherwise stage then provision.
    pub async fn open_link(
        &mut self,
        sdn: &dyn SdnAdapter,
        profile_uuid: &Uuid,
    ) -> anyhow::Result<()> {
        if self.best_effort() {
            self.link_is_open = true;
            self.state = LinkState::Open;
            self.push_history(0, -1, "best-effort link opened without SDN call");
            return Ok(());
        }

        // A stale job from a superseded recompute can still be awaiting its
        // worker permit after FINISHER already deregistered this request on
        // the accept context (clear() only drops queued, not active, jobs).
        // Treat a missing reservation as "already torn down" and no-op.
        let (Some(src_ipv6), Some(dst_ipv6)) = (self.src_ipv6.clone(), self.dst_ipv6.clone()) else {
            return Ok(());
        };
        let src_uri = self.src_site.lock().expect("site mutex poisoned").sense_name.clone();
        let dst_uri = self.dst_site.lock().expect("site mutex poisoned").sense_name.clone();

        let staged = sdn
            .stage(&src_uri, &dst_uri, &src_ipv6, &dst_ipv6, profile_uuid, &self.request_id)
            .await?;
        self.sense_link_id = Some(staged.link_id.clone());
        self.theoretical_bandwidth = staged.theoretical_bandwidth;
        self.bandwidth = self.compute_new_bandwidth();

        sdn.provision(&staged.link_id, &src_uri, &dst_uri, &src_ipv6, &dst_ipv6, self.bandwidth, &self.request_id)
            .await?;
        self.link_is_open = true;
        self.state = LinkState::Open;
        self.push_history(self.bandwidth, -1, "circuit opened");
        Ok(())
    }

    /// OPEN→OPEN. No-op (and no SDN call) if the recomputed bandwidth is
    /// unchanged. Never cache `sense_link_id` across this call — it is
    /// rewritten here and must always be re-read from `self` afterward.
    pub async fn reprovision_link(&mut self, sdn: &dyn SdnAdapter) -> anyhow::Result<bool> {
        if self.best_effort() {
            return Ok(false);
        }
        let new_bandwidth = self.compute_new_bandwidth();
        if new_bandwidth == self.bandwidth {
            return Ok(false);
        }

        // See open_link(): a stale recompute job can still land after
        // FINISHER deregistered this request on the accept context.
        let (Some(src_ipv6), Some(dst_ipv6)) = (self.src_ipv6.clone(), self.dst_ipv6.clone()) else {
            return Ok(false);
        };
        let src_uri = self.src_site.lock().expect("site mutex poisoned").sense_name.clone();
        let dst_uri = self.dst_site.lock().expect("site mutex poisoned").sense_name.clone();
        let old_link_id = self.sense_link_id.clone().expect("open_link() must run before reprovision_link()");

        let new_link_id = sdn
            .reprovision(&old_link_id, &src_uri, &dst_uri, &src_ipv6, &dst_ipv6, new_bandwidth, &self.request_id)
            .await?;
        self.sense_link_id = Some(new_link_id);
        self.bandwidth = new_bandwidth;
        self.push_history(self.bandwidth, -1, "circuit reprovisioned");
        Ok(true)
    }

    /// OPEN→CLOSED. Deletes the SDN circuit unless best-effort, then forgets
    /// the link id regardless.
    pub async fn close_link(&mut self, sdn: &dyn SdnAdapter) -> anyhow::Result<()> {
        if !self.best_effort() {
            if let Some(link_id) = self.sense_link_id.take() {
                sdn.delete(&link_id).await?;
            }
        }
        self.link_is_open = false;
        self.state = LinkState::Closed;
        self.push_history(0, -1, "circuit closed");
        Ok(())
    }

    /// Returns IPv6 blocks to the pool and subtracts the priority
    /// contribution at both sites. Independent of `close_link`: FINISHER calls
    /// both, in that order (see `coordinator.rs`).
    pub fn deregister(&mut self) -> Result<(), SiteError> {
        if !self.best_effort() {
            if let Some(ipv6) = self.src_ipv6.take() {
                self.src_site.lock().expect("site mutex poisoned").free_ipv6(&ipv6)?;
            }
            if let Some(ipv6) = self.dst_ipv6.take() {
                self.dst_site.lock().expect("site mutex poisoned").free_ipv6(&ipv6)?;
            }
        }
        self.src_site.lock().expect("site mutex poisoned").remove_request(&self.dst_rse, self.priority);
        self.dst_site.lock().expect("site mutex poisoned").remove_request(&self.src_rse, self.priority);
        Ok(())
    }

    /// Replace the priority in place, leaving `prio_sums` untouched — the
    /// caller (coordinator) is responsible for the surrounding
    /// remove_request(old)+add_request(new) pair on both sites.
    pub fn set_priority(&mut self, priority: u64) {
        self.priority = priority;
    }

    pub fn record_history(&mut self, actual_bandwidth: i64, message: impl Into<String>) {
        self.push_history(self.bandwidth, actual_bandwidth, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(rse: &str, uplink: f64) -> Arc<Mutex<Site>> {
        Arc::new(Mutex::new(Site::new(
            rse,
            format!("https://sense.example/{rse}"),
            uplink,
            vec!["a".into(), "b".into(), "c".into(), "best".into()],
            "best".into(),
        )))
    }

    fn request(priority: u64, src: Arc<Mutex<Site>>, dst: Arc<Mutex<Site>>) -> Request {
        Request::new("R", "XRD1", "XRD3", src, dst, vec!["a".into()], priority, 4194304, 4)
    }

    #[test]
    fn request_id_is_rule_src_dst() {
        assert_eq!(request_id("R", "XRD1", "XRD3"), "R_XRD1_XRD3");
    }

    #[test]
    fn best_effort_iff_zero_priority() {
        let src = site("XRD1", 100_000.0);
        let dst = site("XRD3", 100_000.0);
        assert!(request(0, src.clone(), dst.clone()).best_effort());
        assert!(!request(1, src, dst).best_effort());
    }

    #[test]
    fn register_reserves_distinct_blocks_for_priority_requests() {
        let src = site("XRD1", 100_000.0);
        let dst = site("XRD3", 100_000.0);
        let mut req = request(3, src.clone(), dst.clone());
        req.register().unwrap();
        assert_ne!(req.src_ipv6, req.dst_ipv6);
        assert_eq!(src.lock().unwrap().prio_sum_for("XRD3"), 3);
        assert_eq!(dst.lock().unwrap().prio_sum_for("XRD1"), 3);
    }

    #[test]
    fn register_binds_default_ipv6_for_best_effort() {
        let src = site("XRD1", 100_000.0);
        let dst = site("XRD3", 100_000.0);
        let mut req = request(0, src.clone(), dst.clone());
        req.register().unwrap();
        assert_eq!(req.src_ipv6.as_deref(), Some("best"));
        assert_eq!(req.dst_ipv6.as_deref(), Some("best"));
    }

    #[test]
    fn s1_bandwidth_matches_literal_scenario() {
        let xrd1 = site("XRD1", 100_000.0);
        let xrd3 = site("XRD3", 100_000.0);
        let xrd4 = site("XRD4", 100_000.0);

        let mut r_3 = Request::new("R", "XRD1", "XRD3", xrd1.clone(), xrd3.clone(), vec![], 3, 0, 4);
        r_3.register().unwrap();
        let mut r_4 = Request::new("R", "XRD1", "XRD4", xrd1.clone(), xrd4.clone(), vec![], 1, 0, 2);
        r_4.register().unwrap();

        r_3.theoretical_bandwidth = 1e15;
        r_4.theoretical_bandwidth = 1e15;

        assert_eq!(xrd1.lock().unwrap().all_prios_sum(), 4);
        assert_eq!(r_3.compute_new_bandwidth(), 75_000);
        assert_eq!(r_4.compute_new_bandwidth(), 25_000);
    }

    #[test]
    fn deregister_frees_blocks_and_priority() {
        let src = site("XRD1", 100_000.0);
        let dst = site("XRD3", 100_000.0);
        let mut req = request(3, src.clone(), dst.clone());
        req.register().unwrap();
        req.deregister().unwrap();
        assert_eq!(src.lock().unwrap().all_prios_sum(), 0);
        assert!(req.src_ipv6.is_none());
    }
}
