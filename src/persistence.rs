//! Crash-recovery persistence: one row per live Request.
//!
//! Correctness never depends on this layer — "Persistence is a convenience"
//! per the data model's lifecycle rules — so writes are dispatched to a
//! background task over a channel and the accept context never blocks on the
//! database. A graceful shutdown flushes the channel before the pool closes.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgPool, Row};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::error::PersistenceError;

pub const SCHEMA: &str = "dmm";
const MIGRATION_LOCK_ID: i64 = 0x444D4D5F4C4F434B; // "DMM_LOCK" in hex, truncated to i64

/// Mirrors the Request scalars named in §3 — the full counter set, a strict
/// superset of what the source system's own schema carried, so a crash
/// mid-transfer rehydrates with correct submitted/finished counts rather than
/// resetting them to zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestRow {
    pub request_id: String,
    pub rule_id: String,
    pub src_site: String,
    pub dst_site: String,
    pub transfer_ids: String, // joined with ','
    pub priority: i64,
    pub n_bytes_total: i64,
    pub n_bytes_transferred: i64,
    pub n_transfers_total: i64,
    pub n_transfers_submitted: i64,
    pub n_transfers_finished: i64,
    pub src_ipv6: Option<String>,
    pub dst_ipv6: Option<String>,
    pub bandwidth: i64,
    pub sense_link_id: Option<String>,
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn upsert_request(&self, row: RequestRow) -> Result<(), PersistenceError>;
    async fn delete_request(&self, request_id: &str) -> Result<(), PersistenceError>;
    async fn load_all(&self) -> Result<Vec<RequestRow>, PersistenceError>;
}

/// Real store: one Postgres table, `dmm.requests`, keyed by `request_id`.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with retry/backoff capped at ~12.8s, matching the pattern used
    /// elsewhere in this codebase for surviving DNS/startup races against a
    /// freshly-started database container.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let mut last_err: Option<anyhow::Error> = None;
        let max_attempts: u32 = 10;
        for attempt in 1..=max_attempts {
            match PgPoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(5))
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    if let Err(e) = initialize_schema(&pool).await {
                        last_err = Some(e);
                    } else {
                        info!(attempt, "connected to persistence database");
                        return Ok(Self { pool });
                    }
                }
                Err(e) => last_err = Some(e.into()),
            }
            let delay_ms = (1u64 << attempt.min(6)) * 200;
            warn!(attempt, max_attempts, delay_ms, "database connect/init attempt failed, retrying");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("unknown database connection error")))
    }
}

async fn initialize_schema(pool: &PgPool) -> Result<()> {
    let mut conn = pool.acquire().await?;
    let mut tx = conn.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(tx.as_mut())
        .await?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {SCHEMA}"))
        .execute(tx.as_mut())
        .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {SCHEMA}.requests (
            request_id TEXT PRIMARY KEY,
            rule_id TEXT NOT NULL,
            src_site TEXT NOT NULL,
            dst_site TEXT NOT NULL,
            transfer_ids TEXT NOT NULL,
            priority BIGINT NOT NULL,
            n_bytes_total BIGINT NOT NULL,
            n_bytes_transferred BIGINT NOT NULL,
            n_transfers_total BIGINT NOT NULL,
            n_transfers_submitted BIGINT NOT NULL,
            n_transfers_finished BIGINT NOT NULL,
            src_ipv6 TEXT,
            dst_ipv6 TEXT,
            bandwidth BIGINT NOT NULL,
            sense_link_id TEXT
        )"
    ))
    .execute(tx.as_mut())
    .await?;

    tx.commit().await?;
    Ok(())
}

#[async_trait]
impl PersistenceStore for PostgresStore {
    async fn upsert_request(&self, row: RequestRow) -> Result<(), PersistenceError> {
        sqlx::query(&format!(
            "INSERT INTO {SCHEMA}.requests
                (request_id, rule_id, src_site, dst_site, transfer_ids, priority,
                 n_bytes_total, n_bytes_transferred, n_transfers_total,
                 n_transfers_submitted, n_transfers_finished, src_ipv6, dst_ipv6,
                 bandwidth, sense_link_id)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
             ON CONFLICT (request_id) DO UPDATE SET
                priority = EXCLUDED.priority,
                n_bytes_total = EXCLUDED.n_bytes_total,
                n_bytes_transferred = EXCLUDED.n_bytes_transferred,
                n_transfers_total = EXCLUDED.n_transfers_total,
                n_transfers_submitted = EXCLUDED.n_transfers_submitted,
                n_transfers_finished = EXCLUDED.n_transfers_finished,
                src_ipv6 = EXCLUDED.src_ipv6,
                dst_ipv6 = EXCLUDED.dst_ipv6,
                bandwidth = EXCLUDED.bandwidth,
                sense_link_id = EXCLUDED.sense_link_id"
        ))
        .bind(row.request_id)
        .bind(row.rule_id)
        .bind(row.src_site)
        .bind(row.dst_site)
        .bind(row.transfer_ids)
        .bind(row.priority)
        .bind(row.n_bytes_total)
        .bind(row.n_bytes_transferred)
        .bind(row.n_transfers_total)
        .bind(row.n_transfers_submitted)
        .bind(row.n_transfers_finished)
        .bind(row.src_ipv6)
        .bind(row.dst_ipv6)
        .bind(row.bandwidth)
        .bind(row.sense_link_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_request(&self, request_id: &str) -> Result<(), PersistenceError> {
        sqlx::query(&format!("DELETE FROM {SCHEMA}.requests WHERE request_id = $1"))
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<RequestRow>, PersistenceError> {
        let rows = sqlx::query(&format!(
            "SELECT request_id, rule_id, src_site, dst_site, transfer_ids, priority,
                    n_bytes_total, n_bytes_transferred, n_transfers_total,
                    n_transfers_submitted, n_transfers_finished, src_ipv6, dst_ipv6,
                    bandwidth, sense_link_id
             FROM {SCHEMA}.requests"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(RequestRow {
                    request_id: r.try_get("request_id").map_err(|e| PersistenceError::Decode("request_id".into(), e.to_string()))?,
                    rule_id: r.try_get("rule_id").map_err(|e| PersistenceError::Decode("rule_id".into(), e.to_string()))?,
                    src_site: r.try_get("src_site").map_err(|e| PersistenceError::Decode("src_site".into(), e.to_string()))?,
                    dst_site: r.try_get("dst_site").map_err(|e| PersistenceError::Decode("dst_site".into(), e.to_string()))?,
                    transfer_ids: r.try_get("transfer_ids").map_err(|e| PersistenceError::Decode("transfer_ids".into(), e.to_string()))?,
                    priority: r.try_get("priority").map_err(|e| PersistenceError::Decode("priority".into(), e.to_string()))?,
                    n_bytes_total: r.try_get("n_bytes_total").map_err(|e| PersistenceError::Decode("n_bytes_total".into(), e.to_string()))?,
                    n_bytes_transferred: r.try_get("n_bytes_transferred").map_err(|e| PersistenceError::Decode("n_bytes_transferred".into(), e.to_string()))?,
                    n_transfers_total: r.try_get("n_transfers_total").map_err(|e| PersistenceError::Decode("n_transfers_total".into(), e.to_string()))?,
                    n_transfers_submitted: r.try_get("n_transfers_submitted").map_err(|e| PersistenceError::Decode("n_transfers_submitted".into(), e.to_string()))?,
                    n_transfers_finished: r.try_get("n_transfers_finished").map_err(|e| PersistenceError::Decode("n_transfers_finished".into(), e.to_string()))?,
                    src_ipv6: r.try_get("src_ipv6").map_err(|e| PersistenceError::Decode("src_ipv6".into(), e.to_string()))?,
                    dst_ipv6: r.try_get("dst_ipv6").map_err(|e| PersistenceError::Decode("dst_ipv6".into(), e.to_string()))?,
                    bandwidth: r.try_get("bandwidth").map_err(|e| PersistenceError::Decode("bandwidth".into(), e.to_string()))?,
                    sense_link_id: r.try_get("sense_link_id").map_err(|e| PersistenceError::Decode("sense_link_id".into(), e.to_string()))?,
                })
            })
            .collect()
    }
}

/// In-memory store for tests and for running without a live Postgres.
#[derive(Default)]
pub struct MockPersistenceStore {
    rows: StdMutex<HashMap<String, RequestRow>>,
}

impl MockPersistenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for MockPersistenceStore {
    async fn upsert_request(&self, row: RequestRow) -> Result<(), PersistenceError> {
        self.rows.lock().expect("mock store mutex poisoned").insert(row.request_id.clone(), row);
        Ok(())
    }

    async fn delete_request(&self, request_id: &str) -> Result<(), PersistenceError> {
        self.rows.lock().expect("mock store mutex poisoned").remove(request_id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<RequestRow>, PersistenceError> {
        Ok(self.rows.lock().expect("mock store mutex poisoned").values().cloned().collect())
    }
}

enum WriterOp {
    Upsert(RequestRow),
    Delete(String),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking facade over any `PersistenceStore`: the accept context calls
/// `upsert`/`delete`, which only enqueue; a background task performs the
/// actual I/O so a slow database never stalls an RPC handler.
#[derive(Clone)]
pub struct AsyncPersistenceWriter {
    tx: mpsc::UnboundedSender<WriterOp>,
}

impl AsyncPersistenceWriter {
    pub fn new(store: std::sync::Arc<dyn PersistenceStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriterOp>();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let result = match op {
                    WriterOp::Upsert(row) => store.upsert_request(row).await,
                    WriterOp::Delete(request_id) => store.delete_request(&request_id).await,
                    WriterOp::Flush(done) => {
                        let _ = done.send(());
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "persistence write failed; in-memory state remains authoritative");
                    crate::metrics::counter!("dmm_persistence_write_failures_total", 1);
                }
            }
        });
        Self { tx }
    }

    pub fn upsert(&self, row: RequestRow) {
        let _ = self.tx.send(WriterOp::Upsert(row));
    }

    pub fn delete(&self, request_id: impl Into<String>) {
        let _ = self.tx.send(WriterOp::Delete(request_id.into()));
    }

    /// Wait until every previously-queued write has been attempted. Used on
    /// graceful shutdown so no acknowledged row is silently lost. The marker
    /// travels through the same FIFO channel the writer task drains, so it
    /// only resolves once everything queued ahead of it has been processed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(WriterOp::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sample_row(id: &str) -> RequestRow {
        RequestRow {
            request_id: id.into(),
            rule_id: "R".into(),
            src_site: "XRD1".into(),
            dst_site: "XRD3".into(),
            transfer_ids: "a,b".into(),
            priority: 3,
            n_bytes_total: 100,
            n_bytes_transferred: 0,
            n_transfers_total: 2,
            n_transfers_submitted: 0,
            n_transfers_finished: 0,
            src_ipv6: Some("2001:db8::1".into()),
            dst_ipv6: Some("2001:db8::2".into()),
            bandwidth: 0,
            sense_link_id: None,
        }
    }

    #[tokio::test]
    async fn mock_store_round_trips() {
        let store = MockPersistenceStore::new();
        store.upsert_request(sample_row("R_XRD1_XRD3")).await.unwrap();
        let rows = store.load_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        store.delete_request("R_XRD1_XRD3").await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn async_writer_delegates_to_store() {
        let store = Arc::new(MockPersistenceStore::new());
        let writer = AsyncPersistenceWriter::new(store.clone());
        writer.upsert(sample_row("R_XRD1_XRD3"));
        writer.flush().await;
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }
}
