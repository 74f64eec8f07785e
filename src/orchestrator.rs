//! Bounded worker pool with per-key job serialization.
//!
//! The dispatcher is a single task that owns all queue state — no shared
//! map needs external locking, mirroring the mpsc-command-loop shape used
//! for the persistence writer. Jobs for the same key always run in the
//! order they were `put`, one at a time; independent keys run concurrently
//! up to the configured worker limit, which is enforced by a semaphore
//! rather than a fixed thread set since jobs are I/O-bound SDN/metrics calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::metrics;

pub type Job = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

const DEBUG_LOG_INTERVAL: Duration = Duration::from_secs(10);

enum Command {
    Put { key: String, job: Job },
    Clear { key: String },
    Stop { done: oneshot::Sender<()> },
}

/// Handle to the orchestrator's dispatcher task. Cloning shares the same
/// underlying queue; `put`/`clear`/`stop` are cheap channel sends.
#[derive(Clone)]
pub struct Orchestrator {
    tx: mpsc::UnboundedSender<Command>,
}

impl Orchestrator {
    pub fn new(n_workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(n_workers.max(1)));
        tokio::spawn(dispatcher_loop(rx, semaphore));
        Self { tx }
    }

    /// Append `job` to the queue identified by `key`. If no job is currently
    /// active for `key`, the next dispatch cycle launches it; otherwise it
    /// queues behind whatever is already pending. Queues are FIFO.
    pub fn put(&self, key: impl Into<String>, job: Job) {
        let key = key.into();
        if self.tx.send(Command::Put { key: key.clone(), job }).is_err() {
            error!(key = %key, "orchestrator dispatcher is gone; job dropped");
        }
    }

    /// Drop all queued (not-yet-started) jobs for `key`. A job already
    /// running for `key` is unaffected.
    pub fn clear(&self, key: impl Into<String>) {
        let key = key.into();
        let _ = self.tx.send(Command::Clear { key });
    }

    /// Drop all pending queues and wait for in-flight jobs to finish, then
    /// shut the dispatcher down. There is no preemption: a running job always
    /// runs to completion.
    pub async fn stop(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Stop { done: done_tx }).is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

async fn dispatcher_loop(mut rx: mpsc::UnboundedReceiver<Command>, semaphore: Arc<Semaphore>) {
    let mut queues: HashMap<String, VecDeque<Job>> = HashMap::new();
    let mut active: HashSet<String> = HashSet::new();
    let mut running: JoinSet<(String, anyhow::Result<()>)> = JoinSet::new();
    let mut debug_ticker = tokio::time::interval(DEBUG_LOG_INTERVAL);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(Command::Put { key, job }) => {
                        queues.entry(key).or_default().push_back(job);
                    }
                    Some(Command::Clear { key }) => {
                        queues.remove(&key);
                    }
                    Some(Command::Stop { done }) => {
                        queues.clear();
                        while running.join_next().await.is_some() {}
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        while running.join_next().await.is_some() {}
                        return;
                    }
                }
            }
            Some(result) = running.join_next(), if !running.is_empty() => {
                match result {
                    Ok((key, Ok(()))) => {
                        debug!(key = %key, "orchestrator job completed");
                        active.remove(&key);
                    }
                    Ok((key, Err(e))) => {
                        warn!(key = %key, error = %e, "orchestrator job failed; future jobs for this key are unaffected");
                        active.remove(&key);
                    }
                    Err(join_err) => {
                        error!(error = %join_err, "orchestrator job task panicked");
                    }
                }
            }
            _ = debug_ticker.tick() => {
                let queued: Vec<&String> = queues.keys().collect();
                debug!(active = ?active, queued = ?queued, "orchestrator status");
            }
        }

        // Dispatch: for each idle key with a non-empty queue, launch its head job.
        let ready_keys: Vec<String> = queues
            .iter()
            .filter(|(key, q)| !active.contains(*key) && !q.is_empty())
            .map(|(key, _)| key.clone())
            .collect();

        for key in ready_keys {
            let Some(queue) = queues.get_mut(&key) else { continue };
            let Some(job) = queue.pop_front() else { continue };
            if queue.is_empty() {
                queues.remove(&key);
            }
            active.insert(key.clone());
            let permit_source = semaphore.clone();
            let task_key = key.clone();
            running.spawn(async move {
                let _permit = permit_source.acquire_owned().await.expect("semaphore never closed");
                let started = std::time::Instant::now();
                let result = job.await;
                metrics::histogram!("dmm_orchestrator_job_duration_ms", started.elapsed().as_millis() as f64, "outcome" => if result.is_ok() { "ok" } else { "error" });
                (task_key, result)
            });
            info!(key = %key, "orchestrator job dispatched");
        }

        metrics::gauge!("dmm_orchestrator_queue_depth", queues.values().map(|q| q.len()).sum::<usize>() as f64);
        metrics::gauge!("dmm_orchestrator_active_jobs", active.len() as f64);
    }
}
