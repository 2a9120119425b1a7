//! Asynchronous write pipeline for request logs and counter updates.
//!
//! Two bounded queues decouple the request path from the store: one for
//! request logs (single drainer, batched flushes) and one for stat/usage
//! counter updates (three workers). Producers never block; a full queue
//! drops the write with a warning, trading log fidelity for latency.

use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::{
    db::{self, DbPool},
    models::RequestLog,
};

const LOG_QUEUE_CAPACITY: usize = 5000;
const WRITE_QUEUE_CAPACITY: usize = 10_000;
const LOG_BATCH_SIZE: usize = 100;
const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const WRITE_WORKERS: usize = 3;
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A counter update, dispatched on the variant by the write workers.
#[derive(Debug, Clone)]
pub enum WriteOp {
    StatsUpdate { account_id: i64, success: bool },
    TokenUsage {
        user_id: i64,
        input_tokens: i64,
        output_tokens: i64,
    },
}

pub struct WritePipeline {
    log_tx: Mutex<Option<mpsc::Sender<RequestLog>>>,
    write_tx: Mutex<Option<mpsc::Sender<WriteOp>>>,
    closing: AtomicBool,
    dropped_logs: AtomicU64,
    dropped_writes: AtomicU64,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WritePipeline {
    /// Spawn the log drainer and the write workers.
    pub fn start(pool: DbPool) -> Arc<Self> {
        let (log_tx, log_rx) = mpsc::channel(LOG_QUEUE_CAPACITY);
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);

        let mut handles = Vec::new();
        handles.push(tokio::spawn(run_log_drainer(pool.clone(), log_rx)));

        let shared_rx = Arc::new(tokio::sync::Mutex::new(write_rx));
        for worker in 0..WRITE_WORKERS {
            handles.push(tokio::spawn(run_write_worker(
                pool.clone(),
                shared_rx.clone(),
                worker,
            )));
        }

        info!(workers = WRITE_WORKERS, "write pipeline started");
        Arc::new(Self {
            log_tx: Mutex::new(Some(log_tx)),
            write_tx: Mutex::new(Some(write_tx)),
            closing: AtomicBool::new(false),
            dropped_logs: AtomicU64::new(0),
            dropped_writes: AtomicU64::new(0),
            handles: Mutex::new(handles),
        })
    }

    /// Non-blocking enqueue; drops (with a warning) when closing or full.
    pub fn enqueue_log(&self, log: RequestLog) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        let sender = self.log_tx.lock().clone();
        if let Some(tx) = sender {
            if let Err(e) = tx.try_send(log) {
                self.dropped_logs.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("writeback_dropped_total", 1, "queue" => "log");
                warn!(error = %e, "request log queue full, dropping entry");
            }
        }
    }

    /// Non-blocking enqueue; drops (with a warning) when closing or full.
    pub fn enqueue_write(&self, op: WriteOp) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        let sender = self.write_tx.lock().clone();
        if let Some(tx) = sender {
            if let Err(e) = tx.try_send(op) {
                self.dropped_writes.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("writeback_dropped_total", 1, "queue" => "write");
                warn!(error = %e, "db write queue full, dropping update");
            }
        }
    }

    pub fn dropped_counts(&self) -> (u64, u64) {
        (
            self.dropped_logs.load(Ordering::Relaxed),
            self.dropped_writes.load(Ordering::Relaxed),
        )
    }

    /// Stop accepting writes, close both queues, and wait (bounded) for
    /// the workers to drain. Every accepted entry is flushed before this
    /// returns, unless the drain deadline expires first.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        self.log_tx.lock().take();
        self.write_tx.lock().take();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let drain = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = ?e, "write worker panicked during shutdown");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
            error!("write pipeline drain timed out");
        } else {
            info!("write pipeline drained");
        }
    }
}

/// Single drainer batching log inserts: flush at 100 entries or every 5 s,
/// whichever comes first; fall back to per-row inserts if a batch fails.
async fn run_log_drainer(pool: DbPool, mut rx: mpsc::Receiver<RequestLog>) {
    let mut batch: Vec<RequestLog> = Vec::with_capacity(LOG_BATCH_SIZE);
    let mut ticker = interval(LOG_FLUSH_INTERVAL);
    loop {
        tokio::select! {
            maybe_log = rx.recv() => match maybe_log {
                Some(log) => {
                    batch.push(log);
                    if batch.len() >= LOG_BATCH_SIZE {
                        flush_logs(&pool, &mut batch).await;
                    }
                }
                None => {
                    flush_logs(&pool, &mut batch).await;
                    debug!("log drainer exiting");
                    break;
                }
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush_logs(&pool, &mut batch).await;
                }
            }
        }
    }
}

async fn flush_logs(pool: &DbPool, batch: &mut Vec<RequestLog>) {
    if batch.is_empty() {
        return;
    }
    let logs = std::mem::take(batch);
    if let Err(e) = db::batch_create_request_logs(pool, &logs).await {
        warn!(error = ?e, count = logs.len(), "batch log insert failed, retrying per row");
        for log in &logs {
            if let Err(e) = db::create_request_log(pool, log).await {
                warn!(error = ?e, log_id = %log.id, "request log insert failed");
            }
        }
    }
}

/// One of the fixed write workers; updates apply serially per worker.
async fn run_write_worker(
    pool: DbPool,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WriteOp>>>,
    worker: usize,
) {
    loop {
        let op = { rx.lock().await.recv().await };
        let Some(op) = op else {
            debug!(worker, "write worker exiting");
            break;
        };
        let result = match &op {
            WriteOp::StatsUpdate { account_id, success } => {
                db::update_stats(&pool, *account_id, *success).await
            }
            WriteOp::TokenUsage {
                user_id,
                input_tokens,
                output_tokens,
            } => db::update_token_usage(&pool, *user_id, *input_tokens, *output_tokens).await,
        };
        if let Err(e) = result {
            warn!(worker, error = ?e, op = ?op, "write op failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EndpointType;

    fn lazy_pool() -> DbPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/kirogate_test")
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_a_noop() {
        let pipeline = WritePipeline::start(lazy_pool());
        pipeline.shutdown().await;
        // must not panic or hang
        pipeline.enqueue_log(RequestLog::begin("1.1.1.1", "POST", "/v1/messages", EndpointType::Claude));
        pipeline.enqueue_write(WriteOp::StatsUpdate {
            account_id: 1,
            success: true,
        });
    }

    #[tokio::test]
    async fn shutdown_closes_workers() {
        let pipeline = WritePipeline::start(lazy_pool());
        // workers idle; shutdown should complete promptly
        tokio::time::timeout(Duration::from_secs(5), pipeline.shutdown())
            .await
            .expect("shutdown should not hit the drain timeout");
    }
}
