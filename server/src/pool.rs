//! In-memory pool of selection-eligible upstream accounts.
//!
//! The pool holds an immutable snapshot rebuilt from the store on a 30-s
//! cadence (or immediately after `invalidate`). Per-request account lookup
//! reads the snapshot only; it never queries the store, keeping database
//! round-trips off the hot path.

use parking_lot::RwLock;
use rand::Rng;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    caches::SettingsCache,
    db::{self, DbPool},
    models::{Account, SelectionMode},
};

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

pub struct AccountPool {
    pool: DbPool,
    settings: Arc<SettingsCache>,
    snapshot: RwLock<Arc<Vec<Account>>>,
    cursor: AtomicUsize,
    dirty: AtomicBool,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl AccountPool {
    pub fn new(pool: DbPool, settings: Arc<SettingsCache>) -> Self {
        Self {
            pool,
            settings,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            cursor: AtomicUsize::new(0),
            dirty: AtomicBool::new(true),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Rebuild the snapshot from the store and swap it in atomically.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let _guard = self.refresh_lock.lock().await;
        let settings = self.settings.get().await;
        let accounts = db::list_eligible_accounts(
            &self.pool,
            &settings.lazy_account_pool_order_by,
            settings.lazy_account_pool_order_desc,
            settings.lazy_account_pool_size.max(1) as i64,
        )
        .await?;
        debug!(size = accounts.len(), "account pool snapshot refreshed");
        *self.snapshot.write() = Arc::new(accounts);
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Next account per the configured selection mode, or `None` if the
    /// snapshot is empty.
    pub async fn get_account(&self) -> Option<Account> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.refresh().await {
                warn!(error = ?e, "forced account pool refresh failed");
            }
        }
        let mode = self.settings.get().await.account_selection_mode;
        let snapshot = self.snapshot.read().clone();
        self.select(&snapshot, mode)
    }

    fn select(&self, snapshot: &[Account], mode: SelectionMode) -> Option<Account> {
        if snapshot.is_empty() {
            return None;
        }
        let picked = match mode {
            SelectionMode::RoundRobin => {
                let i = self.cursor.fetch_add(1, Ordering::Relaxed) % snapshot.len();
                &snapshot[i]
            }
            SelectionMode::Random => {
                let i = rand::thread_rng().gen_range(0..snapshot.len());
                &snapshot[i]
            }
            SelectionMode::LeastUsed => snapshot
                .iter()
                .min_by(|a, b| {
                    a.usage_current
                        .partial_cmp(&b.usage_current)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(&snapshot[0]),
        };
        Some(picked.clone())
    }

    /// Mark the snapshot stale; the next `get_account` refreshes inline.
    pub fn invalidate(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.read().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn install_snapshot(&self, accounts: Vec<Account>) {
        *self.snapshot.write() = Arc::new(accounts);
        self.dirty.store(false, Ordering::Release);
    }
}

/// Periodic snapshot refresh.
pub async fn run_refresh_worker(pool: Arc<AccountPool>, cancel: CancellationToken) {
    info!("starting account pool refresh worker");
    let mut ticker = interval(REFRESH_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = pool.refresh().await {
                    warn!(error = ?e, "account pool refresh failed");
                }
            }
        }
    }
}
