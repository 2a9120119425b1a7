//! Background token refresh sweep.
//!
//! Every five minutes, refresh enabled accounts whose last refresh is
//! missing or older than twenty minutes, in parallel but bounded to
//! roughly half the configured quota-refresh concurrency.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    caches::SettingsCache,
    db::{self, DbPool},
    refresh::{sweep_stale_after, TokenRefresher},
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub async fn run_token_sweep_worker(
    pool: DbPool,
    settings: Arc<SettingsCache>,
    refresher: Arc<TokenRefresher>,
    cancel: CancellationToken,
) {
    info!("starting token refresh sweep worker (runs every 5 minutes)");
    let mut ticker = interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                sweep_once(&pool, &settings, &refresher).await;
            }
        }
    }
}

async fn sweep_once(pool: &DbPool, settings: &SettingsCache, refresher: &Arc<TokenRefresher>) {
    let accounts = match db::list_enabled_accounts(pool).await {
        Ok(accounts) => accounts,
        Err(e) => {
            warn!(error = ?e, "token sweep could not list accounts");
            return;
        }
    };

    let stale: Vec<i64> = accounts
        .iter()
        .filter(|a| a.refresh_token.is_some() && a.token_is_stale(sweep_stale_after()))
        .map(|a| a.id)
        .collect();
    if stale.is_empty() {
        debug!("token sweep found nothing stale");
        return;
    }

    let concurrency = (settings.get().await.quota_refresh_concurrency / 2).clamp(5, 20) as usize;
    info!(count = stale.len(), concurrency, "token sweep refreshing stale accounts");

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut handles = Vec::with_capacity(stale.len());
    for account_id in stale {
        let permit = semaphore.clone().acquire_owned().await;
        let Ok(permit) = permit else { break };
        let refresher = refresher.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            let outcome = refresher.refresh(account_id).await;
            if let Err(e) = outcome.result {
                debug!(account_id, error = %e, "sweep refresh failed");
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
    debug!("token sweep complete");
}
