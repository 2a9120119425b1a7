//! Periodic usage-limits sync.
//!
//! Pulls `GetUsageLimits` for every enabled account (bounded by the
//! configured concurrency) and persists usage/limit/subscription figures.
//! The store flips accounts between `normal` and `quota_exhausted` as the
//! numbers cross the limit; a suspended signal flips the account directly.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    caches::SettingsCache,
    db::{self, DbPool},
    models::{Account, AccountStatus},
    pool::AccountPool,
    upstream::{UpstreamClient, UpstreamError},
};

const SYNC_INTERVAL: Duration = Duration::from_secs(600);

pub async fn run_quota_sync_worker(
    pool: DbPool,
    settings: Arc<SettingsCache>,
    upstream: Arc<UpstreamClient>,
    account_pool: Arc<AccountPool>,
    cancel: CancellationToken,
) {
    info!("starting quota sync worker (runs every 10 minutes)");
    let mut ticker = interval(SYNC_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                sync_once(&pool, &settings, &upstream, &account_pool).await;
            }
        }
    }
}

async fn sync_once(
    pool: &DbPool,
    settings: &SettingsCache,
    upstream: &Arc<UpstreamClient>,
    account_pool: &Arc<AccountPool>,
) {
    let accounts = match db::list_enabled_accounts(pool).await {
        Ok(accounts) => accounts,
        Err(e) => {
            warn!(error = ?e, "quota sync could not list accounts");
            return;
        }
    };

    let concurrency = settings.get().await.quota_refresh_concurrency.clamp(1, 50) as usize;
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut handles = Vec::new();

    for account in accounts {
        if account.access_token.is_none() {
            continue;
        }
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let pool = pool.clone();
        let upstream = upstream.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            sync_account(&pool, &upstream, &account).await
        }));
    }

    let mut changed = false;
    for handle in handles {
        if let Ok(did_change) = handle.await {
            changed |= did_change;
        }
    }
    if changed {
        account_pool.invalidate();
    }
    debug!("quota sync complete");
}

/// Sync one account; returns true if its eligibility may have changed.
async fn sync_account(pool: &DbPool, upstream: &UpstreamClient, account: &Account) -> bool {
    let access_token = account.access_token.as_deref().unwrap_or_default();
    let machine_id = account.machine_id.as_deref().unwrap_or_default();

    match upstream.get_usage_limits(access_token, machine_id).await {
        Ok(limits) => {
            let subscription_type = limits
                .subscription_info
                .as_ref()
                .and_then(|s| s.subscription_type.clone());
            let (mut used, mut limit) = limits
                .usage_breakdown_list
                .first()
                .map(|b| (b.current_usage_with_precision, b.usage_limit_with_precision))
                .unwrap_or((0.0, 0.0));
            // Free-trial numbers take precedence while a trial is active.
            if let Some(trial) = limits
                .usage_breakdown_list
                .first()
                .and_then(|b| b.free_trial_info.as_ref())
            {
                used = trial.current_usage_with_precision;
                limit = trial.usage_limit;
            }
            if let Err(e) = db::update_account_quota(
                pool,
                account.id,
                used,
                limit,
                subscription_type.as_deref(),
            )
            .await
            {
                warn!(account_id = account.id, error = ?e, "quota update failed");
                return false;
            }
            let exhausted_now = limit > 0.0 && used >= limit;
            let was_exhausted = account.status == AccountStatus::QuotaExhausted;
            exhausted_now != was_exhausted
        }
        Err(UpstreamError::Suspended) => {
            warn!(account_id = account.id, "usage check reports suspension");
            if let Err(e) =
                db::update_account_status(pool, account.id, AccountStatus::Suspended).await
            {
                warn!(account_id = account.id, error = ?e, "status update failed");
            }
            true
        }
        Err(e) => {
            debug!(account_id = account.id, error = %e, "usage check failed");
            false
        }
    }
}
