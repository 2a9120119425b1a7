//! Token refresh with single-flight coordination.
//!
//! However many requests notice a stale access token at once, each account
//! sees at most one in-flight refresh; late arrivals await the winner's
//! result instead of dialing the refresh endpoint themselves.

use anyhow::Context;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::{collections::HashMap, future::Future, sync::Arc};
use tracing::{info, warn};

use crate::{
    db::{self, DbPool},
    upstream::UpstreamClient,
};

/// Access tokens older than this are refreshed before an upstream call.
pub const STALE_AFTER_MINUTES: i64 = 25;
/// The background sweep refreshes anything older than this.
pub const SWEEP_STALE_AFTER_MINUTES: i64 = 20;

/// Request-path staleness threshold.
pub fn stale_after() -> chrono::Duration {
    chrono::Duration::minutes(STALE_AFTER_MINUTES)
}

/// Background-sweep staleness threshold.
pub fn sweep_stale_after() -> chrono::Duration {
    chrono::Duration::minutes(SWEEP_STALE_AFTER_MINUTES)
}

type SharedResult = Result<(), Arc<anyhow::Error>>;
type FlightFuture = Shared<BoxFuture<'static, SharedResult>>;

/// Outcome of a single-flight run. `skipped` is true when this caller
/// joined an already in-flight computation instead of starting one.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub result: SharedResult,
    pub skipped: bool,
}

/// Single-flight map: at most one in-flight future per key.
#[derive(Default)]
pub struct SingleFlight {
    inflight: Mutex<HashMap<i64, FlightFuture>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F>(&self, key: i64, fut: F) -> RefreshOutcome
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (shared, leader) = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&key) {
                (existing.clone(), false)
            } else {
                let shared = async move { fut.await.map_err(Arc::new) }.boxed().shared();
                inflight.insert(key, shared.clone());
                (shared, true)
            }
        };

        let result = shared.await;

        // Whoever finishes clears the completed entry; a still-running
        // future (re-inserted by a later flight) is never evicted.
        let mut inflight = self.inflight.lock();
        if let Some(existing) = inflight.get(&key) {
            if existing.peek().is_some() {
                inflight.remove(&key);
            }
        }

        RefreshOutcome {
            result,
            skipped: !leader,
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }
}

/// Coordinates token refreshes against the store and upstream.
pub struct TokenRefresher {
    db: DbPool,
    upstream: Arc<UpstreamClient>,
    flight: SingleFlight,
}

impl TokenRefresher {
    pub fn new(db: DbPool, upstream: Arc<UpstreamClient>) -> Self {
        Self {
            db,
            upstream,
            flight: SingleFlight::new(),
        }
    }

    /// Refresh the account's tokens if stale, then reload the row so the
    /// caller sees the tokens the winning flight persisted.
    pub async fn ensure_fresh(&self, account: &mut crate::models::Account) -> anyhow::Result<()> {
        if !account.token_is_stale(stale_after()) {
            return Ok(());
        }
        self.refresh_and_reload(account).await
    }

    /// Unconditional refresh (401 recovery path), then reload.
    pub async fn force_refresh(&self, account: &mut crate::models::Account) -> anyhow::Result<()> {
        self.refresh_and_reload(account).await
    }

    async fn refresh_and_reload(&self, account: &mut crate::models::Account) -> anyhow::Result<()> {
        let outcome = self.refresh(account.id).await;
        if let Err(e) = outcome.result {
            anyhow::bail!("token refresh failed: {}", e);
        }
        if let Some(updated) = db::get_account(&self.db, account.id).await? {
            *account = updated;
        }
        Ok(())
    }

    /// Run one single-flight refresh for the account.
    pub async fn refresh(&self, account_id: i64) -> RefreshOutcome {
        let db = self.db.clone();
        let upstream = self.upstream.clone();
        self.flight
            .run(account_id, async move {
                refresh_once(db, upstream, account_id).await
            })
            .await
    }
}

/// One actual refresh round-trip: dispatches to the OIDC or social refresh
/// endpoint and persists the new token pair atomically.
async fn refresh_once(
    db: DbPool,
    upstream: Arc<UpstreamClient>,
    account_id: i64,
) -> anyhow::Result<()> {
    let account = db::get_account(&db, account_id)
        .await?
        .context("account no longer exists")?;
    let refresh_token = account
        .refresh_token
        .clone()
        .context("account has no refresh token")?;
    let machine_id = account.machine_id.clone().unwrap_or_default();

    let result = if account.is_social() {
        upstream
            .refresh_social_token(&refresh_token, &machine_id)
            .await
    } else {
        upstream
            .refresh_access_token(
                &account.client_id,
                &account.client_secret,
                &refresh_token,
                &machine_id,
            )
            .await
    };

    match result {
        Ok(tokens) => {
            db::update_tokens(
                &db,
                account_id,
                &tokens.access_token,
                tokens.refresh_token.as_deref(),
                "success",
            )
            .await?;
            info!(account_id, "token refresh succeeded");
            Ok(())
        }
        Err(e) => {
            // The store flips the account to disabled once failures pile up.
            if let Err(db_err) = db::record_refresh_failure(&db, account_id).await {
                warn!(account_id, error = ?db_err, "failed to record refresh failure");
            }
            warn!(account_id, error = %e, "token refresh failed");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flight = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run(7, async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    })
                    .await
            }));
        }

        let mut skipped = 0;
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert!(outcome.result.is_ok());
            if outcome.skipped {
                skipped += 1;
            }
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(skipped, 7);
        assert_eq!(flight.inflight_count(), 0);
    }

    #[tokio::test]
    async fn different_keys_run_independently() {
        let flight = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for key in 0..4i64 {
            let flight = flight.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run(key, async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(!handle.await.unwrap().skipped);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn waiters_observe_the_leaders_error() {
        let flight = Arc::new(SingleFlight::new());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run(1, async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        anyhow::bail!("refresh endpoint said no")
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let waiter = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.run(1, async move { Ok(()) }).await })
        };

        let leader_outcome = leader.await.unwrap();
        let waiter_outcome = waiter.await.unwrap();
        assert!(!leader_outcome.skipped);
        assert!(waiter_outcome.skipped);
        assert!(leader_outcome.result.is_err());
        assert!(waiter_outcome.result.is_err());
    }

    #[tokio::test]
    async fn sequential_runs_execute_separately() {
        let flight = SingleFlight::new();
        let executions = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let executions = executions.clone();
            let outcome = flight
                .run(9, async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert!(!outcome.skipped);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }
}
