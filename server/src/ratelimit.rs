//! Dual-key sliding-window rate limiting.
//!
//! Two independent limiters, one keyed by client IP and one by API key,
//! each holding a per-key log of arrival timestamps. A request is admitted
//! iff fewer than `limit` arrivals lie within the trailing window. The
//! layered precedence across the two limiters lives in
//! [`decide_rate_limit`]; callers never consult the limiters directly.

use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::RateLimitCategory,
    models::{IpConfig, Settings, User},
};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Outcome of a single `allow` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterDecision {
    pub allowed: bool,
    pub count: i64,
    /// Remaining capacity in the window; `-1` means unlimited.
    pub remaining: i64,
}

/// A sliding-window limiter over string keys. The outer map takes a
/// reader/writer lock for topology; each entry carries its own mutex so
/// independent keys never contend.
pub struct SlidingWindowLimiter {
    window: Duration,
    entries: RwLock<HashMap<String, Arc<Mutex<Vec<Instant>>>>>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Admit or refuse one arrival for `key` under `limit`. A limit of
    /// zero or below means unlimited and records nothing.
    pub fn allow(&self, key: &str, limit: i64) -> LimiterDecision {
        if limit <= 0 {
            return LimiterDecision {
                allowed: true,
                count: 0,
                remaining: -1,
            };
        }

        let entry = self.entry(key);
        let mut timestamps = entry.lock();
        let now = Instant::now();
        timestamps.retain(|t| now.duration_since(*t) < self.window);

        let count = timestamps.len() as i64;
        if count >= limit {
            LimiterDecision {
                allowed: false,
                count,
                remaining: 0,
            }
        } else {
            timestamps.push(now);
            LimiterDecision {
                allowed: true,
                count: count + 1,
                remaining: limit - count - 1,
            }
        }
    }

    fn entry(&self, key: &str) -> Arc<Mutex<Vec<Instant>>> {
        if let Some(entry) = self.entries.read().get(key) {
            return entry.clone();
        }
        let mut entries = self.entries.write();
        entries.entry(key.to_string()).or_default().clone()
    }

    /// Drop entries whose newest arrival is older than twice the window
    /// and compact the survivors.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let horizon = self.window * 2;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| {
            let mut timestamps = entry.lock();
            match timestamps.last() {
                Some(newest) if now.duration_since(*newest) < horizon => {
                    timestamps.retain(|t| now.duration_since(*t) < self.window);
                    timestamps.shrink_to_fit();
                    true
                }
                Some(_) => false,
                None => false,
            }
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// The two request-path limiters.
pub struct RateLimiters {
    pub ip: SlidingWindowLimiter,
    pub api_key: SlidingWindowLimiter,
}

impl RateLimiters {
    pub fn new(window: Duration) -> Self {
        Self {
            ip: SlidingWindowLimiter::new(window),
            api_key: SlidingWindowLimiter::new(window),
        }
    }
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// Verdict of the layered policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitVerdict {
    Allow,
    Deny {
        category: RateLimitCategory,
        limit: i64,
        count: i64,
    },
}

/// Layered per-minute rate-limit policy; the first matching layer decides:
///
/// 1. per-IP override (`IpConfig.rate_limit_rpm > 0`) on the IP limiter,
/// 2. per-user override (`User.rate_limit_rpm > 0`) on the key limiter,
/// 3. system default (settings) on the IP limiter.
pub fn decide_rate_limit(
    limiters: &RateLimiters,
    client_ip: &str,
    api_key: Option<&str>,
    ip_config: Option<&IpConfig>,
    user: Option<&User>,
    settings: &Settings,
) -> RateLimitVerdict {
    if let Some(cfg) = ip_config {
        if cfg.rate_limit_rpm > 0 {
            let limit = cfg.rate_limit_rpm as i64;
            let decision = limiters.ip.allow(client_ip, limit);
            return verdict(decision, RateLimitCategory::IpOverride, limit);
        }
    }

    if let (Some(user), Some(key)) = (user, api_key) {
        if user.rate_limit_rpm > 0 {
            let limit = user.rate_limit_rpm as i64;
            let decision = limiters.api_key.allow(key, limit);
            return verdict(decision, RateLimitCategory::UserOverride, limit);
        }
    }

    if settings.enable_ip_rate_limit && settings.ip_rate_limit_max > 0 {
        let limit = settings.ip_rate_limit_max as i64;
        let decision = limiters.ip.allow(client_ip, limit);
        return verdict(decision, RateLimitCategory::SystemDefault, limit);
    }

    RateLimitVerdict::Allow
}

fn verdict(decision: LimiterDecision, category: RateLimitCategory, limit: i64) -> RateLimitVerdict {
    if decision.allowed {
        RateLimitVerdict::Allow
    } else {
        warn!(
            category = category.code(),
            limit, count = decision.count, "rate limit exceeded"
        );
        RateLimitVerdict::Deny {
            category,
            limit,
            count: decision.count,
        }
    }
}

/// Periodic sweep dropping stale limiter entries.
pub async fn run_cleanup_worker(limiters: Arc<RateLimiters>, cancel: CancellationToken) {
    let mut ticker = interval(CLEANUP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let dropped = limiters.ip.cleanup() + limiters.api_key.cleanup();
                debug!(dropped, "rate limiter cleanup completed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SelectionMode;

    fn test_user(rpm: i32) -> User {
        User {
            id: 1,
            name: "u".into(),
            api_key: "sk-test".into(),
            enabled: true,
            rate_limit_rpm: rpm,
            daily_request_limit: 0,
            daily_token_limit: 0,
            monthly_token_limit: 0,
            requests_today: 0,
            input_tokens_today: 0,
            output_tokens_today: 0,
            input_tokens_month: 0,
            output_tokens_month: 0,
        }
    }

    fn test_settings(enable_ip: bool, max: i32) -> Settings {
        Settings {
            enable_ip_rate_limit: enable_ip,
            ip_rate_limit_max: max,
            quota_refresh_concurrency: 20,
            enable_request_log: true,
            account_selection_mode: SelectionMode::RoundRobin,
            lazy_account_pool_size: 100,
            lazy_account_pool_order_by: "id".into(),
            lazy_account_pool_order_desc: false,
        }
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let limiter = SlidingWindowLimiter::default();
        for _ in 0..1000 {
            let d = limiter.allow("k", 0);
            assert!(d.allowed);
            assert_eq!(d.remaining, -1);
        }
        assert!(limiter.is_empty());
    }

    #[test]
    fn window_admits_at_most_limit() {
        let limiter = SlidingWindowLimiter::default();
        for i in 0..5 {
            let d = limiter.allow("k", 5);
            assert!(d.allowed);
            assert_eq!(d.count, i + 1);
            assert_eq!(d.remaining, 5 - i - 1);
        }
        let d = limiter.allow("k", 5);
        assert!(!d.allowed);
        assert_eq!(d.count, 5);
        assert_eq!(d.remaining, 0);
    }

    #[test]
    fn refusal_does_not_record_an_arrival() {
        let limiter = SlidingWindowLimiter::default();
        assert!(limiter.allow("k", 1).allowed);
        for _ in 0..10 {
            assert!(!limiter.allow("k", 1).allowed);
        }
        // still exactly one recorded arrival
        assert_eq!(limiter.allow("k", 2).count, 2);
    }

    #[test]
    fn independent_keys_do_not_share_windows() {
        let limiter = SlidingWindowLimiter::default();
        assert!(limiter.allow("a", 1).allowed);
        assert!(!limiter.allow("a", 1).allowed);
        assert!(limiter.allow("b", 1).allowed);
    }

    #[test]
    fn expired_arrivals_free_capacity() {
        let limiter = SlidingWindowLimiter::new(Duration::from_millis(30));
        assert!(limiter.allow("k", 1).allowed);
        assert!(!limiter.allow("k", 1).allowed);
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.allow("k", 1).allowed);
    }

    #[test]
    fn cleanup_drops_idle_entries() {
        let limiter = SlidingWindowLimiter::new(Duration::from_millis(10));
        limiter.allow("stale", 5);
        std::thread::sleep(Duration::from_millis(30));
        limiter.allow("fresh", 5);
        let dropped = limiter.cleanup();
        assert_eq!(dropped, 1);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn ip_override_takes_precedence() {
        let limiters = RateLimiters::default();
        let ip_config = IpConfig {
            ip: "1.2.3.4".into(),
            rate_limit_rpm: 2,
            daily_request_limit: 0,
            remark: None,
        };
        let user = test_user(100);
        let settings = test_settings(true, 1000);

        for _ in 0..2 {
            assert_eq!(
                decide_rate_limit(
                    &limiters,
                    "1.2.3.4",
                    Some("sk-test"),
                    Some(&ip_config),
                    Some(&user),
                    &settings,
                ),
                RateLimitVerdict::Allow
            );
        }
        match decide_rate_limit(
            &limiters,
            "1.2.3.4",
            Some("sk-test"),
            Some(&ip_config),
            Some(&user),
            &settings,
        ) {
            RateLimitVerdict::Deny { category, limit, count } => {
                assert_eq!(category, RateLimitCategory::IpOverride);
                assert_eq!(limit, 2);
                assert_eq!(count, 2);
            }
            RateLimitVerdict::Allow => panic!("third request should be denied"),
        }
    }

    #[test]
    fn user_override_when_no_ip_override() {
        let limiters = RateLimiters::default();
        let user = test_user(1);
        let settings = test_settings(true, 1000);

        assert_eq!(
            decide_rate_limit(&limiters, "5.6.7.8", Some("sk-test"), None, Some(&user), &settings),
            RateLimitVerdict::Allow
        );
        match decide_rate_limit(&limiters, "5.6.7.8", Some("sk-test"), None, Some(&user), &settings)
        {
            RateLimitVerdict::Deny { category, .. } => {
                assert_eq!(category, RateLimitCategory::UserOverride)
            }
            RateLimitVerdict::Allow => panic!("should be denied by user override"),
        }
    }

    #[test]
    fn system_default_is_last_resort() {
        let limiters = RateLimiters::default();
        let user = test_user(0);
        let settings = test_settings(true, 1);

        assert_eq!(
            decide_rate_limit(&limiters, "5.6.7.8", Some("sk-test"), None, Some(&user), &settings),
            RateLimitVerdict::Allow
        );
        match decide_rate_limit(&limiters, "5.6.7.8", Some("sk-test"), None, Some(&user), &settings)
        {
            RateLimitVerdict::Deny { category, .. } => {
                assert_eq!(category, RateLimitCategory::SystemDefault)
            }
            RateLimitVerdict::Allow => panic!("should be denied by system default"),
        }
    }

    #[test]
    fn no_layer_configured_allows() {
        let limiters = RateLimiters::default();
        let settings = test_settings(false, 0);
        assert_eq!(
            decide_rate_limit(&limiters, "1.1.1.1", None, None, None, &settings),
            RateLimitVerdict::Allow
        );
    }

    #[test]
    fn concurrent_callers_never_exceed_limit() {
        let limiter = Arc::new(SlidingWindowLimiter::default());
        let admitted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let admitted = admitted.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    if limiter.allow("shared", 50).allowed {
                        admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(admitted.load(std::sync::atomic::Ordering::SeqCst), 50);
    }
}
