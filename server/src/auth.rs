//! Caller authentication.
//!
//! The bearer token (from `Authorization: Bearer` or `X-Api-Key`) is tried,
//! in order, as a user API key, then against the configured admin keys;
//! a dev-mode bypass applies only when no admin keys are configured AND
//! no users exist. User lookups sit behind a short-TTL cache so the hot
//! path rarely touches the store.

use axum::http::HeaderMap;
use moka::future::Cache;
use std::time::Duration;
use tracing::debug;

use crate::{
    db::{self, DbPool},
    error::GatewayError,
    models::User,
};

const USER_CACHE_TTL: Duration = Duration::from_secs(30);
const USER_CACHE_CAPACITY: u64 = 10_000;

/// Who the caller is, once authenticated.
#[derive(Debug, Clone)]
pub enum AuthIdentity {
    /// A provisioned user with quotas and limits.
    User(User),
    /// One of the shared admin keys.
    Admin,
    /// Dev-mode bypass: no admin keys configured and no users exist.
    Dev,
}

impl AuthIdentity {
    pub fn user(&self) -> Option<&User> {
        match self {
            AuthIdentity::User(user) => Some(user),
            _ => None,
        }
    }
}

/// Extract the API key from `Authorization: Bearer` or `X-Api-Key`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = auth.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                let token = token.trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub struct Authenticator {
    pool: DbPool,
    admin_keys: Vec<String>,
    user_cache: Cache<String, Option<User>>,
}

impl Authenticator {
    pub fn new(pool: DbPool, admin_keys: Vec<String>) -> Self {
        Self {
            pool,
            admin_keys,
            user_cache: Cache::builder()
                .max_capacity(USER_CACHE_CAPACITY)
                .time_to_live(USER_CACHE_TTL)
                .build(),
        }
    }

    /// Admin keys from `ADMIN_API_KEYS` (comma-separated).
    pub fn admin_keys_from_env() -> Vec<String> {
        std::env::var("ADMIN_API_KEYS")
            .unwrap_or_default()
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthIdentity, GatewayError> {
        let Some(key) = extract_api_key(headers) else {
            // Dev bypass may admit keyless requests on a fresh install.
            if self.dev_mode_active().await? {
                debug!("dev-mode bypass: no admin keys and no users");
                return Ok(AuthIdentity::Dev);
            }
            return Err(GatewayError::MissingApiKey);
        };

        if let Some(user) = self.lookup_user(&key).await? {
            if !user.enabled {
                return Err(GatewayError::UserDisabled);
            }
            return Ok(AuthIdentity::User(user));
        }

        if self.admin_keys.iter().any(|k| k == &key) {
            return Ok(AuthIdentity::Admin);
        }

        if self.dev_mode_active().await? {
            debug!("dev-mode bypass for unrecognized key");
            return Ok(AuthIdentity::Dev);
        }

        Err(GatewayError::InvalidApiKey)
    }

    async fn lookup_user(&self, key: &str) -> Result<Option<User>, GatewayError> {
        let pool = self.pool.clone();
        let key_owned = key.to_string();
        self.user_cache
            .try_get_with(key.to_string(), async move {
                db::get_user_by_api_key(&pool, &key_owned).await
            })
            .await
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("user lookup failed: {}", e)))
    }

    async fn dev_mode_active(&self) -> Result<bool, GatewayError> {
        if !self.admin_keys.is_empty() {
            return Ok(false);
        }
        let count = db::count_users(&self.pool).await?;
        Ok(count == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer sk-abc123"),
        );
        headers.insert("x-api-key", HeaderValue::from_static("sk-other"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-abc123"));
    }

    #[test]
    fn x_api_key_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-xyz"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-xyz"));
    }

    #[test]
    fn missing_or_empty_key_is_none() {
        let headers = HeaderMap::new();
        assert!(extract_api_key(&headers).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer "),
        );
        assert!(extract_api_key(&headers).is_none());
    }

    #[test]
    fn non_bearer_authorization_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwYXNz"),
        );
        assert!(extract_api_key(&headers).is_none());
    }

    #[test]
    fn admin_keys_parse_from_env_format() {
        // exercise the splitting logic directly
        let keys: Vec<String> = "key-a, key-b,,key-c"
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        assert_eq!(keys, vec!["key-a", "key-b", "key-c"]);
    }
}
