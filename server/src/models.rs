//! Store row types shared across the gateway.
//!
//! Enum-valued columns are stored as TEXT and converted with `TryFrom<String>`
//! so the sqlx row mapping stays plain `FromRow`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// Client-protocol request types (submodule)
pub mod chat_request;
pub use chat_request::{
    AnthropicRequest, ChatCompletionsRequest, NormalizedMessage, NormalizedRequest, Role,
    ToolResult, ToolSpec,
};

/// Lifecycle status of an upstream account.
///
/// Only `Normal` accounts (with `enabled = true`) are selection-eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Normal,
    Suspended,
    QuotaExhausted,
    ExpiredToken,
    Disabled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Normal => "normal",
            AccountStatus::Suspended => "suspended",
            AccountStatus::QuotaExhausted => "quota_exhausted",
            AccountStatus::ExpiredToken => "expired_token",
            AccountStatus::Disabled => "disabled",
        }
    }
}

impl TryFrom<String> for AccountStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "normal" => Ok(AccountStatus::Normal),
            "suspended" => Ok(AccountStatus::Suspended),
            "quota_exhausted" => Ok(AccountStatus::QuotaExhausted),
            "expired_token" => Ok(AccountStatus::ExpiredToken),
            "disabled" => Ok(AccountStatus::Disabled),
            other => Err(format!("unknown account status: {}", other)),
        }
    }
}

/// An upstream Amazon Q (Kiro) account.
#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub id: i64,
    pub label: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub machine_id: Option<String>,
    pub last_refresh_time: Option<DateTime<Utc>>,
    pub last_refresh_status: Option<String>,
    pub refresh_error_count: i32,
    pub enabled: bool,
    #[sqlx(try_from = "String")]
    pub status: AccountStatus,
    pub usage_current: f64,
    pub usage_limit: f64,
    pub subscription_type: Option<String>,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Selection eligibility: enabled and in the `normal` state.
    pub fn is_selectable(&self) -> bool {
        self.enabled && self.status == AccountStatus::Normal
    }

    /// Social-login accounts refresh through a different endpoint.
    pub fn is_social(&self) -> bool {
        self.client_id.starts_with("social-")
    }

    /// Whether the access token should be refreshed before use.
    pub fn token_is_stale(&self, max_age: chrono::Duration) -> bool {
        match self.last_refresh_time {
            None => true,
            Some(t) => Utc::now() - t > max_age,
        }
    }
}

/// A downstream API user. The API key is both the authentication identity
/// and the rate-limit key.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub api_key: String,
    pub enabled: bool,
    pub rate_limit_rpm: i32,
    pub daily_request_limit: i32,
    pub daily_token_limit: i64,
    pub monthly_token_limit: i64,
    pub requests_today: i32,
    pub input_tokens_today: i64,
    pub output_tokens_today: i64,
    pub input_tokens_month: i64,
    pub output_tokens_month: i64,
}

/// Optional per-IP overrides. Absence of a row means "fall through to the
/// system default".
#[derive(Debug, Clone, FromRow)]
pub struct IpConfig {
    pub ip: String,
    pub rate_limit_rpm: i32,
    pub daily_request_limit: i32,
    pub remark: Option<String>,
}

/// Account selection strategy for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionMode {
    #[default]
    RoundRobin,
    Random,
    LeastUsed,
}

impl TryFrom<String> for SelectionMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "round_robin" => Ok(SelectionMode::RoundRobin),
            "random" => Ok(SelectionMode::Random),
            "least_used" => Ok(SelectionMode::LeastUsed),
            other => Err(format!("unknown selection mode: {}", other)),
        }
    }
}

/// Runtime-tunable settings, cached in memory with a 30-s TTL.
#[derive(Debug, Clone, FromRow)]
pub struct Settings {
    pub enable_ip_rate_limit: bool,
    pub ip_rate_limit_max: i32,
    pub quota_refresh_concurrency: i32,
    pub enable_request_log: bool,
    #[sqlx(try_from = "String")]
    pub account_selection_mode: SelectionMode,
    pub lazy_account_pool_size: i32,
    pub lazy_account_pool_order_by: String,
    pub lazy_account_pool_order_desc: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enable_ip_rate_limit: false,
            ip_rate_limit_max: 0,
            quota_refresh_concurrency: 20,
            enable_request_log: true,
            account_selection_mode: SelectionMode::RoundRobin,
            lazy_account_pool_size: 100,
            lazy_account_pool_order_by: "id".to_string(),
            lazy_account_pool_order_desc: false,
        }
    }
}

/// Which downstream protocol surface a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Claude,
    Openai,
}

impl EndpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Claude => "claude",
            EndpointType::Openai => "openai",
        }
    }
}

/// One row per client request (including each failed upstream attempt).
/// Written asynchronously through the write pipeline, never read back by
/// the request path.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub endpoint_type: EndpointType,
    pub status_code: i32,
    pub is_success: bool,
    pub duration_ms: i64,
    pub user_agent: Option<String>,
    pub account_id: Option<i64>,
    pub user_id: Option<i64>,
    pub api_key_prefix: Option<String>,
    pub model: Option<String>,
    pub original_model: Option<String>,
    pub is_stream: Option<bool>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub error_message: Option<String>,
}

impl RequestLog {
    /// A log row with fresh id/timestamp and everything else defaulted;
    /// the coordinator fills fields in as the request progresses.
    pub fn begin(client_ip: &str, method: &str, path: &str, endpoint_type: EndpointType) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            timestamp: Utc::now(),
            client_ip: client_ip.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            endpoint_type,
            status_code: 0,
            is_success: false,
            duration_ms: 0,
            user_agent: None,
            account_id: None,
            user_id: None,
            api_key_prefix: None,
            model: None,
            original_model: None,
            is_stream: None,
            input_tokens: 0,
            output_tokens: 0,
            error_message: None,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_account(id: i64) -> Account {
    Account {
        id,
        label: format!("account-{}", id),
        client_id: "arn:aws:sso::client/test".into(),
        client_secret: "secret".into(),
        refresh_token: Some("refresh".into()),
        access_token: Some("access".into()),
        machine_id: Some("machine".into()),
        last_refresh_time: Some(Utc::now()),
        last_refresh_status: Some("success".into()),
        refresh_error_count: 0,
        enabled: true,
        status: AccountStatus::Normal,
        usage_current: 0.0,
        usage_limit: 100.0,
        subscription_type: None,
        success_count: 0,
        failure_count: 0,
        last_used_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
