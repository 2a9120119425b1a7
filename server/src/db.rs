//! Postgres store layer.
//!
//! Free async functions over a shared `PgPool`. Quota checks are single
//! atomic UPDATE statements so concurrent requests serialize on the row;
//! day/month counter rollover happens inside the same statement.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::models::{Account, AccountStatus, IpConfig, RequestLog, Settings, User};

pub type DbPool = PgPool;

const ACCOUNT_COLUMNS: &str = "id, label, client_id, client_secret, refresh_token, access_token, \
     machine_id, last_refresh_time, last_refresh_status, refresh_error_count, enabled, status, \
     usage_current, usage_limit, subscription_type, success_count, failure_count, last_used_at, \
     created_at, updated_at";

const USER_COLUMNS: &str = "id, name, api_key, enabled, rate_limit_rpm, daily_request_limit, \
     daily_token_limit, monthly_token_limit, requests_today, input_tokens_today, \
     output_tokens_today, input_tokens_month, output_tokens_month";

/// Consecutive refresh failures after which the store disables an account.
const REFRESH_FAILURE_LIMIT: i32 = 5;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/kirogate".to_string()),
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Initialize database connection pool with configuration
pub async fn init_db(config: DbConfig) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    Ok(pool)
}

/// Initialize database with default configuration
pub async fn init_db_default() -> Result<DbPool> {
    init_db(DbConfig::default()).await
}

// =============================================================================
// Account Operations
// =============================================================================

/// Columns the pool may order its snapshot by; anything else falls back
/// to `id` rather than interpolating caller input.
fn sanitize_order_column(order_by: &str) -> &'static str {
    match order_by {
        "created_at" => "created_at",
        "updated_at" => "updated_at",
        "last_used_at" => "last_used_at",
        "usage_current" => "usage_current",
        "label" => "label",
        _ => "id",
    }
}

/// Selection-eligible accounts for the pool snapshot.
pub async fn list_eligible_accounts(
    pool: &DbPool,
    order_by: &str,
    desc: bool,
    limit: i64,
) -> Result<Vec<Account>> {
    let direction = if desc { "DESC" } else { "ASC" };
    let query = format!(
        "SELECT {} FROM accounts WHERE enabled AND status = 'normal' ORDER BY {} {} LIMIT $1",
        ACCOUNT_COLUMNS,
        sanitize_order_column(order_by),
        direction
    );
    sqlx::query_as::<_, Account>(&query)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to list eligible accounts")
}

/// All enabled accounts, for the background sweeps.
pub async fn list_enabled_accounts(pool: &DbPool) -> Result<Vec<Account>> {
    let query = format!(
        "SELECT {} FROM accounts WHERE enabled ORDER BY id",
        ACCOUNT_COLUMNS
    );
    sqlx::query_as::<_, Account>(&query)
        .fetch_all(pool)
        .await
        .context("Failed to list enabled accounts")
}

pub async fn get_account(pool: &DbPool, id: i64) -> Result<Option<Account>> {
    let query = format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS);
    sqlx::query_as::<_, Account>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch account")
}

pub async fn update_account_status(
    pool: &DbPool,
    id: i64,
    status: AccountStatus,
) -> Result<()> {
    sqlx::query("UPDATE accounts SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(id)
        .bind(status.as_str())
        .execute(pool)
        .await
        .context("Failed to update account status")?;
    Ok(())
}

/// Persist a refreshed token pair. A `NULL` refresh token keeps the
/// existing one (some refresh endpoints rotate it, some do not). An
/// account parked in `expired_token` returns to `normal`.
pub async fn update_tokens(
    pool: &DbPool,
    id: i64,
    access_token: &str,
    refresh_token: Option<&str>,
    refresh_status: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE accounts SET
            access_token = $2,
            refresh_token = COALESCE($3, refresh_token),
            last_refresh_time = NOW(),
            last_refresh_status = $4,
            refresh_error_count = 0,
            status = CASE WHEN status = 'expired_token' THEN 'normal' ELSE status END,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(access_token)
    .bind(refresh_token)
    .bind(refresh_status)
    .execute(pool)
    .await
    .context("Failed to update tokens")?;
    Ok(())
}

/// Record a refresh failure; repeated failures flip the account to
/// `disabled` here rather than in the caller.
pub async fn record_refresh_failure(pool: &DbPool, id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE accounts SET
            refresh_error_count = refresh_error_count + 1,
            last_refresh_status = 'failed',
            status = CASE
                WHEN refresh_error_count + 1 >= $2 THEN 'disabled'
                ELSE status
            END,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(REFRESH_FAILURE_LIMIT)
    .execute(pool)
    .await
    .context("Failed to record refresh failure")?;
    Ok(())
}

/// Assign a machine id if the account does not have one yet; returns the
/// persisted id either way.
pub async fn assign_machine_id(pool: &DbPool, id: i64, machine_id: &str) -> Result<String> {
    let row: (String,) = sqlx::query_as(
        r#"
        UPDATE accounts SET
            machine_id = COALESCE(machine_id, $2),
            updated_at = NOW()
        WHERE id = $1
        RETURNING machine_id
        "#,
    )
    .bind(id)
    .bind(machine_id)
    .fetch_one(pool)
    .await
    .context("Failed to assign machine id")?;
    Ok(row.0)
}

pub async fn update_stats(pool: &DbPool, id: i64, success: bool) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE accounts SET
            success_count = success_count + CASE WHEN $2 THEN 1 ELSE 0 END,
            failure_count = failure_count + CASE WHEN $2 THEN 0 ELSE 1 END,
            last_used_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(success)
    .execute(pool)
    .await
    .context("Failed to update account stats")?;
    Ok(())
}

/// Persist quota figures from the usage-limits sync. Exhaustion flips the
/// status both ways: `normal` accounts at their limit park as
/// `quota_exhausted`, parked accounts with freed capacity return.
pub async fn update_account_quota(
    pool: &DbPool,
    id: i64,
    usage_current: f64,
    usage_limit: f64,
    subscription_type: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE accounts SET
            usage_current = $2,
            usage_limit = $3,
            subscription_type = COALESCE($4, subscription_type),
            status = CASE
                WHEN $3 > 0 AND $2 >= $3 AND status = 'normal' THEN 'quota_exhausted'
                WHEN ($3 <= 0 OR $2 < $3) AND status = 'quota_exhausted' THEN 'normal'
                ELSE status
            END,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(usage_current)
    .bind(usage_limit)
    .bind(subscription_type)
    .execute(pool)
    .await
    .context("Failed to update account quota")?;
    Ok(())
}

// =============================================================================
// User Operations
// =============================================================================

pub async fn get_user_by_api_key(pool: &DbPool, api_key: &str) -> Result<Option<User>> {
    let query = format!("SELECT {} FROM users WHERE api_key = $1", USER_COLUMNS);
    sqlx::query_as::<_, User>(&query)
        .bind(api_key)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch user by api key")
}

pub async fn count_users(pool: &DbPool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await
        .context("Failed to count users")?;
    Ok(row.0)
}

/// Atomic request-quota check: one UPDATE that rolls counters over at
/// day/month boundaries, enforces all three limits, and increments the
/// daily request count, succeeding iff the request is admitted.
pub async fn check_user_quota(pool: &DbPool, user_id: i64) -> Result<(bool, Option<String>)> {
    let result = sqlx::query(
        r#"
        UPDATE users SET
            requests_today = CASE WHEN last_request_day = CURRENT_DATE THEN requests_today + 1 ELSE 1 END,
            input_tokens_today = CASE WHEN last_request_day = CURRENT_DATE THEN input_tokens_today ELSE 0 END,
            output_tokens_today = CASE WHEN last_request_day = CURRENT_DATE THEN output_tokens_today ELSE 0 END,
            input_tokens_month = CASE WHEN last_request_month = date_trunc('month', CURRENT_DATE)::date THEN input_tokens_month ELSE 0 END,
            output_tokens_month = CASE WHEN last_request_month = date_trunc('month', CURRENT_DATE)::date THEN output_tokens_month ELSE 0 END,
            last_request_day = CURRENT_DATE,
            last_request_month = date_trunc('month', CURRENT_DATE)::date
        WHERE id = $1
          AND enabled
          AND (daily_request_limit <= 0
               OR (CASE WHEN last_request_day = CURRENT_DATE THEN requests_today ELSE 0 END) < daily_request_limit)
          AND (daily_token_limit <= 0
               OR (CASE WHEN last_request_day = CURRENT_DATE THEN input_tokens_today + output_tokens_today ELSE 0 END) < daily_token_limit)
          AND (monthly_token_limit <= 0
               OR (CASE WHEN last_request_month = date_trunc('month', CURRENT_DATE)::date THEN input_tokens_month + output_tokens_month ELSE 0 END) < monthly_token_limit)
        "#,
    )
    .bind(user_id)
    .execute(pool)
    .await
    .context("Failed to check user quota")?;

    if result.rows_affected() == 1 {
        return Ok((true, None));
    }

    // Denied; fetch the row once to name the limit that tripped.
    let query = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
    let user = sqlx::query_as::<_, User>(&query)
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch user for quota reason")?;

    let reason = match user {
        None => "user no longer exists".to_string(),
        Some(u) if !u.enabled => "user is disabled".to_string(),
        Some(u) => {
            if u.daily_request_limit > 0 && u.requests_today >= u.daily_request_limit {
                "daily request limit reached".to_string()
            } else if u.daily_token_limit > 0
                && u.input_tokens_today + u.output_tokens_today >= u.daily_token_limit
            {
                "daily token limit reached".to_string()
            } else if u.monthly_token_limit > 0
                && u.input_tokens_month + u.output_tokens_month >= u.monthly_token_limit
            {
                "monthly token limit reached".to_string()
            } else {
                "quota exceeded".to_string()
            }
        }
    };
    Ok((false, Some(reason)))
}

/// Atomic per-IP daily limit: upsert that only increments while under the
/// limit. Returns `(allowed, count_after)`.
pub async fn check_ip_daily_limit(pool: &DbPool, ip: &str, limit: i64) -> Result<(bool, i64)> {
    if limit <= 0 {
        return Ok((true, 0));
    }

    let admitted: Option<(i32,)> = sqlx::query_as(
        r#"
        INSERT INTO ip_daily_counters (ip, day, count) VALUES ($1, CURRENT_DATE, 1)
        ON CONFLICT (ip, day) DO UPDATE SET count = ip_daily_counters.count + 1
            WHERE ip_daily_counters.count < $2
        RETURNING count
        "#,
    )
    .bind(ip)
    .bind(limit)
    .fetch_optional(pool)
    .await
    .context("Failed to check ip daily limit")?;

    match admitted {
        Some((count,)) => Ok((true, count as i64)),
        None => {
            let row: Option<(i32,)> = sqlx::query_as(
                "SELECT count FROM ip_daily_counters WHERE ip = $1 AND day = CURRENT_DATE",
            )
            .bind(ip)
            .fetch_optional(pool)
            .await
            .context("Failed to read ip daily counter")?;
            Ok((false, row.map(|(c,)| c as i64).unwrap_or(limit)))
        }
    }
}

/// Fold a finished request's token usage into the user counters,
/// rolling over at day/month boundaries.
pub async fn update_token_usage(
    pool: &DbPool,
    user_id: i64,
    input_tokens: i64,
    output_tokens: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE users SET
            input_tokens_today = CASE WHEN last_request_day = CURRENT_DATE THEN input_tokens_today + $2 ELSE $2 END,
            output_tokens_today = CASE WHEN last_request_day = CURRENT_DATE THEN output_tokens_today + $3 ELSE $3 END,
            input_tokens_month = CASE WHEN last_request_month = date_trunc('month', CURRENT_DATE)::date THEN input_tokens_month + $2 ELSE $2 END,
            output_tokens_month = CASE WHEN last_request_month = date_trunc('month', CURRENT_DATE)::date THEN output_tokens_month + $3 ELSE $3 END,
            last_request_day = CURRENT_DATE,
            last_request_month = date_trunc('month', CURRENT_DATE)::date
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .bind(input_tokens)
    .bind(output_tokens)
    .execute(pool)
    .await
    .context("Failed to update token usage")?;
    Ok(())
}

// =============================================================================
// Request Logs
// =============================================================================

pub async fn create_request_log(pool: &DbPool, log: &RequestLog) -> Result<()> {
    insert_log(pool, log).await
}

/// Flush a batch inside one transaction so observers see it atomically.
pub async fn batch_create_request_logs(pool: &DbPool, logs: &[RequestLog]) -> Result<()> {
    let mut tx = pool.begin().await.context("Failed to begin log batch")?;
    for log in logs {
        bind_log(sqlx::query(INSERT_LOG_SQL), log)
            .execute(&mut *tx)
            .await
            .context("Failed to insert request log in batch")?;
    }
    tx.commit().await.context("Failed to commit log batch")?;
    Ok(())
}

const INSERT_LOG_SQL: &str = r#"
    INSERT INTO request_logs (
        id, timestamp, client_ip, method, path, endpoint_type, status_code,
        is_success, duration_ms, user_agent, account_id, user_id,
        api_key_prefix, model, original_model, is_stream, input_tokens,
        output_tokens, error_message
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
    ON CONFLICT (id) DO NOTHING
"#;

fn bind_log<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    log: &'q RequestLog,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(&log.id)
        .bind(log.timestamp)
        .bind(&log.client_ip)
        .bind(&log.method)
        .bind(&log.path)
        .bind(log.endpoint_type.as_str())
        .bind(log.status_code)
        .bind(log.is_success)
        .bind(log.duration_ms)
        .bind(&log.user_agent)
        .bind(log.account_id)
        .bind(log.user_id)
        .bind(&log.api_key_prefix)
        .bind(&log.model)
        .bind(&log.original_model)
        .bind(log.is_stream)
        .bind(log.input_tokens)
        .bind(log.output_tokens)
        .bind(&log.error_message)
}

async fn insert_log(pool: &DbPool, log: &RequestLog) -> Result<()> {
    bind_log(sqlx::query(INSERT_LOG_SQL), log)
        .execute(pool)
        .await
        .context("Failed to insert request log")?;
    Ok(())
}

// =============================================================================
// Settings / IP configuration
// =============================================================================

pub async fn get_settings(pool: &DbPool) -> Result<Settings> {
    let settings = sqlx::query_as::<_, Settings>(
        r#"
        SELECT enable_ip_rate_limit, ip_rate_limit_max, quota_refresh_concurrency,
               enable_request_log, account_selection_mode, lazy_account_pool_size,
               lazy_account_pool_order_by, lazy_account_pool_order_desc
        FROM settings WHERE id = 1
        "#,
    )
    .fetch_optional(pool)
    .await
    .context("Failed to fetch settings")?;
    Ok(settings.unwrap_or_default())
}

pub async fn get_blocked_ips(pool: &DbPool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT ip FROM blocked_ips")
        .fetch_all(pool)
        .await
        .context("Failed to fetch blocked ips")?;
    Ok(rows.into_iter().map(|(ip,)| ip).collect())
}

pub async fn get_ip_configs(pool: &DbPool) -> Result<Vec<IpConfig>> {
    sqlx::query_as::<_, IpConfig>(
        "SELECT ip, rate_limit_rpm, daily_request_limit, remark FROM ip_configs",
    )
    .fetch_all(pool)
    .await
    .context("Failed to fetch ip configs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_column_sanitization() {
        assert_eq!(sanitize_order_column("usage_current"), "usage_current");
        assert_eq!(sanitize_order_column("label"), "label");
        assert_eq!(sanitize_order_column("id; DROP TABLE accounts"), "id");
        assert_eq!(sanitize_order_column(""), "id");
    }
}
