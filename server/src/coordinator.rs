//! Per-request orchestration: blocklist -> auth -> quotas -> rate limit ->
//! account selection -> token freshness -> upstream call -> stream
//! translation -> response, with bounded account failover and a log row
//! per attempt.

use axum::{
    body::Body,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::{
    auth::Authenticator,
    caches::{BlockedIpCache, IpConfigCache, OnlineTracker, SettingsCache},
    db::{self, DbPool},
    error::{GatewayError, RateLimitCategory},
    eventstream::{decode_event, EventStreamParser, UpstreamEvent},
    models::{Account, AccountStatus, EndpointType, NormalizedRequest, RequestLog},
    pool::AccountPool,
    ratelimit::{decide_rate_limit, RateLimitVerdict, RateLimiters},
    refresh::TokenRefresher,
    tokenizer,
    translate::{AnthropicStream, OpenAiStream, Translator, UnifiedStream},
    upstream::{build_generation_payload, UpstreamClient, UpstreamError},
    util,
    writeback::{WriteOp, WritePipeline},
};

/// Downstream protocol surface for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Anthropic,
    OpenAi,
    Unified,
}

impl Protocol {
    pub fn endpoint_type(&self) -> EndpointType {
        match self {
            Protocol::OpenAi => EndpointType::Openai,
            _ => EndpointType::Claude,
        }
    }
}

/// Shared gateway state wired together at startup.
pub struct Gateway {
    pub db: DbPool,
    pub settings: Arc<SettingsCache>,
    pub blocked_ips: Arc<BlockedIpCache>,
    pub ip_configs: Arc<IpConfigCache>,
    pub online: Arc<OnlineTracker>,
    pub limiters: Arc<RateLimiters>,
    pub pool: Arc<AccountPool>,
    pub refresher: Arc<TokenRefresher>,
    pub upstream: Arc<UpstreamClient>,
    pub writeback: Arc<WritePipeline>,
    pub auth: Arc<Authenticator>,
    /// Model alias map from `MODEL_MAP` (`from=to` pairs, comma-separated).
    pub model_map: HashMap<String, String>,
    /// Upper bound on distinct upstream accounts tried per request.
    pub max_attempts: usize,
    pub strict_sse: bool,
}

impl Gateway {
    pub fn model_map_from_env() -> HashMap<String, String> {
        std::env::var("MODEL_MAP")
            .unwrap_or_default()
            .split(',')
            .filter_map(|pair| {
                let (from, to) = pair.split_once('=')?;
                let (from, to) = (from.trim(), to.trim());
                if from.is_empty() || to.is_empty() {
                    None
                } else {
                    Some((from.to_string(), to.to_string()))
                }
            })
            .collect()
    }
}

fn new_translator(protocol: Protocol, strict: bool, model: &str, input_tokens: u32) -> Translator {
    match protocol {
        Protocol::Anthropic => Translator::Anthropic(AnthropicStream::new(
            format!("msg_{}", ulid::Ulid::new().to_string().to_lowercase()),
            model.to_string(),
            input_tokens,
            strict,
        )),
        Protocol::Unified => Translator::Unified(UnifiedStream::new(
            format!("msg_{}", ulid::Ulid::new().to_string().to_lowercase()),
            model.to_string(),
            input_tokens,
            strict,
        )),
        Protocol::OpenAi => Translator::OpenAi(OpenAiStream::new(
            format!("chatcmpl-{}", ulid::Ulid::new().to_string().to_lowercase()),
            model.to_string(),
            input_tokens,
        )),
    }
}

/// An upstream call that produced at least a healthy stream head.
struct CommittedStream {
    parser: EventStreamParser,
    pending: Vec<UpstreamEvent>,
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
}

/// Main entry: run the whole pipeline for one chat request.
pub async fn handle_chat(
    gateway: Arc<Gateway>,
    protocol: Protocol,
    headers: HeaderMap,
    client_ip: String,
    path: &str,
    mut request: NormalizedRequest,
) -> Response {
    let started = Instant::now();
    metrics::counter!("gateway_requests_total", 1, "endpoint" => protocol.endpoint_type().as_str());

    let mut log = RequestLog::begin(&client_ip, "POST", path, protocol.endpoint_type());
    log.user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    log.is_stream = Some(request.stream);

    // model alias rewrite
    if let Some(mapped) = gateway.model_map.get(&request.model) {
        request.original_model = Some(request.model.clone());
        request.model = mapped.clone();
    }
    log.model = Some(request.model.clone());
    log.original_model = request.original_model.clone();

    // 1. IP blocklist
    if gateway.blocked_ips.is_blocked(&client_ip).await {
        return deny(&gateway, log, started, GatewayError::IpBlocked);
    }

    // 2. online tracker
    gateway.online.record(&client_ip);

    // 3. authentication
    let api_key = crate::auth::extract_api_key(&headers);
    log.api_key_prefix = api_key.as_deref().map(util::api_key_prefix);
    let identity = match gateway.auth.authenticate(&headers).await {
        Ok(identity) => identity,
        Err(err) => return deny(&gateway, log, started, err),
    };
    let user = identity.user().cloned();
    log.user_id = user.as_ref().map(|u| u.id);

    // 4. daily limits and user quotas
    let ip_config = gateway.ip_configs.get(&client_ip).await;
    if let Some(cfg) = ip_config.as_ref().filter(|c| c.daily_request_limit > 0) {
        match db::check_ip_daily_limit(&gateway.db, &client_ip, cfg.daily_request_limit as i64)
            .await
        {
            Ok((true, _count)) => {}
            Ok((false, count)) => {
                debug!(ip = %client_ip, count, "ip daily limit reached");
                return deny(
                    &gateway,
                    log,
                    started,
                    GatewayError::RateLimited(RateLimitCategory::IpDailyLimit),
                );
            }
            Err(e) => return deny(&gateway, log, started, GatewayError::Internal(e)),
        }
    }
    if let Some(user) = user.as_ref() {
        match db::check_user_quota(&gateway.db, user.id).await {
            Ok((true, _)) => {}
            Ok((false, reason)) => {
                let reason = reason.unwrap_or_else(|| "quota exceeded".to_string());
                return deny(&gateway, log, started, GatewayError::QuotaExceeded(reason));
            }
            Err(e) => return deny(&gateway, log, started, GatewayError::Internal(e)),
        }
    }

    // 5. sliding-window rate limits
    let settings = gateway.settings.get().await;
    let verdict = decide_rate_limit(
        &gateway.limiters,
        &client_ip,
        api_key.as_deref(),
        ip_config.as_ref(),
        user.as_ref(),
        &settings,
    );
    if let RateLimitVerdict::Deny { category, .. } = verdict {
        return deny(&gateway, log, started, GatewayError::RateLimited(category));
    }

    // 6-10. upstream attempts and streaming
    let input_tokens = tokenizer::count_request_tokens(&request);
    log.input_tokens = input_tokens as i64;
    run_attempts(gateway, protocol, request, log, started, input_tokens).await
}

/// Select accounts and call upstream until one commits or attempts are
/// exhausted. Every failed attempt writes its own log row.
async fn run_attempts(
    gateway: Arc<Gateway>,
    protocol: Protocol,
    request: NormalizedRequest,
    log: RequestLog,
    started: Instant,
    input_tokens: u32,
) -> Response {
    let conversation_id = uuid::Uuid::new_v4().to_string();
    let payload =
        build_generation_payload(&request, &conversation_id, gateway.upstream.profile_arn());

    let mut last_error: Option<UpstreamError> = None;

    for attempt in 1..=gateway.max_attempts {
        let mut account = match gateway.pool.get_account().await {
            Some(account) => account,
            None => {
                // force one refresh before giving up
                if let Err(e) = gateway.pool.refresh().await {
                    warn!(error = ?e, "account pool refresh on empty snapshot failed");
                }
                match gateway.pool.get_account().await {
                    Some(account) => account,
                    None => {
                        let err = match last_error.take() {
                            Some(e) => GatewayError::UpstreamExhausted(e.to_string()),
                            None => GatewayError::NoAccount,
                        };
                        return deny(&gateway, log, started, err);
                    }
                }
            }
        };
        metrics::counter!("gateway_upstream_attempts_total", 1);

        // lazy machine id assignment, persisted on first use
        if account.machine_id.is_none() {
            let generated = uuid::Uuid::new_v4().simple().to_string();
            match db::assign_machine_id(&gateway.db, account.id, &generated).await {
                Ok(machine_id) => account.machine_id = Some(machine_id),
                Err(e) => {
                    warn!(account_id = account.id, error = ?e, "machine id assignment failed");
                    account.machine_id = Some(generated);
                }
            }
        }

        // 7. token freshness
        if let Err(e) = gateway.refresher.ensure_fresh(&mut account).await {
            warn!(account_id = account.id, error = %e, "token refresh before call failed");
            log_attempt_failure(&gateway, &log, started, &account, &e.to_string());
            last_error = Some(UpstreamError::Status {
                status: 502,
                body: e.to_string(),
            });
            continue;
        }

        // 8. upstream call, with one in-place retry after a token refresh
        let mut token_retry_done = false;
        let committed = loop {
            match attempt_upstream(&gateway, &account, &payload).await {
                Ok(committed) => break Some(committed),
                Err(e) if e.is_token_error() && !token_retry_done => {
                    token_retry_done = true;
                    info!(account_id = account.id, "401 from upstream, forcing token refresh");
                    match gateway.refresher.force_refresh(&mut account).await {
                        Ok(()) => continue,
                        Err(refresh_err) => {
                            note_account_failure(&gateway, &account, &e).await;
                            log_attempt_failure(
                                &gateway,
                                &log,
                                started,
                                &account,
                                &refresh_err.to_string(),
                            );
                            last_error = Some(e);
                            break None;
                        }
                    }
                }
                Err(e) => {
                    note_account_failure(&gateway, &account, &e).await;
                    log_attempt_failure(&gateway, &log, started, &account, &e.to_string());
                    last_error = Some(e);
                    break None;
                }
            }
        };

        let Some(committed) = committed else {
            debug!(attempt, "upstream attempt failed, trying next account");
            continue;
        };

        // 9-10. translate and respond
        let translator = new_translator(protocol, gateway.strict_sse, &request.model, input_tokens);
        let mut log = log.clone();
        log.account_id = Some(account.id);
        if request.stream {
            return stream_response(gateway, translator, committed, log, started, account.id);
        }
        return buffered_response(gateway, translator, committed, log, started, account.id).await;
    }

    let err = match last_error {
        Some(e) => GatewayError::UpstreamExhausted(e.to_string()),
        None => GatewayError::NoAccount,
    };
    deny(&gateway, log, started, err)
}

/// Dispatch one generation call and read ahead to the first decoded event
/// so immediate in-stream exceptions (e.g. a suspended account) surface as
/// retryable errors instead of committing the response.
async fn attempt_upstream(
    gateway: &Gateway,
    account: &Account,
    payload: &serde_json::Value,
) -> Result<CommittedStream, UpstreamError> {
    let access_token = account.access_token.clone().ok_or(UpstreamError::TokenInvalid)?;
    let machine_id = account.machine_id.clone().unwrap_or_default();

    let response = gateway
        .upstream
        .generate_assistant_response(&access_token, &machine_id, payload)
        .await?;

    let mut stream = response.bytes_stream().boxed();
    let mut parser = EventStreamParser::new();
    let mut pending: Vec<UpstreamEvent> = Vec::new();

    loop {
        match stream.next().await {
            Some(Ok(bytes)) => {
                let frames = parser.feed(&bytes).map_err(|e| UpstreamError::Status {
                    status: 502,
                    body: format!("malformed event stream: {}", e),
                })?;
                for frame in frames {
                    let event = decode_event(&frame).map_err(|e| UpstreamError::Status {
                        status: 502,
                        body: format!("malformed event payload: {}", e),
                    })?;
                    if let Some(event) = event {
                        pending.push(event);
                    }
                }
                if !pending.is_empty() {
                    break;
                }
            }
            Some(Err(e)) => return Err(UpstreamError::Transport(e)),
            // empty stream: commit anyway, the translator synthesizes closure
            None => break,
        }
    }

    if let Some(UpstreamEvent::Exception { kind, message }) = pending.first() {
        return Err(UpstreamError::classify_exception(kind, message));
    }

    Ok(CommittedStream {
        parser,
        pending,
        stream,
    })
}

/// Streaming path: the response body is fed from a spawned pump task.
fn stream_response(
    gateway: Arc<Gateway>,
    translator: Translator,
    committed: CommittedStream,
    log: RequestLog,
    started: Instant,
    account_id: i64,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(64);
    tokio::spawn(pump_stream(
        gateway, translator, committed, tx, log, started, account_id,
    ));

    let body = Body::from_stream(ReceiverStream::new(rx));
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        body,
    )
        .into_response()
}

async fn pump_stream(
    gateway: Arc<Gateway>,
    mut translator: Translator,
    committed: CommittedStream,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
    mut log: RequestLog,
    started: Instant,
    account_id: i64,
) {
    let CommittedStream {
        mut parser,
        pending,
        mut stream,
    } = committed;

    let mut failure: Option<String> = None;
    let mut client_gone = false;

    // helper: translate one event and push its output to the client
    async fn forward(
        translator: &mut Translator,
        event: &UpstreamEvent,
        tx: &mpsc::Sender<Result<Bytes, Infallible>>,
    ) -> Result<bool, String> {
        let out = translator.on_event(event).map_err(|e| e.to_string())?;
        if out.is_empty() {
            return Ok(true);
        }
        Ok(tx.send(Ok(Bytes::from(out))).await.is_ok())
    }

    'outer: {
        for event in &pending {
            if let UpstreamEvent::Exception { kind, message } = event {
                failure = Some(format!("{}: {}", kind, message));
                break 'outer;
            }
            match forward(&mut translator, event, &tx).await {
                Ok(true) => {}
                Ok(false) => {
                    client_gone = true;
                    break 'outer;
                }
                Err(e) => {
                    failure = Some(e);
                    break 'outer;
                }
            }
        }

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    failure = Some(format!("upstream read failed: {}", e));
                    break 'outer;
                }
            };
            let frames = match parser.feed(&bytes) {
                Ok(frames) => frames,
                Err(e) => {
                    failure = Some(format!("malformed event stream: {}", e));
                    break 'outer;
                }
            };
            for frame in frames {
                let event = match decode_event(&frame) {
                    Ok(Some(event)) => event,
                    Ok(None) => continue,
                    Err(e) => {
                        failure = Some(format!("malformed event payload: {}", e));
                        break 'outer;
                    }
                };
                if let UpstreamEvent::Exception { kind, message } = &event {
                    failure = Some(format!("{}: {}", kind, message));
                    break 'outer;
                }
                match forward(&mut translator, &event, &tx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        client_gone = true;
                        break 'outer;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break 'outer;
                    }
                }
            }
            if translator.ended() {
                break;
            }
        }
    }

    if let Some(message) = &failure {
        warn!(account_id, error = %message, "stream failed mid-flight");
        // Anthropic/unified surface an SSE error frame; OpenAI closes.
        if let Some(frame) = translator.error_frame(message) {
            let _ = tx.send(Ok(Bytes::from(frame))).await;
        }
    } else if !client_gone {
        match translator.finish() {
            Ok(out) if !out.is_empty() => {
                let _ = tx.send(Ok(Bytes::from(out))).await;
            }
            Ok(_) => {}
            Err(e) => {
                error!(account_id, error = %e, "translator finish failed");
                failure = Some(e.to_string());
            }
        }
    }
    drop(tx);

    let success = failure.is_none();
    if client_gone {
        // best-effort log for an aborted request
        log.error_message = Some("client disconnected".to_string());
    }
    log.status_code = StatusCode::OK.as_u16() as i32;
    log.is_success = success && !client_gone;
    log.duration_ms = started.elapsed().as_millis() as i64;
    log.output_tokens = translator.output_tokens() as i64;
    log.error_message = failure.or(log.error_message.take());
    finalize_request(&gateway, log, account_id, success).await;
}

/// Non-streaming path: drain the whole upstream stream, then return one
/// JSON body in the requested protocol.
async fn buffered_response(
    gateway: Arc<Gateway>,
    mut translator: Translator,
    committed: CommittedStream,
    mut log: RequestLog,
    started: Instant,
    account_id: i64,
) -> Response {
    let CommittedStream {
        mut parser,
        pending,
        mut stream,
    } = committed;

    let mut failure: Option<String> = None;

    'outer: {
        for event in &pending {
            if let UpstreamEvent::Exception { kind, message } = event {
                failure = Some(format!("{}: {}", kind, message));
                break 'outer;
            }
            if let Err(e) = translator.on_event(event) {
                failure = Some(e.to_string());
                break 'outer;
            }
        }
        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    failure = Some(format!("upstream read failed: {}", e));
                    break 'outer;
                }
            };
            let frames = match parser.feed(&bytes) {
                Ok(frames) => frames,
                Err(e) => {
                    failure = Some(format!("malformed event stream: {}", e));
                    break 'outer;
                }
            };
            for frame in frames {
                match decode_event(&frame) {
                    Ok(Some(UpstreamEvent::Exception { kind, message })) => {
                        failure = Some(format!("{}: {}", kind, message));
                        break 'outer;
                    }
                    Ok(Some(event)) => {
                        if let Err(e) = translator.on_event(&event) {
                            failure = Some(e.to_string());
                            break 'outer;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        failure = Some(format!("malformed event payload: {}", e));
                        break 'outer;
                    }
                }
            }
            if translator.ended() {
                break;
            }
        }
    }

    if let Some(message) = failure {
        log.status_code = StatusCode::BAD_GATEWAY.as_u16() as i32;
        log.duration_ms = started.elapsed().as_millis() as i64;
        log.error_message = Some(message.clone());
        finalize_request(&gateway, log, account_id, false).await;
        return GatewayError::UpstreamExhausted(message).into_response();
    }

    if let Err(e) = translator.finish() {
        let message = e.to_string();
        log.status_code = StatusCode::BAD_GATEWAY.as_u16() as i32;
        log.duration_ms = started.elapsed().as_millis() as i64;
        log.error_message = Some(message.clone());
        finalize_request(&gateway, log, account_id, false).await;
        return GatewayError::UpstreamExhausted(message).into_response();
    }

    log.status_code = StatusCode::OK.as_u16() as i32;
    log.is_success = true;
    log.duration_ms = started.elapsed().as_millis() as i64;
    log.output_tokens = translator.output_tokens() as i64;
    let body = translator.final_body();
    finalize_request(&gateway, log, account_id, true).await;
    Json(body).into_response()
}

/// Enqueue the terminal log row plus the stats/usage counter updates.
async fn finalize_request(gateway: &Gateway, log: RequestLog, account_id: i64, success: bool) {
    gateway.writeback.enqueue_write(WriteOp::StatsUpdate {
        account_id,
        success,
    });
    if let Some(user_id) = log.user_id {
        if log.input_tokens > 0 || log.output_tokens > 0 {
            gateway.writeback.enqueue_write(WriteOp::TokenUsage {
                user_id,
                input_tokens: log.input_tokens,
                output_tokens: log.output_tokens,
            });
        }
    }
    if gateway.settings.get().await.enable_request_log {
        gateway.writeback.enqueue_log(log);
    }
}

/// Flip account status per the upstream failure signature and invalidate
/// the pool so the next selection skips it.
async fn note_account_failure(gateway: &Gateway, account: &Account, err: &UpstreamError) {
    let new_status = match err {
        UpstreamError::Suspended => Some(AccountStatus::Suspended),
        UpstreamError::QuotaExceeded => Some(AccountStatus::QuotaExhausted),
        UpstreamError::TokenInvalid | UpstreamError::TokenExpired => {
            Some(AccountStatus::ExpiredToken)
        }
        _ => None,
    };
    if let Some(status) = new_status {
        warn!(account_id = account.id, status = status.as_str(), "flipping account status");
        if let Err(e) = db::update_account_status(&gateway.db, account.id, status).await {
            error!(account_id = account.id, error = ?e, "account status update failed");
        }
        gateway.pool.invalidate();
    }
    gateway.writeback.enqueue_write(WriteOp::StatsUpdate {
        account_id: account.id,
        success: false,
    });
}

/// Log row for one failed upstream attempt.
fn log_attempt_failure(
    gateway: &Gateway,
    base: &RequestLog,
    started: Instant,
    account: &Account,
    message: &str,
) {
    let mut log = base.clone();
    log.id = ulid::Ulid::new().to_string();
    log.account_id = Some(account.id);
    log.status_code = StatusCode::BAD_GATEWAY.as_u16() as i32;
    log.is_success = false;
    log.duration_ms = started.elapsed().as_millis() as i64;
    log.error_message = Some(message.to_string());
    gateway.writeback.enqueue_log(log);
}

/// Short-circuit denial: log the refusal and convert it to a response.
fn deny(gateway: &Gateway, mut log: RequestLog, started: Instant, err: GatewayError) -> Response {
    log.status_code = err.status().as_u16() as i32;
    log.is_success = false;
    log.duration_ms = started.elapsed().as_millis() as i64;
    log.error_message = Some(err.to_string());
    gateway.writeback.enqueue_log(log);
    metrics::counter!("gateway_denials_total", 1, "code" => err.code());
    err.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_map_parsing() {
        let map: HashMap<String, String> = "claude-3-opus=claude-sonnet-4, a=b"
            .split(',')
            .filter_map(|pair| {
                let (from, to) = pair.split_once('=')?;
                Some((from.trim().to_string(), to.trim().to_string()))
            })
            .collect();
        assert_eq!(map.get("claude-3-opus").unwrap(), "claude-sonnet-4");
        assert_eq!(map.get("a").unwrap(), "b");
    }

    #[test]
    fn protocol_endpoint_types() {
        assert_eq!(Protocol::Anthropic.endpoint_type(), EndpointType::Claude);
        assert_eq!(Protocol::Unified.endpoint_type(), EndpointType::Claude);
        assert_eq!(Protocol::OpenAi.endpoint_type(), EndpointType::Openai);
    }
}
