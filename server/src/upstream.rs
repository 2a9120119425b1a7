//! HTTP client for the Amazon Q (Kiro) upstream.
//!
//! Covers the four consumed interfaces: `GenerateAssistantResponse`
//! (EventStream body), `GetUsageLimits`, the OIDC token refresh, and the
//! social-login token refresh. Upstream failures are classified into the
//! four signatures the coordinator acts on.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::models::{NormalizedRequest, Role};

const TARGET_GENERATE: &str = "AmazonCodeWhispererStreamingService.GenerateAssistantResponse";
const TARGET_USAGE_LIMITS: &str = "AmazonCodeWhispererService.GetUsageLimits";

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// CodeWhisperer service endpoint.
    pub base_url: String,
    /// OIDC token endpoint base.
    pub oidc_url: String,
    /// Refresh endpoint for social-login accounts.
    pub social_refresh_url: String,
    pub profile_arn: Option<String>,
    pub connect_timeout: Duration,
    /// Applies to unary calls only; streaming reads have no overall deadline.
    pub request_timeout: Duration,
}

impl UpstreamConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("KIRO_BASE_URL").unwrap_or_else(|_| {
                "https://codewhisperer.us-east-1.amazonaws.com".to_string()
            }),
            oidc_url: std::env::var("KIRO_OIDC_URL")
                .unwrap_or_else(|_| "https://oidc.us-east-1.amazonaws.com".to_string()),
            social_refresh_url: std::env::var("KIRO_SOCIAL_REFRESH_URL").unwrap_or_else(|_| {
                "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken".to_string()
            }),
            profile_arn: std::env::var("KIRO_PROFILE_ARN").ok(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// The four upstream failure signatures the coordinator distinguishes,
/// plus transport and uncategorized status failures.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream account suspended")]
    Suspended,

    #[error("upstream quota exceeded")]
    QuotaExceeded,

    #[error("access token invalid")]
    TokenInvalid,

    #[error("access token expired")]
    TokenExpired,

    #[error("upstream status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream transport: {0}")]
    Transport(#[from] reqwest::Error),
}

impl UpstreamError {
    pub fn is_token_error(&self) -> bool {
        matches!(self, UpstreamError::TokenInvalid | UpstreamError::TokenExpired)
    }

    /// Map an HTTP error response to a failure signature.
    pub fn classify_response(status: StatusCode, body: &str) -> UpstreamError {
        let lower = body.to_ascii_lowercase();
        match status {
            StatusCode::FORBIDDEN if lower.contains("suspended") => UpstreamError::Suspended,
            StatusCode::TOO_MANY_REQUESTS => UpstreamError::QuotaExceeded,
            StatusCode::UNAUTHORIZED if lower.contains("expired") => UpstreamError::TokenExpired,
            StatusCode::UNAUTHORIZED => UpstreamError::TokenInvalid,
            other => UpstreamError::Status {
                status: other.as_u16(),
                body: body.chars().take(512).collect(),
            },
        }
    }

    /// Map an in-stream exception frame to a failure signature.
    pub fn classify_exception(kind: &str, message: &str) -> UpstreamError {
        let text = format!("{} {}", kind, message).to_ascii_lowercase();
        if text.contains("suspended") {
            UpstreamError::Suspended
        } else if text.contains("throttl") || text.contains("quota") || text.contains("limit exceeded")
        {
            UpstreamError::QuotaExceeded
        } else if text.contains("expired") {
            UpstreamError::TokenExpired
        } else if text.contains("unauthorized") || text.contains("invalid token") {
            UpstreamError::TokenInvalid
        } else {
            UpstreamError::Status {
                status: 502,
                body: format!("{}: {}", kind, message),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

// Typed GetUsageLimits response (the consumed subset).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimitsResponse {
    #[serde(default)]
    pub subscription_info: Option<SubscriptionInfo>,
    #[serde(default)]
    pub usage_breakdown_list: Vec<UsageBreakdown>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub subscription_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBreakdown {
    #[serde(default)]
    pub current_usage_with_precision: f64,
    #[serde(default)]
    pub usage_limit_with_precision: f64,
    #[serde(default)]
    pub free_trial_info: Option<FreeTrialInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreeTrialInfo {
    #[serde(default)]
    pub current_usage_with_precision: f64,
    #[serde(default)]
    pub usage_limit: f64,
    #[serde(default)]
    pub free_trial_expiry: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OidcTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SocialRefreshResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct UpstreamClient {
    http: reqwest::Client,
    /// Separate client with a hard deadline for unary calls.
    unary: reqwest::Client,
    cfg: UpstreamConfig,
}

impl UpstreamClient {
    pub fn new(cfg: UpstreamConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(cfg.connect_timeout)
            .build()?;
        let unary = reqwest::Client::builder()
            .connect_timeout(cfg.connect_timeout)
            .timeout(cfg.request_timeout)
            .build()?;
        Ok(Self { http, unary, cfg })
    }

    /// Dispatch a generation request. The returned response body is raw
    /// AWS EventStream framing; callers consume it via `bytes_stream`.
    pub async fn generate_assistant_response(
        &self,
        access_token: &str,
        machine_id: &str,
        body: &Value,
    ) -> Result<reqwest::Response, UpstreamError> {
        let response = self
            .http
            .post(&self.cfg.base_url)
            .header("X-Amz-Target", TARGET_GENERATE)
            .header("Content-Type", "application/x-amz-json-1.0")
            .header("x-amzn-codewhisperer-machine-id", machine_id)
            .bearer_auth(access_token)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::classify_response(status, &body));
        }
        Ok(response)
    }

    pub async fn get_usage_limits(
        &self,
        access_token: &str,
        machine_id: &str,
    ) -> Result<UsageLimitsResponse, UpstreamError> {
        let response = self
            .unary
            .post(&self.cfg.base_url)
            .header("X-Amz-Target", TARGET_USAGE_LIMITS)
            .header("Content-Type", "application/x-amz-json-1.0")
            .header("x-amzn-codewhisperer-machine-id", machine_id)
            .bearer_auth(access_token)
            .json(&json!({ "resourceType": "AGENTIC_REQUEST" }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::classify_response(status, &body));
        }
        Ok(response.json().await?)
    }

    /// OIDC-style refresh for SSO accounts.
    pub async fn refresh_access_token(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
        machine_id: &str,
    ) -> Result<TokenPair, UpstreamError> {
        let url = format!("{}/token", self.cfg.oidc_url.trim_end_matches('/'));
        let response = self
            .unary
            .post(url)
            .header("x-amzn-codewhisperer-machine-id", machine_id)
            .json(&json!({
                "clientId": client_id,
                "clientSecret": client_secret,
                "refreshToken": refresh_token,
                "grantType": "refresh_token",
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::classify_response(status, &body));
        }
        let body: OidcTokenResponse = response.json().await?;
        Ok(TokenPair {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
        })
    }

    /// Refresh for accounts onboarded through social login.
    pub async fn refresh_social_token(
        &self,
        refresh_token: &str,
        machine_id: &str,
    ) -> Result<TokenPair, UpstreamError> {
        let response = self
            .unary
            .post(&self.cfg.social_refresh_url)
            .json(&json!({
                "refreshToken": refresh_token,
                "machineId": machine_id,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::classify_response(status, &body));
        }
        let body: SocialRefreshResponse = response.json().await?;
        match (body.success, body.access_token) {
            (true, Some(access_token)) => Ok(TokenPair {
                access_token,
                refresh_token: body.refresh_token,
            }),
            _ => Err(UpstreamError::Status {
                status: 502,
                body: body
                    .error
                    .unwrap_or_else(|| "social refresh rejected".to_string()),
            }),
        }
    }

    pub fn profile_arn(&self) -> Option<&str> {
        self.cfg.profile_arn.as_deref()
    }
}

/// Translate a normalized client request into the Kiro generation payload:
/// role mapping into history turns, the system prompt threaded into the
/// first user message, and tool schemas in the current message context.
pub fn build_generation_payload(
    request: &NormalizedRequest,
    conversation_id: &str,
    profile_arn: Option<&str>,
) -> Value {
    let mut turns: Vec<Value> = Vec::new();
    let mut system_pending = request.system.clone();

    for message in &request.messages {
        match message.role {
            Role::User => {
                let mut content = message.content.clone();
                if let Some(system) = system_pending.take() {
                    content = if content.is_empty() {
                        system
                    } else {
                        format!("{}\n\n{}", system, content)
                    };
                }
                let mut user_message = json!({
                    "content": content,
                    "origin": "AI_EDITOR",
                });
                if !message.tool_results.is_empty() {
                    user_message["userInputMessageContext"] = json!({
                        "toolResults": message
                            .tool_results
                            .iter()
                            .map(|r| json!({
                                "toolUseId": r.tool_use_id,
                                "status": "success",
                                "content": [{"text": r.content}],
                            }))
                            .collect::<Vec<_>>(),
                    });
                }
                turns.push(json!({ "userInputMessage": user_message }));
            }
            Role::Assistant => {
                turns.push(json!({
                    "assistantResponseMessage": { "content": message.content }
                }));
            }
        }
    }

    // A leftover system prompt means there was no user turn to thread it
    // into; synthesize one so the upstream still sees it.
    if let Some(system) = system_pending.take() {
        turns.push(json!({
            "userInputMessage": { "content": system, "origin": "AI_EDITOR" }
        }));
    }

    // The trailing turn is the current message; everything before it is
    // history. The upstream rejects an assistant-final history, so fall
    // back to an empty user turn in that degenerate case.
    let last_is_user = turns
        .last()
        .map(|turn| turn.get("userInputMessage").is_some())
        .unwrap_or(false);
    let current = if last_is_user {
        turns.pop().expect("checked non-empty")
    } else {
        json!({ "userInputMessage": { "content": "", "origin": "AI_EDITOR" } })
    };

    let mut current_user = current["userInputMessage"].clone();
    current_user["modelId"] = json!(request.model);
    let mut context = current_user
        .get("userInputMessageContext")
        .cloned()
        .unwrap_or_else(|| json!({}));
    if !request.tools.is_empty() {
        context["tools"] = json!(request
            .tools
            .iter()
            .map(|t| json!({
                "toolSpecification": {
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": { "json": t.input_schema },
                }
            }))
            .collect::<Vec<_>>());
    }
    current_user["userInputMessageContext"] = context;

    let mut payload = json!({
        "conversationState": {
            "chatTriggerType": "MANUAL",
            "conversationId": conversation_id,
            "currentMessage": { "userInputMessage": current_user },
            "history": turns,
        }
    });
    if let Some(arn) = profile_arn {
        payload["profileArn"] = json!(arn);
    }
    payload
}
