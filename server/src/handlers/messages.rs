//! `POST /v1/messages` (Anthropic surface) and `POST /v1/unified`
//! (same request shape, unified SSE framing).

use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::Response,
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::{
    coordinator::{self, Gateway, Protocol},
    models::AnthropicRequest,
    util,
};

pub async fn messages(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<AnthropicRequest>,
) -> Response {
    let client_ip = util::extract_client_ip(&headers, Some(&addr.ip().to_string()));
    coordinator::handle_chat(
        gateway,
        Protocol::Anthropic,
        headers,
        client_ip,
        "/v1/messages",
        body.normalize(),
    )
    .await
}

pub async fn unified(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<AnthropicRequest>,
) -> Response {
    let client_ip = util::extract_client_ip(&headers, Some(&addr.ip().to_string()));
    coordinator::handle_chat(
        gateway,
        Protocol::Unified,
        headers,
        client_ip,
        "/v1/unified",
        body.normalize(),
    )
    .await
}
