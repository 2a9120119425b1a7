//! `POST /v1/chat/completions` (OpenAI surface).

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
    models::ChatCompletionsRequest,
    util,
};

pub async fn chat_completions(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionsRequest>,
) -> Response {
    let client_ip = util::extract_client_ip(&headers, Some(&addr.ip().to_string()));
    coordinator::handle_chat(
        gateway,
        Protocol::OpenAi,
        headers,
        client_ip,
        "/v1/chat/completions",
        body.normalize(),
    )
    .await
}
