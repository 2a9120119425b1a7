//! `POST /v1/messages/count_tokens`: input-token counting without an
//! upstream call. Authentication applies; rate limits do not.

use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::{coordinator::Gateway, models::AnthropicRequest, tokenizer};

pub async fn count_tokens(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(body): Json<AnthropicRequest>,
) -> Response {
    if let Err(err) = gateway.auth.authenticate(&headers).await {
        return err.into_response();
    }
    let request = body.normalize();
    let input_tokens = tokenizer::count_request_tokens(&request);
    Json(json!({ "input_tokens": input_tokens })).into_response()
}
