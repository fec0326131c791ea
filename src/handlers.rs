use crate::app::AppState;
use crate::auth::Identity;
use crate::error::{AppError, AppResult, GatewayError};
use crate::middleware::client_ip;
use crate::normalize::{CompletionRequest, normalize};
use crate::pricing::UsageRecord;
use crate::relay::{RelayContext, relay};
use crate::upstream;
use crate::users::current_period_start;
use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{Extensions, HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

const DEFAULT_RATE_LIMIT_KEY: &str = "default";

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn root() -> impl IntoResponse {
    Json(json!({
        "title": "llmgate",
        "description": "OpenAI-compatible chat completion gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Lifetime token sums for the target model, in exposition format.
pub async fn metrics_app(State(state): State<AppState>) -> AppResult<Response> {
    let model = state.config.target_model.as_str();
    let totals = state
        .usage
        .usage_by_model(model)
        .await
        .map_err(GatewayError::internal)?;
    let body = format!(
        "llm_proxy_llm_prompt_tokens_grand_sum{{model_name=\"{model}\"}} {}\n\
         llm_proxy_llm_completion_tokens_grand_sum{{model_name=\"{model}\"}} {}\n\
         llm_proxy_llm_total_tokens_grand_sum{{model_name=\"{model}\"}} {}\n",
        totals.prompt_tokens, totals.completion_tokens, totals.total_tokens
    );
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

pub async fn get_user(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    let authed = state.auth.authenticate(credential(&headers)).await?;
    let uid = authed.identity.uid;
    let user = state
        .users
        .get_user(&uid)
        .await
        .map_err(GatewayError::internal)?
        .ok_or_else(|| GatewayError::NotFound(format!("user {uid}")))?;
    let period_start = current_period_start(user.created_at, chrono::Utc::now());
    let usage = state
        .usage
        .usage_by_user(&uid, None, period_start)
        .await
        .map_err(GatewayError::internal)?;
    Ok(Json(json!({
        "uid": uid,
        "email": user.email,
        "user_role": user.user_role,
        "created_at": user.created_at,
        "period_start": period_start,
        "usage": usage,
    }))
    .into_response())
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Result<Json<CompletionRequest>, JsonRejection>,
) -> AppResult<Response> {
    let authed = state.auth.authenticate(credential(&headers)).await?;
    if authed.rate_limited {
        let key = client_ip(&headers, &extensions)
            .unwrap_or_else(|| DEFAULT_RATE_LIMIT_KEY.to_string());
        state.rate_limiter.check(&key).await?;
    }
    let Json(request) = body.map_err(|rej| GatewayError::Validation(rej.body_text()))?;

    let normalized = normalize(&request, &state.config.target_model);
    let endpoint = state.selector.select().clone();
    tracing::debug!(
        uid = %authed.identity.uid,
        provider = %endpoint.name,
        stream = request.stream,
        "forwarding chat completion"
    );

    if request.stream {
        return stream_completion(&state, authed.identity, &endpoint, &request, normalized).await;
    }

    let (status, body) = upstream::forward(
        &state.http,
        &endpoint,
        &normalized,
        state.config.upstream_timeout_ms,
    )
    .await?;
    let model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or(state.config.target_model.as_str())
        .to_string();
    let usage = body
        .get("usage")
        .and_then(|u| UsageRecord::from_usage_value(model.clone(), u))
        .unwrap_or_else(|| UsageRecord::new(model, 0, 0));
    state
        .accountant
        .account(&authed.identity, &endpoint.name, &usage)
        .await;
    Ok((status, Json(body)).into_response())
}

async fn stream_completion(
    state: &AppState,
    identity: Identity,
    endpoint: &upstream::Endpoint,
    request: &CompletionRequest,
    normalized: serde_json::Map<String, serde_json::Value>,
) -> AppResult<Response> {
    let (status, resp) = upstream::open_stream(
        &state.http,
        endpoint,
        &normalized,
        state.config.upstream_timeout_ms,
    )
    .await?;
    let ctx = RelayContext {
        identity,
        provider: endpoint.name.clone(),
        model: state.config.target_model.clone(),
        prompt_estimate: request.estimated_prompt_tokens(),
    };
    let (lines, _accounting) = relay(resp.bytes_stream(), ctx, state.accountant.clone());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(lines))
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal error",
            )
            .with_detail(err.to_string())
        })
}

fn credential(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}
