use axum::extract::{ConnectInfo, MatchedPath, Request};
use axum::http::{Extensions, HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use std::time::Instant;

pub const PROCESS_TIME_HEADER: &str = "x-process-time";

/// First hop of `x-forwarded-for`, then `x-real-ip`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return Some(ip.to_string());
    }
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return Some(ip.to_string());
    }
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// Request logging, request metrics and the `x-process-time` header.
/// Requests that matched no route are passed through untracked.
pub async fn track_requests(req: Request, next: Next) -> Response {
    let Some(path_template) = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
    else {
        return next.run(req).await;
    };
    let method = req.method().to_string();
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let ip = client_ip(req.headers(), req.extensions()).unwrap_or_default();

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path_template,
        client_ip = %ip,
        "request started"
    );
    metrics::counter!(
        "llm_proxy_requests_total",
        "method" => method.clone(),
        "path_template" => path_template.clone()
    )
    .increment(1);

    let started = Instant::now();
    let mut response = next.run(req).await;
    let elapsed = started.elapsed();
    let status = response.status();
    let status_code = status.as_u16().to_string();

    metrics::histogram!(
        "llm_proxy_requests_processing_time_seconds",
        "method" => method.clone(),
        "path_template" => path_template.clone()
    )
    .record(elapsed.as_secs_f64());
    metrics::counter!(
        "llm_proxy_responses_total",
        "method" => method.clone(),
        "path_template" => path_template.clone(),
        "status_code" => status_code.clone()
    )
    .increment(1);
    if status.is_client_error() || status.is_server_error() {
        metrics::counter!(
            "llm_proxy_exceptions_total",
            "method" => method.clone(),
            "path_template" => path_template.clone(),
            "status_code" => status_code
        )
        .increment(1);
    }

    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    if status.is_server_error() {
        tracing::error!(
            request_id = %request_id,
            path = %path_template,
            status = status.as_u16(),
            duration_ms = elapsed_ms,
            "request failed"
        );
    } else {
        tracing::info!(
            request_id = %request_id,
            path = %path_template,
            status = status.as_u16(),
            duration_ms = elapsed_ms,
            "request completed"
        );
    }

    if let Ok(value) = HeaderValue::from_str(&format!("{elapsed_ms:.3}")) {
        response.headers_mut().insert(PROCESS_TIME_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_header_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        assert_eq!(
            client_ip(&headers, &extensions).as_deref(),
            Some("203.0.113.9")
        );
        headers.remove("x-forwarded-for");
        assert_eq!(client_ip(&headers, &extensions).as_deref(), Some("10.0.0.2"));
        headers.remove("x-real-ip");
        assert_eq!(client_ip(&headers, &extensions).as_deref(), Some("127.0.0.1"));
        assert_eq!(client_ip(&headers, &Extensions::new()), None);
    }
}
