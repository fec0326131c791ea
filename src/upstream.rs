use crate::config::ProviderEndpointConfig;
use crate::error::{GatewayError, GatewayResult};
use axum::http::StatusCode;
use serde_json::{Map, Value};
use std::time::Duration;

/// One OpenAI-compatible chat completion upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl Endpoint {
    pub fn from_config(config: &ProviderEndpointConfig) -> Self {
        let headers = config
            .api_key
            .as_ref()
            .map(|key| vec![("Authorization".to_string(), format!("Bearer {key}"))])
            .unwrap_or_default();
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            headers,
        }
    }
}

/// Weighted coin flip between two endpoints, drawn fresh per request.
#[derive(Debug, Clone)]
pub struct ProviderSelector {
    ratio: f64,
    primary: Endpoint,
    fallback: Endpoint,
}

impl ProviderSelector {
    pub fn new(ratio: f64, primary: Endpoint, fallback: Endpoint) -> Self {
        Self {
            ratio: ratio.clamp(0.0, 1.0),
            primary,
            fallback,
        }
    }

    pub fn select(&self) -> &Endpoint {
        self.select_with(random_unit())
    }

    pub fn select_with(&self, draw: f64) -> &Endpoint {
        if draw < self.ratio {
            &self.primary
        } else {
            &self.fallback
        }
    }
}

/// Uniform in `[0, 1)` from the 53 low random bits of a v4 uuid.
fn random_unit() -> f64 {
    const MANTISSA: u64 = 1 << 53;
    let bits = (uuid::Uuid::new_v4().as_u128() as u64) & (MANTISSA - 1);
    bits as f64 / MANTISSA as f64
}

fn build_request(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    body: &Map<String, Value>,
) -> reqwest::RequestBuilder {
    let mut req = client.post(&endpoint.url).json(body);
    for (name, value) in &endpoint.headers {
        req = req.header(name.as_str(), value.as_str());
    }
    req
}

fn map_send_error(endpoint: &Endpoint, err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::UpstreamTimeout(format!("{}: {err}", endpoint.name))
    } else {
        GatewayError::UpstreamUnavailable(format!("{}: {err}", endpoint.name))
    }
}

fn status_of(resp: &reqwest::Response) -> StatusCode {
    StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Buffered call: one POST, upstream status and JSON body returned verbatim.
pub async fn forward(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    body: &Map<String, Value>,
    timeout_ms: u64,
) -> GatewayResult<(StatusCode, Value)> {
    let resp = build_request(client, endpoint, body)
        .timeout(Duration::from_millis(timeout_ms))
        .send()
        .await
        .map_err(|err| map_send_error(endpoint, err))?;
    let status = status_of(&resp);
    let text = resp
        .text()
        .await
        .map_err(|err| map_send_error(endpoint, err))?;
    let value: Value = serde_json::from_str(&text).map_err(|err| {
        GatewayError::UpstreamUnavailable(format!(
            "{} returned a non-JSON body with status {status}: {err}",
            endpoint.name
        ))
    })?;
    Ok((status, value))
}

/// Opens a streamed call. The timeout bounds only the wait for response
/// headers; the body is read for as long as upstream keeps sending.
pub async fn open_stream(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    body: &Map<String, Value>,
    timeout_ms: u64,
) -> GatewayResult<(StatusCode, reqwest::Response)> {
    let send = build_request(client, endpoint, body).send();
    let resp = tokio::time::timeout(Duration::from_millis(timeout_ms), send)
        .await
        .map_err(|_| {
            GatewayError::UpstreamTimeout(format!(
                "{} did not respond within {timeout_ms}ms",
                endpoint.name
            ))
        })?
        .map_err(|err| map_send_error(endpoint, err))?;
    Ok((status_of(&resp), resp))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str) -> Endpoint {
        Endpoint {
            name: name.to_string(),
            url: format!("http://{name}.invalid/v1/chat/completions"),
            headers: Vec::new(),
        }
    }

    #[test]
    fn ratio_split_is_close_to_configured() {
        let selector = ProviderSelector::new(0.5, endpoint("primary"), endpoint("fallback"));
        let trials = 10_000;
        let primary = (0..trials)
            .filter(|_| selector.select().name == "primary")
            .count();
        let freq = primary as f64 / trials as f64;
        assert!((freq - 0.5).abs() <= 0.02, "primary frequency {freq}");
    }

    #[test]
    fn draw_boundaries() {
        let selector = ProviderSelector::new(0.25, endpoint("primary"), endpoint("fallback"));
        assert_eq!(selector.select_with(0.0).name, "primary");
        assert_eq!(selector.select_with(0.25).name, "fallback");
        let never = ProviderSelector::new(0.0, endpoint("primary"), endpoint("fallback"));
        assert_eq!(never.select_with(0.0).name, "fallback");
        let always = ProviderSelector::new(1.0, endpoint("primary"), endpoint("fallback"));
        assert_eq!(always.select_with(0.999_999).name, "primary");
    }

    #[test]
    fn random_unit_stays_in_range() {
        for _ in 0..1000 {
            let u = random_unit();
            assert!((0.0..1.0).contains(&u));
        }
    }

    #[test]
    fn api_key_becomes_bearer_header() {
        let with_key = Endpoint::from_config(&ProviderEndpointConfig {
            name: "p".into(),
            url: "http://p/v1/chat/completions".into(),
            api_key: Some("k".into()),
        });
        assert_eq!(
            with_key.headers,
            vec![("Authorization".to_string(), "Bearer k".to_string())]
        );
        let without = Endpoint::from_config(&ProviderEndpointConfig {
            name: "f".into(),
            url: "http://f/v1/chat/completions".into(),
            api_key: None,
        });
        assert!(without.headers.is_empty());
    }

    #[tokio::test]
    async fn connection_refused_is_upstream_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let target = Endpoint {
            name: "down".into(),
            url: format!("http://{addr}/v1/chat/completions"),
            headers: Vec::new(),
        };
        let err = forward(&reqwest::Client::new(), &target, &Map::new(), 2_000)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnavailable(_)));
    }
}
