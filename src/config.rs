use crate::error::AppError;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TARGET_MODEL: &str = "mistralai/Mistral-7B-Instruct-v0.1";
pub const DEFAULT_DEMO_API_KEY: &str = "Bearer demo-api-key";

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    ApiKey,
    Session,
}

impl AuthMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "api_key" | "apikey" | "api-key" => Some(Self::ApiKey),
            "session" => Some(Self::Session),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite(String),
}

#[derive(Debug, Clone)]
pub struct ProviderEndpointConfig {
    pub name: String,
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub jwt_secret: Option<String>,
    pub remote_url: Option<String>,
    pub project_id: Option<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub credential: String,
    pub email: String,
    pub max_calls_per_hour: u64,
}

#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub write_key: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: String,
    pub metrics_path: String,
    pub allowed_origins: Vec<String>,
    pub store: StoreBackend,
    pub auth_mode: AuthMode,
    pub session: SessionConfig,
    pub demo: DemoConfig,
    pub target_model: String,
    pub provider_ratio: f64,
    pub primary: ProviderEndpointConfig,
    pub fallback: ProviderEndpointConfig,
    pub upstream_timeout_ms: u64,
    pub analytics: AnalyticsConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".to_string(),
            metrics_path: "/metrics".to_string(),
            allowed_origins: vec!["*".to_string()],
            store: StoreBackend::Sqlite("sqlite://./data/llmgate.db".to_string()),
            auth_mode: AuthMode::ApiKey,
            session: SessionConfig::default(),
            demo: DemoConfig {
                credential: DEFAULT_DEMO_API_KEY.to_string(),
                email: "demo@llmgate.local".to_string(),
                max_calls_per_hour: 4,
            },
            target_model: DEFAULT_TARGET_MODEL.to_string(),
            provider_ratio: 0.5,
            primary: ProviderEndpointConfig {
                name: "anyscale".to_string(),
                url: "https://api.endpoints.anyscale.com/v1/chat/completions".to_string(),
                api_key: None,
            },
            fallback: ProviderEndpointConfig {
                name: "self-hosted".to_string(),
                url: chat_completions_url("http://127.0.0.1:8000/v1/"),
                api_key: None,
            },
            upstream_timeout_ms: 30_000,
            analytics: AnalyticsConfig {
                write_key: None,
                url: "https://api.segment.io/v1/track".to_string(),
            },
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source; empty
    /// values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let auth_mode = match var("GATEWAY_AUTH_MODE") {
            Some(raw) => AuthMode::parse(&raw).ok_or_else(|| {
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "auth_mode_invalid",
                    format!("unknown GATEWAY_AUTH_MODE: {raw}"),
                )
            })?,
            None => defaults.auth_mode,
        };

        let store = match var("GATEWAY_DATABASE_DSN").or_else(|| var("DATABASE_URL")) {
            Some(dsn) if dsn.trim() == "memory" => StoreBackend::Memory,
            Some(dsn) => StoreBackend::Sqlite(dsn.trim().to_string()),
            None => defaults.store,
        };

        let allowed_origins = var("ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.allowed_origins);

        let provider_ratio =
            parse_or_default("PROVIDER_RATIO", var("PROVIDER_RATIO"), defaults.provider_ratio)
                .clamp(0.0, 1.0);

        let fallback_url = var("LLM_BASE_URL")
            .map(|base| chat_completions_url(&base))
            .unwrap_or(defaults.fallback.url);

        Ok(Self {
            listen: var("GATEWAY_LISTEN").unwrap_or(defaults.listen),
            metrics_path: var("GATEWAY_METRICS_PATH").unwrap_or(defaults.metrics_path),
            allowed_origins,
            store,
            auth_mode,
            session: SessionConfig {
                jwt_secret: var("GATEWAY_SESSION_JWT_SECRET"),
                remote_url: var("GATEWAY_SESSION_URL"),
                project_id: var("GATEWAY_SESSION_PROJECT_ID"),
                secret: var("GATEWAY_SESSION_SECRET"),
            },
            demo: DemoConfig {
                credential: var("GATEWAY_DEMO_API_KEY").unwrap_or(defaults.demo.credential),
                email: var("GATEWAY_DEMO_EMAIL").unwrap_or(defaults.demo.email),
                max_calls_per_hour: parse_or_default(
                    "GATEWAY_DEMO_MAX_CALLS_PER_HOUR",
                    var("GATEWAY_DEMO_MAX_CALLS_PER_HOUR"),
                    defaults.demo.max_calls_per_hour,
                ),
            },
            target_model: var("GATEWAY_TARGET_MODEL").unwrap_or(defaults.target_model),
            provider_ratio,
            primary: ProviderEndpointConfig {
                name: var("PRIMARY_LLM_NAME").unwrap_or(defaults.primary.name),
                url: var("PRIMARY_LLM_URL").unwrap_or(defaults.primary.url),
                api_key: var("PRIMARY_LLM_API_KEY").or_else(|| var("ANYSCALE_LLM_API_KEY")),
            },
            fallback: ProviderEndpointConfig {
                name: var("FALLBACK_LLM_NAME").unwrap_or(defaults.fallback.name),
                url: fallback_url,
                api_key: var("FALLBACK_LLM_API_KEY"),
            },
            upstream_timeout_ms: parse_or_default(
                "GATEWAY_UPSTREAM_TIMEOUT_MS",
                var("GATEWAY_UPSTREAM_TIMEOUT_MS"),
                defaults.upstream_timeout_ms,
            )
            .max(1),
            analytics: AnalyticsConfig {
                write_key: var("SEGMENT_WRITE_KEY"),
                url: var("SEGMENT_URL").unwrap_or(defaults.analytics.url),
            },
        })
    }
}

fn parse_or_default<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match raw {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring invalid value for {key}: {raw}");
            default
        }),
        None => default,
    }
}

/// `http://host/v1/` and `http://host/v1` both become `http://host/v1/chat/completions`.
pub fn chat_completions_url(base: &str) -> String {
    format!("{}/chat/completions", base.trim().trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = GatewayConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.auth_mode, AuthMode::ApiKey);
        assert_eq!(cfg.demo.credential, "Bearer demo-api-key");
        assert_eq!(cfg.demo.max_calls_per_hour, 4);
        assert_eq!(cfg.provider_ratio, 0.5);
        assert_eq!(cfg.target_model, DEFAULT_TARGET_MODEL);
        assert!(cfg.analytics.write_key.is_none());
    }

    #[test]
    fn overrides_and_fallbacks() {
        let cfg = GatewayConfig::from_lookup(lookup(&[
            ("GATEWAY_AUTH_MODE", "session"),
            ("PROVIDER_RATIO", "1.7"),
            ("GATEWAY_DEMO_MAX_CALLS_PER_HOUR", "not-a-number"),
            ("LLM_BASE_URL", "http://10.0.0.1/v1/"),
            ("GATEWAY_DATABASE_DSN", "memory"),
            ("GATEWAY_LISTEN", "   "),
        ]))
        .unwrap();
        assert_eq!(cfg.auth_mode, AuthMode::Session);
        assert_eq!(cfg.provider_ratio, 1.0);
        assert_eq!(cfg.demo.max_calls_per_hour, 4);
        assert_eq!(cfg.fallback.url, "http://10.0.0.1/v1/chat/completions");
        assert_eq!(cfg.store, StoreBackend::Memory);
        assert_eq!(cfg.listen, "0.0.0.0:5000");
    }

    #[test]
    fn unknown_auth_mode_is_rejected() {
        let err = GatewayConfig::from_lookup(lookup(&[("GATEWAY_AUTH_MODE", "magic")]))
            .unwrap_err();
        assert_eq!(err.code, "auth_mode_invalid");
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
