use crate::accounting::{UsageAccountant, analytics_sink_from_config};
use crate::auth::{ApiKeyAuthenticator, AuthGate, Authenticator, SessionAuthenticator};
use crate::config::{AuthMode, GatewayConfig, StoreBackend};
use crate::error::{AppError, AppResult};
use crate::rate_limit::RateLimiter;
use crate::store::{MemoryDocumentStore, SharedStore, SqliteDocumentStore};
use crate::upstream::{Endpoint, ProviderSelector};
use crate::users::{UsageStore, UserStore};
use axum::Router;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub store: SharedStore,
    pub auth: AuthGate,
    pub rate_limiter: RateLimiter,
    pub selector: Arc<ProviderSelector>,
    pub users: UserStore,
    pub usage: UsageStore,
    pub accountant: UsageAccountant,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_config(GatewayConfig::from_env()?).await
}

pub async fn load_state_with_config(config: GatewayConfig) -> AppResult<AppState> {
    let store: SharedStore = match &config.store {
        StoreBackend::Memory => Arc::new(MemoryDocumentStore::new()),
        StoreBackend::Sqlite(dsn) => Arc::new(SqliteDocumentStore::new(dsn).await.map_err(
            |err| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "database_init_failed", err),
        )?),
    };
    load_state_with_store(config, store).await
}

/// Wires every service on top of an already opened store.
pub async fn load_state_with_store(config: GatewayConfig, store: SharedStore) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("llmgate/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let users = UserStore::new(store.clone());
    let usage = UsageStore::new(store.clone());

    let authenticator: Arc<dyn Authenticator> = match config.auth_mode {
        AuthMode::ApiKey => Arc::new(ApiKeyAuthenticator::new(users.clone())),
        AuthMode::Session => {
            let verifier = crate::auth::session_verifier_from_config(&config.session, http.clone())
                .map_err(|err| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "session_config_invalid", err))?;
            Arc::new(SessionAuthenticator::new(verifier))
        }
    };
    let auth = AuthGate::new(authenticator, &config.demo);
    let rate_limiter = RateLimiter::new(store.clone(), config.demo.max_calls_per_hour);
    let selector = Arc::new(ProviderSelector::new(
        config.provider_ratio,
        Endpoint::from_config(&config.primary),
        Endpoint::from_config(&config.fallback),
    ));
    let accountant = UsageAccountant::new(
        usage.clone(),
        analytics_sink_from_config(&config.analytics, http.clone()),
        Method::POST.as_str(),
        CHAT_COMPLETIONS_PATH,
    );
    let metrics = init_metrics()?;

    tracing::info!(
        auth_mode = ?config.auth_mode,
        primary = %config.primary.name,
        fallback = %config.fallback.name,
        provider_ratio = config.provider_ratio,
        "gateway state loaded"
    );

    Ok(AppState {
        config: Arc::new(config),
        http,
        metrics,
        store,
        auth,
        rate_limiter,
        selector,
        users,
        usage,
        accountant,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.config.metrics_path.clone();
    let cors = cors_layer(&state.config.allowed_origins);
    let api_router = build_api_router(&metrics_path);
    Router::<AppState>::new()
        .merge(api_router.clone())
        .nest("/api", api_router)
        .layer(axum::middleware::from_fn(crate::middleware::track_requests))
        .with_state(state)
        .layer(cors)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_api_router(metrics_path: &str) -> Router<AppState> {
    Router::new()
        .route("/", get(crate::handlers::root))
        .route(
            CHAT_COMPLETIONS_PATH,
            post(crate::handlers::create_chat_completions),
        )
        .route("/v1/user", get(crate::handlers::get_user))
        .route("/metrics-app", get(crate::handlers::metrics_app))
        .route(metrics_path, get(crate::handlers::metrics))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}
