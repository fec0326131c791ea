use crate::auth::Identity;
use crate::config::AnalyticsConfig;
use crate::pricing::UsageRecord;
use crate::users::UsageStore;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

pub const API_CALL_EVENT: &str = "API call";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnalyticsEvent {
    pub user_id: String,
    pub email: String,
    pub event: String,
    pub provider: String,
    pub usage: UsageRecord,
}

/// Fire-and-forget event emission.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn track(&self, event: AnalyticsEvent) -> Result<(), String>;
}

pub struct NoopSink;

#[async_trait]
impl AnalyticsSink for NoopSink {
    async fn track(&self, _event: AnalyticsEvent) -> Result<(), String> {
        Ok(())
    }
}

/// Segment `track` API over HTTP basic auth with the write key as user.
pub struct SegmentSink {
    http: reqwest::Client,
    url: String,
    write_key: String,
}

impl SegmentSink {
    pub fn new(http: reqwest::Client, url: impl Into<String>, write_key: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            write_key: write_key.into(),
        }
    }
}

#[async_trait]
impl AnalyticsSink for SegmentSink {
    async fn track(&self, event: AnalyticsEvent) -> Result<(), String> {
        let user_id = if event.user_id.is_empty() {
            event.email.clone()
        } else {
            event.user_id.clone()
        };
        let payload = json!({
            "userId": user_id,
            "event": event.event,
            "properties": {
                "email": event.email,
                "provider": event.provider,
                "model": event.usage.model,
                "prompt_tokens": event.usage.prompt_tokens,
                "completion_tokens": event.usage.completion_tokens,
                "total_tokens": event.usage.total_tokens,
            },
        });
        let resp = self
            .http
            .post(&self.url)
            .basic_auth(&self.write_key, Some(""))
            .json(&payload)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("analytics endpoint returned {}", resp.status()));
        }
        Ok(())
    }
}

pub fn analytics_sink_from_config(
    config: &AnalyticsConfig,
    http: reqwest::Client,
) -> Arc<dyn AnalyticsSink> {
    match config.write_key.as_deref() {
        Some(key) => Arc::new(SegmentSink::new(http, config.url.clone(), key)),
        None => Arc::new(NoopSink),
    }
}

/// Records one completed call: persisted usage, token histograms and an
/// analytics event. Nothing here can fail the request.
#[derive(Clone)]
pub struct UsageAccountant {
    usage: UsageStore,
    analytics: Arc<dyn AnalyticsSink>,
    method: String,
    path_template: String,
}

impl UsageAccountant {
    pub fn new(
        usage: UsageStore,
        analytics: Arc<dyn AnalyticsSink>,
        method: impl Into<String>,
        path_template: impl Into<String>,
    ) -> Self {
        Self {
            usage,
            analytics,
            method: method.into(),
            path_template: path_template.into(),
        }
    }

    pub async fn account(&self, identity: &Identity, provider: &str, usage: &UsageRecord) {
        tracing::debug!(
            uid = %identity.uid,
            provider = %provider,
            model = %usage.model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            price = %usage.price,
            "accounting usage"
        );

        if let Err(err) = self.usage.record(&identity.uid, provider, usage).await {
            tracing::error!(uid = %identity.uid, "usage persistence failed: {err}");
        }

        self.observe(provider, usage);

        let event = AnalyticsEvent {
            user_id: identity.uid.clone(),
            email: identity.email.clone(),
            event: API_CALL_EVENT.to_string(),
            provider: provider.to_string(),
            usage: usage.clone(),
        };
        let sink = self.analytics.clone();
        tokio::spawn(async move {
            if let Err(err) = sink.track(event).await {
                tracing::warn!("analytics event dropped: {err}");
            }
        });
    }

    fn observe(&self, provider: &str, usage: &UsageRecord) {
        let labels = [
            ("method", self.method.clone()),
            ("path_template", self.path_template.clone()),
            ("model_name", usage.model.clone()),
            ("provider", provider.to_string()),
        ];
        metrics::histogram!("llm_proxy_llm_prompt_tokens", &labels)
            .record(usage.prompt_tokens as f64);
        metrics::histogram!("llm_proxy_llm_completion_tokens", &labels)
            .record(usage.completion_tokens as f64);
        metrics::histogram!("llm_proxy_llm_total_tokens", &labels)
            .record(usage.total_tokens as f64);
    }
}
