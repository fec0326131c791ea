use crate::error::{GatewayError, GatewayResult};
use crate::store::{Mutation, SharedStore};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

pub const DEMO_USAGE_COLLECTION: &str = "demo_user_usage";

const WINDOW_SECONDS: f64 = 3600.0;

/// Sliding one-hour call log per client key, persisted in the document
/// store as `{"usage_time": [unix_seconds, ...]}`.
#[derive(Clone)]
pub struct RateLimiter {
    store: SharedStore,
    max_calls_per_hour: u64,
}

impl RateLimiter {
    pub fn new(store: SharedStore, max_calls_per_hour: u64) -> Self {
        Self {
            store,
            max_calls_per_hour,
        }
    }

    pub async fn allow(&self, key: &str) -> GatewayResult<bool> {
        self.allow_at(key, Utc::now()).await
    }

    /// A call is admitted while the number of calls recorded in the last
    /// hour is at most `max_calls_per_hour`; admitted calls are appended.
    pub async fn allow_at(&self, key: &str, now: DateTime<Utc>) -> GatewayResult<bool> {
        let now_ts = now.timestamp_millis() as f64 / 1000.0;
        let cutoff = now_ts - WINDOW_SECONDS;
        let max = self.max_calls_per_hour;
        let decide = move |current: Option<&Value>| {
            let mut recent: Vec<f64> = current
                .and_then(|v| v.get("usage_time"))
                .and_then(|v| v.as_array())
                .map(|times| {
                    times
                        .iter()
                        .filter_map(|t| t.as_f64())
                        .filter(|t| *t >= cutoff)
                        .collect()
                })
                .unwrap_or_default();
            if recent.len() as u64 <= max {
                recent.push(now_ts);
                Mutation::Write(json!({ "usage_time": recent }))
            } else {
                Mutation::Keep
            }
        };
        let allowed = self
            .store
            .modify(DEMO_USAGE_COLLECTION, key, &decide)
            .await
            .map_err(GatewayError::internal)?;
        if !allowed {
            tracing::info!(client = %key, "demo rate limit exceeded");
        }
        Ok(allowed)
    }

    pub async fn check(&self, key: &str) -> GatewayResult<()> {
        if self.allow(key).await? {
            Ok(())
        } else {
            Err(GatewayError::RateLimitExceeded(
                "Rate limit exceeded. Sign up to use the API without limits.".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        Document, DocumentStore, Filter, MemoryDocumentStore, ModifyFn, SqliteDocumentStore,
    };
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Arc;

    struct OfflineStore;

    #[async_trait]
    impl DocumentStore for OfflineStore {
        async fn get(&self, _: &str, _: &str) -> Result<Option<Value>, String> {
            Err("store offline".into())
        }
        async fn set(&self, _: &str, _: &str, _: Value) -> Result<(), String> {
            Err("store offline".into())
        }
        async fn add(&self, _: &str, _: Value) -> Result<String, String> {
            Err("store offline".into())
        }
        async fn query(&self, _: &str, _: &[Filter]) -> Result<Vec<Document>, String> {
            Err("store offline".into())
        }
        async fn modify(&self, _: &str, _: &str, _: &ModifyFn<'_>) -> Result<bool, String> {
            Err("store offline".into())
        }
    }

    #[tokio::test]
    async fn admits_max_plus_one_then_denies() {
        let limiter = RateLimiter::new(Arc::new(MemoryDocumentStore::new()), 4);
        let now = Utc::now();
        let mut results = Vec::new();
        for i in 0..6 {
            results.push(
                limiter
                    .allow_at("1.2.3.4", now + Duration::seconds(i))
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(results, vec![true, true, true, true, true, false]);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(Arc::new(MemoryDocumentStore::new()), 0);
        let now = Utc::now();
        assert!(limiter.allow_at("a", now).await.unwrap());
        assert!(!limiter.allow_at("a", now).await.unwrap());
        assert!(limiter.allow_at("b", now).await.unwrap());
    }

    #[tokio::test]
    async fn old_calls_fall_out_of_the_window() {
        let store = Arc::new(MemoryDocumentStore::new());
        let limiter = RateLimiter::new(store.clone(), 1);
        let start = Utc::now() - Duration::hours(2);
        assert!(limiter.allow_at("k", start).await.unwrap());
        assert!(limiter.allow_at("k", start).await.unwrap());
        assert!(!limiter.allow_at("k", start).await.unwrap());

        let later = start + Duration::minutes(61);
        assert!(limiter.allow_at("k", later).await.unwrap());
        let doc = store.get(DEMO_USAGE_COLLECTION, "k").await.unwrap().unwrap();
        assert_eq!(doc["usage_time"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn check_maps_denial_to_rate_limit_error() {
        let limiter = RateLimiter::new(Arc::new(MemoryDocumentStore::new()), 0);
        limiter.check("x").await.unwrap();
        let err = limiter.check("x").await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimitExceeded(_)));
    }

    #[tokio::test]
    async fn concurrent_callers_never_exceed_the_limit() {
        let limiter = RateLimiter::new(Arc::new(MemoryDocumentStore::new()), 4);
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.allow("shared").await }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn store_failure_is_an_internal_error() {
        let limiter = RateLimiter::new(Arc::new(OfflineStore), 4);
        let err = limiter.allow("k").await.unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
        let err = limiter.check("k").await.unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[tokio::test]
    async fn sqlite_backend_admits_max_plus_one() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("sqlite://{}", dir.path().join("limits.db").display());
        let store = Arc::new(SqliteDocumentStore::new(&dsn).await.unwrap());
        let limiter = RateLimiter::new(store, 4);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.allow("shared").await }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
        assert!(!limiter.allow("shared").await.unwrap());
        assert!(limiter.allow("other").await.unwrap());
    }
}
