use crate::pricing::UsageRecord;
use crate::store::{Filter, SharedStore, sum_fields};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const USERS_COLLECTION: &str = "users";
pub const TOKEN_USAGES_COLLECTION: &str = "token_usages";

const SUBSCRIPTION_PERIOD_DAYS: i64 = 30;
const TOKEN_FIELDS: [&str; 3] = ["prompt_tokens", "completion_tokens", "total_tokens"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    #[serde(skip)]
    pub uid: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_user_role")]
    pub user_role: String,
    /// Unix seconds.
    #[serde(default)]
    pub created_at: i64,
}

fn default_user_role() -> String {
    "developer".to_string()
}

impl User {
    fn from_document(uid: &str, value: Value) -> Result<Self, String> {
        let mut user: User = serde_json::from_value(value).map_err(|err| err.to_string())?;
        user.uid = uid.to_string();
        Ok(user)
    }
}

#[derive(Clone)]
pub struct UserStore {
    store: SharedStore,
}

impl UserStore {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn get_user(&self, uid: &str) -> Result<Option<User>, String> {
        match self.store.get(USERS_COLLECTION, uid).await? {
            Some(value) => User::from_document(uid, value).map(Some),
            None => Ok(None),
        }
    }

    pub async fn get_user_by_api_key(&self, api_key: &str) -> Result<Option<User>, String> {
        let docs = self
            .store
            .query(USERS_COLLECTION, &[Filter::eq("api_key", api_key)])
            .await?;
        match docs.into_iter().next() {
            Some(doc) => User::from_document(&doc.id, doc.value).map(Some),
            None => Ok(None),
        }
    }

    pub async fn put_user(&self, user: &User) -> Result<(), String> {
        let value = serde_json::to_value(user).map_err(|err| err.to_string())?;
        self.store.set(USERS_COLLECTION, &user.uid, value).await
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageTotals {
    fn from_sums(sums: &Map<String, Value>) -> Self {
        let get = |key: &str| sums.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
        Self {
            prompt_tokens: get("prompt_tokens"),
            completion_tokens: get("completion_tokens"),
            total_tokens: get("total_tokens"),
        }
    }
}

#[derive(Clone)]
pub struct UsageStore {
    store: SharedStore,
}

impl UsageStore {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        user_id: &str,
        provider: &str,
        usage: &UsageRecord,
    ) -> Result<String, String> {
        let doc = json!({
            "user_id": user_id,
            "provider": provider,
            "model_name": usage.model,
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
            "price": usage.price.to_string(),
            "currency": usage.currency,
            "created_at": Utc::now().timestamp(),
        });
        self.store.add(TOKEN_USAGES_COLLECTION, doc).await
    }

    pub async fn usage_by_model(&self, model_name: &str) -> Result<UsageTotals, String> {
        let docs = self
            .store
            .query(
                TOKEN_USAGES_COLLECTION,
                &[Filter::eq("model_name", model_name)],
            )
            .await?;
        Ok(UsageTotals::from_sums(&sum_fields(&docs, &TOKEN_FIELDS)))
    }

    pub async fn usage_by_user(
        &self,
        user_id: &str,
        model_name: Option<&str>,
        since: i64,
    ) -> Result<UsageTotals, String> {
        let mut filters = vec![
            Filter::eq("user_id", user_id),
            Filter::gte("created_at", since as f64),
        ];
        if let Some(model_name) = model_name {
            filters.push(Filter::eq("model_name", model_name));
        }
        let docs = self.store.query(TOKEN_USAGES_COLLECTION, &filters).await?;
        Ok(UsageTotals::from_sums(&sum_fields(&docs, &TOKEN_FIELDS)))
    }
}

/// Start of the current 30-day billing period anchored at `registered_at`.
/// A registration in the future yields the window ending now.
pub fn current_period_start(registered_at: i64, now: DateTime<Utc>) -> i64 {
    let now_ts = now.timestamp();
    let period = Duration::days(SUBSCRIPTION_PERIOD_DAYS).num_seconds();
    if now_ts < registered_at {
        return now_ts - period;
    }
    let elapsed_periods = (now_ts - registered_at) / period;
    registered_at + elapsed_periods * period
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    #[tokio::test]
    async fn api_key_lookup_returns_uid() {
        let users = UserStore::new(Arc::new(MemoryDocumentStore::new()));
        users
            .put_user(&User {
                uid: "uid-1".into(),
                email: "dev@example.com".into(),
                api_key: Some("lo-abc".into()),
                user_role: "developer".into(),
                created_at: 0,
            })
            .await
            .unwrap();
        let found = users.get_user_by_api_key("lo-abc").await.unwrap().unwrap();
        assert_eq!(found.uid, "uid-1");
        assert_eq!(found.email, "dev@example.com");
        assert!(users.get_user_by_api_key("lo-nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn usage_aggregates_per_model_and_user() {
        let usage = UsageStore::new(Arc::new(MemoryDocumentStore::new()));
        let record = |model: &str, p: u64, c: u64| UsageRecord {
            model: model.to_string(),
            prompt_tokens: p,
            completion_tokens: c,
            total_tokens: p + c,
            price: Decimal::ZERO,
            currency: "USD".to_string(),
        };
        usage.record("u1", "primary", &record("m", 10, 5)).await.unwrap();
        usage.record("u1", "fallback", &record("m", 1, 1)).await.unwrap();
        usage.record("u2", "primary", &record("other", 7, 7)).await.unwrap();

        let by_model = usage.usage_by_model("m").await.unwrap();
        assert_eq!(by_model.prompt_tokens, 11);
        assert_eq!(by_model.total_tokens, 17);

        let by_user = usage.usage_by_user("u2", None, 0).await.unwrap();
        assert_eq!(by_user.completion_tokens, 7);
        let filtered = usage.usage_by_user("u2", Some("m"), 0).await.unwrap();
        assert_eq!(filtered, UsageTotals::default());
    }

    #[test]
    fn period_start_advances_in_thirty_day_steps() {
        let registered = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        let start = current_period_start(registered.timestamp(), now);
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(start, expected.timestamp());
    }

    #[test]
    fn future_registration_uses_trailing_window() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let start = current_period_start(now.timestamp() + 100, now);
        assert_eq!(start, now.timestamp() - 30 * 24 * 3600);
    }
}
