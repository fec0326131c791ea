use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{Pool, Sqlite, sqlite::SqlitePoolOptions};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub value: Value,
}

impl Document {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.value.get(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Gte(String, f64),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn gte(field: impl Into<String>, value: f64) -> Self {
        Self::Gte(field.into(), value)
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Eq(field, expected) => value.get(field) == Some(expected),
            Self::Gte(field, bound) => value
                .get(field)
                .and_then(|v| v.as_f64())
                .is_some_and(|v| v >= *bound),
        }
    }
}

/// Outcome of a read-modify-write closure passed to [`DocumentStore::modify`].
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Keep,
    Write(Value),
}

pub type ModifyFn<'a> = dyn Fn(Option<&Value>) -> Mutation + Send + Sync + 'a;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, String>;
    async fn set(&self, collection: &str, id: &str, value: Value) -> Result<(), String>;
    /// Inserts under a generated id and returns it.
    async fn add(&self, collection: &str, value: Value) -> Result<String, String>;
    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Document>, String>;
    /// Atomically reads `collection/id`, hands it to `f`, and persists the
    /// result when `f` returns [`Mutation::Write`]. Returns whether a write
    /// happened. No other `modify` on the same document can interleave.
    async fn modify(&self, collection: &str, id: &str, f: &ModifyFn<'_>) -> Result<bool, String>;
}

pub type SharedStore = Arc<dyn DocumentStore>;

fn matches_all(filters: &[Filter], value: &Value) -> bool {
    filters.iter().all(|f| f.matches(value))
}

fn new_document_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<RwLock<HashMap<String, BTreeMap<String, Value>>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, String> {
        let guard = self.inner.read().await;
        Ok(guard.get(collection).and_then(|docs| docs.get(id)).cloned())
    }

    async fn set(&self, collection: &str, id: &str, value: Value) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        guard
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), value);
        Ok(())
    }

    async fn add(&self, collection: &str, value: Value) -> Result<String, String> {
        let id = new_document_id();
        self.set(collection, &id, value).await?;
        Ok(id)
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Document>, String> {
        let guard = self.inner.read().await;
        let Some(docs) = guard.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter(|(_, value)| matches_all(filters, value))
            .map(|(id, value)| Document {
                id: id.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn modify(&self, collection: &str, id: &str, f: &ModifyFn<'_>) -> Result<bool, String> {
        let mut guard = self.inner.write().await;
        let docs = guard.entry(collection.to_string()).or_default();
        match f(docs.get(id)) {
            Mutation::Keep => Ok(false),
            Mutation::Write(value) => {
                docs.insert(id.to_string(), value);
                Ok(true)
            }
        }
    }
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: Pool<Sqlite>,
}

impl SqliteDocumentStore {
    pub async fn new(dsn: &str) -> Result<Self, String> {
        ensure_sqlite_file(dsn)?;
        let options = dsn
            .parse::<sqlx::sqlite::SqliteConnectOptions>()
            .map_err(|err| err.to_string())?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        // In-memory databases are per connection.
        let max_connections = if dsn.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|err| err.to_string())?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (\
             collection TEXT NOT NULL,\
             id TEXT NOT NULL,\
             value TEXT NOT NULL,\
             PRIMARY KEY (collection, id)\
             )",
        )
        .execute(&pool)
        .await
        .map_err(|err| err.to_string())?;
        for index in [
            "CREATE INDEX IF NOT EXISTS documents_api_key \
             ON documents (collection, json_extract(value, '$.api_key'))",
            "CREATE INDEX IF NOT EXISTS documents_user_id \
             ON documents (collection, json_extract(value, '$.user_id'))",
        ] {
            sqlx::query(index)
                .execute(&pool)
                .await
                .map_err(|err| err.to_string())?;
        }
        Ok(Self { pool })
    }
}

enum SqlParam {
    Text(String),
    Int(i64),
    Real(f64),
}

/// `'$.field'` for plain identifiers; anything else is filtered in memory.
fn json_path(field: &str) -> Option<String> {
    let plain = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    plain.then(|| format!("'$.{field}'"))
}

/// SQL predicate for a filter, when it can be expressed over `json_extract`.
fn filter_clause(filter: &Filter) -> Option<(String, SqlParam)> {
    match filter {
        Filter::Eq(field, expected) => {
            let path = json_path(field)?;
            let param = match expected {
                Value::String(v) => SqlParam::Text(v.clone()),
                Value::Bool(v) => SqlParam::Int(i64::from(*v)),
                Value::Number(n) => match n.as_i64() {
                    Some(v) => SqlParam::Int(v),
                    None => SqlParam::Real(n.as_f64()?),
                },
                _ => return None,
            };
            Some((format!("json_extract(value, {path}) = ?"), param))
        }
        Filter::Gte(field, bound) => {
            let path = json_path(field)?;
            Some((
                format!("json_extract(value, {path}) >= ?"),
                SqlParam::Real(*bound),
            ))
        }
    }
}

fn decode_value(text: &str) -> Result<Value, String> {
    serde_json::from_str(text).map_err(|err| err.to_string())
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, String> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT value FROM documents WHERE collection=? AND id=?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        row.map(|(text,)| decode_value(&text)).transpose()
    }

    async fn set(&self, collection: &str, id: &str, value: Value) -> Result<(), String> {
        let value_text = serde_json::to_string(&value).map_err(|err| err.to_string())?;
        sqlx::query(
            "INSERT INTO documents (collection, id, value) VALUES (?, ?, ?)\
             ON CONFLICT(collection, id) DO UPDATE SET value=excluded.value",
        )
        .bind(collection)
        .bind(id)
        .bind(value_text)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(())
    }

    async fn add(&self, collection: &str, value: Value) -> Result<String, String> {
        let id = new_document_id();
        self.set(collection, &id, value).await?;
        Ok(id)
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Document>, String> {
        let mut sql = String::from("SELECT id, value FROM documents WHERE collection=?");
        let mut binds = Vec::new();
        for (clause, bind) in filters.iter().filter_map(filter_clause) {
            sql.push_str(" AND ");
            sql.push_str(&clause);
            binds.push(bind);
        }
        sql.push_str(" ORDER BY id");

        let mut query = sqlx::query_as::<_, (String, String)>(&sql).bind(collection);
        for bind in binds {
            query = match bind {
                SqlParam::Text(v) => query.bind(v),
                SqlParam::Int(v) => query.bind(v),
                SqlParam::Real(v) => query.bind(v),
            };
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|err| err.to_string())?;
        // SQL comparisons are looser than JSON equality, so re-check.
        let mut out = Vec::new();
        for (id, value_text) in rows {
            let value = decode_value(&value_text)?;
            if matches_all(filters, &value) {
                out.push(Document { id, value });
            }
        }
        Ok(out)
    }

    async fn modify(&self, collection: &str, id: &str, f: &ModifyFn<'_>) -> Result<bool, String> {
        // IMMEDIATE takes the write lock up front so concurrent modifies
        // serialize. Dropping `tx` before commit rolls back.
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|err| err.to_string())?;
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT value FROM documents WHERE collection=? AND id=?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| err.to_string())?;
        let current = row.map(|(text,)| decode_value(&text)).transpose()?;
        let wrote = match f(current.as_ref()) {
            Mutation::Keep => false,
            Mutation::Write(value) => {
                let value_text = serde_json::to_string(&value).map_err(|err| err.to_string())?;
                sqlx::query(
                    "INSERT INTO documents (collection, id, value) VALUES (?, ?, ?)\
                     ON CONFLICT(collection, id) DO UPDATE SET value=excluded.value",
                )
                .bind(collection)
                .bind(id)
                .bind(value_text)
                .execute(&mut *tx)
                .await
                .map_err(|err| err.to_string())?;
                true
            }
        };
        tx.commit().await.map_err(|err| err.to_string())?;
        Ok(wrote)
    }
}

/// Sums numeric fields across documents; missing or non-numeric fields count as zero.
pub fn sum_fields(docs: &[Document], fields: &[&str]) -> Map<String, Value> {
    let mut out = Map::new();
    for field in fields {
        let total = docs
            .iter()
            .filter_map(|doc| doc.field(field).and_then(|v| v.as_u64()))
            .fold(0u64, u64::saturating_add);
        out.insert(field.to_string(), Value::from(total));
    }
    out
}
