//! Credential stores consulted by the handshake for external tokens.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use proto::{ConfigError, CredentialQuery, CredentialRecord, GatewayError};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Column, Row};
use tracing::{debug, info};

/// Table consulted when no model name is configured.
pub const DEFAULT_TOKEN_MODEL: &str = "AccessToken";

/// Lookup of stored access tokens by id.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Returns the stored record for `query.id`, or `None` when there is none.
    async fn find_one(&self, query: &CredentialQuery)
    -> Result<Option<CredentialRecord>, GatewayError>;
}

/// In-memory store keyed by token id.
#[derive(Default)]
pub struct MemoryTokenStore {
    records: DashMap<String, CredentialRecord>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from records carrying a string or numeric `id` field.
    ///
    /// Records without a usable id are skipped.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Map<String, Value>>,
    {
        let store = Self::new();
        for fields in records {
            let id = match fields.get("id") {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => {
                    debug!("Skipping token record without id");
                    continue;
                }
            };
            store.insert(id, CredentialRecord::new(fields));
        }
        store
    }

    pub fn insert(&self, id: impl Into<String>, record: CredentialRecord) {
        self.records.insert(id.into(), record);
    }

    pub fn remove(&self, id: &str) -> Option<CredentialRecord> {
        self.records.remove(id).map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl TokenValidator for MemoryTokenStore {
    async fn find_one(
        &self,
        query: &CredentialQuery,
    ) -> Result<Option<CredentialRecord>, GatewayError> {
        Ok(self.records.get(&query.id).map(|r| r.value().clone()))
    }
}

#[async_trait]
impl<T: TokenValidator + ?Sized> TokenValidator for Arc<T> {
    async fn find_one(
        &self,
        query: &CredentialQuery,
    ) -> Result<Option<CredentialRecord>, GatewayError> {
        (**self).find_one(query).await
    }
}

/// Checks that `model` is a plain SQL identifier.
pub fn validate_model_name(model: &str) -> Result<(), ConfigError> {
    let mut chars = model.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            "realtime.custom.access_token",
            format!("'{model}' is not a plain identifier"),
        ))
    }
}

/// SQLite-backed store reading one table (the token model).
pub struct SqliteTokenStore {
    pool: SqlitePool,
    model: String,
}

impl SqliteTokenStore {
    /// Opens the database at `db_url` (a path or `sqlite:` URL, `~` expanded).
    pub async fn open(db_url: &str, model: &str) -> Result<Self, GatewayError> {
        let url = if db_url.starts_with('~') {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            db_url.replacen('~', &home, 1)
        } else {
            db_url.to_string()
        };
        let url = if url.starts_with("sqlite:") {
            url
        } else {
            format!("sqlite:{url}")
        };

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| GatewayError::Database(e.to_string()))?;
        info!(model, "SQLite token store opened: {url}");
        Self::with_pool(pool, model)
    }

    /// Wraps an existing pool.
    pub fn with_pool(pool: SqlitePool, model: &str) -> Result<Self, GatewayError> {
        validate_model_name(model)?;
        Ok(Self {
            pool,
            model: model.to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn column_value(row: &SqliteRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return Value::from(v);
    }
    if let Ok(v) = row.try_get::<String, _>(index) {
        return Value::String(v);
    }
    Value::Null
}

fn row_to_record(row: &SqliteRow) -> CredentialRecord {
    let fields = row
        .columns()
        .iter()
        .map(|col| (col.name().to_string(), column_value(row, col.ordinal())))
        .collect();
    CredentialRecord::new(fields)
}

#[async_trait]
impl TokenValidator for SqliteTokenStore {
    async fn find_one(
        &self,
        query: &CredentialQuery,
    ) -> Result<Option<CredentialRecord>, GatewayError> {
        let sql = format!("SELECT * FROM \"{}\" WHERE id = ? LIMIT 1", self.model);
        let row = sqlx::query(&sql)
            .bind(&query.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| GatewayError::Database(e.to_string()))?;
        debug!(model = %self.model, id = %query.id, found = row.is_some(), "Token lookup");
        Ok(row.as_ref().map(row_to_record))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    async fn seeded_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        sqlx::query(
            "CREATE TABLE \"AccessToken\" (id TEXT PRIMARY KEY, userId TEXT, ttl INTEGER, scope TEXT)",
        )
        .execute(&pool)
        .await
        .expect("create table");
        sqlx::query("INSERT INTO \"AccessToken\" (id, userId, ttl, scope) VALUES (?, ?, ?, NULL)")
            .bind("tok-1")
            .bind("u-1")
            .bind(1209600_i64)
            .execute(&pool)
            .await
            .expect("insert");
        pool
    }

    #[tokio::test]
    async fn memory_store_finds_records_by_id() {
        let store = MemoryTokenStore::from_records(vec![
            json!({"id": "abc", "userId": "u"}).as_object().cloned().expect("object"),
            json!({"id": 7, "userId": "n"}).as_object().cloned().expect("object"),
            json!({"userId": "no-id"}).as_object().cloned().expect("object"),
        ]);
        assert_eq!(store.len(), 2);

        let record = store
            .find_one(&CredentialQuery::new("abc"))
            .await
            .expect("lookup")
            .expect("record");
        assert_eq!(record.fields.get("userId"), Some(&json!("u")));
        assert!(
            store
                .find_one(&CredentialQuery::new("7"))
                .await
                .expect("lookup")
                .is_some()
        );
        assert!(
            store
                .find_one(&CredentialQuery::new("missing"))
                .await
                .expect("lookup")
                .is_none()
        );
    }

    #[tokio::test]
    async fn sqlite_store_maps_row_columns_to_record_fields() {
        let store = SqliteTokenStore::with_pool(seeded_pool().await, DEFAULT_TOKEN_MODEL)
            .expect("store");
        let record = store
            .find_one(&CredentialQuery::new("tok-1"))
            .await
            .expect("lookup")
            .expect("record");
        assert_eq!(record.fields.get("id"), Some(&json!("tok-1")));
        assert_eq!(record.fields.get("userId"), Some(&json!("u-1")));
        assert_eq!(record.fields.get("ttl"), Some(&json!(1209600)));
        assert_eq!(record.fields.get("scope"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn sqlite_store_returns_none_for_unknown_id() {
        let store = SqliteTokenStore::with_pool(seeded_pool().await, DEFAULT_TOKEN_MODEL)
            .expect("store");
        assert!(
            store
                .find_one(&CredentialQuery::new("nope"))
                .await
                .expect("lookup")
                .is_none()
        );
    }

    #[tokio::test]
    async fn missing_table_surfaces_database_error() {
        let store =
            SqliteTokenStore::with_pool(seeded_pool().await, "Missing").expect("valid name");
        let err = store
            .find_one(&CredentialQuery::new("tok-1"))
            .await
            .expect_err("no such table");
        assert!(matches!(err, GatewayError::Database(_)));
    }

    #[test]
    fn model_names_must_be_identifiers() {
        assert!(validate_model_name("AccessToken").is_ok());
        assert!(validate_model_name("_tokens2").is_ok());
        assert!(validate_model_name("").is_err());
        assert!(validate_model_name("2fa").is_err());
        assert!(matches!(
            validate_model_name("x\"; DROP TABLE y; --"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
