use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::{Config, StoreBackend};
use crate::error::{AppError, AppResult};

pub mod elasticsearch;
pub mod memory;
pub mod redis;

pub use self::elasticsearch::ElasticsearchStore;
pub use self::memory::MemoryStore;
pub use self::redis::{create_redis_client, RedisStore};

/// Raw fields of a stored document
pub type Fields = Map<String, Value>;

/// Pseudo-field that matches a document's own id in term searches
pub const ID_FIELD: &str = "_id";

/// Version stamp returned with every read, used for compare-and-swap writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocVersion {
    pub seq_no: i64,
    pub primary_term: i64,
}

/// Condition a write must satisfy to be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional full replace
    Any,
    /// Only create; fails if the document exists
    Absent,
    /// Only replace the exact version previously read
    Version(DocVersion),
}

/// A document as returned by the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: i64,
    pub fields: Fields,
    pub version: DocVersion,
}

/// Remote document store boundary.
///
/// Every call is an independent round trip. There are no cross-document
/// transactions; a single-document write is the unit of atomicity.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document by id. Missing documents and missing collections yield `None`.
    async fn get(&self, collection: &str, id: i64) -> AppResult<Option<StoredDocument>>;

    /// Replace all fields of a document if the precondition holds.
    ///
    /// Returns `AppError::Conflict` when it does not.
    async fn upsert_if(
        &self,
        collection: &str,
        id: i64,
        fields: Fields,
        precondition: Precondition,
    ) -> AppResult<()>;

    /// Unconditional full replace of a document's fields
    async fn upsert(&self, collection: &str, id: i64, fields: Fields) -> AppResult<()> {
        self.upsert_if(collection, id, fields, Precondition::Any)
            .await
    }

    /// Delete a document. Deleting an absent document succeeds.
    async fn delete(&self, collection: &str, id: i64) -> AppResult<()>;

    /// Documents whose `field` equals `value` (or contains it, for array fields)
    async fn find_by_term(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> AppResult<Vec<StoredDocument>>;

    /// Documents whose `field` intersects `values`
    async fn find_by_any_term(
        &self,
        collection: &str,
        field: &str,
        values: &[Value],
    ) -> AppResult<Vec<StoredDocument>>;

    async fn create_collection(&self, name: &str) -> AppResult<()>;

    async fn list_collections(&self) -> AppResult<Vec<String>>;

    /// Copy every document of `source` into `dest`
    async fn reindex(&self, source: &str, dest: &str) -> AppResult<()>;

    /// Drop a collection. Dropping an absent collection succeeds.
    async fn delete_collection(&self, name: &str) -> AppResult<()>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Characters a collection name may not contain.
///
/// `:` separates key segments in Redis and the glob characters would widen a
/// key scan; the rest are rejected by Elasticsearch index names.
const FORBIDDEN_NAME_CHARS: &[char] = &[
    ':', '*', '?', '[', ']', '\\', '/', '"', '<', '>', '|', ',', '#',
];

fn invalid_name(name: &str, reason: &str) -> AppError {
    AppError::InvalidInput(format!("invalid collection name '{}': {}", name, reason))
}

/// Validates a caller-supplied collection name
pub fn check_collection_name(name: &str) -> AppResult<()> {
    if name.is_empty() {
        return Err(invalid_name(name, "must not be empty"));
    }
    if name == "." || name == ".." {
        return Err(invalid_name(name, "reserved name"));
    }
    if name.starts_with(['_', '-', '+']) {
        return Err(invalid_name(name, "must not start with '_', '-' or '+'"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_whitespace() || FORBIDDEN_NAME_CHARS.contains(c))
    {
        return Err(invalid_name(name, &format!("'{}' is not allowed", c)));
    }
    Ok(())
}

/// Builds the store selected by configuration
pub async fn create_store(config: &Config) -> anyhow::Result<Arc<dyn DocumentStore>> {
    let store: Arc<dyn DocumentStore> = match config.store_backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Elasticsearch => Arc::new(ElasticsearchStore::new(config)?),
        StoreBackend::Redis => {
            let client = create_redis_client(&config.redis_url)?;
            Arc::new(RedisStore::new(client).await?)
        }
    };
    Ok(store)
}

/// Exact match of a stored value against a wanted scalar; arrays match on any element
pub fn value_matches(stored: &Value, wanted: &Value) -> bool {
    match stored {
        Value::Array(items) => items.iter().any(|item| item == wanted),
        other => other == wanted,
    }
}

/// Whether `wanted` names the document id `id`
pub fn id_matches(id: i64, wanted: &Value) -> bool {
    match wanted {
        Value::Number(n) => n.as_i64() == Some(id),
        Value::String(s) => s.parse::<i64>().ok() == Some(id),
        _ => false,
    }
}

/// Term predicate shared by the backends that search in process
pub fn matches_any_term(doc: &StoredDocument, field: &str, values: &[Value]) -> bool {
    if field == ID_FIELD {
        return values.iter().any(|v| id_matches(doc.id, v));
    }
    doc.fields
        .get(field)
        .map(|stored| values.iter().any(|wanted| value_matches(stored, wanted)))
        .unwrap_or(false)
}
