use ::redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use serde_json::Value;
use std::sync::Arc;

use crate::db::{
    check_collection_name, matches_any_term, DocVersion, DocumentStore, Fields, Precondition,
    StoredDocument, ID_FIELD,
};
use crate::error::{AppError, AppResult};

/// Set of known collection names. Contains no `:`, so no `{collection}:*` key can equal it.
const REGISTRY_KEY: &str = "likegraph.collections";
const PRIMARY_TERM: i64 = 1;
const SCAN_COUNT: usize = 500;

/// Lua helpers maintaining the per-term inverted index of one document
const TERM_INDEX_LUA: &str = r#"
local function term_key(prefix, field, v)
  if type(v) == 'number' then
    return prefix .. ':term:' .. field .. ':' .. string.format('%d', v)
  end
  return prefix .. ':term:' .. field .. ':' .. tostring(v)
end

local function is_scalar(v)
  local t = type(v)
  return t == 'number' or t == 'string' or t == 'boolean'
end

local function index_terms(prefix, raw, id, op)
  if not raw then return end
  local doc = cjson.decode(raw)
  for field, value in pairs(doc) do
    if type(value) == 'table' then
      for _, v in ipairs(value) do
        if is_scalar(v) then redis.call(op, term_key(prefix, field, v), id) end
      end
    elseif is_scalar(value) then
      redis.call(op, term_key(prefix, field, value), id)
    end
  end
end
"#;

/// KEYS: doc, version, ids, registry. ARGV: mode, expected, json, id, collection.
/// Returns the new version, or -1 when the precondition fails.
const UPSERT_LUA: &str = r#"
if ARGV[1] == 'absent' then
  if redis.call('EXISTS', KEYS[1]) == 1 then return -1 end
elseif ARGV[1] == 'version' then
  if redis.call('EXISTS', KEYS[1]) == 0 or redis.call('GET', KEYS[2]) ~= ARGV[2] then
    return -1
  end
end
index_terms(ARGV[5], redis.call('GET', KEYS[1]), ARGV[4], 'SREM')
redis.call('SET', KEYS[1], ARGV[3])
index_terms(ARGV[5], ARGV[3], ARGV[4], 'SADD')
redis.call('SADD', KEYS[3], ARGV[4])
redis.call('SADD', KEYS[4], ARGV[5])
return redis.call('INCR', KEYS[2])
"#;

/// KEYS: doc, ids. ARGV: id, collection. Returns 1 if a document was removed.
const DELETE_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
index_terms(ARGV[2], raw, ARGV[1], 'SREM')
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
return 1
"#;

fn doc_key(collection: &str, id: i64) -> String {
    format!("{}:doc:{}", collection, id)
}

/// Version counters outlive deletes so a recreated document never reuses a version
fn version_key(collection: &str, id: i64) -> String {
    format!("{}:ver:{}", collection, id)
}

fn ids_key(collection: &str) -> String {
    format!("{}:ids", collection)
}

/// Scan patterns for the keys dropped with a collection; version keys are left in place
fn drop_patterns(collection: &str) -> [String; 2] {
    [
        format!("{}:doc:*", collection),
        format!("{}:term:*", collection),
    ]
}

/// Inverted-index key for one scalar term; must agree with `term_key` in the Lua helpers
fn term_key(collection: &str, field: &str, value: &Value) -> Option<String> {
    let term = match value {
        Value::Number(n) => n
            .as_i64()
            .map(|i| i.to_string())
            .unwrap_or_else(|| n.to_string()),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    Some(format!("{}:term:{}:{}", collection, field, term))
}

/// Redis-backed document store.
///
/// Documents are JSON strings; each scalar (or array element) of a document is
/// indexed in a `term` set so searches never scan the collection. Writes run as
/// Lua scripts, which makes index maintenance and version checks atomic per document.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    upsert_script: Arc<Script>,
    delete_script: Arc<Script>,
}

impl RedisStore {
    pub async fn new(client: Client) -> anyhow::Result<Self> {
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            upsert_script: Arc::new(Script::new(&format!("{}{}", TERM_INDEX_LUA, UPSERT_LUA))),
            delete_script: Arc::new(Script::new(&format!("{}{}", TERM_INDEX_LUA, DELETE_LUA))),
        })
    }

    fn decode(id: i64, raw: &str, version: Option<i64>) -> AppResult<StoredDocument> {
        let fields: Fields = serde_json::from_str(raw)
            .map_err(|e| AppError::InvalidDocument(format!("document {}: {}", id, e)))?;
        Ok(StoredDocument {
            id,
            fields,
            version: DocVersion {
                seq_no: version.unwrap_or_default(),
                primary_term: PRIMARY_TERM,
            },
        })
    }

    /// Loads documents by id in one pipeline, skipping ids deleted meanwhile
    async fn fetch_many(&self, collection: &str, ids: &[i64]) -> AppResult<Vec<StoredDocument>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = ::redis::pipe();
        for id in ids {
            pipe.get(doc_key(collection, *id))
                .get(version_key(collection, *id));
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        // replies come back as (doc, version) pairs in request order
        let mut docs = Vec::with_capacity(ids.len());
        for (id, pair) in ids.iter().zip(values.chunks(2)) {
            if let [Some(raw), version] = pair {
                let version = version.as_deref().and_then(|v| v.parse::<i64>().ok());
                docs.push(Self::decode(*id, raw, version)?);
            }
        }
        Ok(docs)
    }

    async fn scan_keys(&self, pattern: &str) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

#[async_trait::async_trait]
impl DocumentStore for RedisStore {
    async fn get(&self, collection: &str, id: i64) -> AppResult<Option<StoredDocument>> {
        let mut conn = self.conn.clone();
        let (raw, version): (Option<String>, Option<i64>) = ::redis::pipe()
            .atomic()
            .get(doc_key(collection, id))
            .get(version_key(collection, id))
            .query_async(&mut conn)
            .await?;

        raw.map(|raw| Self::decode(id, &raw, version)).transpose()
    }

    async fn upsert_if(
        &self,
        collection: &str,
        id: i64,
        fields: Fields,
        precondition: Precondition,
    ) -> AppResult<()> {
        let (mode, expected) = match precondition {
            Precondition::Any => ("any", String::new()),
            Precondition::Absent => ("absent", String::new()),
            Precondition::Version(version) => ("version", version.seq_no.to_string()),
        };
        let json = serde_json::to_string(&fields)
            .map_err(|e| AppError::Internal(format!("Document serialization error: {}", e)))?;

        // precondition check, index maintenance and write happen in one script call
        let mut conn = self.conn.clone();
        let version: i64 = self
            .upsert_script
            .key(doc_key(collection, id))
            .key(version_key(collection, id))
            .key(ids_key(collection))
            .key(REGISTRY_KEY)
            .arg(mode)
            .arg(expected)
            .arg(json)
            .arg(id)
            .arg(collection)
            .invoke_async(&mut conn)
            .await?;

        if version < 0 {
            return Err(AppError::Conflict(format!(
                "document {} in '{}' changed since it was read",
                id, collection
            )));
        }
        tracing::debug!(collection = %collection, id, version, "Document stored");
        Ok(())
    }

    async fn delete(&self, collection: &str, id: i64) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _removed: i64 = self
            .delete_script
            .key(doc_key(collection, id))
            .key(ids_key(collection))
            .arg(id)
            .arg(collection)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn find_by_term(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> AppResult<Vec<StoredDocument>> {
        if field == ID_FIELD {
            let id = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse::<i64>().ok(),
                _ => None,
            };
            return match id {
                Some(id) => Ok(self.get(collection, id).await?.into_iter().collect()),
                None => Ok(Vec::new()),
            };
        }
        self.find_by_any_term(collection, field, std::slice::from_ref(value))
            .await
    }

    async fn find_by_any_term(
        &self,
        collection: &str,
        field: &str,
        values: &[Value],
    ) -> AppResult<Vec<StoredDocument>> {
        if field == ID_FIELD {
            let mut docs = Vec::new();
            for value in values {
                docs.extend(self.find_by_term(collection, field, value).await?);
            }
            docs.sort_by_key(|doc| doc.id);
            docs.dedup_by_key(|doc| doc.id);
            return Ok(docs);
        }

        let keys: Vec<String> = values
            .iter()
            .filter_map(|value| term_key(collection, field, value))
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        // candidate ids from the term sets, then load and re-check the documents
        let mut conn = self.conn.clone();
        let mut ids: Vec<i64> = conn.sunion(keys).await?;
        ids.sort_unstable();

        let docs = self.fetch_many(collection, &ids).await?;
        Ok(docs
            .into_iter()
            .filter(|doc| matches_any_term(doc, field, values))
            .collect())
    }

    async fn create_collection(&self, name: &str) -> AppResult<()> {
        check_collection_name(name)?;
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(REGISTRY_KEY, name).await?;
        if added == 0 {
            return Err(AppError::InvalidInput(format!(
                "collection '{}' already exists",
                name
            )));
        }
        tracing::info!(collection = %name, "Collection created");
        Ok(())
    }

    async fn list_collections(&self) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = conn.smembers(REGISTRY_KEY).await?;
        names.sort();
        Ok(names)
    }

    async fn reindex(&self, source: &str, dest: &str) -> AppResult<()> {
        check_collection_name(source)?;
        check_collection_name(dest)?;
        let mut conn = self.conn.clone();
        let known: bool = conn.sismember(REGISTRY_KEY, source).await?;
        if !known {
            return Err(AppError::NotFound(format!("collection '{}'", source)));
        }

        let mut ids: Vec<i64> = conn.smembers(ids_key(source)).await?;
        ids.sort_unstable();
        let docs = self.fetch_many(source, &ids).await?;

        // through upsert, so dest gets its own term index and versions
        for doc in docs {
            self.upsert(dest, doc.id, doc.fields).await?;
        }
        let _: i64 = conn.sadd(REGISTRY_KEY, dest).await?;

        tracing::info!(source = %source, dest = %dest, documents = ids.len(), "Reindex completed");
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> AppResult<()> {
        // the name is spliced into scan patterns, so it must not contain glob or separator characters
        check_collection_name(name)?;

        let mut keys = vec![ids_key(name)];
        for pattern in drop_patterns(name) {
            keys.extend(self.scan_keys(&pattern).await?);
        }

        let mut conn = self.conn.clone();
        for chunk in keys.chunks(SCAN_COUNT) {
            let _: i64 = conn.del(chunk.to_vec()).await?;
        }
        let _: i64 = conn.srem(REGISTRY_KEY, name).await?;

        tracing::info!(collection = %name, keys = keys.len(), "Collection deleted");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_layout() {
        assert_eq!(doc_key("users", 75), "users:doc:75");
        assert_eq!(version_key("users", 75), "users:ver:75");
        assert_eq!(ids_key("movies"), "movies:ids");
    }

    #[test]
    fn test_drop_patterns_stay_inside_collection_and_spare_versions() {
        let patterns = drop_patterns("users");
        assert_eq!(patterns, ["users:doc:*".to_string(), "users:term:*".to_string()]);
        assert!(patterns.iter().all(|p| !p.contains(":ver:")));
        assert!(!REGISTRY_KEY.contains(':'));
    }

    #[test]
    fn test_term_key_formats_scalars() {
        assert_eq!(
            term_key("users", "likedMovies", &json!(80000)).as_deref(),
            Some("users:term:likedMovies:80000")
        );
        assert_eq!(
            term_key("movies", "genre", &json!("drama")).as_deref(),
            Some("movies:term:genre:drama")
        );
        assert_eq!(
            term_key("movies", "flag", &json!(true)).as_deref(),
            Some("movies:term:flag:true")
        );
        assert_eq!(term_key("movies", "x", &json!(null)), None);
        assert_eq!(term_key("movies", "x", &json!([1])), None);
    }

    #[test]
    fn test_decode_rejects_non_object() {
        assert!(matches!(
            RedisStore::decode(1, "[1,2]", Some(1)),
            Err(AppError::InvalidDocument(_))
        ));
        let doc = RedisStore::decode(1, r#"{"whoLiked":[3]}"#, Some(7)).unwrap();
        assert_eq!(doc.version.seq_no, 7);
        assert_eq!(doc.fields["whoLiked"], json!([3]));
    }

    async fn live_store() -> RedisStore {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let client = crate::db::create_redis_client(&redis_url).unwrap();
        RedisStore::new(client).await.unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at REDIS_URL"]
    async fn test_live_term_index_follows_rewrites() {
        let store = live_store().await;
        let coll = "likegraph_test_users";
        store.delete_collection(coll).await.unwrap();

        let mut fields = Fields::new();
        fields.insert("likedMovies".to_string(), json!([1, 2]));
        store.upsert(coll, 10, fields).await.unwrap();

        let mut fields = Fields::new();
        fields.insert("likedMovies".to_string(), json!([2, 3]));
        store.upsert(coll, 10, fields).await.unwrap();

        let stale = store
            .find_by_any_term(coll, "likedMovies", &[json!(1)])
            .await
            .unwrap();
        assert!(stale.is_empty());

        let hits = store
            .find_by_any_term(coll, "likedMovies", &[json!(3)])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 10);

        store.delete_collection(coll).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at REDIS_URL"]
    async fn test_live_version_conflict() {
        let store = live_store().await;
        let coll = "likegraph_test_movies";
        store.delete_collection(coll).await.unwrap();

        let mut fields = Fields::new();
        fields.insert("whoLiked".to_string(), json!([]));
        store
            .upsert_if(coll, 5, fields.clone(), Precondition::Absent)
            .await
            .unwrap();
        let read = store.get(coll, 5).await.unwrap().unwrap();

        store.upsert(coll, 5, fields.clone()).await.unwrap();
        let result = store
            .upsert_if(coll, 5, fields.clone(), Precondition::Version(read.version))
            .await;
        assert!(matches!(result, Err(AppError::Conflict(_))));

        // a version read before the drop must not match the recreated document
        let before_drop = store.get(coll, 5).await.unwrap().unwrap().version;
        store.delete_collection(coll).await.unwrap();
        store.upsert(coll, 5, fields.clone()).await.unwrap();
        let result = store
            .upsert_if(coll, 5, fields, Precondition::Version(before_drop))
            .await;
        assert!(matches!(result, Err(AppError::Conflict(_))));

        store.delete_collection(coll).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at REDIS_URL"]
    async fn test_live_drop_leaves_other_collections_and_registry() {
        let store = live_store().await;
        store.delete_collection("likegraph_a").await.unwrap();
        store.delete_collection("likegraph_ab").await.unwrap();
        store.create_collection("likegraph_a").await.unwrap();
        store.create_collection("likegraph_ab").await.unwrap();

        let mut fields = Fields::new();
        fields.insert("likedMovies".to_string(), json!([1]));
        store.upsert("likegraph_ab", 1, fields).await.unwrap();

        store.delete_collection("likegraph_a").await.unwrap();
        assert!(store.get("likegraph_ab", 1).await.unwrap().is_some());
        let names = store.list_collections().await.unwrap();
        assert!(names.contains(&"likegraph_ab".to_string()));
        assert!(!names.contains(&"likegraph_a".to_string()));

        assert!(matches!(
            store.delete_collection("likegraph*").await,
            Err(AppError::InvalidInput(_))
        ));
        store.delete_collection("likegraph_ab").await.unwrap();
    }
}
