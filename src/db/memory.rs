use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{
    matches_any_term, DocVersion, DocumentStore, Fields, Precondition, StoredDocument,
};
use crate::error::{AppError, AppResult};

const PRIMARY_TERM: i64 = 1;

#[derive(Default)]
struct Collection {
    docs: BTreeMap<i64, (Fields, i64)>,
}

impl Collection {
    fn stored(&self, id: i64) -> Option<StoredDocument> {
        self.docs.get(&id).map(|(fields, seq_no)| StoredDocument {
            id,
            fields: fields.clone(),
            version: DocVersion {
                seq_no: *seq_no,
                primary_term: PRIMARY_TERM,
            },
        })
    }
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, Collection>,
    /// Store-wide, so dropping and recreating a collection never reissues a version
    next_seq_no: i64,
}

impl Inner {
    fn put(&mut self, collection: &str, id: i64, fields: Fields) {
        let seq_no = self.next_seq_no;
        self.next_seq_no += 1;
        self.collections
            .entry(collection.to_string())
            .or_default()
            .docs
            .insert(id, (fields, seq_no));
    }
}

/// In-process document store.
///
/// Collections are created on first write, like an auto-creating index.
/// Each write stamps the document with a sequence number unique across the store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every document of a collection in id order
    pub async fn documents(&self, collection: &str) -> Vec<StoredDocument> {
        let inner = self.inner.read().await;
        match inner.collections.get(collection) {
            Some(coll) => coll.docs.keys().filter_map(|id| coll.stored(*id)).collect(),
            None => Vec::new(),
        }
    }

    async fn scan(
        &self,
        collection: &str,
        field: &str,
        values: &[Value],
    ) -> Vec<StoredDocument> {
        self.documents(collection)
            .await
            .into_iter()
            .filter(|doc| matches_any_term(doc, field, values))
            .collect()
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: i64) -> AppResult<Option<StoredDocument>> {
        let inner = self.inner.read().await;
        Ok(inner.collections.get(collection).and_then(|c| c.stored(id)))
    }

    async fn upsert_if(
        &self,
        collection: &str,
        id: i64,
        fields: Fields,
        precondition: Precondition,
    ) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let current = inner
            .collections
            .get(collection)
            .and_then(|c| c.docs.get(&id))
            .map(|(_, seq_no)| *seq_no);

        match (precondition, current) {
            (Precondition::Any, _) | (Precondition::Absent, None) => {}
            (Precondition::Version(expected), Some(seq_no))
                if expected.seq_no == seq_no && expected.primary_term == PRIMARY_TERM => {}
            _ => {
                return Err(AppError::Conflict(format!(
                    "document {} in '{}' changed since it was read",
                    id, collection
                )))
            }
        }

        inner.put(collection, id, fields);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: i64) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(coll) = inner.collections.get_mut(collection) {
            coll.docs.remove(&id);
        }
        Ok(())
    }

    async fn find_by_term(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> AppResult<Vec<StoredDocument>> {
        Ok(self
            .scan(collection, field, std::slice::from_ref(value))
            .await)
    }

    async fn find_by_any_term(
        &self,
        collection: &str,
        field: &str,
        values: &[Value],
    ) -> AppResult<Vec<StoredDocument>> {
        Ok(self.scan(collection, field, values).await)
    }

    async fn create_collection(&self, name: &str) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        if inner.collections.contains_key(name) {
            return Err(AppError::InvalidInput(format!(
                "collection '{}' already exists",
                name
            )));
        }
        inner.collections.insert(name.to_string(), Collection::default());
        Ok(())
    }

    async fn list_collections(&self) -> AppResult<Vec<String>> {
        let inner = self.inner.read().await;
        let mut names: Vec<String> = inner.collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn reindex(&self, source: &str, dest: &str) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let docs: Vec<(i64, Fields)> = inner
            .collections
            .get(source)
            .ok_or_else(|| AppError::NotFound(format!("collection '{}'", source)))?
            .docs
            .iter()
            .map(|(id, (fields, _))| (*id, fields.clone()))
            .collect();

        // copies get fresh versions, and dest exists even when source is empty
        inner.collections.entry(dest.to_string()).or_default();
        for (id, fields) in docs {
            inner.put(dest, id, fields);
        }
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> AppResult<()> {
        self.inner.write().await.collections.remove(name);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
