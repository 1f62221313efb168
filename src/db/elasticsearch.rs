//! Elasticsearch-backed document store.
//!
//! Collections map to indices, documents to `_doc` entries keyed by the entity id.
//! Versions are the `_seq_no`/`_primary_term` pair Elasticsearch reports.
use reqwest::{Client as HttpClient, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use std::time::Duration;

use super::{DocVersion, DocumentStore, Fields, Precondition, StoredDocument};
use crate::{
    config::Config,
    error::{AppError, AppResult},
};

#[derive(Debug, Deserialize)]
struct ApiGetResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source", default)]
    source: Option<Fields>,
    #[serde(rename = "_seq_no", default)]
    seq_no: Option<i64>,
    #[serde(rename = "_primary_term", default)]
    primary_term: Option<i64>,
}

/// How long a point in time stays open between pages
const PIT_KEEP_ALIVE: &str = "1m";

#[derive(Debug, Deserialize)]
struct ApiPitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiSearchResponse {
    #[serde(default)]
    pit_id: Option<String>,
    hits: ApiHits,
}

#[derive(Debug, Deserialize)]
struct ApiHits {
    hits: Vec<ApiHit>,
}

#[derive(Debug, Deserialize)]
struct ApiHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Fields,
    #[serde(rename = "_seq_no", default)]
    seq_no: i64,
    #[serde(rename = "_primary_term", default)]
    primary_term: i64,
    /// Sort values of the hit, used as the `search_after` cursor
    #[serde(default)]
    sort: Option<Value>,
}

impl ApiSearchResponse {
    /// Cursor for the next page, or `None` once a short page shows the results are exhausted
    fn next_cursor(&self, page_size: usize) -> Option<Value> {
        if self.hits.hits.len() < page_size {
            return None;
        }
        self.hits.hits.last().and_then(|hit| hit.sort.clone())
    }
}

impl ApiHit {
    fn into_document(self) -> AppResult<StoredDocument> {
        let id = self.id.parse::<i64>().map_err(|_| {
            AppError::InvalidDocument(format!("document id '{}' is not an integer", self.id))
        })?;
        Ok(StoredDocument {
            id,
            fields: self.source,
            version: DocVersion {
                seq_no: self.seq_no,
                primary_term: self.primary_term,
            },
        })
    }
}

#[derive(Clone)]
pub struct ElasticsearchStore {
    http_client: HttpClient,
    base_url: String,
    search_size: usize,
    refresh_policy: Option<String>,
    index_shards: u32,
    index_replicas: u32,
}

impl ElasticsearchStore {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let refresh_policy = Some(config.refresh_policy.trim().to_string())
            .filter(|policy| !policy.is_empty());

        Ok(Self {
            http_client,
            base_url: config.elasticsearch_url.trim_end_matches('/').to_string(),
            search_size: config.search_size.max(1),
            refresh_policy,
            index_shards: config.index_shards,
            index_replicas: config.index_replicas,
        })
    }

    fn doc_url(&self, collection: &str, id: i64) -> String {
        format!("{}/{}/_doc/{}", self.base_url, collection, id)
    }

    fn write_params(&self, precondition: Precondition) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(policy) = &self.refresh_policy {
            params.push(("refresh", policy.clone()));
        }
        match precondition {
            Precondition::Any => {}
            Precondition::Absent => params.push(("op_type", "create".to_string())),
            Precondition::Version(version) => {
                params.push(("if_seq_no", version.seq_no.to_string()));
                params.push(("if_primary_term", version.primary_term.to_string()));
            }
        }
        params
    }

    /// One page of a point-in-time search, sorted by shard order
    fn page_body(&self, pit_id: &str, query: &Value, search_after: Option<&Value>) -> Value {
        let mut body = json!({
            "size": self.search_size,
            "seq_no_primary_term": true,
            "track_total_hits": false,
            "query": query,
            "pit": { "id": pit_id, "keep_alive": PIT_KEEP_ALIVE },
            "sort": [{ "_shard_doc": "asc" }],
        });
        if let Some(cursor) = search_after {
            body["search_after"] = cursor.clone();
        }
        body
    }

    /// Opens a point in time over a collection; a missing index yields `None`
    async fn open_pit(&self, collection: &str) -> AppResult<Option<String>> {
        let response = self
            .http_client
            .post(format!("{}/{}/_pit", self.base_url, collection))
            .query(&[("keep_alive", PIT_KEEP_ALIVE)])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, collection).await?;
        let pit: ApiPitResponse = decode(response, collection).await?;
        Ok(Some(pit.id))
    }

    async fn close_pit(&self, pit_id: &str) {
        let result = self
            .http_client
            .delete(format!("{}/_pit", self.base_url))
            .json(&json!({ "id": pit_id }))
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to close point in time");
        }
    }

    /// Runs a search over every matching document, paging with `search_after`.
    ///
    /// A missing index yields no hits.
    async fn search(&self, collection: &str, query: Value) -> AppResult<Vec<StoredDocument>> {
        let Some(mut pit_id) = self.open_pit(collection).await? else {
            return Ok(Vec::new());
        };

        let result = self.collect_pages(collection, &mut pit_id, &query).await;
        self.close_pit(&pit_id).await;
        result
    }

    async fn collect_pages(
        &self,
        collection: &str,
        pit_id: &mut String,
        query: &Value,
    ) -> AppResult<Vec<StoredDocument>> {
        let mut docs = Vec::new();
        let mut cursor: Option<Value> = None;
        let mut pages = 0;

        loop {
            let response = self
                .http_client
                .post(format!("{}/_search", self.base_url))
                .json(&self.page_body(pit_id, query, cursor.as_ref()))
                .send()
                .await?;
            let response = check_status(response, collection).await?;
            let page: ApiSearchResponse = decode(response, collection).await?;
            pages += 1;

            // the cluster may hand back a new id for the same point in time
            if let Some(id) = &page.pit_id {
                pit_id.clone_from(id);
            }
            cursor = page.next_cursor(self.search_size);

            for hit in page.hits.hits {
                docs.push(hit.into_document()?);
            }
            if cursor.is_none() {
                break;
            }
        }

        tracing::debug!(collection = %collection, pages, hits = docs.len(), "Search completed");
        Ok(docs)
    }
}

/// Parses a response body, reporting a malformed body as an invalid document
async fn decode<T: DeserializeOwned>(response: Response, context: &str) -> AppResult<T> {
    let bytes = response.bytes().await?;
    parse_body(&bytes, context)
}

fn parse_body<T: DeserializeOwned>(bytes: &[u8], context: &str) -> AppResult<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        AppError::InvalidDocument(format!("{} returned an unexpected body: {}", context, e))
    })
}

/// Maps a non-success response to the error taxonomy
async fn check_status(response: Response, context: &str) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{} returned status {}: {}", context, status, body);
    Err(match status {
        StatusCode::CONFLICT => AppError::Conflict(message),
        StatusCode::NOT_FOUND => AppError::NotFound(message),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            AppError::StoreUnavailable(message)
        }
        _ => AppError::InvalidInput(message),
    })
}

#[async_trait::async_trait]
impl DocumentStore for ElasticsearchStore {
    async fn get(&self, collection: &str, id: i64) -> AppResult<Option<StoredDocument>> {
        let response = self
            .http_client
            .get(self.doc_url(collection, id))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, collection).await?;

        let body: ApiGetResponse = decode(response, collection).await?;
        if !body.found {
            return Ok(None);
        }
        Ok(Some(StoredDocument {
            id,
            fields: body.source.unwrap_or_default(),
            version: DocVersion {
                seq_no: body.seq_no.unwrap_or_default(),
                primary_term: body.primary_term.unwrap_or_default(),
            },
        }))
    }

    async fn upsert_if(
        &self,
        collection: &str,
        id: i64,
        fields: Fields,
        precondition: Precondition,
    ) -> AppResult<()> {
        let response = self
            .http_client
            .put(self.doc_url(collection, id))
            .query(&self.write_params(precondition))
            .json(&fields)
            .send()
            .await?;

        check_status(response, collection).await?;
        tracing::debug!(collection = %collection, id, "Document indexed");
        Ok(())
    }

    async fn delete(&self, collection: &str, id: i64) -> AppResult<()> {
        let response = self
            .http_client
            .delete(self.doc_url(collection, id))
            .query(&self.write_params(Precondition::Any))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, collection).await?;
        Ok(())
    }

    async fn find_by_term(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> AppResult<Vec<StoredDocument>> {
        self.search(collection, json!({ "term": { field: value } }))
            .await
    }

    async fn find_by_any_term(
        &self,
        collection: &str,
        field: &str,
        values: &[Value],
    ) -> AppResult<Vec<StoredDocument>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        self.search(collection, json!({ "terms": { field: values } }))
            .await
    }

    async fn create_collection(&self, name: &str) -> AppResult<()> {
        let response = self
            .http_client
            .put(format!("{}/{}", self.base_url, name))
            .json(&json!({
                "settings": {
                    "number_of_shards": self.index_shards,
                    "number_of_replicas": self.index_replicas,
                }
            }))
            .send()
            .await?;

        check_status(response, name).await?;
        tracing::info!(index = %name, "Index created");
        Ok(())
    }

    async fn list_collections(&self) -> AppResult<Vec<String>> {
        let response = self
            .http_client
            .get(format!("{}/_alias", self.base_url))
            .send()
            .await?;
        let response = check_status(response, "_alias").await?;

        let body: Map<String, Value> = decode(response, "_alias").await?;
        let mut names: Vec<String> = body.into_iter().map(|(name, _)| name).collect();
        names.sort();
        Ok(names)
    }

    async fn reindex(&self, source: &str, dest: &str) -> AppResult<()> {
        let response = self
            .http_client
            .post(format!("{}/_reindex", self.base_url))
            .query(&[("refresh", "true")])
            .json(&json!({
                "source": { "index": source },
                "dest": { "index": dest },
            }))
            .send()
            .await?;

        check_status(response, source).await?;
        tracing::info!(source = %source, dest = %dest, "Reindex completed");
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> AppResult<()> {
        let response = self
            .http_client
            .delete(format!("{}/{}", self.base_url, name))
            .send()
            .await?;

        match response.status() {
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => Ok(()),
            _ => check_status(response, name).await.map(|_| ()),
        }
    }

    fn name(&self) -> &'static str {
        "elasticsearch"
    }
}
