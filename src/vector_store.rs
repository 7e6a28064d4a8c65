//! Vector index adapter: embedding-keyed upsert, cosine search, and stats.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};

use crate::config::IndexSettings;
use crate::document::{Document, Metadata, SearchResult};
use crate::embedding::Embedder;
use crate::error::{CoreError, CoreResult};

/// Vectors are written in groups of this size to bound request payloads.
pub const UPSERT_BATCH_SIZE: usize = 50;

/// One embedded record as stored by the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Document id.
    pub id: String,
    /// Embedding components.
    pub values: Vec<f32>,
    /// Stored metadata, including a `text` copy of the document body.
    pub metadata: Metadata,
}

/// One nearest-neighbor hit returned by the index.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexMatch {
    /// Matched record id.
    pub id: String,
    /// Cosine similarity score.
    pub score: f32,
    /// Stored metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// Aggregate statistics reported by the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Number of records currently stored.
    #[serde(alias = "totalRecordCount", alias = "totalVectorCount")]
    pub total_record_count: usize,
    /// Embedding dimension the index was created with.
    pub dimension: usize,
}

/// Seam over concrete similarity indexes; lets tests run in-process.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Writes (or fully replaces) the given records.
    async fn upsert(&self, vectors: Vec<VectorRecord>) -> Result<()>;

    /// Returns the `top_k` nearest records by cosine similarity, optionally
    /// restricted to records whose metadata exactly matches `filter`.
    async fn query(
        &self,
        vector: Vec<f32>,
        top_k: usize,
        filter: Option<Metadata>,
    ) -> Result<Vec<IndexMatch>>;

    /// Removes the records with the given ids.
    async fn delete_many(&self, ids: &[String]) -> Result<()>;

    /// Removes every record in the index.
    async fn delete_all(&self) -> Result<()>;

    /// Reports aggregate index statistics.
    async fn describe_stats(&self) -> Result<IndexStats>;
}

/// In-process cosine-similarity index backed by a guarded map.
pub struct MemoryIndex {
    dimension: usize,
    records: Mutex<HashMap<String, VectorRecord>>,
}

impl MemoryIndex {
    /// Builds an empty index for vectors of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            records: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(&self, vectors: Vec<VectorRecord>) -> Result<()> {
        let mut records = self.records.lock().await;
        for vector in vectors {
            anyhow::ensure!(
                vector.values.len() == self.dimension,
                "vector {} has dimension {}, index expects {}",
                vector.id,
                vector.values.len(),
                self.dimension
            );
            records.insert(vector.id.clone(), vector);
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: Vec<f32>,
        top_k: usize,
        filter: Option<Metadata>,
    ) -> Result<Vec<IndexMatch>> {
        let records = self.records.lock().await;
        let mut matches: Vec<IndexMatch> = records
            .values()
            .filter(|record| matches_filter(&record.metadata, filter.as_ref()))
            .map(|record| IndexMatch {
                id: record.id.clone(),
                score: cosine_similarity(&vector, &record.values),
                metadata: record.metadata.clone(),
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete_many(&self, ids: &[String]) -> Result<()> {
        let mut records = self.records.lock().await;
        for id in ids {
            records.remove(id);
        }
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        self.records.lock().await.clear();
        Ok(())
    }

    async fn describe_stats(&self) -> Result<IndexStats> {
        let records = self.records.lock().await;
        Ok(IndexStats {
            total_record_count: records.len(),
            dimension: self.dimension,
        })
    }
}

fn matches_filter(metadata: &Metadata, filter: Option<&Metadata>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    filter
        .iter()
        .all(|(key, expected)| metadata.get(key) == Some(expected))
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f64 = a
        .iter()
        .zip(b)
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum();
    let norm_a: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)) as f32
}

/// Remote serverless index speaking the Pinecone-compatible REST protocol.
pub struct RemoteIndex {
    client: reqwest::Client,
    host: String,
}

const CONTROL_PLANE: &str = "https://api.pinecone.io";

impl RemoteIndex {
    /// Connects to the configured index, creating it (cosine metric, then a
    /// fixed settling delay) when absent and creation is enabled.
    pub async fn connect(settings: &IndexSettings) -> Result<Self> {
        anyhow::ensure!(
            !settings.api_key.trim().is_empty(),
            "missing vector index API key"
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            "Api-Key",
            HeaderValue::from_str(settings.api_key.trim()).context("invalid index API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .default_headers(headers)
            .build()
            .context("failed to build index HTTP client")?;

        let host = match &settings.host {
            Some(host) => host.trim_end_matches('/').to_string(),
            None => resolve_host(&client, settings).await?,
        };
        let host = if host.starts_with("http") {
            host
        } else {
            format!("https://{host}")
        };
        tracing::info!(index = %settings.index_name, host = %host, "vector index connected");
        Ok(Self { client, host })
    }
}

async fn resolve_host(client: &reqwest::Client, settings: &IndexSettings) -> Result<String> {
    let list_url = format!("{CONTROL_PLANE}/indexes");
    let listing: IndexListing = client
        .get(&list_url)
        .send()
        .await
        .context("failed to list indexes")?
        .error_for_status()
        .context("index listing rejected")?
        .json()
        .await
        .context("failed to parse index listing")?;

    if let Some(found) = listing
        .indexes
        .iter()
        .find(|index| index.name == settings.index_name)
    {
        return Ok(found.host.clone());
    }

    if !settings.create_if_missing {
        bail!("index {} does not exist", settings.index_name);
    }

    let create = CreateIndexBody {
        name: &settings.index_name,
        dimension: settings.dimension,
        metric: "cosine",
        spec: CreateIndexSpec {
            serverless: ServerlessSpec {
                cloud: &settings.cloud,
                region: &settings.region,
            },
        },
    };
    client
        .post(&list_url)
        .json(&create)
        .send()
        .await
        .context("failed to create index")?
        .error_for_status()
        .context("index creation rejected")?;
    tracing::info!(index = %settings.index_name, "vector index created, waiting for it to settle");
    tokio::time::sleep(settings.settle_delay).await;

    let listing: IndexListing = client
        .get(&list_url)
        .send()
        .await
        .context("failed to re-list indexes")?
        .json()
        .await
        .context("failed to parse index listing")?;
    listing
        .indexes
        .into_iter()
        .find(|index| index.name == settings.index_name)
        .map(|index| index.host)
        .with_context(|| format!("index {} missing after creation", settings.index_name))
}

#[async_trait]
impl VectorIndex for RemoteIndex {
    async fn upsert(&self, vectors: Vec<VectorRecord>) -> Result<()> {
        let url = format!("{}/vectors/upsert", self.host);
        let body = UpsertBody { vectors };
        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("failed to call upsert endpoint")?
            .error_for_status()
            .context("upsert rejected")?;
        Ok(())
    }

    async fn query(
        &self,
        vector: Vec<f32>,
        top_k: usize,
        filter: Option<Metadata>,
    ) -> Result<Vec<IndexMatch>> {
        let url = format!("{}/query", self.host);
        let body = QueryBody {
            vector,
            top_k,
            filter,
            include_metadata: true,
        };
        let response: QueryResponse = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("failed to call query endpoint")?
            .error_for_status()
            .context("query rejected")?
            .json()
            .await
            .context("failed to parse query response")?;
        Ok(response.matches)
    }

    async fn delete_many(&self, ids: &[String]) -> Result<()> {
        let url = format!("{}/vectors/delete", self.host);
        let body = DeleteBody {
            ids: Some(ids.to_vec()),
            delete_all: None,
        };
        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("failed to call delete endpoint")?
            .error_for_status()
            .context("delete rejected")?;
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        let url = format!("{}/vectors/delete", self.host);
        let body = DeleteBody {
            ids: None,
            delete_all: Some(true),
        };
        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("failed to call delete endpoint")?
            .error_for_status()
            .context("clear rejected")?;
        Ok(())
    }

    async fn describe_stats(&self) -> Result<IndexStats> {
        let url = format!("{}/describe_index_stats", self.host);
        let stats: IndexStats = self
            .client
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .context("failed to call stats endpoint")?
            .error_for_status()
            .context("stats rejected")?
            .json()
            .await
            .context("failed to parse stats response")?;
        Ok(stats)
    }
}

#[derive(Debug, Deserialize)]
struct IndexListing {
    #[serde(default)]
    indexes: Vec<IndexDescription>,
}

#[derive(Debug, Deserialize)]
struct IndexDescription {
    name: String,
    host: String,
}

#[derive(Serialize)]
struct CreateIndexBody<'a> {
    name: &'a str,
    dimension: usize,
    metric: &'a str,
    spec: CreateIndexSpec<'a>,
}

#[derive(Serialize)]
struct CreateIndexSpec<'a> {
    serverless: ServerlessSpec<'a>,
}

#[derive(Serialize)]
struct ServerlessSpec<'a> {
    cloud: &'a str,
    region: &'a str,
}

#[derive(Serialize)]
struct UpsertBody {
    vectors: Vec<VectorRecord>,
}

#[derive(Serialize)]
struct QueryBody {
    vector: Vec<f32>,
    #[serde(rename = "topK")]
    top_k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Metadata>,
    #[serde(rename = "includeMetadata")]
    include_metadata: bool,
}

#[derive(Serialize)]
struct DeleteBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    ids: Option<Vec<String>>,
    #[serde(rename = "deleteAll", skip_serializing_if = "Option::is_none")]
    delete_all: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<IndexMatch>,
}

/// Adapter combining the embedder with a lazily connected index handle.
///
/// The handle is established on first use and cached for the process
/// lifetime; concurrent first calls initialize it exactly once.
pub struct VectorStore {
    embedder: Embedder,
    settings: IndexSettings,
    index: OnceCell<Arc<dyn VectorIndex>>,
}

impl VectorStore {
    /// Builds a store that connects to the remote index on first use.
    pub fn new(embedder: Embedder, settings: IndexSettings) -> Self {
        Self {
            embedder,
            settings,
            index: OnceCell::new(),
        }
    }

    /// Builds a store over an already connected index handle.
    pub fn with_index(embedder: Embedder, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            embedder,
            settings: IndexSettings::default(),
            index: OnceCell::new_with(Some(index)),
        }
    }

    /// Embedder used for ingestion and queries.
    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    async fn index(&self) -> CoreResult<&Arc<dyn VectorIndex>> {
        self.index
            .get_or_try_init(|| async {
                RemoteIndex::connect(&self.settings)
                    .await
                    .map(|index| Arc::new(index) as Arc<dyn VectorIndex>)
            })
            .await
            .map_err(|err| CoreError::IndexInit(format!("{err:#}")))
    }

    /// Embeds and writes the documents in batches of [`UPSERT_BATCH_SIZE`].
    ///
    /// At-least-once: batches sent before a failure stay written; there is no
    /// rollback. Returns the number of documents submitted.
    pub async fn upsert_documents(&self, documents: &[Document]) -> CoreResult<usize> {
        let index = self.index().await?;
        let mut batch = Vec::with_capacity(UPSERT_BATCH_SIZE.min(documents.len()));
        for document in documents {
            let mut metadata = document.metadata.clone();
            metadata.insert("text".to_string(), Value::String(document.text.clone()));
            batch.push(VectorRecord {
                id: document.id.clone(),
                values: self.embedder.embed(&document.text),
                metadata,
            });
            if batch.len() >= UPSERT_BATCH_SIZE {
                index
                    .upsert(std::mem::take(&mut batch))
                    .await
                    .map_err(|err| CoreError::Upsert(format!("{err:#}")))?;
            }
        }
        if !batch.is_empty() {
            index
                .upsert(batch)
                .await
                .map_err(|err| CoreError::Upsert(format!("{err:#}")))?;
        }
        Ok(documents.len())
    }

    /// Embeds the query and returns the `top_k` most similar documents,
    /// ordered by descending score as ranked by the index.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<Metadata>,
    ) -> CoreResult<Vec<SearchResult>> {
        let index = self.index().await?;
        let filter = filter.filter(|map| !map.is_empty());
        let matches = index
            .query(self.embedder.embed(query), top_k, filter)
            .await
            .map_err(|err| CoreError::Retrieval(format!("{err:#}")))?;
        Ok(matches
            .into_iter()
            .map(|hit| {
                let text = hit
                    .metadata
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                SearchResult {
                    id: hit.id,
                    score: hit.score,
                    text,
                    metadata: hit.metadata,
                }
            })
            .collect())
    }

    /// Deletes the given ids; returns how many deletions were requested.
    pub async fn delete(&self, ids: &[String]) -> CoreResult<usize> {
        let index = self.index().await?;
        index
            .delete_many(ids)
            .await
            .map_err(|err| CoreError::Delete(format!("{err:#}")))?;
        Ok(ids.len())
    }

    /// Reports aggregate index statistics.
    pub async fn stats(&self) -> CoreResult<IndexStats> {
        let index = self.index().await?;
        index
            .describe_stats()
            .await
            .map_err(|err| CoreError::Retrieval(format!("{err:#}")))
    }

    /// Removes every document from the index.
    pub async fn clear(&self) -> CoreResult<()> {
        let index = self.index().await?;
        index
            .delete_all()
            .await
            .map_err(|err| CoreError::Delete(format!("{err:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> VectorStore {
        VectorStore::with_index(Embedder::new(64), Arc::new(MemoryIndex::new(64)))
    }

    fn doc(id: &str, text: &str, metadata: Metadata) -> Document {
        Document {
            id: id.to_string(),
            text: text.to_string(),
            metadata,
        }
    }

    fn meta(key: &str, value: &str) -> Metadata {
        let mut map = Metadata::new();
        map.insert(key.to_string(), json!(value));
        map
    }

    #[tokio::test(flavor = "current_thread")]
    async fn exact_text_ranks_first_with_unit_score() {
        let store = store();
        store
            .upsert_documents(&[
                doc("a", "rust borrow checker", Metadata::new()),
                doc("b", "gardening for beginners", Metadata::new()),
            ])
            .await
            .unwrap();
        let results = store.search("rust borrow checker", 2, None).await.unwrap();
        assert_eq!(results[0].id, "a");
        assert!((results[0].score - 1.0).abs() < 1e-5);
        assert_eq!(results[0].text, "rust borrow checker");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn metadata_filter_is_exact_match() {
        let store = store();
        store
            .upsert_documents(&[
                doc("a", "shared text", meta("source", "wiki")),
                doc("b", "shared text", meta("source", "blog")),
            ])
            .await
            .unwrap();
        let results = store
            .search("shared text", 5, Some(meta("source", "blog")))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "b");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_filter_is_ignored() {
        let store = store();
        store
            .upsert_documents(&[doc("a", "something", Metadata::new())])
            .await
            .unwrap();
        let results = store
            .search("something", 5, Some(Metadata::new()))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn upsert_batches_and_counts_all_documents() {
        let store = store();
        let documents: Vec<Document> = (0..120)
            .map(|i| doc(&format!("doc-{i}"), &format!("body {i}"), Metadata::new()))
            .collect();
        let count = store.upsert_documents(&documents).await.unwrap();
        assert_eq!(count, 120);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_record_count, 120);
        assert_eq!(stats.dimension, 64);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn delete_and_clear() {
        let store = store();
        store
            .upsert_documents(&[
                doc("a", "first", Metadata::new()),
                doc("b", "second", Metadata::new()),
            ])
            .await
            .unwrap();
        let deleted = store.delete(&["a".to_string()]).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.stats().await.unwrap().total_record_count, 1);
        store.clear().await.unwrap();
        assert_eq!(store.stats().await.unwrap().total_record_count, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn upsert_replaces_existing_id() {
        let store = store();
        store
            .upsert_documents(&[doc("a", "old text", Metadata::new())])
            .await
            .unwrap();
        store
            .upsert_documents(&[doc("a", "new text", Metadata::new())])
            .await
            .unwrap();
        let results = store.search("new text", 1, None).await.unwrap();
        assert_eq!(results[0].text, "new text");
        assert_eq!(store.stats().await.unwrap().total_record_count, 1);
    }
}
