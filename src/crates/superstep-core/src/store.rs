//! Cross-thread key-value store with optional similarity search
//!
//! Checkpoints belong to one thread. Data that must outlive a thread, such as
//! user preferences or facts learned in earlier conversations, goes into a
//! [`Store`] instead. Nodes reach it through
//! [`NodeContext::store`](crate::NodeContext::store).
//!
//! Items are addressed by a hierarchical namespace plus a key:
//!
//! ```text
//! ("users", "42", "memories") / "favourite-food" → {"text": "pizza"}
//! ```
//!
//! [`Store::search`] lists items under a namespace prefix. Without a query the
//! most recently updated items come first. When the store has an
//! [`IndexConfig`] and the request carries a query, items are ranked by cosine
//! similarity between the query embedding and the embeddings of the configured
//! fields.
//!
//! There is no transactional coupling between the store and the checkpoint log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during Store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Namespace is empty or has an empty label
    #[error("Invalid namespace: {0:?}")]
    InvalidNamespace(Vec<String>),

    /// The embedder failed or returned the wrong number of vectors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Other error
    #[error("Store error: {0}")]
    Other(String),
}

/// Result type for Store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// A stored value with its address and timestamps
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub value: Value,
    pub key: String,
    pub namespace: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An item returned by [`Store::search`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchItem {
    #[serde(flatten)]
    pub item: Item,
    /// Cosine similarity to the query, when similarity search was used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Parameters for [`Store::search`]
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub filter: Option<HashMap<String, Value>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: None,
            filter: None,
            limit: 10,
            offset: 0,
        }
    }
}

impl SearchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Natural-language query for similarity ranking
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Require `value[field] == expected` for every entry
    pub fn filter(mut self, field: impl Into<String>, expected: Value) -> Self {
        self.filter
            .get_or_insert_with(HashMap::new)
            .insert(field.into(), expected);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Turns texts into vectors for similarity search
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, in order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Similarity index settings
#[derive(Clone)]
pub struct IndexConfig {
    pub embedder: Arc<dyn Embedder>,
    /// Dotted paths into the value to embed; `$` embeds the whole value
    pub fields: Vec<String>,
}

impl IndexConfig {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            fields: vec!["$".to_string()],
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    fn texts(&self, value: &Value) -> Vec<String> {
        self.fields
            .iter()
            .filter_map(|field| extract_field(value, field))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()
    }
}

impl std::fmt::Debug for IndexConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexConfig")
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

fn extract_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path == "$" {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

/// Cosine similarity of two vectors; zero when either has no magnitude
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Store trait for cross-thread key-value storage
#[async_trait]
pub trait Store: Send + Sync {
    /// Get an item by namespace and key
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Item>>;

    /// Insert or replace an item; `created_at` survives replacement
    async fn put(&self, namespace: &[String], key: &str, value: Value) -> Result<()>;

    /// Delete an item, returning whether it existed
    async fn delete(&self, namespace: &[String], key: &str) -> Result<bool>;

    /// Search items whose namespace starts with `namespace_prefix`
    async fn search(
        &self,
        namespace_prefix: &[String],
        request: SearchRequest,
    ) -> Result<Vec<SearchItem>>;

    /// Distinct namespaces starting with `prefix`, truncated to `max_depth` labels
    async fn list_namespaces(
        &self,
        prefix: &[String],
        max_depth: Option<usize>,
    ) -> Result<Vec<Vec<String>>>;
}

#[derive(Debug, Clone)]
struct StoredItem {
    item: Item,
    embeddings: Vec<Vec<f32>>,
}

/// In-memory [`Store`] implementation
#[derive(Clone, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<HashMap<Vec<String>, BTreeMap<String, StoredItem>>>>,
    index: Option<IndexConfig>,
}

impl InMemoryStore {
    /// Create a store without similarity search
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that embeds values for similarity search
    pub fn with_index(index: IndexConfig) -> Self {
        Self {
            data: Arc::default(),
            index: Some(index),
        }
    }

    /// Number of stored items
    pub fn len(&self) -> usize {
        self.data.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(namespace: &[String]) -> Result<()> {
        if namespace.is_empty() || namespace.iter().any(String::is_empty) {
            return Err(StoreError::InvalidNamespace(namespace.to_vec()));
        }
        Ok(())
    }

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let Some(index) = &self.index else {
            return Ok(Vec::new());
        };
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = index.embedder.embed(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(StoreError::Embedding(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("items", &self.len())
            .field("index", &self.index)
            .finish()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Item>> {
        Self::validate(namespace)?;
        Ok(self
            .data
            .read()
            .get(namespace)
            .and_then(|items| items.get(key))
            .map(|stored| stored.item.clone()))
    }

    async fn put(&self, namespace: &[String], key: &str, value: Value) -> Result<()> {
        Self::validate(namespace)?;
        let texts = self
            .index
            .as_ref()
            .map(|index| index.texts(&value))
            .unwrap_or_default();
        let embeddings = self.embed(texts).await?;

        let now = Utc::now();
        let mut data = self.data.write();
        let items = data.entry(namespace.to_vec()).or_default();
        let created_at = items
            .get(key)
            .map(|existing| existing.item.created_at)
            .unwrap_or(now);
        items.insert(
            key.to_string(),
            StoredItem {
                item: Item {
                    value,
                    key: key.to_string(),
                    namespace: namespace.to_vec(),
                    created_at,
                    updated_at: now,
                },
                embeddings,
            },
        );
        Ok(())
    }

    async fn delete(&self, namespace: &[String], key: &str) -> Result<bool> {
        Self::validate(namespace)?;
        let mut data = self.data.write();
        let Some(items) = data.get_mut(namespace) else {
            return Ok(false);
        };
        let removed = items.remove(key).is_some();
        if items.is_empty() {
            data.remove(namespace);
        }
        Ok(removed)
    }

    async fn search(
        &self,
        namespace_prefix: &[String],
        request: SearchRequest,
    ) -> Result<Vec<SearchItem>> {
        let query_vector = match (&request.query, &self.index) {
            (Some(query), Some(_)) => self.embed(vec![query.clone()]).await?.into_iter().next(),
            _ => None,
        };

        let mut matches: Vec<SearchItem> = {
            let data = self.data.read();
            data.iter()
                .filter(|(namespace, _)| namespace.starts_with(namespace_prefix))
                .flat_map(|(_, items)| items.values())
                .filter(|stored| {
                    request.filter.as_ref().map_or(true, |filter| {
                        filter
                            .iter()
                            .all(|(field, expected)| {
                                extract_field(&stored.item.value, field) == Some(expected)
                            })
                    })
                })
                .map(|stored| SearchItem {
                    item: stored.item.clone(),
                    score: query_vector.as_ref().map(|query| {
                        stored
                            .embeddings
                            .iter()
                            .map(|embedding| cosine_similarity(query, embedding))
                            .fold(0.0f64, f64::max)
                    }),
                })
                .collect()
        };

        matches.sort_by(|a, b| {
            let by_score = match (a.score, b.score) {
                (Some(x), Some(y)) => y.total_cmp(&x),
                _ => std::cmp::Ordering::Equal,
            };
            by_score
                .then_with(|| b.item.updated_at.cmp(&a.item.updated_at))
                .then_with(|| a.item.namespace.cmp(&b.item.namespace))
                .then_with(|| a.item.key.cmp(&b.item.key))
        });

        debug!(
            prefix = ?namespace_prefix,
            found = matches.len(),
            similarity = query_vector.is_some(),
            "Store search"
        );

        Ok(matches
            .into_iter()
            .skip(request.offset)
            .take(request.limit)
            .collect())
    }

    async fn list_namespaces(
        &self,
        prefix: &[String],
        max_depth: Option<usize>,
    ) -> Result<Vec<Vec<String>>> {
        let data = self.data.read();
        let namespaces: BTreeSet<Vec<String>> = data
            .keys()
            .filter(|namespace| namespace.starts_with(prefix))
            .map(|namespace| match max_depth {
                Some(depth) => namespace.iter().take(depth).cloned().collect(),
                None => namespace.clone(),
            })
            .collect();
        Ok(namespaces.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    /// Letter-frequency embedding, enough to rank overlapping words higher.
    struct LetterEmbedder;

    #[async_trait]
    impl Embedder for LetterEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut v = vec![0.0f32; 26];
                    for c in text.to_lowercase().chars().filter(char::is_ascii_lowercase) {
                        v[(c as u8 - b'a') as usize] += 1.0;
                    }
                    v
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_store_put_get() {
        let store = InMemoryStore::new();
        let namespace = ns(&["users", "1"]);

        store.put(&namespace, "name", json!("ada")).await.unwrap();
        let item = store.get(&namespace, "name").await.unwrap().unwrap();
        assert_eq!(item.value, json!("ada"));
        assert_eq!(item.key, "name");
        assert_eq!(item.namespace, namespace);
        assert_eq!(item.created_at, item.updated_at);

        assert!(store.get(&namespace, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_overwrite_keeps_created_at() {
        let store = InMemoryStore::new();
        let namespace = ns(&["users", "1"]);

        store.put(&namespace, "k", json!(1)).await.unwrap();
        let first = store.get(&namespace, "k").await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.put(&namespace, "k", json!(2)).await.unwrap();
        let second = store.get(&namespace, "k").await.unwrap().unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(second.value, json!(2));
    }

    #[tokio::test]
    async fn test_store_delete() {
        let store = InMemoryStore::new();
        let namespace = ns(&["a"]);
        store.put(&namespace, "k", json!(true)).await.unwrap();

        assert!(store.delete(&namespace, "k").await.unwrap());
        assert!(!store.delete(&namespace, "k").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_namespace() {
        let store = InMemoryStore::new();
        let err = store.put(&[], "k", json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidNamespace(_)));
    }

    #[tokio::test]
    async fn test_search_by_recency_and_filter() {
        let store = InMemoryStore::new();
        let namespace = ns(&["docs"]);
        for (key, kind) in [("a", "note"), ("b", "todo"), ("c", "note")] {
            store
                .put(&namespace, key, json!({"kind": kind}))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let all = store.search(&ns(&["docs"]), SearchRequest::new()).await.unwrap();
        let keys: Vec<_> = all.iter().map(|r| r.item.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "b", "a"]);
        assert!(all.iter().all(|r| r.score.is_none()));

        let notes = store
            .search(&ns(&["docs"]), SearchRequest::new().filter("kind", json!("note")).limit(1))
            .await
            .unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].item.key, "c");

        let page = store
            .search(&ns(&["docs"]), SearchRequest::new().offset(2))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].item.key, "a");
    }

    #[tokio::test]
    async fn test_similarity_search() {
        let index = IndexConfig::new(Arc::new(LetterEmbedder)).with_fields(["text"]);
        let store = InMemoryStore::with_index(index);
        let namespace = ns(&["memories"]);

        store
            .put(&namespace, "1", json!({"text": "pizza"}))
            .await
            .unwrap();
        store
            .put(&namespace, "2", json!({"text": "quantum mechanics"}))
            .await
            .unwrap();

        let results = store
            .search(&namespace, SearchRequest::new().query("pizza pie"))
            .await
            .unwrap();
        assert_eq!(results[0].item.key, "1");
        let top = results[0].score.unwrap();
        let other = results[1].score.unwrap();
        assert!(top > other);
    }

    #[tokio::test]
    async fn test_list_namespaces() {
        let store = InMemoryStore::new();
        store.put(&ns(&["users", "1", "prefs"]), "k", json!(1)).await.unwrap();
        store.put(&ns(&["users", "2", "prefs"]), "k", json!(1)).await.unwrap();
        store.put(&ns(&["teams", "x"]), "k", json!(1)).await.unwrap();

        let users = store.list_namespaces(&ns(&["users"]), Some(2)).await.unwrap();
        assert_eq!(users, vec![ns(&["users", "1"]), ns(&["users", "2"])]);

        let all = store.list_namespaces(&[], None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
