// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! On-disk persisted vector store.
//!
//! One store per thread id, created empty on first access. Documents are
//! chunked (fixed size with overlap) before insertion and the whole index
//! is flushed to disk after every mutation, so the store survives session
//! cleanup - it is durable knowledge, independent of session liveness.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::embeddings::{cosine_similarity, Embeddings};
use crate::error::{Error, Result};
use crate::text_splitter::CharacterTextSplitter;

/// A retrieved document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable id of the stored chunk.
    pub id: String,
    /// Chunk text.
    pub page_content: String,
    /// Arbitrary metadata (source, title, filename, ...).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One stored chunk with its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    id: String,
    text: String,
    vector: Vec<f32>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

/// Serialized index file layout.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    entries: Vec<StoredEntry>,
}

/// Persistent vector store: JSON index on disk, cosine top-k in memory.
pub struct PersistentVectorStore {
    path: PathBuf,
    embeddings: Arc<dyn Embeddings>,
    splitter: CharacterTextSplitter,
    entries: tokio::sync::Mutex<Vec<StoredEntry>>,
}

impl PersistentVectorStore {
    /// Open the store at `path`, loading an existing index or starting
    /// empty when none is on disk.
    pub async fn open(path: impl Into<PathBuf>, embeddings: Arc<dyn Embeddings>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let index: IndexFile = serde_json::from_slice(&bytes)?;
                index.entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), count = entries.len(), "opened vector store");
        Ok(Self {
            path,
            embeddings,
            splitter: CharacterTextSplitter::default(),
            entries: tokio::sync::Mutex::new(entries),
        })
    }

    /// Location of the index file on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored chunks.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// True when no chunks are stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Chunk, embed and insert documents, then flush the index to disk.
    ///
    /// `metadatas` (when given) must pair one metadata map per document;
    /// every chunk of a document inherits its metadata. Returns the ids of
    /// the inserted chunks.
    pub async fn add_documents(
        &self,
        documents: &[String],
        metadatas: Option<&[HashMap<String, serde_json::Value>]>,
    ) -> Result<Vec<String>> {
        if let Some(metadatas) = metadatas {
            if metadatas.len() != documents.len() {
                return Err(Error::Generic(format!(
                    "metadatas length ({}) must match documents length ({})",
                    metadatas.len(),
                    documents.len()
                )));
            }
        }

        let chunks = self.splitter.split_all(documents);
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = chunks.iter().map(|(_, text)| text.clone()).collect();
        let vectors = self.embeddings.embed_documents(&texts).await?;

        let mut ids = Vec::with_capacity(chunks.len());
        {
            let mut entries = self.entries.lock().await;
            for ((source_idx, text), vector) in chunks.into_iter().zip(vectors) {
                let id = uuid::Uuid::new_v4().to_string();
                let metadata = metadatas
                    .and_then(|m| m.get(source_idx))
                    .cloned()
                    .unwrap_or_default();
                entries.push(StoredEntry {
                    id: id.clone(),
                    text,
                    vector,
                    metadata,
                });
                ids.push(id);
            }
            self.flush(&entries).await?;
        }
        Ok(ids)
    }

    /// Similarity search: top-`k` chunks by cosine similarity, optionally
    /// restricted to entries whose metadata exactly matches `filter`.
    pub async fn similarity_search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&HashMap<String, serde_json::Value>>,
    ) -> Result<Vec<Document>> {
        let query_vector = self.embeddings.embed_query(query).await?;
        let entries = self.entries.lock().await;

        let mut scored: Vec<(f32, &StoredEntry)> = entries
            .iter()
            .filter(|entry| matches_filter(entry, filter))
            .map(|entry| (cosine_similarity(&query_vector, &entry.vector), entry))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(_, entry)| Document {
                id: entry.id.clone(),
                page_content: entry.text.clone(),
                metadata: entry.metadata.clone(),
            })
            .collect())
    }

    /// Atomically write the index: temp file in the same directory, then
    /// rename over the target.
    async fn flush(&self, entries: &[StoredEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let index = IndexFile {
            entries: entries.to_vec(),
        };
        let bytes = serde_json::to_vec(&index)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), count = entries.len(), "flushed vector store");
        Ok(())
    }
}

fn matches_filter(
    entry: &StoredEntry,
    filter: Option<&HashMap<String, serde_json::Value>>,
) -> bool {
    match filter {
        None => true,
        Some(filter) => filter
            .iter()
            .all(|(key, value)| entry.metadata.get(key) == Some(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEmbeddings;
    use serde_json::json;

    fn store_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("kb.json")
    }

    #[tokio::test]
    async fn test_open_creates_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentVectorStore::open(store_path(&dir), Arc::new(MockEmbeddings::new(16)))
            .await
            .unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_add_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentVectorStore::open(store_path(&dir), Arc::new(MockEmbeddings::new(16)))
            .await
            .unwrap();

        store
            .add_documents(
                &[
                    "the capital of France is Paris".to_string(),
                    "rust has a borrow checker".to_string(),
                ],
                None,
            )
            .await
            .unwrap();

        let results = store
            .similarity_search("the capital of France is Paris", 1, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].page_content.contains("Paris"));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        {
            let store =
                PersistentVectorStore::open(&path, Arc::new(MockEmbeddings::new(16)))
                    .await
                    .unwrap();
            store
                .add_documents(&["durable knowledge".to_string()], None)
                .await
                .unwrap();
        }
        let reopened = PersistentVectorStore::open(&path, Arc::new(MockEmbeddings::new(16)))
            .await
            .unwrap();
        assert_eq!(reopened.len().await, 1);
        let results = reopened
            .similarity_search("durable knowledge", 5, None)
            .await
            .unwrap();
        assert_eq!(results[0].page_content, "durable knowledge");
    }

    #[tokio::test]
    async fn test_metadata_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentVectorStore::open(store_path(&dir), Arc::new(MockEmbeddings::new(16)))
            .await
            .unwrap();

        let metadatas = vec![
            HashMap::from([("source".to_string(), json!("a.txt"))]),
            HashMap::from([("source".to_string(), json!("b.txt"))]),
        ];
        store
            .add_documents(
                &["doc one".to_string(), "doc two".to_string()],
                Some(&metadatas),
            )
            .await
            .unwrap();

        let filter = HashMap::from([("source".to_string(), json!("b.txt"))]);
        let results = store
            .similarity_search("doc", 10, Some(&filter))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata["source"], json!("b.txt"));
    }

    #[tokio::test]
    async fn test_long_documents_are_chunked() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentVectorStore::open(store_path(&dir), Arc::new(MockEmbeddings::new(16)))
            .await
            .unwrap();
        let long_doc = "sentence about storage systems. ".repeat(100);
        let ids = store.add_documents(&[long_doc], None).await.unwrap();
        assert!(ids.len() > 1, "a long document must produce several chunks");
        assert_eq!(store.len().await, ids.len());
    }

    #[tokio::test]
    async fn test_metadata_length_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentVectorStore::open(store_path(&dir), Arc::new(MockEmbeddings::new(16)))
            .await
            .unwrap();
        let err = store
            .add_documents(&["one".to_string()], Some(&[]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("metadatas length"));
    }
}
