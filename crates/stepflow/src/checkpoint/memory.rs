// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! In-memory checkpointer.
//!
//! Keeps the full version chain in process memory. Used by tests and as the
//! default store for ephemeral runs; durable storage lives in the
//! `stepflow-sqlite-checkpointer` crate.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use super::{
    metadata_matches_filter, require_thread_id, serialize_pair, Checkpoint, CheckpointConfig,
    CheckpointMetadata, CheckpointSerde, CheckpointTuple, Checkpointer, JsonSerde, ListOptions,
    PendingWrite, PENDING_SENDS_CHANNEL,
};
use crate::error::{CheckpointError, Result};

/// One stored checkpoint row: tagged payloads plus the parent link.
#[derive(Clone)]
struct StoredCheckpoint {
    tag: String,
    checkpoint: Vec<u8>,
    metadata: Vec<u8>,
    parent_id: Option<String>,
}

/// One stored write row.
#[derive(Clone)]
struct StoredWrite {
    channel: String,
    tag: String,
    value: Vec<u8>,
}

/// `(thread_id, checkpoint_ns)` - a version chain key.
type ChainKey = (String, String);
/// `(thread_id, checkpoint_ns, checkpoint_id)` - a write-group key.
type WriteKey = (String, String, String);

/// In-memory checkpoint store.
///
/// Checkpoints are held in a `BTreeMap` keyed by checkpoint id, so "latest"
/// and "before X" queries are ordinary ordered-map operations - the same
/// shape the SQLite store gets from its `ORDER BY checkpoint_id` index.
pub struct MemoryCheckpointer {
    serde: Arc<dyn CheckpointSerde>,
    checkpoints: Mutex<HashMap<ChainKey, BTreeMap<String, StoredCheckpoint>>>,
    writes: Mutex<HashMap<WriteKey, BTreeMap<(String, u32), StoredWrite>>>,
}

impl Default for MemoryCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCheckpointer {
    /// Create an empty store with the default JSON serializer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_serde(Arc::new(JsonSerde))
    }

    /// Create an empty store with a custom serialization protocol.
    #[must_use]
    pub fn with_serde(serde: Arc<dyn CheckpointSerde>) -> Self {
        Self {
            serde,
            checkpoints: Mutex::new(HashMap::new()),
            writes: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored checkpoints across all chains (test helper).
    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints.lock().values().map(BTreeMap::len).sum()
    }

    /// True when no checkpoints are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load_writes(&self, key: &WriteKey) -> Result<Vec<PendingWrite>> {
        let writes = self.writes.lock();
        let Some(group) = writes.get(key) else {
            return Ok(Vec::new());
        };
        group
            .iter()
            .map(|((task_id, idx), row)| {
                Ok(PendingWrite {
                    task_id: task_id.clone(),
                    idx: *idx,
                    channel: row.channel.clone(),
                    value: self.serde.loads(&row.tag, &row.value)?,
                })
            })
            .collect()
    }

    /// Pending sends for a checkpoint: its parent's writes on the reserved
    /// channel, in `(task_id, idx)` order.
    fn load_pending_sends(
        &self,
        thread_id: &str,
        ns: &str,
        parent_id: Option<&str>,
    ) -> Result<Vec<serde_json::Value>> {
        let Some(parent_id) = parent_id else {
            return Ok(Vec::new());
        };
        let key = (thread_id.to_string(), ns.to_string(), parent_id.to_string());
        Ok(self
            .load_writes(&key)?
            .into_iter()
            .filter(|w| w.channel == PENDING_SENDS_CHANNEL)
            .map(|w| w.value)
            .collect())
    }

    fn build_tuple(
        &self,
        thread_id: &str,
        ns: &str,
        id: &str,
        stored: &StoredCheckpoint,
    ) -> Result<CheckpointTuple> {
        let checkpoint_value = self.serde.loads(&stored.tag, &stored.checkpoint)?;
        let mut checkpoint: Checkpoint =
            serde_json::from_value(checkpoint_value).map_err(|e| {
                CheckpointError::DeserializationFailed {
                    reason: format!("checkpoint '{id}': {e}"),
                }
            })?;
        let metadata_value = self.serde.loads(&stored.tag, &stored.metadata)?;
        let metadata: CheckpointMetadata =
            serde_json::from_value(metadata_value).map_err(|e| {
                CheckpointError::DeserializationFailed {
                    reason: format!("metadata for '{id}': {e}"),
                }
            })?;

        checkpoint.pending_sends =
            self.load_pending_sends(thread_id, ns, stored.parent_id.as_deref())?;

        let write_key = (thread_id.to_string(), ns.to_string(), id.to_string());
        let pending_writes = self.load_writes(&write_key)?;

        let parent_config = stored.parent_id.as_ref().map(|parent| CheckpointConfig {
            thread_id: thread_id.to_string(),
            checkpoint_ns: ns.to_string(),
            checkpoint_id: Some(parent.clone()),
        });

        Ok(CheckpointTuple {
            config: CheckpointConfig {
                thread_id: thread_id.to_string(),
                checkpoint_ns: ns.to_string(),
                checkpoint_id: Some(id.to_string()),
            },
            checkpoint,
            metadata,
            parent_config,
            pending_writes,
        })
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let chain_key = (config.thread_id.clone(), config.checkpoint_ns.clone());
        let resolved = {
            let checkpoints = self.checkpoints.lock();
            let Some(chain) = checkpoints.get(&chain_key) else {
                return Ok(None);
            };
            match &config.checkpoint_id {
                Some(id) => chain.get(id).cloned().map(|stored| (id.clone(), stored)),
                None => chain
                    .iter()
                    .next_back()
                    .map(|(id, stored)| (id.clone(), stored.clone())),
            }
        };
        match resolved {
            Some((id, stored)) => Ok(Some(self.build_tuple(
                &config.thread_id,
                &config.checkpoint_ns,
                &id,
                &stored,
            )?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        thread_id: &str,
        namespace: Option<&str>,
        options: ListOptions,
    ) -> Result<Vec<CheckpointTuple>> {
        // Snapshot matching rows first so tuple building never holds the lock.
        let rows: Vec<(String, String, StoredCheckpoint)> = {
            let checkpoints = self.checkpoints.lock();
            let mut rows: Vec<(String, String, StoredCheckpoint)> = checkpoints
                .iter()
                .filter(|((t, ns), _)| {
                    t == thread_id && namespace.map_or(true, |wanted| ns == wanted)
                })
                .flat_map(|((_, ns), chain)| {
                    chain
                        .iter()
                        .map(|(id, stored)| (ns.clone(), id.clone(), stored.clone()))
                })
                .collect();
            // Most-recent-first by checkpoint id.
            rows.sort_by(|a, b| b.1.cmp(&a.1));
            rows
        };

        let mut tuples = Vec::new();
        for (ns, id, stored) in rows {
            if let Some(before) = &options.before {
                if id.as_str() >= before.as_str() {
                    continue;
                }
            }
            let tuple = self.build_tuple(thread_id, &ns, &id, &stored)?;
            if !metadata_matches_filter(&tuple.metadata, options.filter.as_ref()) {
                continue;
            }
            tuples.push(tuple);
            if let Some(limit) = options.limit {
                if tuples.len() >= limit {
                    break;
                }
            }
        }
        Ok(tuples)
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig> {
        require_thread_id(config)?;
        // Serialize (and enforce the shared-tag invariant) before storage.
        let pair = serialize_pair(self.serde.as_ref(), &checkpoint, &metadata)?;

        let chain_key = (config.thread_id.clone(), config.checkpoint_ns.clone());
        let stored = StoredCheckpoint {
            tag: pair.tag,
            checkpoint: pair.checkpoint,
            metadata: pair.metadata,
            parent_id: config.checkpoint_id.clone(),
        };

        self.checkpoints
            .lock()
            .entry(chain_key)
            .or_default()
            .insert(checkpoint.id.clone(), stored);

        debug!(
            thread_id = %config.thread_id,
            checkpoint_id = %checkpoint.id,
            "stored checkpoint"
        );

        Ok(CheckpointConfig {
            thread_id: config.thread_id.clone(),
            checkpoint_ns: config.checkpoint_ns.clone(),
            checkpoint_id: Some(checkpoint.id),
        })
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: &[(String, serde_json::Value)],
        task_id: &str,
    ) -> Result<()> {
        require_thread_id(config)?;
        let checkpoint_id = config
            .checkpoint_id
            .clone()
            .ok_or(crate::error::Error::MissingConfiguration {
                field: "checkpoint_id",
            })?;

        let key = (
            config.thread_id.clone(),
            config.checkpoint_ns.clone(),
            checkpoint_id,
        );
        let mut store = self.writes.lock();
        let group = store.entry(key).or_default();
        for (idx, (channel, value)) in writes.iter().enumerate() {
            let (tag, payload) = self.serde.dumps(value)?;
            group.insert(
                (task_id.to_string(), idx as u32),
                StoredWrite {
                    channel: channel.clone(),
                    tag,
                    value: payload,
                },
            );
        }
        Ok(())
    }
}
