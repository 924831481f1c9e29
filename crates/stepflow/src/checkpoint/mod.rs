// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Checkpoint model and the [`Checkpointer`] trait.
//!
//! Every node transition of the graph is persisted as a checkpoint keyed by
//! `(thread_id, checkpoint_ns, checkpoint_id)`. Checkpoints link to their
//! parent, forming a version chain per `(thread, namespace)`; checkpoint id
//! ordering within a chain is monotonic, so "latest" and "list since X" are
//! plain id comparisons.
//!
//! Two kinds of rows exist:
//!
//! - **Checkpoints** - a serialized state blob plus serialized metadata,
//!   each carrying a format tag. A tag disagreement between the two is a
//!   fatal invariant violation and rejects the write before storage.
//! - **Pending writes** - `(task_id, idx, channel, value)` records attached
//!   to a checkpoint id: side effects produced by a task that have not yet
//!   been folded into the next checkpoint's state. Writes on the reserved
//!   [`PENDING_SENDS_CHANNEL`] of a checkpoint represent values in flight
//!   to its *child* and are surfaced as that child's `pending_sends`.
//!
//! [`MemoryCheckpointer`] is the in-process reference implementation; the
//! `stepflow-sqlite-checkpointer` crate provides the durable one.

mod memory;

pub use memory::MemoryCheckpointer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Reserved channel name for values in flight between a checkpoint and its
/// child. Writes recorded on this channel are not ordinary pending writes:
/// they are re-surfaced as the *next* checkpoint's `pending_sends`.
pub const PENDING_SENDS_CHANNEL: &str = "__pending_sends__";

/// Metadata keys that `list` filters may match on. Unknown filter keys are
/// ignored, not errors.
pub const METADATA_FILTER_KEYS: &[&str] = &["source", "step"];

/// Addressing for checkpoint operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Thread (conversation) id. Required for all writes.
    pub thread_id: String,
    /// Checkpoint namespace; the empty string is the root namespace.
    #[serde(default)]
    pub checkpoint_ns: String,
    /// Specific checkpoint id; `None` addresses the latest in the chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
}

impl CheckpointConfig {
    /// Config addressing the latest checkpoint of a thread's root namespace.
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: String::new(),
            checkpoint_id: None,
        }
    }

    /// Use a non-root namespace.
    #[must_use]
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.checkpoint_ns = ns.into();
        self
    }

    /// Address a specific checkpoint id.
    #[must_use]
    pub fn with_checkpoint_id(mut self, id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(id.into());
        self
    }
}

/// Immutable snapshot of graph state at one transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Monotonic id (see [`next_checkpoint_id`]).
    pub id: String,
    /// Wall-clock timestamp of the snapshot.
    pub ts: DateTime<Utc>,
    /// Serialized graph state.
    pub state: serde_json::Value,
    /// Values in flight from the parent step to this one. Stripped from the
    /// persisted payload by `put` and reconstructed at read time from the
    /// parent's writes on [`PENDING_SENDS_CHANNEL`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_sends: Vec<serde_json::Value>,
}

impl Checkpoint {
    /// Create a checkpoint with a fresh monotonic id.
    pub fn new(state: serde_json::Value) -> Self {
        Self {
            id: next_checkpoint_id(),
            ts: Utc::now(),
            state,
            pending_sends: Vec::new(),
        }
    }

    /// Copy of this checkpoint with `pending_sends` removed, as persisted.
    #[must_use]
    pub fn stripped(&self) -> Self {
        Self {
            id: self.id.clone(),
            ts: self.ts,
            state: self.state.clone(),
            pending_sends: Vec::new(),
        }
    }
}

/// Source of a checkpoint write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    /// First checkpoint of a run, holding the input state.
    Input,
    /// Produced by the driver loop between node executions.
    #[default]
    Loop,
    /// Produced by an external state update (e.g. resume injection).
    Update,
}

/// Metadata persisted alongside each checkpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Where the write came from.
    pub source: CheckpointSource,
    /// Step counter: -1 for input, then incremented per transition.
    pub step: i64,
    /// Coarse-grained summary of what each task wrote at this step.
    #[serde(default)]
    pub writes: serde_json::Map<String, serde_json::Value>,
    /// Parent chain summary: namespace to parent checkpoint id.
    #[serde(default)]
    pub parents: HashMap<String, String>,
}

/// A side-effect value recorded against a task, not yet folded into a
/// checkpoint's primary state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    /// Task that produced the write.
    pub task_id: String,
    /// Per-task ordering index; `(task_id, idx)` is the replace key.
    pub idx: u32,
    /// Channel the value belongs to.
    pub channel: String,
    /// The value itself.
    pub value: serde_json::Value,
}

/// Everything reconstructed for one checkpoint on read.
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    /// Resolved config (thread, namespace, and the concrete checkpoint id).
    pub config: CheckpointConfig,
    /// The checkpoint, with `pending_sends` reconstructed from the parent's
    /// writes on the reserved channel.
    pub checkpoint: Checkpoint,
    /// Deserialized metadata.
    pub metadata: CheckpointMetadata,
    /// Config of the parent checkpoint, if one exists.
    pub parent_config: Option<CheckpointConfig>,
    /// Writes directly associated with this checkpoint, ordered by
    /// `(task_id, idx)`.
    pub pending_writes: Vec<PendingWrite>,
}

/// Options for [`Checkpointer::list`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Maximum number of tuples to return.
    pub limit: Option<usize>,
    /// Only return checkpoints with id strictly less than this id.
    pub before: Option<String>,
    /// Exact-match metadata filter. Only keys in [`METADATA_FILTER_KEYS`]
    /// are consulted; unknown keys are ignored.
    pub filter: Option<HashMap<String, serde_json::Value>>,
}

impl ListOptions {
    /// Bound the number of returned tuples.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Bound results to ids strictly before the given checkpoint id.
    #[must_use]
    pub fn with_before(mut self, before: impl Into<String>) -> Self {
        self.before = Some(before.into());
        self
    }

    /// Filter on metadata fields (exact match, allow-listed keys only).
    #[must_use]
    pub fn with_filter(mut self, filter: HashMap<String, serde_json::Value>) -> Self {
        self.filter = Some(filter);
        self
    }
}

// ============================================================================
// Serialization protocol
// ============================================================================

/// Serialization protocol for checkpoint payloads.
///
/// Every payload is stored alongside a format tag so that stores can verify
/// on read that they know how to decode what they find. `put` serializes
/// the checkpoint and its metadata through the same protocol and rejects
/// the write if the two tags disagree.
pub trait CheckpointSerde: Send + Sync {
    /// Serialize a value, returning the format tag and the payload bytes.
    fn dumps(&self, value: &serde_json::Value) -> Result<(String, Vec<u8>)>;

    /// Deserialize a payload previously produced under `tag`.
    fn loads(&self, tag: &str, payload: &[u8]) -> Result<serde_json::Value>;
}

/// JSON serialization (the default protocol; tag `"json"`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerde;

impl CheckpointSerde for JsonSerde {
    fn dumps(&self, value: &serde_json::Value) -> Result<(String, Vec<u8>)> {
        let payload = serde_json::to_vec(value)?;
        Ok(("json".to_string(), payload))
    }

    fn loads(&self, tag: &str, payload: &[u8]) -> Result<serde_json::Value> {
        if tag != "json" {
            return Err(crate::error::CheckpointError::DeserializationFailed {
                reason: format!("unknown serialization tag '{tag}'"),
            }
            .into());
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Serialized form of a (checkpoint, metadata) pair sharing one format tag.
#[derive(Debug)]
pub struct SerializedPair {
    /// The shared format tag.
    pub tag: String,
    /// Serialized checkpoint payload (with `pending_sends` stripped).
    pub checkpoint: Vec<u8>,
    /// Serialized metadata payload.
    pub metadata: Vec<u8>,
}

/// Serialize a checkpoint/metadata pair, enforcing the shared-tag invariant.
///
/// The checkpoint is persisted without its `pending_sends` (they live as
/// writes on the parent's reserved channel). A tag mismatch between the two
/// payloads is a fatal [`Error::SerializationMismatch`]; the caller must not
/// touch storage when this fails.
pub fn serialize_pair(
    serde: &dyn CheckpointSerde,
    checkpoint: &Checkpoint,
    metadata: &CheckpointMetadata,
) -> Result<SerializedPair> {
    let checkpoint_value = serde_json::to_value(checkpoint.stripped())?;
    let metadata_value = serde_json::to_value(metadata)?;

    let (checkpoint_tag, checkpoint_bytes) = serde.dumps(&checkpoint_value)?;
    let (metadata_tag, metadata_bytes) = serde.dumps(&metadata_value)?;

    if checkpoint_tag != metadata_tag {
        return Err(Error::SerializationMismatch {
            checkpoint_tag,
            metadata_tag,
        });
    }

    Ok(SerializedPair {
        tag: checkpoint_tag,
        checkpoint: checkpoint_bytes,
        metadata: metadata_bytes,
    })
}

/// Check whether stored metadata matches a `list` filter.
///
/// Only keys in [`METADATA_FILTER_KEYS`] participate; unknown keys are
/// skipped rather than failing the match.
pub fn metadata_matches_filter(
    metadata: &CheckpointMetadata,
    filter: Option<&HashMap<String, serde_json::Value>>,
) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let Ok(metadata_value) = serde_json::to_value(metadata) else {
        return false;
    };
    filter
        .iter()
        .filter(|(key, _)| METADATA_FILTER_KEYS.contains(&key.as_str()))
        .all(|(key, expected)| metadata_value.get(key) == Some(expected))
}

// ============================================================================
// Id generation
// ============================================================================

static CHECKPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a checkpoint id whose lexicographic order equals creation
/// order within this process.
///
/// Layout: zero-padded millisecond timestamp, a process-local sequence
/// number breaking ties within a millisecond, and a uuid suffix for
/// cross-process uniqueness.
pub fn next_checkpoint_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let seq = CHECKPOINT_SEQ.fetch_add(1, Ordering::Relaxed) % 0x1_0000;
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis:016x}-{seq:04x}-{}", &suffix[..8])
}

// ============================================================================
// Checkpointer trait
// ============================================================================

/// Durable, append-friendly persistence of graph state.
///
/// Implementations share these semantics:
///
/// - `put` upserts by primary key `(thread, namespace, checkpoint id)`;
///   replays of the same id overwrite rather than duplicate.
/// - `put_writes` replaces on `(…, task_id, idx)` collision, so write
///   replay is idempotent.
/// - `get_tuple` with no checkpoint id resolves the latest checkpoint by
///   id ordering.
/// - `list` returns most-recent-first and never observes ids at or after
///   a given `before` bound.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Read one checkpoint tuple; `None` when the key does not exist.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// List checkpoint tuples for a thread, most-recent-first.
    ///
    /// `namespace: None` lists across all namespaces of the thread.
    async fn list(
        &self,
        thread_id: &str,
        namespace: Option<&str>,
        options: ListOptions,
    ) -> Result<Vec<CheckpointTuple>>;

    /// Persist a checkpoint. The passed config's `checkpoint_id` (if any)
    /// is recorded as the parent; the returned config carries the new id.
    ///
    /// # Errors
    ///
    /// [`Error::MissingConfiguration`] when `thread_id` is empty;
    /// [`Error::SerializationMismatch`] when checkpoint and metadata
    /// serialize under different tags (rejected before storage).
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig>;

    /// Persist pending writes produced by `task_id` against the checkpoint
    /// addressed by `config` (which must carry a concrete checkpoint id).
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: &[(String, serde_json::Value)],
        task_id: &str,
    ) -> Result<()>;
}

/// Validate that a config is usable for a write.
pub(crate) fn require_thread_id(config: &CheckpointConfig) -> Result<()> {
    if config.thread_id.is_empty() {
        return Err(Error::MissingConfiguration { field: "thread_id" });
    }
    Ok(())
}
