//! SQLite checkpointer for StepFlow
//!
//! Durable checkpoint storage in a local SQLite database. Two tables hold
//! everything that matters for compatibility:
//!
//! - `<prefix>_checkpoints` - `(thread_id, checkpoint_ns, checkpoint_id)`
//!   primary key, parent checkpoint id, serialization type tag, checkpoint
//!   blob, metadata blob.
//! - `<prefix>_writes` - `(thread_id, checkpoint_ns, checkpoint_id,
//!   task_id, idx)` primary key, channel, type tag, value blob.
//!
//! Puts upsert by primary key, so replays of the same checkpoint id
//! overwrite rather than duplicate, and `put_writes` replaces on
//! `(task_id, idx)` collision, making write replay idempotent.
//!
//! # Example
//!
//! ```rust,ignore
//! use stepflow_sqlite_checkpointer::SqliteCheckpointer;
//! use stepflow::graph::AgentGraph;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let checkpointer = SqliteCheckpointer::open("checkpoints.sqlite").await?;
//!     // let graph = AgentGraph::new(model, registry, Arc::new(checkpointer));
//!     Ok(())
//! }
//! ```
//!
//! # See Also
//!
//! - [`Checkpointer`] - The trait this implements
//! - [`stepflow::checkpoint::MemoryCheckpointer`] - In-process alternative for tests

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use stepflow::checkpoint::{
    metadata_matches_filter, serialize_pair, Checkpoint, CheckpointConfig, CheckpointMetadata,
    CheckpointSerde, CheckpointTuple, Checkpointer, JsonSerde, ListOptions, PendingWrite,
    PENDING_SENDS_CHANNEL,
};
use stepflow::error::{CheckpointError, Error, Result as StepflowResult};

/// Validate a SQLite identifier (table name prefix).
///
/// Identifiers must start with a letter or underscore, contain only
/// letters, digits, and underscores, and stay within a sane length. This
/// keeps the formatted table names injection-safe.
fn validate_identifier(name: &str) -> Result<(), SqliteCheckpointerError> {
    if name.is_empty() {
        return Err(SqliteCheckpointerError::InvalidIdentifier(
            "identifier cannot be empty".to_string(),
        ));
    }
    if name.len() > 48 {
        return Err(SqliteCheckpointerError::InvalidIdentifier(format!(
            "identifier '{name}' exceeds maximum length of 48 characters"
        )));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap_or('_');
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(SqliteCheckpointerError::InvalidIdentifier(format!(
            "identifier '{name}' must start with a letter or underscore"
        )));
    }
    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(SqliteCheckpointerError::InvalidIdentifier(format!(
                "identifier '{name}' contains invalid character '{c}'"
            )));
        }
    }
    Ok(())
}

/// One raw checkpoint row, as selected.
struct CheckpointRow {
    checkpoint_ns: String,
    checkpoint_id: String,
    parent_checkpoint_id: Option<String>,
    type_tag: String,
    checkpoint: Vec<u8>,
    metadata: Vec<u8>,
}

/// SQLite-backed checkpoint store.
///
/// The connection is held behind an async mutex; SQLite operations are
/// short and local, so they run inline on the async task.
pub struct SqliteCheckpointer {
    conn: Mutex<Connection>,
    serde: Arc<dyn CheckpointSerde>,
    checkpoints_table: String,
    writes_table: String,
}

impl std::fmt::Debug for SqliteCheckpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointer")
            .field("checkpoints_table", &self.checkpoints_table)
            .field("writes_table", &self.writes_table)
            .finish_non_exhaustive()
    }
}

impl SqliteCheckpointer {
    /// Open (or create) a checkpoint database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SqliteCheckpointerError> {
        let path = path.as_ref();
        info!("Opening SQLite checkpoint store: {}", path.display());
        let conn = Connection::open(path)
            .map_err(|e| SqliteCheckpointerError::Open(e.to_string()))?;
        Self::from_connection(conn, "stepflow")
    }

    /// Open an in-memory database (contents are lost on drop).
    pub fn in_memory() -> Result<Self, SqliteCheckpointerError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SqliteCheckpointerError::Open(e.to_string()))?;
        Self::from_connection(conn, "stepflow")
    }

    /// Open at `path` with a custom table-name prefix.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` if the prefix contains characters that
    /// are unsafe in a table name.
    pub async fn with_table_prefix(
        path: impl AsRef<Path>,
        prefix: &str,
    ) -> Result<Self, SqliteCheckpointerError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| SqliteCheckpointerError::Open(e.to_string()))?;
        Self::from_connection(conn, prefix)
    }

    fn from_connection(conn: Connection, prefix: &str) -> Result<Self, SqliteCheckpointerError> {
        validate_identifier(prefix)?;
        let checkpoints_table = format!("{prefix}_checkpoints");
        let writes_table = format!("{prefix}_writes");
        initialize_schema(&conn, &checkpoints_table, &writes_table)?;
        Ok(Self {
            conn: Mutex::new(conn),
            serde: Arc::new(JsonSerde),
            checkpoints_table,
            writes_table,
        })
    }

    /// Swap the serialization protocol (default: JSON).
    #[must_use]
    pub fn with_serde(mut self, serde: Arc<dyn CheckpointSerde>) -> Self {
        self.serde = serde;
        self
    }

    /// Load the pending writes stored under one checkpoint key, ordered by
    /// `(task_id, idx)`.
    fn load_writes(
        &self,
        conn: &Connection,
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint_id: &str,
    ) -> StepflowResult<Vec<PendingWrite>> {
        let sql = format!(
            "SELECT task_id, idx, channel, type, value FROM {}
             WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3
             ORDER BY task_id, idx",
            self.writes_table
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| query_error(&e))?;
        let rows = stmt
            .query_map(params![thread_id, checkpoint_ns, checkpoint_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                ))
            })
            .map_err(|e| query_error(&e))?;

        let mut writes = Vec::new();
        for row in rows {
            let (task_id, idx, channel, tag, value) = row.map_err(|e| query_error(&e))?;
            writes.push(PendingWrite {
                task_id,
                idx: idx as u32,
                channel,
                value: self.serde.loads(&tag, &value)?,
            });
        }
        Ok(writes)
    }

    /// Reconstruct one tuple from a raw row: deserialize both payloads,
    /// attach this checkpoint's writes, and rebuild `pending_sends` from
    /// the parent's writes on the reserved channel.
    fn build_tuple(
        &self,
        conn: &Connection,
        thread_id: &str,
        row: CheckpointRow,
    ) -> StepflowResult<CheckpointTuple> {
        let checkpoint_value = self.serde.loads(&row.type_tag, &row.checkpoint)?;
        let mut checkpoint: Checkpoint =
            serde_json::from_value(checkpoint_value).map_err(|e| {
                CheckpointError::DeserializationFailed {
                    reason: format!("checkpoint '{}': {e}", row.checkpoint_id),
                }
            })?;
        let metadata_value = self.serde.loads(&row.type_tag, &row.metadata)?;
        let metadata: CheckpointMetadata =
            serde_json::from_value(metadata_value).map_err(|e| {
                CheckpointError::DeserializationFailed {
                    reason: format!("metadata for '{}': {e}", row.checkpoint_id),
                }
            })?;

        checkpoint.pending_sends = match &row.parent_checkpoint_id {
            Some(parent_id) => self
                .load_writes(conn, thread_id, &row.checkpoint_ns, parent_id)?
                .into_iter()
                .filter(|w| w.channel == PENDING_SENDS_CHANNEL)
                .map(|w| w.value)
                .collect(),
            None => Vec::new(),
        };

        let pending_writes =
            self.load_writes(conn, thread_id, &row.checkpoint_ns, &row.checkpoint_id)?;

        let parent_config = row.parent_checkpoint_id.map(|parent_id| CheckpointConfig {
            thread_id: thread_id.to_string(),
            checkpoint_ns: row.checkpoint_ns.clone(),
            checkpoint_id: Some(parent_id),
        });

        Ok(CheckpointTuple {
            config: CheckpointConfig {
                thread_id: thread_id.to_string(),
                checkpoint_ns: row.checkpoint_ns,
                checkpoint_id: Some(checkpoint.id.clone()),
            },
            checkpoint,
            metadata,
            parent_config,
            pending_writes,
        })
    }
}

/// Create the two tables if they do not exist.
fn initialize_schema(
    conn: &Connection,
    checkpoints_table: &str,
    writes_table: &str,
) -> Result<(), SqliteCheckpointerError> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {checkpoints_table} (
            thread_id TEXT NOT NULL,
            checkpoint_ns TEXT NOT NULL DEFAULT '',
            checkpoint_id TEXT NOT NULL,
            parent_checkpoint_id TEXT,
            type TEXT NOT NULL,
            checkpoint BLOB NOT NULL,
            metadata BLOB NOT NULL,
            PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id)
        );
        CREATE TABLE IF NOT EXISTS {writes_table} (
            thread_id TEXT NOT NULL,
            checkpoint_ns TEXT NOT NULL DEFAULT '',
            checkpoint_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            channel TEXT NOT NULL,
            type TEXT NOT NULL,
            value BLOB NOT NULL,
            PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id, task_id, idx)
        );"
    );
    conn.execute_batch(&sql).map_err(|e| {
        error!("Failed to create checkpoint tables: {e}");
        SqliteCheckpointerError::Query(e.to_string())
    })?;
    debug!("SQLite schema initialized: tables {checkpoints_table} and {writes_table}");
    Ok(())
}

fn query_error(e: &dyn std::fmt::Display) -> Error {
    Error::Checkpoint(CheckpointError::Other(format!("sqlite query failed: {e}")))
}

fn row_to_checkpoint_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRow> {
    Ok(CheckpointRow {
        checkpoint_ns: row.get(0)?,
        checkpoint_id: row.get(1)?,
        parent_checkpoint_id: row.get(2)?,
        type_tag: row.get(3)?,
        checkpoint: row.get(4)?,
        metadata: row.get(5)?,
    })
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    async fn get_tuple(&self, config: &CheckpointConfig) -> StepflowResult<Option<CheckpointTuple>> {
        let conn = self.conn.lock().await;
        let row = match &config.checkpoint_id {
            Some(checkpoint_id) => {
                let sql = format!(
                    "SELECT checkpoint_ns, checkpoint_id, parent_checkpoint_id, type, checkpoint, metadata
                     FROM {} WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3",
                    self.checkpoints_table
                );
                conn.query_row(
                    &sql,
                    params![config.thread_id, config.checkpoint_ns, checkpoint_id],
                    row_to_checkpoint_row,
                )
                .optional()
                .map_err(|e| query_error(&e))?
            }
            None => {
                let sql = format!(
                    "SELECT checkpoint_ns, checkpoint_id, parent_checkpoint_id, type, checkpoint, metadata
                     FROM {} WHERE thread_id = ?1 AND checkpoint_ns = ?2
                     ORDER BY checkpoint_id DESC LIMIT 1",
                    self.checkpoints_table
                );
                conn.query_row(
                    &sql,
                    params![config.thread_id, config.checkpoint_ns],
                    row_to_checkpoint_row,
                )
                .optional()
                .map_err(|e| query_error(&e))?
            }
        };

        match row {
            Some(row) => Ok(Some(self.build_tuple(&conn, &config.thread_id, row)?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        thread_id: &str,
        namespace: Option<&str>,
        options: ListOptions,
    ) -> StepflowResult<Vec<CheckpointTuple>> {
        let conn = self.conn.lock().await;
        // `before` and ordering are pushed into SQL; the metadata filter
        // needs deserialized metadata, so it (and the limit) apply after.
        let mut sql = format!(
            "SELECT checkpoint_ns, checkpoint_id, parent_checkpoint_id, type, checkpoint, metadata
             FROM {} WHERE thread_id = ?",
            self.checkpoints_table
        );
        let mut bindings: Vec<String> = vec![thread_id.to_string()];
        if let Some(ns) = namespace {
            sql.push_str(" AND checkpoint_ns = ?");
            bindings.push(ns.to_string());
        }
        if let Some(before) = &options.before {
            sql.push_str(" AND checkpoint_id < ?");
            bindings.push(before.clone());
        }
        sql.push_str(" ORDER BY checkpoint_id DESC");

        let mut stmt = conn.prepare(&sql).map_err(|e| query_error(&e))?;
        let rows: Vec<CheckpointRow> = stmt
            .query_map(rusqlite::params_from_iter(bindings.iter()), row_to_checkpoint_row)
            .map_err(|e| query_error(&e))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| query_error(&e))?;

        let mut tuples = Vec::new();
        for row in rows {
            let tuple = self.build_tuple(&conn, thread_id, row)?;
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
    ) -> StepflowResult<CheckpointConfig> {
        if config.thread_id.is_empty() {
            return Err(Error::MissingConfiguration { field: "thread_id" });
        }
        // Serialize first: a tag mismatch must reject the write before it
        // touches storage.
        let pair = serialize_pair(self.serde.as_ref(), &checkpoint, &metadata)?;

        let sql = format!(
            "INSERT INTO {} (thread_id, checkpoint_ns, checkpoint_id, parent_checkpoint_id, type, checkpoint, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (thread_id, checkpoint_ns, checkpoint_id) DO UPDATE SET
                 parent_checkpoint_id = excluded.parent_checkpoint_id,
                 type = excluded.type,
                 checkpoint = excluded.checkpoint,
                 metadata = excluded.metadata",
            self.checkpoints_table
        );
        let conn = self.conn.lock().await;
        conn.execute(
            &sql,
            params![
                config.thread_id,
                config.checkpoint_ns,
                checkpoint.id,
                config.checkpoint_id,
                pair.tag,
                pair.checkpoint,
                pair.metadata,
            ],
        )
        .map_err(|e| {
            error!("Failed to save checkpoint: {e}");
            query_error(&e)
        })?;

        debug!(
            thread_id = %config.thread_id,
            checkpoint_id = %checkpoint.id,
            "saved checkpoint"
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
    ) -> StepflowResult<()> {
        if config.thread_id.is_empty() {
            return Err(Error::MissingConfiguration { field: "thread_id" });
        }
        let Some(checkpoint_id) = &config.checkpoint_id else {
            return Err(Error::MissingConfiguration {
                field: "checkpoint_id",
            });
        };

        let sql = format!(
            "INSERT INTO {} (thread_id, checkpoint_ns, checkpoint_id, task_id, idx, channel, type, value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (thread_id, checkpoint_ns, checkpoint_id, task_id, idx) DO UPDATE SET
                 channel = excluded.channel,
                 type = excluded.type,
                 value = excluded.value",
            self.writes_table
        );
        let conn = self.conn.lock().await;
        for (idx, (channel, value)) in writes.iter().enumerate() {
            let (tag, payload) = self.serde.dumps(value)?;
            conn.execute(
                &sql,
                params![
                    config.thread_id,
                    config.checkpoint_ns,
                    checkpoint_id,
                    task_id,
                    idx as i64,
                    channel,
                    tag,
                    payload,
                ],
            )
            .map_err(|e| {
                error!("Failed to save pending write: {e}");
                query_error(&e)
            })?;
        }
        Ok(())
    }
}

/// Error types for the SQLite checkpointer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SqliteCheckpointerError {
    /// Opening the database failed.
    #[error("Failed to open database: {0}")]
    Open(String),

    /// A query failed.
    #[error("Query error: {0}")]
    Query(String),

    /// An unsafe table-name prefix was supplied.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

/// Convert `SqliteCheckpointerError` to `stepflow::Error` for use with `?`.
impl From<SqliteCheckpointerError> for Error {
    fn from(e: SqliteCheckpointerError) -> Self {
        match e {
            SqliteCheckpointerError::Open(reason) => {
                Error::Checkpoint(CheckpointError::ConnectionFailed {
                    backend: "sqlite".to_string(),
                    reason,
                })
            }
            other => Error::Checkpoint(CheckpointError::Other(other.to_string())),
        }
    }
}
