// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for StepFlow.
//!
//! Two layers of failure exist in a run:
//!
//! 1. **Tool-level failures** (missing file, dead process, navigation error)
//!    are *not* represented here. They are rendered as descriptive text
//!    results at the tool boundary so the model can read them and adapt its
//!    plan. See [`crate::tools`].
//! 2. **Graph-level failures** (checkpoint store unavailable, serialization
//!    tag mismatch, missing thread id) are represented by [`Error`] and
//!    propagate to the run's caller.

use std::fmt;
use thiserror::Error;

/// Checkpoint-specific error types for explicit failure handling.
///
/// Enables pattern matching on the distinct ways the checkpoint store can
/// fail, separate from resource-level errors.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Serialization of checkpoint state failed
    #[error("Checkpoint serialization failed: {reason}")]
    SerializationFailed {
        /// Detailed reason for serialization failure
        reason: String,
    },

    /// Deserialization of checkpoint state failed
    #[error("Checkpoint deserialization failed: {reason}")]
    DeserializationFailed {
        /// Detailed reason for deserialization failure
        reason: String,
    },

    /// Checkpoint not found
    #[error("Checkpoint '{checkpoint_id}' not found")]
    NotFound {
        /// ID of the missing checkpoint
        checkpoint_id: String,
    },

    /// Connection to storage backend was lost or could not be established
    #[error("Connection to checkpoint backend '{backend}' failed: {reason}")]
    ConnectionFailed {
        /// Name of the backend (e.g., "sqlite", "memory")
        backend: String,
        /// Reason for the failure
        reason: String,
    },

    /// I/O error during checkpoint operation
    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other checkpoint error
    #[error("Checkpoint error: {0}")]
    Other(String),
}

impl CheckpointError {
    /// Returns true if this error is likely recoverable (retry may succeed)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CheckpointError::ConnectionFailed { .. })
    }

    /// Returns true if this error indicates corrupted stored data
    pub fn is_corruption(&self) -> bool {
        matches!(self, CheckpointError::DeserializationFailed { .. })
    }
}

/// The kind of session-scoped resource an operation addressed.
///
/// Used by [`Error::NotFound`] to say *what* was missing without a separate
/// error variant per resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// A shell session keyed by (thread id, shell id)
    Shell,
    /// The browser instance for a session
    Browser,
    /// The vector store for a session
    VectorStore,
    /// A checkpoint keyed by (thread, namespace, checkpoint id)
    Checkpoint,
    /// A whole session keyed by thread id
    Session,
    /// A tool looked up by name
    Tool,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Shell => "shell session",
            ResourceKind::Browser => "browser",
            ResourceKind::VectorStore => "vector store",
            ResourceKind::Checkpoint => "checkpoint",
            ResourceKind::Session => "session",
            ResourceKind::Tool => "tool",
        };
        write!(f, "{name}")
    }
}

/// StepFlow error types
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// A session-scoped resource was addressed by an unknown key.
    ///
    /// Recoverable: reported to the caller as a textual result, not fatal
    /// to the run.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// What kind of resource was looked up.
        kind: ResourceKind,
        /// The key that missed.
        id: String,
    },

    /// A shell operation targeted a session whose process is not live.
    #[error("No running process in shell session '{shell_id}'")]
    NotRunning {
        /// The shell session id.
        shell_id: String,
    },

    /// A bounded wait elapsed before the awaited event occurred.
    ///
    /// Recoverable: callers receive partial state alongside this signal.
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// An external tool (process, browser, parser) failed in a way the
    /// model should be told about.
    #[error("External tool failure: {0}")]
    ExternalToolFailure(String),

    /// The serialized checkpoint and metadata carried different format
    /// tags. Fatal: the write must be rejected before touching storage.
    #[error("Serialization tag mismatch: checkpoint tagged '{checkpoint_tag}', metadata tagged '{metadata_tag}'")]
    SerializationMismatch {
        /// Tag produced for the checkpoint payload.
        checkpoint_tag: String,
        /// Tag produced for the metadata payload.
        metadata_tag: String,
    },

    /// A checkpoint write was attempted without the configuration it
    /// requires. Fatal: programmer error.
    #[error("Missing configuration: {field} is required")]
    MissingConfiguration {
        /// The absent field (e.g., "thread_id").
        field: &'static str,
    },

    /// The language model call failed.
    #[error("Model error: {0}")]
    Model(String),

    /// The model was asked for structured output and returned something
    /// that does not parse into the requested shape.
    #[error("Structured output error: {0}")]
    StructuredOutput(String),

    /// Node transition count exceeded the configured limit.
    #[error("Recursion limit of {limit} reached. Graph execution exceeded the maximum number of node transitions; this may indicate an infinite loop.")]
    RecursionLimit {
        /// The recursion limit that was exceeded.
        limit: u32,
    },

    /// Cannot resume: no checkpoint exists for the thread.
    #[error("No checkpoint found to resume from for thread_id: {0}")]
    NoCheckpointToResume(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}

impl Error {
    /// Shorthand for a [`Error::NotFound`] with the given resource kind.
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for an [`Error::ExternalToolFailure`].
    pub fn tool_failure(msg: impl Into<String>) -> Self {
        Error::ExternalToolFailure(msg.into())
    }

    /// Returns true if this error is fatal to the run (must propagate to
    /// the caller rather than be rendered as a tool result).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::SerializationMismatch { .. }
                | Error::MissingConfiguration { .. }
                | Error::Checkpoint(_)
                | Error::RecursionLimit { .. }
        )
    }
}

/// Result type for StepFlow operations
pub type Result<T> = std::result::Result<T, Error>;
