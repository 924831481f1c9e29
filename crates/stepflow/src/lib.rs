// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # StepFlow
//!
//! A multi-agent task orchestrator: a planner decomposes a user objective
//! into sequential steps, a supervisor routes each step to specialized
//! workers (file, shell, browser, knowledge base, human interaction),
//! workers execute tool calls against session-scoped resources, and a
//! replanner folds results back into the remaining plan until a final
//! response is produced.
//!
//! Execution state is checkpointed at every node transition, so a run can
//! suspend (awaiting human input) and resume later, and any past state can
//! be read back for inspection or replay.
//!
//! ## Architecture
//!
//! - [`graph::AgentGraph`] - the plan/execute/replan state machine and its
//!   checkpoint-persisting driver loop.
//! - [`supervisor`] / [`planner`] / [`worker`] - the routing and execution
//!   nodes of the machine.
//! - [`session::SessionRegistry`] - per-thread resource bundles (shell
//!   sessions, browser, vector store) with lazy allocation and best-effort
//!   cleanup.
//! - [`tools`] - the invocable operations workers are scoped to.
//! - [`checkpoint`] - the checkpoint data model, serializer protocol and
//!   the [`checkpoint::Checkpointer`] trait, with an in-memory store;
//!   durable SQLite storage lives in the `stepflow-sqlite-checkpointer`
//!   crate.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stepflow::checkpoint::MemoryCheckpointer;
//! use stepflow::graph::{AgentGraph, GraphConfig, RunOutcome};
//! use stepflow::session::{SessionConfig, SessionRegistry};
//!
//! # async fn example(model: Arc<dyn stepflow::model::ChatModel>,
//! #                  config: SessionConfig) -> stepflow::error::Result<()> {
//! let registry = Arc::new(SessionRegistry::new(config));
//! let graph = AgentGraph::new(model, registry, Arc::new(MemoryCheckpointer::new()));
//!
//! let run = GraphConfig::new("thread-1");
//! match graph.invoke("find the weather in Paris and save it", &run).await? {
//!     RunOutcome::Finished { response } => println!("{response}"),
//!     RunOutcome::Interrupted { prompt, .. } => {
//!         // ask the human, then:
//!         graph.resume(&run, Some("the human's answer")).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod embeddings;
pub mod error;
pub mod graph;
pub mod messages;
pub mod model;
pub mod planner;
pub mod prompts;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod testing;
pub mod text_splitter;
pub mod tools;
pub mod vector_store;
pub mod worker;

pub use checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSerde, CheckpointTuple,
    Checkpointer, JsonSerde, ListOptions, MemoryCheckpointer, PendingWrite,
};
pub use error::{Error, Result};
pub use graph::{AgentGraph, GraphConfig, GraphEvent, GraphNode, RunOutcome};
pub use messages::{Message, ToolCall};
pub use model::{ChatModel, ChatResult, ToolChoice, ToolDefinition};
pub use session::{Session, SessionConfig, SessionRegistry};
pub use state::{AgentState, PastStep, Route, Step, WorkerKind};

/// Convenient single-import surface for applications.
pub mod prelude {
    pub use crate::checkpoint::{CheckpointConfig, Checkpointer, MemoryCheckpointer};
    pub use crate::error::{Error, Result};
    pub use crate::graph::{AgentGraph, GraphConfig, GraphEvent, RunOutcome};
    pub use crate::messages::{Message, ToolCall};
    pub use crate::model::{ChatModel, ToolDefinition};
    pub use crate::session::{SessionConfig, SessionRegistry};
    pub use crate::state::{AgentState, Step, WorkerKind};
}
