// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The planning/execution state machine and its driver.
//!
//! Control flow: Planner -> Supervisor loop (Supervisor -> Worker ->
//! Supervisor -> ...) -> Replanner -> (back to the Supervisor loop, or
//! End) -> Cleanup. The machine is explicit - a node enum and a transition
//! function - rather than a generic graph library: resumability comes from
//! the driver persisting a checkpoint *before* executing each node, so the
//! latest checkpoint always names the node that runs next.
//!
//! Human interaction is the designed suspension boundary: routing to
//! `ask_user` or `update_user` persists state and returns
//! [`RunOutcome::Interrupted`]; [`AgentGraph::resume`] loads the latest
//! checkpoint, injects the human's message (for `ask_user`) and continues
//! as a distinct invocation, not a held stack frame.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSource, Checkpointer,
    PENDING_SENDS_CHANNEL,
};
use crate::error::{Error, Result};
use crate::messages::Message;
use crate::model::ChatModel;
use crate::planner::{self, ReplanAction};
use crate::session::SessionRegistry;
use crate::state::{AgentState, WorkerKind};
use crate::supervisor::{self, SupervisorDecision};
use crate::worker::{self, kb::KbConfig};

/// Response surfaced when the replanner budget runs out.
const BUDGET_EXHAUSTED_RESPONSE: &str =
    "I could not complete the task within the allotted number of planning cycles.";

/// Nodes of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphNode {
    /// Initial decomposition of the objective.
    Planner,
    /// Route the current step to a worker.
    Supervisor,
    /// Execute one worker.
    Worker(WorkerKind),
    /// Fold results back into the remaining plan, or finish.
    Replanner,
    /// Terminal: release resources and emit the response.
    End,
}

impl GraphNode {
    /// Node name for metadata and events.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            GraphNode::Planner => "planner",
            GraphNode::Supervisor => "supervisor",
            GraphNode::Worker(kind) => kind.name(),
            GraphNode::Replanner => "replanner",
            GraphNode::End => "__end__",
        }
    }
}

/// What the driver checkpoints: the agent state plus the machine position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// The orchestrator state.
    pub state: AgentState,
    /// The node that runs next.
    pub next: GraphNode,
}

/// Per-run configuration.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Thread id: the unit of session and checkpoint isolation.
    pub thread_id: String,
    /// Checkpoint namespace (empty = root).
    pub checkpoint_ns: String,
    /// Bound on node transitions per invocation.
    pub recursion_limit: u32,
    /// Bound on replanner cycles before the fallback response.
    pub max_replan_cycles: u32,
    /// Bound on model/tool iterations inside one worker.
    pub max_react_iterations: usize,
    /// Knowledge-base worker configuration.
    pub kb: KbConfig,
}

impl GraphConfig {
    /// Defaults for a thread id.
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: String::new(),
            recursion_limit: 100,
            max_replan_cycles: 25,
            max_react_iterations: worker::DEFAULT_MAX_REACT_ITERATIONS,
            kb: KbConfig::default(),
        }
    }

    /// Override the transition bound.
    #[must_use]
    pub fn with_recursion_limit(mut self, limit: u32) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Override the replanner budget.
    #[must_use]
    pub fn with_max_replan_cycles(mut self, cycles: u32) -> Self {
        self.max_replan_cycles = cycles;
        self
    }

    fn checkpoint_config(&self) -> CheckpointConfig {
        CheckpointConfig {
            thread_id: self.thread_id.clone(),
            checkpoint_ns: self.checkpoint_ns.clone(),
            checkpoint_id: None,
        }
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run completed and resources were released.
    Finished {
        /// The replanner's final response.
        response: String,
    },
    /// The run suspended awaiting the human; state is checkpointed and
    /// session resources are kept alive for [`AgentGraph::resume`].
    Interrupted {
        /// Which human-interaction worker suspended the run.
        kind: WorkerKind,
        /// The prompt or notification for the human.
        prompt: String,
    },
}

/// Transition events emitted by [`AgentGraph::stream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    /// A checkpoint was persisted ahead of node execution.
    CheckpointSaved {
        /// Id of the stored checkpoint.
        checkpoint_id: String,
    },
    /// A node began executing.
    NodeStarted {
        /// Node name.
        node: &'static str,
    },
    /// A node finished executing.
    NodeFinished {
        /// Node name.
        node: &'static str,
    },
    /// The run suspended awaiting the human.
    Interrupted {
        /// Which human-interaction worker suspended the run.
        kind: WorkerKind,
        /// The prompt or notification for the human.
        prompt: String,
    },
    /// The run completed.
    Finished {
        /// The final response.
        response: String,
    },
    /// The run failed with a graph-level error.
    Failed {
        /// Rendered error.
        error: String,
    },
}

/// The compiled orchestrator: model, session registry and checkpoint
/// store wired to the state machine.
#[derive(Clone)]
pub struct AgentGraph {
    model: Arc<dyn ChatModel>,
    registry: Arc<SessionRegistry>,
    checkpointer: Arc<dyn Checkpointer>,
}

impl AgentGraph {
    /// Wire the graph to its collaborators.
    pub fn new(
        model: Arc<dyn ChatModel>,
        registry: Arc<SessionRegistry>,
        checkpointer: Arc<dyn Checkpointer>,
    ) -> Self {
        Self {
            model,
            registry,
            checkpointer,
        }
    }

    /// Run an objective to completion or to the first interrupt.
    pub async fn invoke(&self, objective: &str, config: &GraphConfig) -> Result<RunOutcome> {
        let snapshot = GraphSnapshot {
            state: AgentState::new(objective),
            next: GraphNode::Planner,
        };
        self.drive(
            snapshot,
            config,
            config.checkpoint_config(),
            -1,
            CheckpointSource::Input,
            None,
        )
        .await
    }

    /// Continue a suspended run past its human interrupt.
    ///
    /// For an `ask_user` interrupt the human's literal input is injected
    /// as a message; for `update_user` the notification was already
    /// delivered and `human_input` is ignored.
    pub async fn resume(
        &self,
        config: &GraphConfig,
        human_input: Option<&str>,
    ) -> Result<RunOutcome> {
        let tuple = self
            .checkpointer
            .get_tuple(&config.checkpoint_config())
            .await?
            .ok_or_else(|| Error::NoCheckpointToResume(config.thread_id.clone()))?;

        let mut snapshot: GraphSnapshot = serde_json::from_value(tuple.checkpoint.state)?;
        let step = tuple.metadata.step;

        if let GraphNode::Worker(kind) = snapshot.next {
            if kind.is_interrupt() {
                if kind == WorkerKind::AskUser {
                    if let Some(input) = human_input {
                        snapshot
                            .state
                            .messages
                            .push(Message::human(input).with_name(kind.name()));
                    }
                }
                snapshot.next = GraphNode::Supervisor;
            }
        }
        info!(thread_id = %config.thread_id, "resuming from checkpoint");
        // Continue the version chain: the resumed checkpoint is the parent
        // of everything written from here on.
        self.drive(snapshot, config, tuple.config, step, CheckpointSource::Update, None)
            .await
    }

    /// Run an objective, streaming transition events.
    ///
    /// The final event is [`GraphEvent::Finished`],
    /// [`GraphEvent::Interrupted`] or [`GraphEvent::Failed`].
    pub fn stream(
        &self,
        objective: String,
        config: GraphConfig,
    ) -> impl futures::Stream<Item = GraphEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let graph = self.clone();
        tokio::spawn(async move {
            let snapshot = GraphSnapshot {
                state: AgentState::new(objective),
                next: GraphNode::Planner,
            };
            let start = config.checkpoint_config();
            let result = graph
                .drive(snapshot, &config, start, -1, CheckpointSource::Input, Some(&tx))
                .await;
            if let Err(e) = result {
                let _ = tx.send(GraphEvent::Failed {
                    error: e.to_string(),
                });
            }
        });
        async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }
    }

    /// Drive the machine, releasing session resources when the run ends
    /// (normally or with an error) but not when it suspends.
    async fn drive(
        &self,
        snapshot: GraphSnapshot,
        config: &GraphConfig,
        start_config: CheckpointConfig,
        step: i64,
        first_source: CheckpointSource,
        events: Option<&mpsc::UnboundedSender<GraphEvent>>,
    ) -> Result<RunOutcome> {
        let result = self
            .drive_inner(snapshot, config, start_config, step, first_source, events)
            .await;
        match &result {
            Ok(RunOutcome::Interrupted { .. }) => {
                // Suspended, not finished: resources stay alive for resume.
            }
            Ok(RunOutcome::Finished { .. }) | Err(_) => {
                // Cleanup failures are logged inside the registry and never
                // clobber the run result.
                self.registry.clear_session(&config.thread_id).await;
            }
        }
        result
    }

    async fn drive_inner(
        &self,
        mut snapshot: GraphSnapshot,
        config: &GraphConfig,
        start_config: CheckpointConfig,
        mut step: i64,
        first_source: CheckpointSource,
        events: Option<&mpsc::UnboundedSender<GraphEvent>>,
    ) -> Result<RunOutcome> {
        let emit = |event: GraphEvent| {
            if let Some(tx) = events {
                let _ = tx.send(event);
            }
        };

        let mut checkpoint_config = start_config;
        let mut transitions: u32 = 0;
        let mut last_write: Option<(&'static str, serde_json::Value)> = None;

        loop {
            if snapshot.next == GraphNode::End {
                let response = snapshot.state.response.clone().unwrap_or_default();
                info!(thread_id = %config.thread_id, "run finished");
                emit(GraphEvent::Finished {
                    response: response.clone(),
                });
                return Ok(RunOutcome::Finished { response });
            }

            transitions += 1;
            if transitions > config.recursion_limit {
                return Err(Error::RecursionLimit {
                    limit: config.recursion_limit,
                });
            }

            // Persist before executing: the latest checkpoint always names
            // the node that runs next, which is what makes every
            // transition a resume point.
            step += 1;
            let source = if transitions == 1 {
                first_source
            } else {
                CheckpointSource::Loop
            };
            let mut metadata = CheckpointMetadata {
                source,
                step,
                ..Default::default()
            };
            if let Some((node_name, summary)) = last_write.take() {
                metadata.writes.insert(node_name.to_string(), summary);
            }
            if let Some(parent_id) = &checkpoint_config.checkpoint_id {
                metadata.parents = HashMap::from([(
                    checkpoint_config.checkpoint_ns.clone(),
                    parent_id.clone(),
                )]);
            }
            let checkpoint = Checkpoint::new(serde_json::to_value(&snapshot)?);
            let checkpoint_id = checkpoint.id.clone();
            checkpoint_config = self
                .checkpointer
                .put(&checkpoint_config, checkpoint, metadata)
                .await?;
            emit(GraphEvent::CheckpointSaved { checkpoint_id });

            let node = snapshot.next;

            // Human-interaction nodes suspend the whole run. The
            // checkpoint just written names this node, so resume knows
            // where it stopped.
            if let GraphNode::Worker(kind) = node {
                if kind.is_interrupt() {
                    let prompt = snapshot.state.instruction.clone();
                    info!(thread_id = %config.thread_id, worker = kind.name(), "run interrupted");
                    emit(GraphEvent::Interrupted { kind, prompt: prompt.clone() });
                    return Ok(RunOutcome::Interrupted { kind, prompt });
                }
            }

            emit(GraphEvent::NodeStarted { node: node.name() });
            last_write = self
                .execute_node(node, &mut snapshot, config, &checkpoint_config)
                .await?;
            emit(GraphEvent::NodeFinished { node: node.name() });
        }
    }

    /// Execute one node: mutate the snapshot and set its `next`.
    ///
    /// Returns the write summary recorded in the *next* checkpoint's
    /// metadata.
    async fn execute_node(
        &self,
        node: GraphNode,
        snapshot: &mut GraphSnapshot,
        config: &GraphConfig,
        checkpoint_config: &CheckpointConfig,
    ) -> Result<Option<(&'static str, serde_json::Value)>> {
        let state = &mut snapshot.state;
        match node {
            GraphNode::Planner => {
                state.plan = planner::plan(&self.model, &state.input).await?;
                debug!(steps = state.plan.len(), "planned");
                snapshot.next = GraphNode::Supervisor;
                Ok(Some(("planner", json!({ "steps": state.plan.len() }))))
            }

            GraphNode::Supervisor => {
                let Some(task) = state.plan.front().cloned() else {
                    // Nothing left to route: hand control to the replanner.
                    snapshot.next = GraphNode::Replanner;
                    return Ok(None);
                };
                match supervisor::route(&self.model, state, &task).await? {
                    SupervisorDecision::Finish => {
                        supervisor::apply_finish(state);
                        snapshot.next = GraphNode::Replanner;
                        Ok(Some(("supervisor", json!({ "finished_step": task.description }))))
                    }
                    SupervisorDecision::Dispatch { kind, instruction } => {
                        supervisor::apply_dispatch(state, kind, &instruction);
                        // The instruction is a value in flight between this
                        // step and the worker's: record it on the reserved
                        // channel so the next checkpoint reconstructs it as
                        // a pending send.
                        self.checkpointer
                            .put_writes(
                                checkpoint_config,
                                &[(
                                    PENDING_SENDS_CHANNEL.to_string(),
                                    json!({ "worker": kind.name(), "instruction": instruction }),
                                )],
                                GraphNode::Supervisor.name(),
                            )
                            .await?;
                        snapshot.next = GraphNode::Worker(kind);
                        Ok(Some(("supervisor", json!({ "dispatched": kind.name() }))))
                    }
                }
            }

            GraphNode::Worker(kind) => {
                let session = self.registry.session(&config.thread_id);
                let message = match kind {
                    WorkerKind::KnowledgeBase => {
                        let outcome = worker::kb::run_kb_worker(
                            &self.model,
                            &session,
                            &state.instruction,
                            &config.kb,
                        )
                        .await?;
                        for source in outcome.sources {
                            if !state.sources.contains(&source) {
                                state.sources.push(source);
                            }
                        }
                        outcome.message
                    }
                    WorkerKind::AskUser | WorkerKind::UpdateUser => {
                        // Interrupts are intercepted by the driver before
                        // execution; reaching here is a driver bug.
                        return Err(Error::Generic(format!(
                            "interrupt worker '{}' reached execute_node",
                            kind.name()
                        )));
                    }
                    _ => {
                        worker::run_worker(
                            kind,
                            &self.model,
                            &session,
                            &state.instruction,
                            config.max_react_iterations,
                        )
                        .await?
                    }
                };

                // The worker result is a side effect not yet folded into a
                // checkpoint: record it as a pending write against the
                // checkpoint that launched this node.
                self.checkpointer
                    .put_writes(
                        checkpoint_config,
                        &[("messages".to_string(), serde_json::to_value(&message)?)],
                        kind.name(),
                    )
                    .await?;

                state.messages.push(message);
                snapshot.next = GraphNode::Supervisor;
                Ok(Some((kind.name(), json!({ "messages": 1 }))))
            }

            GraphNode::Replanner => {
                state.replan_cycles += 1;
                if state.replan_cycles > config.max_replan_cycles {
                    warn!(
                        thread_id = %config.thread_id,
                        cycles = state.replan_cycles,
                        "replan budget exhausted"
                    );
                    state.response = Some(BUDGET_EXHAUSTED_RESPONSE.to_string());
                } else {
                    match planner::replan(&self.model, state).await? {
                        ReplanAction::Respond(response) => {
                            state.response = Some(response);
                        }
                        ReplanAction::Plan(steps) => {
                            state.plan = steps;
                        }
                    }
                }
                snapshot.next = if state.has_response() {
                    GraphNode::End
                } else {
                    GraphNode::Supervisor
                };
                Ok(Some(("replanner", json!({
                    "responded": state.has_response(),
                    "remaining_steps": state.plan.len(),
                }))))
            }

            GraphNode::End => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointConfig, ListOptions, MemoryCheckpointer};
    use crate::messages::ToolCall;
    use crate::session::{SessionConfig, SessionRegistry};
    use crate::testing::{FakeChatModel, MockEmbeddings, NullBrowserLauncher};

    fn registry(dir: &tempfile::TempDir) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(SessionConfig {
            kb_root: dir.path().to_path_buf(),
            embeddings: Arc::new(MockEmbeddings::new(8)),
            browser_launcher: Arc::new(NullBrowserLauncher::default()),
            screenshot_parser: None,
        }))
    }

    fn plan_call(steps: serde_json::Value) -> Message {
        Message::ai_with_tool_calls("", vec![ToolCall::new("c", "plan", json!({"steps": steps}))])
    }

    fn route_call(next: &str, instruction: &str) -> Message {
        Message::ai_with_tool_calls(
            "",
            vec![ToolCall::new(
                "c",
                "route",
                json!({"next": next, "instruction": instruction}),
            )],
        )
    }

    fn respond_call(text: &str) -> Message {
        Message::ai_with_tool_calls(
            "",
            vec![ToolCall::new("c", "respond", json!({"response": text}))],
        )
    }

    #[tokio::test]
    async fn test_minimal_run_finishes_with_response() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let checkpointer = Arc::new(MemoryCheckpointer::new());
        let model: Arc<dyn ChatModel> = Arc::new(FakeChatModel::new(vec![
            // Planner
            plan_call(json!([{"description": "only step", "substeps": ["do it"]}])),
            // Supervisor: step already complete
            route_call("FINISH", ""),
            // Replanner: respond
            respond_call("the answer"),
        ]));

        let graph = AgentGraph::new(model, Arc::clone(&registry), checkpointer);
        let config = GraphConfig::new("t-min");
        let outcome = graph.invoke("objective", &config).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Finished {
                response: "the answer".to_string()
            }
        );
        // Session was cleaned up at End.
        assert!(!registry.contains("t-min"));
    }

    #[tokio::test]
    async fn test_checkpoints_form_parent_chain() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let checkpointer = Arc::new(MemoryCheckpointer::new());
        let model: Arc<dyn ChatModel> = Arc::new(FakeChatModel::new(vec![
            plan_call(json!([{"description": "s", "substeps": []}])),
            route_call("FINISH", ""),
            respond_call("done"),
        ]));

        let graph =
            AgentGraph::new(model, registry, Arc::clone(&checkpointer) as Arc<dyn Checkpointer>);
        let config = GraphConfig::new("t-chain");
        graph.invoke("objective", &config).await.unwrap();

        let tuples = checkpointer
            .list("t-chain", Some(""), ListOptions::default())
            .await
            .unwrap();
        // Planner, Supervisor, Replanner, plus the End transition is never
        // checkpointed (End short-circuits at loop top).
        assert!(tuples.len() >= 3);
        // Most-recent-first; every non-initial checkpoint links to its
        // parent and steps are strictly increasing.
        for pair in tuples.windows(2) {
            assert_eq!(
                pair[0]
                    .parent_config
                    .as_ref()
                    .and_then(|c| c.checkpoint_id.clone()),
                pair[1].config.checkpoint_id
            );
            assert!(pair[0].metadata.step > pair[1].metadata.step);
        }
        let first = tuples.last().unwrap();
        assert_eq!(first.metadata.source, CheckpointSource::Input);
        assert_eq!(first.metadata.step, 0);
    }

    #[tokio::test]
    async fn test_interrupt_and_resume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let checkpointer: Arc<dyn Checkpointer> = Arc::new(MemoryCheckpointer::new());
        let model: Arc<dyn ChatModel> = Arc::new(FakeChatModel::new(vec![
            plan_call(json!([{"description": "ask the user something", "substeps": []}])),
            route_call("ask_user", "What city are you in?"),
            // After resume:
            route_call("FINISH", ""),
            respond_call("thanks, done"),
        ]));

        let graph = AgentGraph::new(model, Arc::clone(&registry), Arc::clone(&checkpointer));
        let config = GraphConfig::new("t-interrupt");

        let outcome = graph.invoke("objective", &config).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Interrupted {
                kind: WorkerKind::AskUser,
                prompt: "What city are you in?".to_string()
            }
        );
        // Suspended: session resources were NOT released.
        assert!(registry.contains("t-interrupt"));

        let outcome = graph.resume(&config, Some("Paris")).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Finished {
                response: "thanks, done".to_string()
            }
        );
        assert!(!registry.contains("t-interrupt"));

        // The human's literal input was injected into the conversation:
        // the latest checkpoint's state carries it.
        let tuple = checkpointer
            .get_tuple(&CheckpointConfig::new("t-interrupt"))
            .await
            .unwrap()
            .unwrap();
        let snapshot: GraphSnapshot = serde_json::from_value(tuple.checkpoint.state).unwrap();
        assert!(snapshot
            .state
            .messages
            .iter()
            .any(|m| m.is_human() && m.as_text() == "Paris"));
    }

    #[tokio::test]
    async fn test_update_user_resumes_without_input() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let checkpointer: Arc<dyn Checkpointer> = Arc::new(MemoryCheckpointer::new());
        let model: Arc<dyn ChatModel> = Arc::new(FakeChatModel::new(vec![
            plan_call(json!([{"description": "notify", "substeps": []}])),
            route_call("update_user", "Halfway there."),
            route_call("FINISH", ""),
            respond_call("complete"),
        ]));

        let graph = AgentGraph::new(model, registry, checkpointer);
        let config = GraphConfig::new("t-update");

        let outcome = graph.invoke("objective", &config).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Interrupted {
                kind: WorkerKind::UpdateUser,
                prompt: "Halfway there.".to_string()
            }
        );
        // Resume without any human input.
        let outcome = graph.resume(&config, None).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Finished {
                response: "complete".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint_errors() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let checkpointer: Arc<dyn Checkpointer> = Arc::new(MemoryCheckpointer::new());
        let model: Arc<dyn ChatModel> = Arc::new(FakeChatModel::new(vec![]));
        let graph = AgentGraph::new(model, registry, checkpointer);

        let err = graph
            .resume(&GraphConfig::new("t-none"), Some("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoCheckpointToResume(_)));
    }

    #[tokio::test]
    async fn test_replan_budget_produces_fallback_response() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let checkpointer: Arc<dyn Checkpointer> = Arc::new(MemoryCheckpointer::new());
        // Model never responds terminally: it keeps routing FINISH on an
        // empty plan and replanning a new step, forever.
        let model: Arc<dyn ChatModel> = Arc::new(
            FakeChatModel::new(vec![plan_call(
                json!([{"description": "loop", "substeps": []}]),
            )])
            .with_fallback(plan_call(json!([{"description": "loop again", "substeps": []}]))),
        );

        let graph = AgentGraph::new(model, registry, checkpointer);
        let config = GraphConfig::new("t-budget")
            .with_max_replan_cycles(2)
            .with_recursion_limit(100);
        let outcome = graph.invoke("objective", &config).await.unwrap();
        match outcome {
            RunOutcome::Finished { response } => {
                assert!(response.contains("could not complete"));
            }
            RunOutcome::Interrupted { .. } => panic!("expected a finished run"),
        }
    }

    #[tokio::test]
    async fn test_recursion_limit_propagates_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let checkpointer: Arc<dyn Checkpointer> = Arc::new(MemoryCheckpointer::new());
        let model: Arc<dyn ChatModel> = Arc::new(
            FakeChatModel::new(vec![plan_call(
                json!([{"description": "loop", "substeps": []}]),
            )])
            .with_fallback(plan_call(json!([{"description": "more", "substeps": []}]))),
        );

        let graph = AgentGraph::new(model, Arc::clone(&registry), checkpointer);
        let config = GraphConfig::new("t-limit")
            .with_recursion_limit(4)
            .with_max_replan_cycles(1000);
        let err = graph.invoke("objective", &config).await.unwrap_err();
        assert!(matches!(err, Error::RecursionLimit { limit: 4 }));
        assert!(!registry.contains("t-limit"), "cleanup runs on failure too");
    }

    #[tokio::test]
    async fn test_dispatch_records_pending_send() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let checkpointer = Arc::new(MemoryCheckpointer::new());
        let model: Arc<dyn ChatModel> = Arc::new(FakeChatModel::new(vec![
            plan_call(json!([{"description": "write a file", "substeps": []}])),
            route_call("file_worker", "write hello to /tmp/x"),
            Message::ai("file written"), // worker summary (no tool calls)
            route_call("FINISH", ""),
            respond_call("done"),
        ]));

        let graph =
            AgentGraph::new(model, registry, Arc::clone(&checkpointer) as Arc<dyn Checkpointer>);
        let config = GraphConfig::new("t-sends");
        graph.invoke("objective", &config).await.unwrap();

        // Find the checkpoint whose pending_sends carries the dispatched
        // instruction (the worker-node checkpoint, child of the
        // supervisor's).
        let tuples = checkpointer
            .list("t-sends", Some(""), ListOptions::default())
            .await
            .unwrap();
        let with_sends: Vec<_> = tuples
            .iter()
            .filter(|t| !t.checkpoint.pending_sends.is_empty())
            .collect();
        assert_eq!(with_sends.len(), 1);
        assert_eq!(
            with_sends[0].checkpoint.pending_sends[0]["instruction"],
            "write hello to /tmp/x"
        );

        // The worker's summary message was recorded as a pending write on
        // the checkpoint that launched it.
        let worker_writes: Vec<_> = tuples
            .iter()
            .flat_map(|t| t.pending_writes.iter())
            .filter(|w| w.task_id == "file_worker")
            .collect();
        assert_eq!(worker_writes.len(), 1);
        assert_eq!(worker_writes[0].channel, "messages");
    }

    #[tokio::test]
    async fn test_stream_emits_transitions_in_order() {
        use futures::StreamExt;

        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let checkpointer: Arc<dyn Checkpointer> = Arc::new(MemoryCheckpointer::new());
        let model: Arc<dyn ChatModel> = Arc::new(FakeChatModel::new(vec![
            plan_call(json!([{"description": "s", "substeps": []}])),
            route_call("FINISH", ""),
            respond_call("streamed"),
        ]));

        let graph = AgentGraph::new(model, registry, checkpointer);
        let events: Vec<GraphEvent> = graph
            .stream("objective".to_string(), GraphConfig::new("t-stream"))
            .collect()
            .await;

        let nodes: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                GraphEvent::NodeStarted { node } => Some(*node),
                _ => None,
            })
            .collect();
        assert_eq!(nodes, vec!["planner", "supervisor", "replanner"]);
        assert!(matches!(
            events.last(),
            Some(GraphEvent::Finished { response }) if response == "streamed"
        ));
        // A checkpoint preceded every node execution.
        let saves = events
            .iter()
            .filter(|e| matches!(e, GraphEvent::CheckpointSaved { .. }))
            .count();
        assert_eq!(saves, 3);
    }

    #[tokio::test]
    async fn test_plan_execute_cycle_consumes_head() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let checkpointer = Arc::new(MemoryCheckpointer::new());
        // Three-step plan; one supervisor FINISH cycle consumes step one,
        // then the replanner restates the remaining two steps, and a
        // second cycle responds.
        let model: Arc<dyn ChatModel> = Arc::new(FakeChatModel::new(vec![
            plan_call(json!([
                {"description": "one", "substeps": []},
                {"description": "two", "substeps": []},
                {"description": "three", "substeps": []}
            ])),
            route_call("FINISH", ""),
            plan_call(json!([
                {"description": "two", "substeps": []},
                {"description": "three", "substeps": []}
            ])),
            route_call("FINISH", ""),
            respond_call("enough"),
        ]));

        let graph =
            AgentGraph::new(model, registry, Arc::clone(&checkpointer) as Arc<dyn Checkpointer>);
        let config = GraphConfig::new("t-consume");
        graph.invoke("objective", &config).await.unwrap();

        // Inspect the checkpoint written after the first replan: plan has
        // two steps and past-steps exactly one entry.
        let tuples = checkpointer
            .list("t-consume", Some(""), ListOptions::default())
            .await
            .unwrap();
        let snapshots: Vec<GraphSnapshot> = tuples
            .iter()
            .rev()
            .map(|t| serde_json::from_value(t.checkpoint.state.clone()).unwrap())
            .collect();
        let after_first_cycle = snapshots
            .iter()
            .find(|s| s.state.past_steps.len() == 1)
            .expect("some checkpoint captures the first completed step");
        assert_eq!(after_first_cycle.state.past_steps[0].step, "one");
        assert_eq!(after_first_cycle.state.plan.len(), 2);
    }
}
