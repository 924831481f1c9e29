// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Knowledge-base worker: the retrieval sub-loop.
//!
//! An explicit machine over four phases:
//!
//! ```text
//! Retrieve -> Grade -> Generate            (relevant)
//!               |
//!               +----> Rewrite -> Retrieve (not relevant, budget left)
//! ```
//!
//! Grading fails closed: anything but an unambiguous affirmative re-queries
//! instead of answering from irrelevant context. The rewrite cycle carries
//! an explicit budget; once exhausted the worker answers that it could not
//! find relevant information rather than looping forever.

use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::messages::Message;
use crate::model::ChatModel;
use crate::prompts;
use crate::session::Session;
use crate::state::WorkerKind;

/// Number of documents retrieved per similarity search.
pub const RETRIEVAL_TOP_K: usize = 5;

/// Default bound on rewrite cycles before giving up.
pub const DEFAULT_MAX_REWRITES: u32 = 3;

/// Apology response when generation has nothing to work from.
const NO_INFORMATION_RESPONSE: &str =
    "I couldn't find relevant information to answer your question.";

/// Configuration for one knowledge-base worker invocation.
#[derive(Debug, Clone)]
pub struct KbConfig {
    /// Documents per retrieval.
    pub top_k: usize,
    /// Rewrite budget; decremented each Rewrite cycle.
    pub max_rewrites: u32,
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            top_k: RETRIEVAL_TOP_K,
            max_rewrites: DEFAULT_MAX_REWRITES,
        }
    }
}

/// Result of the knowledge-base worker.
#[derive(Debug, Clone)]
pub struct KbOutcome {
    /// The answer message, tagged with the worker's name.
    pub message: Message,
    /// Deduplicated source identifiers backing the answer.
    pub sources: Vec<String>,
}

/// Phases of the retrieval machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KbPhase {
    Retrieve,
    Grade,
    Rewrite,
    Generate,
}

/// What one retrieval produced.
struct Retrieved {
    content: String,
    sources: Vec<String>,
}

/// Run the retrieval machine for one query.
pub async fn run_kb_worker(
    model: &Arc<dyn ChatModel>,
    session: &Arc<Session>,
    query: &str,
    config: &KbConfig,
) -> Result<KbOutcome> {
    let original_query = query.to_string();
    let mut current_query = query.to_string();
    let mut rewrites_left = config.max_rewrites;
    let mut retrieved = Retrieved {
        content: String::new(),
        sources: Vec::new(),
    };

    let mut phase = KbPhase::Retrieve;
    loop {
        match phase {
            KbPhase::Retrieve => {
                retrieved = retrieve(session, &current_query, config.top_k).await?;
                debug!(
                    query = %current_query,
                    sources = retrieved.sources.len(),
                    "kb retrieve"
                );
                phase = KbPhase::Grade;
            }
            KbPhase::Grade => {
                phase = if grade(model, &original_query, &retrieved.content).await? {
                    KbPhase::Generate
                } else {
                    KbPhase::Rewrite
                };
            }
            KbPhase::Rewrite => {
                if rewrites_left == 0 {
                    // Budget exhausted: surface a terminal answer instead
                    // of cycling retrieve/rewrite forever.
                    debug!("kb rewrite budget exhausted");
                    return Ok(KbOutcome {
                        message: Message::ai(NO_INFORMATION_RESPONSE)
                            .with_name(WorkerKind::KnowledgeBase.name()),
                        sources: Vec::new(),
                    });
                }
                rewrites_left -= 1;
                current_query = rewrite(model, &original_query).await?;
                debug!(rewritten = %current_query, rewrites_left, "kb rewrite");
                phase = KbPhase::Retrieve;
            }
            KbPhase::Generate => {
                return generate(model, &original_query, &retrieved).await;
            }
        }
    }
}

/// Similarity search plus source deduplication.
async fn retrieve(session: &Arc<Session>, query: &str, top_k: usize) -> Result<Retrieved> {
    let store = session.vector_store().await?;
    let documents = store.similarity_search(query, top_k, None).await?;

    let content = documents
        .iter()
        .map(|d| d.page_content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut sources = Vec::new();
    for document in &documents {
        let source = ["source", "title", "filename"]
            .iter()
            .find_map(|key| {
                document
                    .metadata
                    .get(*key)
                    .and_then(serde_json::Value::as_str)
            })
            .unwrap_or("Unknown source")
            .to_string();
        if !sources.contains(&source) {
            sources.push(source);
        }
    }

    Ok(Retrieved { content, sources })
}

/// Strict yes/no relevance check.
///
/// Only an answer containing "yes" routes to Generate; everything else -
/// including an empty query or empty content, where the model is never
/// asked - is treated as "no".
async fn grade(model: &Arc<dyn ChatModel>, query: &str, content: &str) -> Result<bool> {
    if query.is_empty() || content.is_empty() {
        return Ok(false);
    }
    let messages = vec![Message::human(prompts::relevance_prompt(query, content))];
    let result = model.generate(&messages, None, None).await?;
    Ok(result.text().to_lowercase().contains("yes"))
}

/// Ask the model for a more specific query.
async fn rewrite(model: &Arc<dyn ChatModel>, query: &str) -> Result<String> {
    let messages = vec![Message::human(prompts::rewrite_query_prompt(query))];
    let result = model.generate(&messages, None, None).await?;
    Ok(result.text().trim().to_string())
}

/// Produce the cited answer.
///
/// Missing query or content short-circuits to the apology response
/// without a model call.
async fn generate(
    model: &Arc<dyn ChatModel>,
    query: &str,
    retrieved: &Retrieved,
) -> Result<KbOutcome> {
    if query.is_empty() || retrieved.content.is_empty() {
        return Ok(KbOutcome {
            message: Message::ai(NO_INFORMATION_RESPONSE)
                .with_name(WorkerKind::KnowledgeBase.name()),
            sources: Vec::new(),
        });
    }

    let sources_text = prompts::render_sources(&retrieved.sources);
    let messages = vec![Message::human(prompts::generate_answer_prompt(
        query,
        &retrieved.content,
        &sources_text,
    ))];
    let result = model.generate(&messages, None, None).await?;
    Ok(KbOutcome {
        message: Message::ai(result.text()).with_name(WorkerKind::KnowledgeBase.name()),
        sources: retrieved.sources.clone(),
    })
}
