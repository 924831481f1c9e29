// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Knowledge-base tools.
//!
//! Document ingestion into the session's persistent vector store. Retrieval
//! is not a tool: it runs inside the knowledge-base worker's
//! retrieve/grade/rewrite/generate loop.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Error;
use crate::session::Session;
use crate::tools::{Tool, ToolInput, ToolResult};

/// Add documents (chunked and embedded) to the session's knowledge base.
pub struct KbAddDocumentsTool {
    session: Arc<Session>,
}

impl KbAddDocumentsTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for KbAddDocumentsTool {
    fn name(&self) -> &str {
        "kb_add_documents"
    }

    fn description(&self) -> &str {
        "Add documents to the knowledge base for later retrieval. Each document is chunked and embedded; optional sources label where each document came from."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "documents": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Document texts to store"
                },
                "sources": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "(Optional) Source label per document, same length as documents"
                }
            },
            "required": ["documents"]
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let ToolInput::Structured(ref value) = input else {
            return Ok(ToolResult::text(
                "Error: kb_add_documents requires structured input".to_string(),
            ));
        };
        let documents: Vec<String> = value
            .get("documents")
            .and_then(serde_json::Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .ok_or_else(|| Error::tool_failure("Missing documents parameter"))?;
        let sources: Option<Vec<String>> = value
            .get("sources")
            .and_then(serde_json::Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(str::to_string)
                    .collect()
            });

        let metadatas: Option<Vec<HashMap<String, serde_json::Value>>> = sources.map(|sources| {
            sources
                .into_iter()
                .map(|source| HashMap::from([("source".to_string(), json!(source))]))
                .collect()
        });

        let outcome = async {
            let store = self.session.vector_store().await?;
            store
                .add_documents(&documents, metadatas.as_deref())
                .await
        };
        match outcome.await {
            Ok(ids) => Ok(ToolResult::text(format!(
                "Added {} document(s) as {} chunk(s) to the knowledge base",
                documents.len(),
                ids.len()
            ))),
            Err(e) => Ok(ToolResult::text(format!("Error adding documents: {e}"))),
        }
    }
}

/// The knowledge-base toolkit bound to a session.
#[must_use]
pub fn kb_toolkit(session: &Arc<Session>) -> Vec<Arc<dyn Tool>> {
    vec![Arc::new(KbAddDocumentsTool::new(Arc::clone(session)))]
}
