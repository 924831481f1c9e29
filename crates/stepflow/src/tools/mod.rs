// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Tool surface.
//!
//! Tools are the operations workers can invoke: stateless contracts over
//! stateful session-backed resources. Failures at the tool boundary are
//! converted to descriptive text results rather than thrown - the model is
//! the consumer and must be able to read the failure and adapt its plan.
//! This is intentional, not an oversight; only graph-level failures
//! propagate as errors.

pub mod browser;
pub mod file;
pub mod kb;
pub mod shell;

use async_trait::async_trait;
use serde_json::json;

use crate::error::Result;
use crate::model::ToolDefinition;

/// Input type for tools: a bare string or structured named arguments.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum ToolInput {
    /// Simple string input
    String(String),
    /// Structured input with named arguments
    Structured(serde_json::Value),
}

impl From<String> for ToolInput {
    fn from(s: String) -> Self {
        ToolInput::String(s)
    }
}

impl From<&str> for ToolInput {
    fn from(s: &str) -> Self {
        ToolInput::String(s.to_string())
    }
}

impl From<serde_json::Value> for ToolInput {
    fn from(v: serde_json::Value) -> Self {
        ToolInput::Structured(v)
    }
}

impl ToolInput {
    /// Fetch a string field from structured input.
    #[must_use]
    pub fn str_field(&self, name: &str) -> Option<String> {
        match self {
            ToolInput::Structured(v) => v
                .get(name)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            ToolInput::String(_) => None,
        }
    }

    /// Fetch a boolean field from structured input.
    #[must_use]
    pub fn bool_field(&self, name: &str) -> Option<bool> {
        match self {
            ToolInput::Structured(v) => v.get(name).and_then(serde_json::Value::as_bool),
            ToolInput::String(_) => None,
        }
    }

    /// Fetch an unsigned integer field from structured input.
    #[must_use]
    pub fn u64_field(&self, name: &str) -> Option<u64> {
        match self {
            ToolInput::Structured(v) => v.get(name).and_then(serde_json::Value::as_u64),
            ToolInput::String(_) => None,
        }
    }

    /// Fetch a float field from structured input.
    #[must_use]
    pub fn f64_field(&self, name: &str) -> Option<f64> {
        match self {
            ToolInput::Structured(v) => v.get(name).and_then(serde_json::Value::as_f64),
            ToolInput::String(_) => None,
        }
    }

    /// The bare string, or the conventional "input" field of structured
    /// input.
    #[must_use]
    pub fn as_text(&self) -> Option<String> {
        match self {
            ToolInput::String(s) => Some(s.clone()),
            ToolInput::Structured(v) => v
                .get("input")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
        }
    }
}

/// An inline image attached to a tool result, base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    /// MIME content type (e.g. "image/png").
    pub content_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

/// Result of a tool invocation: text plus optional inline images.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    /// Textual result (failures are rendered here as text).
    pub text: String,
    /// Inline images (screenshots, image file reads).
    pub images: Vec<InlineImage>,
}

impl ToolResult {
    /// A text-only result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
        }
    }

    /// Attach an inline image.
    #[must_use]
    pub fn with_image(mut self, content_type: impl Into<String>, data: impl Into<String>) -> Self {
        self.images.push(InlineImage {
            content_type: content_type.into(),
            data: data.into(),
        });
        self
    }
}

/// Base trait for all StepFlow tools.
///
/// Each tool exposes a name, a description the model reads to decide when
/// to call it, a JSON Schema for its arguments, and the async call itself.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool's unique name.
    fn name(&self) -> &str;

    /// What the tool does; read by the model when choosing tools.
    fn description(&self) -> &str;

    /// JSON Schema of the tool's input.
    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "input": {
                    "type": "string",
                    "description": "Tool input"
                }
            },
            "required": ["input"]
        })
    }

    /// Execute the tool.
    ///
    /// Expected failures (missing files, dead processes, stale element
    /// indices) are rendered into the returned text; an `Err` from this
    /// method is reserved for failures the worker loop itself must see.
    async fn call(&self, input: ToolInput) -> Result<ToolResult>;

    /// This tool as a model-facing definition.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.args_schema(),
        }
    }
}
