// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Language model boundary.
//!
//! The model is an external collaborator: an opaque function from messages
//! (plus optional tool schemas) to one AI message that may carry tool-call
//! requests. Nothing in this crate depends on which provider sits behind
//! [`ChatModel`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::messages::Message;

/// Definition of a tool (function) the model may choose to call.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolDefinition {
    /// Name of the tool (must be unique within a request)
    pub name: String,
    /// Human-readable description of what the tool does
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// How the model should choose which tool(s) to call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolChoice {
    /// Let the model decide whether to call a tool (default)
    #[default]
    Auto,
    /// Must call at least one tool
    Required,
    /// Call a specific tool by name
    Specific(String),
}

/// Result of one chat model call.
#[derive(Debug, Clone)]
pub struct ChatResult {
    /// The message output by the model (an AI message).
    pub message: Message,
}

impl ChatResult {
    /// Wrap a message as a result.
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self { message }
    }

    /// Text content of the generated message.
    #[must_use]
    pub fn text(&self) -> String {
        self.message.as_text().to_string()
    }
}

/// Chat model boundary trait.
///
/// Implementors call a provider and return one AI message, optionally with
/// structured tool calls when `tools` were supplied.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Generate a response from messages.
    ///
    /// # Arguments
    ///
    /// * `messages` - Conversation so far
    /// * `tools` - Optional tool definitions for function calling
    /// * `tool_choice` - Whether/which tools must be called
    ///
    /// # Errors
    ///
    /// Returns [`Error::Model`] when the provider call fails. Provider
    /// failures are graph-level failures: they propagate to the run's
    /// caller rather than being rendered as tool text.
    async fn generate(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        tool_choice: Option<&ToolChoice>,
    ) -> Result<ChatResult>;

    /// Identifier for the model type, used in logs.
    fn model_type(&self) -> &str;
}

/// Ask the model for structured output conforming to `schema`.
///
/// Implements the `with_structured_output` pattern on top of tool calling:
/// the schema is presented as the single callable function with
/// [`ToolChoice::Specific`], and the returned call's arguments are parsed
/// into `T`.
///
/// Returns `Ok(None)` when the model produced no tool call at all (callers
/// decide the default; the supervisor treats this as "finish"). A tool call
/// whose arguments do not parse into `T` is a
/// [`Error::StructuredOutput`] error.
pub async fn structured_output<T: DeserializeOwned>(
    model: &Arc<dyn ChatModel>,
    messages: &[Message],
    name: &str,
    description: &str,
    schema: serde_json::Value,
) -> Result<Option<T>> {
    let definition = ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        parameters: schema,
    };
    let choice = ToolChoice::Specific(name.to_string());
    let result = model
        .generate(messages, Some(std::slice::from_ref(&definition)), Some(&choice))
        .await?;

    let Some(call) = result
        .message
        .tool_calls()
        .iter()
        .find(|c| c.name == name)
        .cloned()
    else {
        return Ok(None);
    };

    let parsed: T = serde_json::from_value(call.args).map_err(|e| {
        Error::StructuredOutput(format!("arguments for '{name}' did not match schema: {e}"))
    })?;
    Ok(Some(parsed))
}

/// Ask for structured output where the model picks exactly one of several
/// functions (e.g. the replanner's plan-or-respond decision).
///
/// Returns the name of the chosen function and its raw arguments, or `None`
/// when the model produced no tool call.
pub async fn structured_choice(
    model: &Arc<dyn ChatModel>,
    messages: &[Message],
    definitions: &[ToolDefinition],
) -> Result<Option<(String, serde_json::Value)>> {
    let result = model
        .generate(messages, Some(definitions), Some(&ToolChoice::Required))
        .await?;

    Ok(result
        .message
        .tool_calls()
        .first()
        .map(|c| (c.name.clone(), c.args.clone())))
}

/// JSON Schema for a plain object with string-typed properties.
///
/// Small helper used by the hand-written schemas in this crate; keeps the
/// `json!` literals at call sites focused on the interesting fields.
#[must_use]
pub fn object_schema(
    properties: serde_json::Value,
    required: &[&str],
) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ToolCall;
    use parking_lot::Mutex;
    use serde::Deserialize;

    /// Minimal scripted model for this module's tests.
    struct OneShot {
        reply: Mutex<Option<Message>>,
    }

    #[async_trait]
    impl ChatModel for OneShot {
        async fn generate(
            &self,
            _messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _tool_choice: Option<&ToolChoice>,
        ) -> Result<ChatResult> {
            let msg = self
                .reply
                .lock()
                .take()
                .unwrap_or_else(|| Message::ai("done"));
            Ok(ChatResult::new(msg))
        }

        fn model_type(&self) -> &str {
            "one_shot"
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Router {
        next: String,
        instruction: String,
    }

    #[tokio::test]
    async fn test_structured_output_parses_tool_call() {
        let model: Arc<dyn ChatModel> = Arc::new(OneShot {
            reply: Mutex::new(Some(Message::ai_with_tool_calls(
                "",
                vec![ToolCall::new(
                    "c1",
                    "route",
                    json!({"next": "shell_worker", "instruction": "run ls"}),
                )],
            ))),
        });

        let routed: Option<Router> = structured_output(
            &model,
            &[Message::human("go")],
            "route",
            "Pick the next worker",
            object_schema(json!({"next": {"type": "string"}, "instruction": {"type": "string"}}), &["next", "instruction"]),
        )
        .await
        .unwrap();

        assert_eq!(
            routed,
            Some(Router {
                next: "shell_worker".to_string(),
                instruction: "run ls".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_structured_output_none_without_tool_call() {
        let model: Arc<dyn ChatModel> = Arc::new(OneShot {
            reply: Mutex::new(Some(Message::ai("just text"))),
        });

        let routed: Option<Router> = structured_output(
            &model,
            &[Message::human("go")],
            "route",
            "Pick the next worker",
            json!({"type": "object"}),
        )
        .await
        .unwrap();

        assert!(routed.is_none());
    }

    #[tokio::test]
    async fn test_structured_output_bad_args_is_error() {
        let model: Arc<dyn ChatModel> = Arc::new(OneShot {
            reply: Mutex::new(Some(Message::ai_with_tool_calls(
                "",
                vec![ToolCall::new("c1", "route", json!({"next": 42}))],
            ))),
        });

        let routed: Result<Option<Router>> = structured_output(
            &model,
            &[Message::human("go")],
            "route",
            "Pick the next worker",
            json!({"type": "object"}),
        )
        .await;

        assert!(matches!(routed, Err(Error::StructuredOutput(_))));
    }

    #[tokio::test]
    async fn test_structured_choice_returns_first_call() {
        let model: Arc<dyn ChatModel> = Arc::new(OneShot {
            reply: Mutex::new(Some(Message::ai_with_tool_calls(
                "",
                vec![ToolCall::new("c1", "respond", json!({"response": "42"}))],
            ))),
        });

        let defs = vec![
            ToolDefinition {
                name: "plan".to_string(),
                description: String::new(),
                parameters: json!({"type": "object"}),
            },
            ToolDefinition {
                name: "respond".to_string(),
                description: String::new(),
                parameters: json!({"type": "object"}),
            },
        ];
        let choice = structured_choice(&model, &[Message::human("go")], &defs)
            .await
            .unwrap();
        let (name, args) = choice.unwrap();
        assert_eq!(name, "respond");
        assert_eq!(args["response"], "42");
    }
}
