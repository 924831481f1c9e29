// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Test utilities: scripted chat model, deterministic embeddings, and
//! no-op browser fixtures.
//!
//! Compiled unconditionally so the crate's integration tests and
//! downstream crates can drive the graph without a live model, embedding
//! service or browser.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::embeddings::Embeddings;
use crate::error::{Error, Result};
use crate::messages::Message;
use crate::model::{ChatModel, ChatResult, ToolChoice, ToolDefinition};
use crate::session::browser::{
    BrowserDriver, BrowserLauncher, ConsoleEntry, ElementKind, ScreenshotParser, ScrollTarget,
};

/// One recorded model invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Messages passed to the model.
    pub messages: Vec<Message>,
    /// Names of the tools offered.
    pub tool_names: Vec<String>,
}

/// A chat model that replays a scripted sequence of responses.
///
/// Each `generate` call pops the next scripted message; when the script is
/// exhausted the fallback response is returned. All calls are recorded for
/// assertions.
pub struct FakeChatModel {
    script: Mutex<Vec<Message>>,
    fallback: Message,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeChatModel {
    /// Create a model that will answer with `script` in order.
    #[must_use]
    pub fn new(script: Vec<Message>) -> Self {
        Self {
            script: Mutex::new({
                let mut s = script;
                s.reverse();
                s
            }),
            fallback: Message::ai("done"),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replace the response used once the script runs dry.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Message) -> Self {
        self.fallback = fallback;
        self
    }

    /// Number of generate calls made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Copies of all recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Remaining scripted responses.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl ChatModel for FakeChatModel {
    async fn generate(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        _tool_choice: Option<&ToolChoice>,
    ) -> Result<ChatResult> {
        self.calls.lock().push(RecordedCall {
            messages: messages.to_vec(),
            tool_names: tools
                .map(|t| t.iter().map(|d| d.name.clone()).collect())
                .unwrap_or_default(),
        });
        let message = self
            .script
            .lock()
            .pop()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(ChatResult::new(message))
    }

    fn model_type(&self) -> &str {
        "fake_chat_model"
    }
}

/// Deterministic embeddings: the vector is a pure function of the text, so
/// identical texts are identical vectors and similarity search behaves
/// predictably in tests.
pub struct MockEmbeddings {
    dimension: usize,
}

impl MockEmbeddings {
    /// Create embeddings of the given dimension.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        // FNV-style rolling hash seeded per component.
        (0..self.dimension)
            .map(|component| {
                let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ (component as u64);
                for byte in text.bytes() {
                    hash ^= u64::from(byte);
                    hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
                }
                // Map to [-1, 1].
                ((hash % 2000) as f32 / 1000.0) - 1.0
            })
            .collect()
    }
}

#[async_trait]
impl Embeddings for MockEmbeddings {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// A browser driver that accepts every action and records nothing real.
///
/// `element_count` is scriptable so index-targeting paths can be tested.
#[derive(Default)]
pub struct NullBrowserDriver {
    /// Scripted element counts per kind (defaults to 0).
    pub clickable: usize,
    /// Number of input-capable elements to report.
    pub inputs: usize,
    /// Number of select elements to report.
    pub selects: usize,
    /// Actions performed, in order, as short labels.
    pub actions: Mutex<Vec<String>>,
}

impl NullBrowserDriver {
    fn record(&self, action: impl Into<String>) {
        self.actions.lock().push(action.into());
    }
}

#[async_trait]
impl BrowserDriver for NullBrowserDriver {
    async fn goto(&self, url: &str) -> Result<()> {
        self.record(format!("goto {url}"));
        Ok(())
    }

    async fn element_count(&self, kind: ElementKind) -> Result<usize> {
        Ok(match kind {
            ElementKind::Clickable => self.clickable,
            ElementKind::Input => self.inputs,
            ElementKind::Select => self.selects,
        })
    }

    async fn click_element(&self, _kind: ElementKind, index: usize) -> Result<()> {
        self.record(format!("click #{index}"));
        Ok(())
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<()> {
        self.record(format!("click @{x},{y}"));
        Ok(())
    }

    async fn fill_element(&self, index: usize, text: &str) -> Result<()> {
        self.record(format!("fill #{index} {text}"));
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        self.record(format!("type {text}"));
        Ok(())
    }

    async fn move_mouse(&self, x: f64, y: f64) -> Result<()> {
        self.record(format!("move @{x},{y}"));
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        self.record(format!("press {key}"));
        Ok(())
    }

    async fn select_option(&self, index: usize, option: usize) -> Result<()> {
        self.record(format!("select #{index} option {option}"));
        Ok(())
    }

    async fn scroll(&self, target: ScrollTarget) -> Result<()> {
        self.record(format!("scroll {target:?}"));
        Ok(())
    }

    async fn evaluate(&self, javascript: &str) -> Result<serde_json::Value> {
        self.record(format!("eval {javascript}"));
        Ok(serde_json::Value::Null)
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        // Minimal PNG magic so encoders treat it as an image payload.
        Ok(vec![0x89, 0x50, 0x4E, 0x47])
    }

    async fn drain_console(&self) -> Result<Vec<ConsoleEntry>> {
        Ok(Vec::new())
    }

    async fn wait_for_network_idle(&self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    async fn close_page(&self) -> Result<()> {
        Ok(())
    }

    async fn close_context(&self) -> Result<()> {
        Ok(())
    }

    async fn close_browser(&self) -> Result<()> {
        Ok(())
    }
}

/// Launcher producing [`NullBrowserDriver`]s; records launch count.
#[derive(Default)]
pub struct NullBrowserLauncher {
    /// Element counts copied onto each launched driver.
    pub clickable: usize,
    /// Number of input-capable elements each driver reports.
    pub inputs: usize,
    /// Number of select elements each driver reports.
    pub selects: usize,
    pub(crate) launches: Mutex<usize>,
}

impl NullBrowserLauncher {
    /// How many times a browser was launched.
    #[must_use]
    pub fn launch_count(&self) -> usize {
        *self.launches.lock()
    }
}

#[async_trait]
impl BrowserLauncher for NullBrowserLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserDriver>> {
        *self.launches.lock() += 1;
        Ok(Arc::new(NullBrowserDriver {
            clickable: self.clickable,
            inputs: self.inputs,
            selects: self.selects,
            actions: Mutex::new(Vec::new()),
        }))
    }
}

/// A screenshot parser that always returns the same text.
pub struct StaticParser(pub String);

#[async_trait]
impl ScreenshotParser for StaticParser {
    async fn parse(&self, _png: &[u8]) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// A screenshot parser that always fails, for degradation tests.
#[derive(Default)]
pub struct BrokenParser;

#[async_trait]
impl ScreenshotParser for BrokenParser {
    async fn parse(&self, _png: &[u8]) -> Result<String> {
        Err(Error::tool_failure("parser unavailable"))
    }
}
