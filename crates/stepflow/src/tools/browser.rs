// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Browser tools.
//!
//! Adapters over the session's browser. Index-based element targeting
//! re-queries the element class on every call - indices are not stable
//! across page mutations, and an index that no longer resolves comes back
//! as a textual failure the model can react to (typically by taking a
//! fresh view).

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use std::sync::Arc;

use crate::error::Error;
use crate::session::browser::{ElementKind, ScrollTarget};
use crate::session::Session;
use crate::tools::{Tool, ToolInput, ToolResult};

fn render_error(e: &Error) -> String {
    format!("Error: {e}")
}

/// Validate an index against the current count of an element class.
async fn check_index(
    session: &Session,
    kind: ElementKind,
    index: usize,
) -> crate::error::Result<Option<String>> {
    let driver = session.browser().driver().await?;
    let count = driver.element_count(kind).await?;
    if index >= count {
        return Ok(Some(if count == 0 {
            format!("Error: Index {index} is out of range (no matching elements on page)")
        } else {
            format!("Error: Index {index} is out of range (0-{})", count - 1)
        }));
    }
    Ok(None)
}

/// Screenshot the page and extract text via the configured parser.
pub struct BrowserViewTool {
    session: Arc<Session>,
}

impl BrowserViewTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserViewTool {
    fn name(&self) -> &str {
        "browser_view"
    }

    fn description(&self) -> &str {
        "View the content of the current browser page. Use for checking the latest state of previously opened pages."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _input: ToolInput) -> crate::error::Result<ToolResult> {
        match self.session.browser().view(self.session.screenshot_parser()).await {
            Ok(view) => {
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(&view.screenshot);
                let text = view
                    .parsed_text
                    .unwrap_or_else(|| "(no structured text extracted)".to_string());
                Ok(ToolResult::text(text).with_image("image/png", encoded))
            }
            Err(e) => Ok(ToolResult::text(render_error(&e))),
        }
    }
}

/// Navigate to a URL.
pub struct BrowserNavigateTool {
    session: Arc<Session>,
}

impl BrowserNavigateTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserNavigateTool {
    fn name(&self) -> &str {
        "browser_navigate"
    }

    fn description(&self) -> &str {
        "Navigate the browser to a specified URL. Use when accessing new pages is needed."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Complete URL to visit, including protocol prefix"}
            },
            "required": ["url"]
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let url = input
            .str_field("url")
            .or_else(|| input.as_text())
            .ok_or_else(|| Error::tool_failure("Missing url parameter"))?;
        match self.session.browser().navigate(&url).await {
            Ok(()) => Ok(ToolResult::text(format!("Successfully navigated to {url}"))),
            Err(e) => Ok(ToolResult::text(format!("Error navigating to {url}: {e}"))),
        }
    }
}

/// Restart the browser and navigate to a URL.
pub struct BrowserRestartTool {
    session: Arc<Session>,
}

impl BrowserRestartTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserRestartTool {
    fn name(&self) -> &str {
        "browser_restart"
    }

    fn description(&self) -> &str {
        "Restart the browser and navigate to a specified URL. Use when the browser state needs to be reset."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Complete URL to visit after restart, including protocol prefix"}
            },
            "required": ["url"]
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let url = input
            .str_field("url")
            .or_else(|| input.as_text())
            .ok_or_else(|| Error::tool_failure("Missing url parameter"))?;
        let restart = async {
            self.session.browser().restart().await?;
            self.session.browser().navigate(&url).await
        };
        match restart.await {
            Ok(()) => Ok(ToolResult::text(format!(
                "Browser restarted and navigated to {url}"
            ))),
            Err(e) => Ok(ToolResult::text(format!(
                "Error restarting browser and navigating to {url}: {e}"
            ))),
        }
    }
}

/// Click an element by index or a position by coordinates.
pub struct BrowserClickTool {
    session: Arc<Session>,
}

impl BrowserClickTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserClickTool {
    fn name(&self) -> &str {
        "browser_click"
    }

    fn description(&self) -> &str {
        "Click an element on the current browser page, by element index or by coordinates."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "index": {"type": "integer", "description": "(Optional) Index number of the element to click"},
                "coordinate_x": {"type": "number", "description": "(Optional) X coordinate of the click position"},
                "coordinate_y": {"type": "number", "description": "(Optional) Y coordinate of the click position"}
            }
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let index = input.u64_field("index").map(|n| n as usize);
        let x = input.f64_field("coordinate_x");
        let y = input.f64_field("coordinate_y");

        let outcome = async {
            let driver = self.session.browser().driver().await?;
            if let Some(index) = index {
                if let Some(out_of_range) =
                    check_index(&self.session, ElementKind::Clickable, index).await?
                {
                    return Ok::<String, Error>(out_of_range);
                }
                driver.click_element(ElementKind::Clickable, index).await?;
                self.session.browser().settle().await?;
                Ok(format!("Clicked on element at index {index}"))
            } else if let (Some(x), Some(y)) = (x, y) {
                driver.click_at(x, y).await?;
                self.session.browser().settle().await?;
                Ok(format!("Clicked at coordinates ({x}, {y})"))
            } else {
                Ok("Error: Either index or coordinates (x, y) must be provided".to_string())
            }
        };
        match outcome.await {
            Ok(text) => Ok(ToolResult::text(text)),
            Err(e) => Ok(ToolResult::text(format!("Error clicking: {e}"))),
        }
    }
}

/// Overwrite text in an editable element.
pub struct BrowserInputTool {
    session: Arc<Session>,
}

impl BrowserInputTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserInputTool {
    fn name(&self) -> &str {
        "browser_input"
    }

    fn description(&self) -> &str {
        "Overwrite text in an editable element on the current browser page. Use when filling content in input fields."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "index": {"type": "integer", "description": "(Optional) Index number of the element to overwrite text in"},
                "coordinate_x": {"type": "number", "description": "(Optional) X coordinate of the element"},
                "coordinate_y": {"type": "number", "description": "(Optional) Y coordinate of the element"},
                "text": {"type": "string", "description": "Complete text content to overwrite"},
                "press_enter": {"type": "boolean", "description": "Whether to press the Enter key after input"}
            },
            "required": ["text", "press_enter"]
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let text = input
            .str_field("text")
            .ok_or_else(|| Error::tool_failure("Missing text parameter"))?;
        let press_enter = input.bool_field("press_enter").unwrap_or(false);
        let index = input.u64_field("index").map(|n| n as usize);
        let x = input.f64_field("coordinate_x");
        let y = input.f64_field("coordinate_y");

        let outcome = async {
            let driver = self.session.browser().driver().await?;
            if let Some(index) = index {
                if let Some(out_of_range) =
                    check_index(&self.session, ElementKind::Input, index).await?
                {
                    return Ok::<String, Error>(out_of_range);
                }
                driver.fill_element(index, &text).await?;
                if press_enter {
                    driver.press_key("Enter").await?;
                    self.session.browser().settle().await?;
                }
                Ok(format!("Text input completed at element index {index}"))
            } else if let (Some(x), Some(y)) = (x, y) {
                driver.click_at(x, y).await?;
                driver.type_text(&text).await?;
                if press_enter {
                    driver.press_key("Enter").await?;
                    self.session.browser().settle().await?;
                }
                Ok(format!("Text input completed at coordinates ({x}, {y})"))
            } else {
                Ok("Error: Either index or coordinates (x, y) must be provided".to_string())
            }
        };
        match outcome.await {
            Ok(text) => Ok(ToolResult::text(text)),
            Err(e) => Ok(ToolResult::text(format!("Error inputting text: {e}"))),
        }
    }
}

/// Move the mouse cursor.
pub struct BrowserMoveMouseTool {
    session: Arc<Session>,
}

impl BrowserMoveMouseTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserMoveMouseTool {
    fn name(&self) -> &str {
        "browser_move_mouse"
    }

    fn description(&self) -> &str {
        "Move the cursor to a specified position on the current browser page. Use when simulating user mouse movement."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "coordinate_x": {"type": "number", "description": "X coordinate of the target cursor position"},
                "coordinate_y": {"type": "number", "description": "Y coordinate of the target cursor position"}
            },
            "required": ["coordinate_x", "coordinate_y"]
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let x = input
            .f64_field("coordinate_x")
            .ok_or_else(|| Error::tool_failure("Missing coordinate_x parameter"))?;
        let y = input
            .f64_field("coordinate_y")
            .ok_or_else(|| Error::tool_failure("Missing coordinate_y parameter"))?;
        let outcome = async {
            let driver = self.session.browser().driver().await?;
            driver.move_mouse(x, y).await
        };
        match outcome.await {
            Ok(()) => Ok(ToolResult::text(format!("Mouse moved to coordinates ({x}, {y})"))),
            Err(e) => Ok(ToolResult::text(format!("Error moving mouse: {e}"))),
        }
    }
}

/// Press a key or key combination.
pub struct BrowserPressKeyTool {
    session: Arc<Session>,
}

impl BrowserPressKeyTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserPressKeyTool {
    fn name(&self) -> &str {
        "browser_press_key"
    }

    fn description(&self) -> &str {
        "Simulate a key press in the current browser page. Supports key combinations (e.g., Control+Enter)."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "key": {"type": "string", "description": "Key name to simulate (e.g., Enter, Tab, ArrowUp)"}
            },
            "required": ["key"]
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let key = input
            .str_field("key")
            .or_else(|| input.as_text())
            .ok_or_else(|| Error::tool_failure("Missing key parameter"))?;
        let outcome = async {
            let driver = self.session.browser().driver().await?;
            driver.press_key(&key).await?;
            self.session.browser().settle().await
        };
        match outcome.await {
            Ok(()) => Ok(ToolResult::text(format!("Key press simulated: {key}"))),
            Err(e) => Ok(ToolResult::text(format!("Error pressing key: {e}"))),
        }
    }
}

/// Select an option from a dropdown.
pub struct BrowserSelectOptionTool {
    session: Arc<Session>,
}

impl BrowserSelectOptionTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserSelectOptionTool {
    fn name(&self) -> &str {
        "browser_select_option"
    }

    fn description(&self) -> &str {
        "Select a specified option from a dropdown list element in the current browser page."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "index": {"type": "integer", "description": "Index number of the dropdown list element"},
                "option": {"type": "integer", "description": "Option number to select, starting from 0"}
            },
            "required": ["index", "option"]
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let index = input
            .u64_field("index")
            .ok_or_else(|| Error::tool_failure("Missing index parameter"))? as usize;
        let option = input
            .u64_field("option")
            .ok_or_else(|| Error::tool_failure("Missing option parameter"))? as usize;

        let outcome = async {
            if let Some(out_of_range) =
                check_index(&self.session, ElementKind::Select, index).await?
            {
                return Ok::<String, Error>(out_of_range);
            }
            let driver = self.session.browser().driver().await?;
            driver.select_option(index, option).await?;
            Ok(format!("Selected option {option} from dropdown at index {index}"))
        };
        match outcome.await {
            Ok(text) => Ok(ToolResult::text(text)),
            Err(e) => Ok(ToolResult::text(format!("Error selecting option: {e}"))),
        }
    }
}

/// Scroll the page up.
pub struct BrowserScrollUpTool {
    session: Arc<Session>,
}

impl BrowserScrollUpTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserScrollUpTool {
    fn name(&self) -> &str {
        "browser_scroll_up"
    }

    fn description(&self) -> &str {
        "Scroll up the current browser page, one viewport or directly to the top."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "to_top": {"type": "boolean", "description": "(Optional) Scroll directly to the page top instead of one viewport up"}
            }
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let to_top = input.bool_field("to_top").unwrap_or(false);
        let target = if to_top {
            ScrollTarget::Top
        } else {
            ScrollTarget::UpViewport
        };
        let outcome = async {
            let driver = self.session.browser().driver().await?;
            driver.scroll(target).await
        };
        match outcome.await {
            Ok(()) => Ok(ToolResult::text(if to_top {
                "Scrolled to page top"
            } else {
                "Scrolled up one viewport"
            })),
            Err(e) => Ok(ToolResult::text(format!("Error scrolling up: {e}"))),
        }
    }
}

/// Scroll the page down.
pub struct BrowserScrollDownTool {
    session: Arc<Session>,
}

impl BrowserScrollDownTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserScrollDownTool {
    fn name(&self) -> &str {
        "browser_scroll_down"
    }

    fn description(&self) -> &str {
        "Scroll down the current browser page, one viewport or directly to the bottom."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "to_bottom": {"type": "boolean", "description": "(Optional) Scroll directly to the page bottom instead of one viewport down"}
            }
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let to_bottom = input.bool_field("to_bottom").unwrap_or(false);
        let target = if to_bottom {
            ScrollTarget::Bottom
        } else {
            ScrollTarget::DownViewport
        };
        let outcome = async {
            let driver = self.session.browser().driver().await?;
            driver.scroll(target).await
        };
        match outcome.await {
            Ok(()) => Ok(ToolResult::text(if to_bottom {
                "Scrolled to page bottom"
            } else {
                "Scrolled down one viewport"
            })),
            Err(e) => Ok(ToolResult::text(format!("Error scrolling down: {e}"))),
        }
    }
}

/// Execute JavaScript in the page.
pub struct BrowserConsoleExecTool {
    session: Arc<Session>,
}

impl BrowserConsoleExecTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserConsoleExecTool {
    fn name(&self) -> &str {
        "browser_console_exec"
    }

    fn description(&self) -> &str {
        "Execute JavaScript code in the browser console. Use when custom scripts need to be executed."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "javascript": {"type": "string", "description": "JavaScript code to execute in the browser console"}
            },
            "required": ["javascript"]
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let javascript = input
            .str_field("javascript")
            .or_else(|| input.as_text())
            .ok_or_else(|| Error::tool_failure("Missing javascript parameter"))?;
        let outcome = async {
            let driver = self.session.browser().driver().await?;
            driver.evaluate(&javascript).await
        };
        match outcome.await {
            Ok(result) => Ok(ToolResult::text(format!(
                "JavaScript executed successfully. Result: {result}"
            ))),
            Err(e) => Ok(ToolResult::text(format!("Error executing JavaScript: {e}"))),
        }
    }
}

/// View captured console logs.
pub struct BrowserConsoleViewTool {
    session: Arc<Session>,
}

impl BrowserConsoleViewTool {
    /// Bind to a session.
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Tool for BrowserConsoleViewTool {
    fn name(&self) -> &str {
        "browser_console_view"
    }

    fn description(&self) -> &str {
        "View the browser console output. Use when checking JavaScript logs or debugging page errors."
    }

    fn args_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "max_lines": {"type": "integer", "description": "(Optional) Maximum number of log lines to return"}
            }
        })
    }

    async fn call(&self, input: ToolInput) -> crate::error::Result<ToolResult> {
        let max_lines = input.u64_field("max_lines").unwrap_or(100) as usize;
        match self.session.browser().console_logs(max_lines).await {
            Ok(entries) => {
                if entries.is_empty() {
                    return Ok(ToolResult::text("No console logs available"));
                }
                let rendered: Vec<String> = entries
                    .iter()
                    .map(|e| format!("[{}] {}", e.level.to_uppercase(), e.message))
                    .collect();
                Ok(ToolResult::text(rendered.join("\n")))
            }
            Err(e) => Ok(ToolResult::text(format!("Error viewing console: {e}"))),
        }
    }
}

/// The complete browser toolkit bound to a session.
#[must_use]
pub fn browser_toolkit(session: &Arc<Session>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(BrowserViewTool::new(Arc::clone(session))),
        Arc::new(BrowserNavigateTool::new(Arc::clone(session))),
        Arc::new(BrowserRestartTool::new(Arc::clone(session))),
        Arc::new(BrowserClickTool::new(Arc::clone(session))),
        Arc::new(BrowserInputTool::new(Arc::clone(session))),
        Arc::new(BrowserMoveMouseTool::new(Arc::clone(session))),
        Arc::new(BrowserPressKeyTool::new(Arc::clone(session))),
        Arc::new(BrowserSelectOptionTool::new(Arc::clone(session))),
        Arc::new(BrowserScrollUpTool::new(Arc::clone(session))),
        Arc::new(BrowserScrollDownTool::new(Arc::clone(session))),
        Arc::new(BrowserConsoleExecTool::new(Arc::clone(session))),
        Arc::new(BrowserConsoleViewTool::new(Arc::clone(session))),
    ]
}
