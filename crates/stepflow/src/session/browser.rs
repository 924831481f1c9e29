// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Browser session.
//!
//! The live browser is an external collaborator reached through the
//! [`BrowserDriver`] trait; this module owns everything around it: lazy
//! startup through a [`BrowserLauncher`], restart, ordered teardown
//! (page -> context -> browser, tolerating partially closed resources) and
//! the bounded console-log ring buffer.
//!
//! Element targeting is index-based and the index space is re-queried from
//! the DOM on every call: an index captured before a page mutation may
//! address a different element afterwards. Callers are expected to
//! re-enumerate right before acting; a stale index surfaces as a textual
//! tool failure, never a crash.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;

/// Bound on retained console entries; oldest entries are evicted first.
pub const CONSOLE_BUFFER_CAPACITY: usize = 1000;

/// How long to wait for the network to go idle after actions that may
/// trigger navigation. Expiry is a non-fatal "no navigation occurred".
pub const NETWORK_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Element classes addressable by index.
///
/// Mirrors the selector groups the view exposes to the model: things you
/// can click, things you can type into, and dropdowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// Links, buttons, submit inputs, elements with click handlers.
    Clickable,
    /// Text inputs, textareas, contenteditable regions.
    Input,
    /// `<select>` dropdowns.
    Select,
}

impl ElementKind {
    /// CSS selector enumerating this element class.
    #[must_use]
    pub fn selector(&self) -> &'static str {
        match self {
            ElementKind::Clickable => {
                "a, button, input[type='submit'], input[type='button'], div[role='button'], [onclick]"
            }
            ElementKind::Input => {
                "input:not([type='submit']):not([type='button']), textarea, [contenteditable='true']"
            }
            ElementKind::Select => "select",
        }
    }
}

/// One captured console message.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConsoleEntry {
    /// Log level ("log", "warning", "error", "info").
    pub level: String,
    /// Message text.
    pub message: String,
}

/// Scroll destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollTarget {
    /// One viewport up.
    UpViewport,
    /// One viewport down.
    DownViewport,
    /// Directly to the top of the page.
    Top,
    /// Directly to the bottom of the page.
    Bottom,
}

/// Driver for one live browser page.
///
/// Implementations wrap an actual automation backend. Every method acts on
/// the driver's current page.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Navigate to a URL.
    async fn goto(&self, url: &str) -> Result<()>;

    /// Count elements of the given class on the current page.
    async fn element_count(&self, kind: ElementKind) -> Result<usize>;

    /// Click the `index`-th element of the given class.
    async fn click_element(&self, kind: ElementKind, index: usize) -> Result<()>;

    /// Click at page coordinates.
    async fn click_at(&self, x: f64, y: f64) -> Result<()>;

    /// Overwrite the text of the `index`-th input-capable element.
    async fn fill_element(&self, index: usize, text: &str) -> Result<()>;

    /// Type text at the current focus.
    async fn type_text(&self, text: &str) -> Result<()>;

    /// Move the cursor to page coordinates.
    async fn move_mouse(&self, x: f64, y: f64) -> Result<()>;

    /// Press a key or key combination ("Enter", "Control+a").
    async fn press_key(&self, key: &str) -> Result<()>;

    /// Select the `option`-th option of the `index`-th dropdown.
    async fn select_option(&self, index: usize, option: usize) -> Result<()>;

    /// Scroll the page.
    async fn scroll(&self, target: ScrollTarget) -> Result<()>;

    /// Evaluate JavaScript on the page, returning its JSON result.
    async fn evaluate(&self, javascript: &str) -> Result<serde_json::Value>;

    /// PNG screenshot of the current page.
    async fn screenshot(&self) -> Result<Vec<u8>>;

    /// Drain console messages captured since the last drain.
    async fn drain_console(&self) -> Result<Vec<ConsoleEntry>>;

    /// Wait until network activity settles, bounded by `timeout`.
    ///
    /// Returns `Ok(false)` when the timeout fires first - a non-fatal
    /// "no navigation occurred" signal, not an error.
    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<bool>;

    /// Close the current page.
    async fn close_page(&self) -> Result<()>;

    /// Close the browsing context.
    async fn close_context(&self) -> Result<()>;

    /// Close the browser process.
    async fn close_browser(&self) -> Result<()>;
}

/// Factory producing a fresh [`BrowserDriver`].
///
/// Injected into the session so tests and hosts choose the backend.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Start a browser and return a driver for its initial page.
    async fn launch(&self) -> Result<Arc<dyn BrowserDriver>>;
}

/// Best-effort structured-text extraction from a screenshot.
///
/// External collaborator (an OCR/vision service). Parse failure degrades
/// the view to image-only output; it never fails the whole call.
#[async_trait]
pub trait ScreenshotParser: Send + Sync {
    /// Extract structured text from PNG bytes.
    async fn parse(&self, png: &[u8]) -> Result<String>;
}

/// Result of a browser view: the raw screenshot plus whatever the parser
/// could extract.
#[derive(Debug, Clone)]
pub struct BrowserViewResult {
    /// PNG screenshot bytes.
    pub screenshot: Vec<u8>,
    /// Parsed text, absent when no parser is configured or parsing failed.
    pub parsed_text: Option<String>,
}

/// Lazy singleton browser (plus current page) for one session.
pub struct BrowserSession {
    launcher: Arc<dyn BrowserLauncher>,
    driver: tokio::sync::Mutex<Option<Arc<dyn BrowserDriver>>>,
    console: Mutex<VecDeque<ConsoleEntry>>,
}

impl BrowserSession {
    /// Create a session that will launch on first use.
    pub fn new(launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            launcher,
            driver: tokio::sync::Mutex::new(None),
            console: Mutex::new(VecDeque::new()),
        }
    }

    /// Get the live driver, launching the browser on first call.
    pub async fn driver(&self) -> Result<Arc<dyn BrowserDriver>> {
        let mut slot = self.driver.lock().await;
        if let Some(driver) = slot.as_ref() {
            return Ok(Arc::clone(driver));
        }
        debug!("launching browser");
        let driver = self.launcher.launch().await?;
        *slot = Some(Arc::clone(&driver));
        Ok(driver)
    }

    /// Whether a browser is currently open.
    pub async fn is_open(&self) -> bool {
        self.driver.lock().await.is_some()
    }

    /// Tear the browser down and launch a fresh one.
    pub async fn restart(&self) -> Result<Arc<dyn BrowserDriver>> {
        self.close().await;
        self.driver().await
    }

    /// Close page, then context, then browser.
    ///
    /// Each stage tolerates an already-closed resource: a failing close is
    /// logged and the remaining stages still run.
    pub async fn close(&self) {
        let driver = self.driver.lock().await.take();
        let Some(driver) = driver else {
            return;
        };
        if let Err(e) = driver.close_page().await {
            warn!("error closing page: {e}");
        }
        if let Err(e) = driver.close_context().await {
            warn!("error closing context: {e}");
        }
        if let Err(e) = driver.close_browser().await {
            warn!("error closing browser: {e}");
        }
        self.console.lock().clear();
    }

    /// Navigate and wait (bounded) for the network to settle.
    pub async fn navigate(&self, url: &str) -> Result<()> {
        let driver = self.driver().await?;
        driver.goto(url).await?;
        // Timeout here is tolerated: some pages never go fully idle.
        let _ = driver.wait_for_network_idle(NETWORK_IDLE_TIMEOUT).await?;
        Ok(())
    }

    /// After an action that may trigger navigation, wait (bounded) for the
    /// network to settle, treating timeout as "no navigation occurred".
    pub async fn settle(&self) -> Result<()> {
        let driver = self.driver().await?;
        let _ = driver.wait_for_network_idle(NETWORK_IDLE_TIMEOUT).await?;
        Ok(())
    }

    /// Pull new console entries from the driver into the ring buffer and
    /// return the most recent `max_lines`.
    pub async fn console_logs(&self, max_lines: usize) -> Result<Vec<ConsoleEntry>> {
        let driver = self.driver().await?;
        let fresh = driver.drain_console().await?;
        let mut buffer = self.console.lock();
        for entry in fresh {
            if buffer.len() == CONSOLE_BUFFER_CAPACITY {
                buffer.pop_front();
            }
            buffer.push_back(entry);
        }
        let start = buffer.len().saturating_sub(max_lines);
        Ok(buffer.iter().skip(start).cloned().collect())
    }

    /// Screenshot the page and run the (optional) parser over it.
    ///
    /// Parser failure degrades to image-only output.
    pub async fn view(&self, parser: Option<&dyn ScreenshotParser>) -> Result<BrowserViewResult> {
        let driver = self.driver().await?;
        let screenshot = driver.screenshot().await?;
        let parsed_text = match parser {
            Some(parser) => match parser.parse(&screenshot).await {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!("screenshot parse failed, returning image only: {e}");
                    None
                }
            },
            None => None,
        };
        Ok(BrowserViewResult {
            screenshot,
            parsed_text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Driver that records calls and can be scripted to fail closes.
    struct RecordingDriver {
        closes: Mutex<Vec<&'static str>>,
        fail_page_close: bool,
        console_batches: Mutex<Vec<Vec<ConsoleEntry>>>,
    }

    impl RecordingDriver {
        fn new(fail_page_close: bool) -> Self {
            Self {
                closes: Mutex::new(Vec::new()),
                fail_page_close,
                console_batches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BrowserDriver for RecordingDriver {
        async fn goto(&self, _url: &str) -> Result<()> {
            Ok(())
        }
        async fn element_count(&self, _kind: ElementKind) -> Result<usize> {
            Ok(0)
        }
        async fn click_element(&self, _kind: ElementKind, _index: usize) -> Result<()> {
            Ok(())
        }
        async fn click_at(&self, _x: f64, _y: f64) -> Result<()> {
            Ok(())
        }
        async fn fill_element(&self, _index: usize, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn type_text(&self, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn move_mouse(&self, _x: f64, _y: f64) -> Result<()> {
            Ok(())
        }
        async fn press_key(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn select_option(&self, _index: usize, _option: usize) -> Result<()> {
            Ok(())
        }
        async fn scroll(&self, _target: ScrollTarget) -> Result<()> {
            Ok(())
        }
        async fn evaluate(&self, _javascript: &str) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
        async fn screenshot(&self) -> Result<Vec<u8>> {
            Ok(vec![137, 80, 78, 71])
        }
        async fn drain_console(&self) -> Result<Vec<ConsoleEntry>> {
            Ok(self.console_batches.lock().pop().unwrap_or_default())
        }
        async fn wait_for_network_idle(&self, _timeout: Duration) -> Result<bool> {
            Ok(true)
        }
        async fn close_page(&self) -> Result<()> {
            self.closes.lock().push("page");
            if self.fail_page_close {
                return Err(Error::tool_failure("page already closed"));
            }
            Ok(())
        }
        async fn close_context(&self) -> Result<()> {
            self.closes.lock().push("context");
            Ok(())
        }
        async fn close_browser(&self) -> Result<()> {
            self.closes.lock().push("browser");
            Ok(())
        }
    }

    struct TestLauncher {
        launches: AtomicUsize,
        fail_page_close: bool,
        last: Mutex<Option<Arc<RecordingDriver>>>,
    }

    impl TestLauncher {
        fn new(fail_page_close: bool) -> Self {
            Self {
                launches: AtomicUsize::new(0),
                fail_page_close,
                last: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl BrowserLauncher for TestLauncher {
        async fn launch(&self) -> Result<Arc<dyn BrowserDriver>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let driver = Arc::new(RecordingDriver::new(self.fail_page_close));
            *self.last.lock() = Some(Arc::clone(&driver));
            Ok(driver)
        }
    }

    #[tokio::test]
    async fn test_lazy_launch_happens_once() {
        let launcher = Arc::new(TestLauncher::new(false));
        let session = BrowserSession::new(Arc::clone(&launcher) as Arc<dyn BrowserLauncher>);
        assert!(!session.is_open().await);

        session.driver().await.unwrap();
        session.driver().await.unwrap();
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert!(session.is_open().await);
    }

    #[tokio::test]
    async fn test_close_order_page_context_browser() {
        let launcher = Arc::new(TestLauncher::new(false));
        let session = BrowserSession::new(Arc::clone(&launcher) as Arc<dyn BrowserLauncher>);
        session.driver().await.unwrap();
        session.close().await;

        let driver = launcher.last.lock().clone().unwrap();
        assert_eq!(*driver.closes.lock(), vec!["page", "context", "browser"]);
        assert!(!session.is_open().await);
    }

    #[tokio::test]
    async fn test_close_tolerates_failing_stage() {
        let launcher = Arc::new(TestLauncher::new(true));
        let session = BrowserSession::new(Arc::clone(&launcher) as Arc<dyn BrowserLauncher>);
        session.driver().await.unwrap();
        session.close().await;

        // Page close failed, but context and browser were still closed.
        let driver = launcher.last.lock().clone().unwrap();
        assert_eq!(*driver.closes.lock(), vec!["page", "context", "browser"]);
    }

    #[tokio::test]
    async fn test_restart_replaces_driver() {
        let launcher = Arc::new(TestLauncher::new(false));
        let session = BrowserSession::new(Arc::clone(&launcher) as Arc<dyn BrowserLauncher>);
        session.driver().await.unwrap();
        session.restart().await.unwrap();
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert!(session.is_open().await);
    }

    #[tokio::test]
    async fn test_close_without_open_browser_is_noop() {
        let launcher = Arc::new(TestLauncher::new(false));
        let session = BrowserSession::new(launcher as Arc<dyn BrowserLauncher>);
        session.close().await;
        assert!(!session.is_open().await);
    }

    #[tokio::test]
    async fn test_console_ring_buffer_evicts_oldest() {
        let launcher = Arc::new(TestLauncher::new(false));
        let session = BrowserSession::new(Arc::clone(&launcher) as Arc<dyn BrowserLauncher>);
        session.driver().await.unwrap();

        let driver = launcher.last.lock().clone().unwrap();
        let batch: Vec<ConsoleEntry> = (0..CONSOLE_BUFFER_CAPACITY + 10)
            .map(|n| ConsoleEntry {
                level: "log".to_string(),
                message: format!("line {n}"),
            })
            .collect();
        driver.console_batches.lock().push(batch);

        let logs = session.console_logs(usize::MAX).await.unwrap();
        assert_eq!(logs.len(), CONSOLE_BUFFER_CAPACITY);
        // Oldest ten were evicted.
        assert_eq!(logs[0].message, "line 10");
    }

    #[tokio::test]
    async fn test_console_logs_returns_most_recent() {
        let launcher = Arc::new(TestLauncher::new(false));
        let session = BrowserSession::new(Arc::clone(&launcher) as Arc<dyn BrowserLauncher>);
        session.driver().await.unwrap();

        let driver = launcher.last.lock().clone().unwrap();
        driver.console_batches.lock().push(vec![
            ConsoleEntry {
                level: "log".to_string(),
                message: "first".to_string(),
            },
            ConsoleEntry {
                level: "error".to_string(),
                message: "second".to_string(),
            },
        ]);

        let logs = session.console_logs(1).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "second");
    }

    #[tokio::test]
    async fn test_view_degrades_without_parser() {
        let launcher = Arc::new(TestLauncher::new(false));
        let session = BrowserSession::new(launcher as Arc<dyn BrowserLauncher>);
        let view = session.view(None).await.unwrap();
        assert!(!view.screenshot.is_empty());
        assert!(view.parsed_text.is_none());
    }

    struct FailingParser;

    #[async_trait]
    impl ScreenshotParser for FailingParser {
        async fn parse(&self, _png: &[u8]) -> Result<String> {
            Err(Error::tool_failure("parser offline"))
        }
    }

    #[tokio::test]
    async fn test_view_degrades_on_parser_failure() {
        let launcher = Arc::new(TestLauncher::new(false));
        let session = BrowserSession::new(launcher as Arc<dyn BrowserLauncher>);
        let view = session.view(Some(&FailingParser)).await.unwrap();
        assert!(!view.screenshot.is_empty());
        assert!(view.parsed_text.is_none(), "parse failure is non-fatal");
    }

    #[test]
    fn test_element_kind_selectors() {
        assert!(ElementKind::Clickable.selector().contains("button"));
        assert!(ElementKind::Input.selector().contains("textarea"));
        assert_eq!(ElementKind::Select.selector(), "select");
    }
}
