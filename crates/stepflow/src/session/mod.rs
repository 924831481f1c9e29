// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Session registry and per-thread resource bundles.
//!
//! A session maps 1:1 to a thread id and owns that thread's live resources:
//! shell sessions, the browser instance and the vector store handle. The
//! registry is an explicitly constructed object injected into the graph -
//! never a process-wide singleton - so tests instantiate isolated
//! registries per case.
//!
//! Resource allocation is lazy: creating a session allocates nothing
//! external; the browser launches on first browser tool call and the
//! vector store opens (or is created empty) on first knowledge-base
//! access. Cleanup is best-effort per resource: a failing close never
//! blocks releasing the others, and the persisted vector store file is
//! deliberately left on disk.

pub mod browser;
pub mod shell;

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::embeddings::Embeddings;
use crate::error::Result;
use crate::session::browser::{BrowserLauncher, BrowserSession, ScreenshotParser};
use crate::session::shell::ShellManager;
use crate::vector_store::PersistentVectorStore;

/// Shared collaborators every session is built from.
pub struct SessionConfig {
    /// Directory holding per-thread vector store files.
    pub kb_root: PathBuf,
    /// Embedding function for the vector store.
    pub embeddings: Arc<dyn Embeddings>,
    /// Browser backend factory.
    pub browser_launcher: Arc<dyn BrowserLauncher>,
    /// Optional screenshot text-extraction collaborator.
    pub screenshot_parser: Option<Arc<dyn ScreenshotParser>>,
}

/// One thread's resource bundle.
pub struct Session {
    thread_id: String,
    config: Arc<SessionConfig>,
    shells: ShellManager,
    browser: BrowserSession,
    vector_store: OnceCell<Arc<PersistentVectorStore>>,
}

impl Session {
    fn new(thread_id: &str, config: Arc<SessionConfig>) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            shells: ShellManager::new(thread_id),
            browser: BrowserSession::new(Arc::clone(&config.browser_launcher)),
            config,
            vector_store: OnceCell::new(),
        }
    }

    /// The owning thread id.
    #[must_use]
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Shell sessions of this thread.
    #[must_use]
    pub fn shells(&self) -> &ShellManager {
        &self.shells
    }

    /// Browser of this thread (launches lazily on first driver use).
    #[must_use]
    pub fn browser(&self) -> &BrowserSession {
        &self.browser
    }

    /// Screenshot parser, when one is configured.
    #[must_use]
    pub fn screenshot_parser(&self) -> Option<&dyn ScreenshotParser> {
        self.config.screenshot_parser.as_deref()
    }

    /// Vector store of this thread, opened (or created empty) on first use.
    pub async fn vector_store(&self) -> Result<Arc<PersistentVectorStore>> {
        let store = self
            .vector_store
            .get_or_try_init(|| async {
                let path = self.config.kb_root.join(format!("{}.json", self.thread_id));
                let store =
                    PersistentVectorStore::open(path, Arc::clone(&self.config.embeddings)).await?;
                Ok::<_, crate::error::Error>(Arc::new(store))
            })
            .await?;
        Ok(Arc::clone(store))
    }

    /// Release this session's live resources.
    ///
    /// Kills still-running shell processes (tolerating already-dead ones)
    /// and closes the browser page -> context -> browser. The vector store
    /// file stays on disk: it is durable knowledge, independent of session
    /// liveness. Per-resource errors are swallowed so one failing close
    /// cannot block the others.
    pub async fn cleanup(&self) {
        debug!(thread_id = %self.thread_id, "cleaning up session");
        self.shells.kill_all().await;
        self.browser.close().await;
    }
}

/// Maps thread ids to live sessions.
pub struct SessionRegistry {
    config: Arc<SessionConfig>,
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    /// Create a registry; sessions are created lazily per thread id.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config: Arc::new(config),
            sessions: DashMap::new(),
        }
    }

    /// Get the session for a thread id, creating it on first access.
    pub fn session(&self, thread_id: &str) -> Arc<Session> {
        Arc::clone(
            self.sessions
                .entry(thread_id.to_string())
                .or_insert_with(|| {
                    info!(thread_id, "creating session");
                    Arc::new(Session::new(thread_id, Arc::clone(&self.config)))
                })
                .value(),
        )
    }

    /// Whether a session currently exists for the thread id.
    #[must_use]
    pub fn contains(&self, thread_id: &str) -> bool {
        self.sessions.contains_key(thread_id)
    }

    /// Release and forget a thread's session.
    ///
    /// Idempotent: clearing an unknown thread id is a no-op.
    pub async fn clear_session(&self, thread_id: &str) {
        if let Some((_, session)) = self.sessions.remove(thread_id) {
            session.cleanup().await;
            info!(thread_id, "cleared session");
        }
    }

    /// Release every session.
    pub async fn clear_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for thread_id in ids {
            self.clear_session(&thread_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockEmbeddings, NullBrowserLauncher};

    fn registry(dir: &tempfile::TempDir) -> SessionRegistry {
        SessionRegistry::new(SessionConfig {
            kb_root: dir.path().to_path_buf(),
            embeddings: Arc::new(MockEmbeddings::new(8)),
            browser_launcher: Arc::new(NullBrowserLauncher::default()),
            screenshot_parser: None,
        })
    }

    #[tokio::test]
    async fn test_session_created_on_miss_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        assert!(!registry.contains("t1"));

        let first = registry.session("t1");
        let second = registry.session("t1");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.contains("t1"));
    }

    #[tokio::test]
    async fn test_sessions_are_isolated_by_thread() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let a = registry.session("thread-a");
        let b = registry.session("thread-b");

        a.shells().exec("main", "/tmp", "echo A").await.unwrap();
        b.shells().exec("main", "/tmp", "echo B").await.unwrap();

        let a_view = match a.shells().wait("main", Some(10)).await.unwrap() {
            shell::WaitOutcome::Completed { output, .. } => output,
            shell::WaitOutcome::TimedOut { .. } => panic!("echo should finish"),
        };
        assert!(a_view.contains('A') && !a_view.contains('B'));

        // Thread B's shell "main" is a different resource entirely.
        let b_view = match b.shells().wait("main", Some(10)).await.unwrap() {
            shell::WaitOutcome::Completed { output, .. } => output,
            shell::WaitOutcome::TimedOut { .. } => panic!("echo should finish"),
        };
        assert!(b_view.contains('B') && !b_view.contains('A'));
    }

    #[tokio::test]
    async fn test_clear_session_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        registry.session("t1");
        registry.clear_session("t1").await;
        assert!(!registry.contains("t1"));
        // Second clear (and clearing a never-created id) is a no-op.
        registry.clear_session("t1").await;
        registry.clear_session("never-existed").await;
    }

    #[tokio::test]
    async fn test_clear_session_kills_shells() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let session = registry.session("t1");
        session
            .shells()
            .exec("main", "/tmp", "sleep 30")
            .await
            .unwrap();
        assert_eq!(session.shells().running_ids(), vec!["main".to_string()]);

        registry.clear_session("t1").await;
        assert!(session.shells().running_ids().is_empty());
    }

    #[tokio::test]
    async fn test_vector_store_file_survives_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let session = registry.session("t1");
        let store = session.vector_store().await.unwrap();
        store
            .add_documents(&["remember me".to_string()], None)
            .await
            .unwrap();
        let path = store.path().to_path_buf();
        assert!(path.exists());

        registry.clear_session("t1").await;
        assert!(path.exists(), "vector store file must survive cleanup");

        // A fresh session for the same thread sees the persisted knowledge.
        let session = registry.session("t1");
        let store = session.vector_store().await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_clear_all() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        registry.session("t1");
        registry.session("t2");
        registry.clear_all().await;
        assert!(!registry.contains("t1"));
        assert!(!registry.contains("t2"));
    }
}
