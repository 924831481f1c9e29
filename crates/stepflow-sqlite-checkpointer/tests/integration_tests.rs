//! Integration tests for the SQLite checkpointer.
//!
//! Exercises the full trait contract against a real database file:
//! upsert semantics, ordering, filtering, write idempotence, pending-sends
//! reconstruction and durability across reopen.

use serde_json::json;
use std::collections::HashMap;
use stepflow::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSerde, CheckpointSource,
    Checkpointer, ListOptions, PENDING_SENDS_CHANNEL,
};
use stepflow::error::Error;
use stepflow_sqlite_checkpointer::SqliteCheckpointer;

fn config(thread: &str) -> CheckpointConfig {
    CheckpointConfig::new(thread)
}

fn metadata(step: i64) -> CheckpointMetadata {
    CheckpointMetadata {
        step,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_put_then_get_latest() {
    let store = SqliteCheckpointer::in_memory().unwrap();
    let checkpoint = Checkpoint::new(json!({"plan": ["step"]}));
    let id = checkpoint.id.clone();

    let updated = store
        .put(&config("t1"), checkpoint, metadata(0))
        .await
        .unwrap();
    assert_eq!(updated.checkpoint_id.as_deref(), Some(id.as_str()));

    let tuple = store.get_tuple(&config("t1")).await.unwrap().unwrap();
    assert_eq!(tuple.checkpoint.id, id);
    assert_eq!(tuple.checkpoint.state, json!({"plan": ["step"]}));
    assert!(tuple.parent_config.is_none());
}

#[tokio::test]
async fn test_put_same_id_overwrites_not_duplicates() {
    let store = SqliteCheckpointer::in_memory().unwrap();
    let mut checkpoint = Checkpoint::new(json!({"v": 1}));
    store
        .put(&config("t1"), checkpoint.clone(), metadata(0))
        .await
        .unwrap();

    checkpoint.state = json!({"v": 2});
    store
        .put(&config("t1"), checkpoint, metadata(0))
        .await
        .unwrap();

    let listed = store
        .list("t1", Some(""), ListOptions::default())
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].checkpoint.state, json!({"v": 2}));
}

#[tokio::test]
async fn test_parent_chain_and_get_by_id() {
    let store = SqliteCheckpointer::in_memory().unwrap();
    let first = Checkpoint::new(json!({"n": 1}));
    let first_id = first.id.clone();
    let after_first = store.put(&config("t1"), first, metadata(0)).await.unwrap();
    store
        .put(&after_first, Checkpoint::new(json!({"n": 2})), metadata(1))
        .await
        .unwrap();

    let latest = store.get_tuple(&config("t1")).await.unwrap().unwrap();
    assert_eq!(latest.checkpoint.state, json!({"n": 2}));
    assert_eq!(
        latest
            .parent_config
            .as_ref()
            .and_then(|c| c.checkpoint_id.as_deref()),
        Some(first_id.as_str())
    );

    let first_again = store
        .get_tuple(&config("t1").with_checkpoint_id(first_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first_again.checkpoint.state, json!({"n": 1}));
}

#[tokio::test]
async fn test_get_missing_is_none() {
    let store = SqliteCheckpointer::in_memory().unwrap();
    assert!(store.get_tuple(&config("ghost")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_put_without_thread_id_is_missing_configuration() {
    let store = SqliteCheckpointer::in_memory().unwrap();
    let bad = CheckpointConfig {
        thread_id: String::new(),
        checkpoint_ns: String::new(),
        checkpoint_id: None,
    };
    let err = store
        .put(&bad, Checkpoint::new(json!({})), metadata(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingConfiguration { .. }));
}

#[tokio::test]
async fn test_list_ordering_before_and_limit() {
    let store = SqliteCheckpointer::in_memory().unwrap();
    let mut cfg = config("t1");
    let mut ids = Vec::new();
    for n in 0..5 {
        let checkpoint = Checkpoint::new(json!({"n": n}));
        ids.push(checkpoint.id.clone());
        cfg = store.put(&cfg, checkpoint, metadata(n)).await.unwrap();
    }

    let all = store
        .list("t1", Some(""), ListOptions::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 5);
    assert_eq!(all[0].checkpoint.id, ids[4], "most recent first");
    assert_eq!(all[4].checkpoint.id, ids[0]);

    let bounded = store
        .list(
            "t1",
            Some(""),
            ListOptions::default().with_before(ids[3].clone()).with_limit(2),
        )
        .await
        .unwrap();
    assert_eq!(bounded.len(), 2);
    assert!(bounded.iter().all(|t| t.checkpoint.id < ids[3]));
    assert_eq!(bounded[0].checkpoint.id, ids[2]);
}

#[tokio::test]
async fn test_list_metadata_filter_allow_list() {
    let store = SqliteCheckpointer::in_memory().unwrap();
    let mut cfg = config("t1");
    for n in 0..3 {
        let meta = CheckpointMetadata {
            source: if n == 0 {
                CheckpointSource::Input
            } else {
                CheckpointSource::Loop
            },
            step: n,
            ..Default::default()
        };
        cfg = store
            .put(&cfg, Checkpoint::new(json!({"n": n})), meta)
            .await
            .unwrap();
    }

    let mut filter = HashMap::new();
    filter.insert("source".to_string(), json!("input"));
    let inputs = store
        .list("t1", Some(""), ListOptions::default().with_filter(filter))
        .await
        .unwrap();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].metadata.step, 0);

    // Unknown filter keys are ignored, not errors.
    let mut unknown = HashMap::new();
    unknown.insert("color".to_string(), json!("green"));
    let all = store
        .list("t1", Some(""), ListOptions::default().with_filter(unknown))
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_put_writes_replace_and_extend() {
    let store = SqliteCheckpointer::in_memory().unwrap();
    let cfg = store
        .put(&config("t1"), Checkpoint::new(json!({})), metadata(0))
        .await
        .unwrap();

    store
        .put_writes(&cfg, &[("messages".to_string(), json!("first"))], "task-a")
        .await
        .unwrap();
    // Same (task, idx) replaces.
    store
        .put_writes(&cfg, &[("messages".to_string(), json!("second"))], "task-a")
        .await
        .unwrap();
    let tuple = store.get_tuple(&cfg).await.unwrap().unwrap();
    assert_eq!(tuple.pending_writes.len(), 1);
    assert_eq!(tuple.pending_writes[0].value, json!("second"));

    // A longer batch for the same task extends without disturbing idx 0.
    store
        .put_writes(
            &cfg,
            &[
                ("messages".to_string(), json!("second")),
                ("sources".to_string(), json!(["s1"])),
                ("extra".to_string(), json!(3)),
            ],
            "task-a",
        )
        .await
        .unwrap();
    let tuple = store.get_tuple(&cfg).await.unwrap().unwrap();
    assert_eq!(tuple.pending_writes.len(), 3);
    assert_eq!(tuple.pending_writes[0].value, json!("second"));
    assert_eq!(tuple.pending_writes[1].channel, "sources");
    assert_eq!(tuple.pending_writes[2].idx, 2);
}

#[tokio::test]
async fn test_put_writes_requires_checkpoint_id() {
    let store = SqliteCheckpointer::in_memory().unwrap();
    let err = store
        .put_writes(&config("t1"), &[("c".to_string(), json!(1))], "task")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::MissingConfiguration {
            field: "checkpoint_id"
        }
    ));
}

#[tokio::test]
async fn test_pending_sends_come_from_parent_writes() {
    let store = SqliteCheckpointer::in_memory().unwrap();
    let first_cfg = store
        .put(&config("t1"), Checkpoint::new(json!({"n": 1})), metadata(0))
        .await
        .unwrap();
    store
        .put_writes(
            &first_cfg,
            &[
                (PENDING_SENDS_CHANNEL.to_string(), json!("carried")),
                ("messages".to_string(), json!("ordinary write")),
            ],
            "supervisor",
        )
        .await
        .unwrap();

    store
        .put(&first_cfg, Checkpoint::new(json!({"n": 2})), metadata(1))
        .await
        .unwrap();

    let child = store.get_tuple(&config("t1")).await.unwrap().unwrap();
    // Only the reserved channel is surfaced as pending sends.
    assert_eq!(child.checkpoint.pending_sends, vec![json!("carried")]);
    // The parent's own tuple still lists both as pending writes.
    let parent = store.get_tuple(&first_cfg).await.unwrap().unwrap();
    assert_eq!(parent.pending_writes.len(), 2);
    assert!(parent.checkpoint.pending_sends.is_empty());
}

#[tokio::test]
async fn test_namespaces_are_independent_chains() {
    let store = SqliteCheckpointer::in_memory().unwrap();
    store
        .put(&config("t1"), Checkpoint::new(json!({"ns": "root"})), metadata(0))
        .await
        .unwrap();
    store
        .put(
            &config("t1").with_namespace("sub"),
            Checkpoint::new(json!({"ns": "sub"})),
            metadata(0),
        )
        .await
        .unwrap();

    let root = store.get_tuple(&config("t1")).await.unwrap().unwrap();
    assert_eq!(root.checkpoint.state["ns"], "root");
    let sub = store
        .get_tuple(&config("t1").with_namespace("sub"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.checkpoint.state["ns"], "sub");

    // No-namespace listing spans both chains.
    let all = store.list("t1", None, ListOptions::default()).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_threads_are_isolated() {
    let store = SqliteCheckpointer::in_memory().unwrap();
    store
        .put(&config("t1"), Checkpoint::new(json!({"who": "t1"})), metadata(0))
        .await
        .unwrap();
    store
        .put(&config("t2"), Checkpoint::new(json!({"who": "t2"})), metadata(0))
        .await
        .unwrap();

    let t1 = store.get_tuple(&config("t1")).await.unwrap().unwrap();
    assert_eq!(t1.checkpoint.state["who"], "t1");
    assert_eq!(
        store
            .list("t1", Some(""), ListOptions::default())
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_durability_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.sqlite");

    let checkpoint_id = {
        let store = SqliteCheckpointer::open(&path).await.unwrap();
        let checkpoint = Checkpoint::new(json!({"durable": true}));
        let id = checkpoint.id.clone();
        let cfg = store
            .put(&config("t1"), checkpoint, metadata(0))
            .await
            .unwrap();
        store
            .put_writes(&cfg, &[("messages".to_string(), json!("kept"))], "worker")
            .await
            .unwrap();
        id
    };

    let reopened = SqliteCheckpointer::open(&path).await.unwrap();
    let tuple = reopened.get_tuple(&config("t1")).await.unwrap().unwrap();
    assert_eq!(tuple.checkpoint.id, checkpoint_id);
    assert_eq!(tuple.checkpoint.state, json!({"durable": true}));
    assert_eq!(tuple.pending_writes.len(), 1);
    assert_eq!(tuple.pending_writes[0].value, json!("kept"));
}

/// A serde whose tag depends on the payload shape, to prove a mismatch is
/// rejected before storage.
struct SplitBrainSerde;

impl CheckpointSerde for SplitBrainSerde {
    fn dumps(&self, value: &serde_json::Value) -> stepflow::error::Result<(String, Vec<u8>)> {
        let tag = if value.get("source").is_some() {
            "msgpack"
        } else {
            "json"
        };
        Ok((tag.to_string(), serde_json::to_vec(value)?))
    }

    fn loads(&self, _tag: &str, payload: &[u8]) -> stepflow::error::Result<serde_json::Value> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[tokio::test]
async fn test_tag_mismatch_rejected_before_storage() {
    let store = SqliteCheckpointer::in_memory()
        .unwrap()
        .with_serde(std::sync::Arc::new(SplitBrainSerde));

    let err = store
        .put(&config("t1"), Checkpoint::new(json!({})), metadata(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SerializationMismatch { .. }));

    // Nothing was persisted.
    let listed = store
        .list("t1", Some(""), ListOptions::default())
        .await
        .unwrap();
    assert!(listed.is_empty());
}
