//! Integration tests for warden-session
//!
//! Covers the file-backed store lifecycle:
//! - Append and ordered listing
//! - Reload from disk in a fresh store
//! - Session id sanitisation
//! - Listing sessions
//! - Archive keeps history and never deletes it
//! - Corrupt files surface as errors and are never overwritten

use serde_json::json;
use tempfile::TempDir;
use warden_provider::{Message, Role, ToolCall, ToolResult};
use warden_session::{FileMessageStore, MemoryMessageStore, MessageStore, StoreError};

fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

// ============================================================================
// FileMessageStore Tests
// ============================================================================

#[tokio::test]
async fn test_append_preserves_order() {
    let dir = temp_dir();
    let store = FileMessageStore::new(dir.path());

    store
        .append_message("s1", &Message::user("first"))
        .await
        .unwrap();
    store
        .append_message("s1", &Message::assistant("second"))
        .await
        .unwrap();
    store
        .append_message("s1", &Message::user("third"))
        .await
        .unwrap();

    let messages = store.list_messages("s1").await.unwrap();
    let texts: Vec<_> = messages.iter().map(|m| m.text()).collect();
    assert_eq!(texts, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_unknown_session_is_empty() {
    let dir = temp_dir();
    let store = FileMessageStore::new(dir.path());
    assert!(store.list_messages("nope").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reload_in_new_store() {
    let dir = temp_dir();
    let call = ToolCall::new("c1", "exec", json!({"command": "ls"}));
    {
        let store = FileMessageStore::new(dir.path());
        store
            .append_message("cli:default", &Message::user("list"))
            .await
            .unwrap();
        store
            .append_message(
                "cli:default",
                &Message::assistant_turn("", "", vec![call.clone()]),
            )
            .await
            .unwrap();
        store
            .append_message(
                "cli:default",
                &Message::tool_results(vec![ToolResult::success(&call, "a.txt")]),
            )
            .await
            .unwrap();
    }

    assert!(dir.path().join("cli_default.json").exists());

    let store = FileMessageStore::new(dir.path());
    let messages = store.list_messages("cli:default").await.unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].tool_calls().next(), Some(&call));
    assert_eq!(messages[2].role, Role::Tool);
}

#[tokio::test]
async fn test_no_temp_files_left_behind() {
    let dir = temp_dir();
    let store = FileMessageStore::new(dir.path());
    store
        .append_message("s1", &Message::user("x"))
        .await
        .unwrap();

    let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        let name = entry.file_name().to_string_lossy().to_string();
        assert!(!name.ends_with(".tmp"), "leftover temp file {}", name);
    }
}

#[tokio::test]
async fn test_list_sessions_returns_original_ids() {
    let dir = temp_dir();
    let store = FileMessageStore::new(dir.path());
    store
        .append_message("cli:b", &Message::user("x"))
        .await
        .unwrap();
    store
        .append_message("cli:a", &Message::user("y"))
        .await
        .unwrap();

    let ids = store.list_sessions().await.unwrap();
    assert_eq!(ids, vec!["cli:a".to_string(), "cli:b".to_string()]);
}

#[tokio::test]
async fn test_archive_moves_and_keeps_history() {
    let dir = temp_dir();
    let store = FileMessageStore::new(dir.path());
    store
        .append_message("s1", &Message::user("keep me"))
        .await
        .unwrap();

    store.archive("s1").await.unwrap();

    assert!(!dir.path().join("s1.json").exists());
    let archived = dir.path().join("archive").join("s1.json");
    assert!(archived.exists());
    let content = tokio::fs::read_to_string(&archived).await.unwrap();
    assert!(content.contains("keep me"));
    assert!(content.contains("\"archived\": true"));

    assert!(store.list_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_archive_unknown_session_fails() {
    let dir = temp_dir();
    let store = FileMessageStore::new(dir.path());
    let result = store.archive("ghost").await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_corrupt_file_is_reported_and_preserved() {
    let dir = temp_dir();
    let path = dir.path().join("bad.json");
    tokio::fs::write(&path, "{ nope").await.unwrap();

    let store = FileMessageStore::new(dir.path());
    let listed = store.list_messages("bad").await;
    assert!(matches!(listed, Err(StoreError::Corrupt { .. })));

    let appended = store.append_message("bad", &Message::user("hello")).await;
    assert!(matches!(appended, Err(StoreError::Corrupt { .. })));
    assert!(matches!(store.archive("bad").await, Err(StoreError::Corrupt { .. })));

    // Never overwritten
    assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "{ nope");
    assert!(store.list_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_persist_leaves_cache_unchanged() {
    let dir = temp_dir();
    let store = FileMessageStore::new(dir.path());
    store
        .append_message("s1", &Message::user("kept"))
        .await
        .unwrap();

    // A directory where the temp file goes makes the write fail
    tokio::fs::create_dir(dir.path().join("s1.json.tmp"))
        .await
        .unwrap();
    let result = store.append_message("s1", &Message::user("lost")).await;
    assert!(matches!(result, Err(StoreError::Io(_))));

    let texts: Vec<_> = store
        .list_messages("s1")
        .await
        .unwrap()
        .iter()
        .map(|m| m.text())
        .collect();
    assert_eq!(texts, vec!["kept"]);

    let reloaded = FileMessageStore::new(dir.path());
    assert_eq!(reloaded.list_messages("s1").await.unwrap().len(), 1);
}

// ============================================================================
// MemoryMessageStore Tests
// ============================================================================

#[tokio::test]
async fn test_memory_store_roundtrip() {
    let store = MemoryMessageStore::new();
    store
        .append_message("a", &Message::user("one"))
        .await
        .unwrap();
    store
        .append_message("b", &Message::user("two"))
        .await
        .unwrap();

    assert_eq!(store.list_messages("a").await.unwrap().len(), 1);
    assert_eq!(
        store.list_sessions().await.unwrap(),
        vec!["a".to_string(), "b".to_string()]
    );
}
