//! Tests for the coordinator run loop

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use common::*;
use warden_agent::{AgentError, ExecutionState, SessionAgentCall, StopReason};
use warden_provider::{ContentPart, Message, ProviderError, Role, ToolCall, ToolResult, ToolStatus};
use warden_session::{FileMessageStore, MessageStore, StoreError};

const WAIT: Duration = Duration::from_secs(5);

fn tool_results(message: &Message) -> Vec<ToolResult> {
    message.tool_results_iter().cloned().collect()
}

// ===== Completion Tests =====

#[tokio::test]
async fn test_run_completes_without_tool_calls() {
    let h = harness(vec![text_turn("all done")], vec![]);

    let outcome = h
        .coordinator
        .run(SessionAgentCall::new("s1", "say hi"))
        .await
        .unwrap();

    assert_eq!(outcome.stop_reason, StopReason::Completed);
    assert_eq!(outcome.final_text.as_deref(), Some("all done"));
    assert_eq!(outcome.state, ExecutionState::Idle);
    assert_eq!(outcome.steps, 1);
    assert_eq!(outcome.tool_calls, 0);

    let messages = h.store.list_messages("s1").await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);

    let path: Vec<ExecutionState> = h
        .coordinator
        .state_history("s1")
        .iter()
        .map(|t| t.to)
        .collect();
    assert_eq!(
        path,
        vec![
            ExecutionState::ProcessingPrompt,
            ExecutionState::StreamingResponse,
            ExecutionState::ProgressCheck,
            ExecutionState::Idle,
        ]
    );
}

#[tokio::test]
async fn test_attachments_reach_provider() {
    let h = harness(vec![text_turn("read it")], vec![]);

    h.coordinator
        .run(SessionAgentCall::new("s1", "look").with_attachment("notes.md", "remember this"))
        .await
        .unwrap();

    let requests = h.provider.requests();
    let user = &requests[0].messages[0];
    assert_eq!(user.parts.len(), 2);
    assert!(user.text().contains("remember this"));
}

#[tokio::test]
async fn test_tool_round_trip_pairs_results() {
    let h = harness(
        vec![
            tool_turn(vec![("inspect", json!({"path": "src/main.rs"}))]),
            text_turn("finished"),
        ],
        vec![StubTool::new("inspect", Behavior::Succeed)],
    );

    let outcome = h
        .coordinator
        .run(SessionAgentCall::new("s1", "edit main"))
        .await
        .unwrap();

    assert_eq!(outcome.steps, 2);
    assert_eq!(outcome.tool_calls, 1);
    assert_eq!(outcome.final_text.as_deref(), Some("finished"));

    let messages = h.store.list_messages("s1").await.unwrap();
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );

    let call: Vec<&ToolCall> = messages[1].tool_calls().collect();
    assert!(!call[0].id.is_empty());
    let results = tool_results(&messages[2]);
    assert_eq!(results[0].tool_call_id, call[0].id);
    assert_eq!(results[0].status, ToolStatus::Success);

    warden_agent::validator::validate_outgoing(&messages).unwrap();
}

#[tokio::test]
async fn test_file_progress_advances_phase() {
    let h = harness(
        vec![
            tool_turn(vec![("inspect", json!({"path": "src/main.rs"}))]),
            text_turn("done"),
        ],
        vec![StubTool::new("inspect", Behavior::Succeed)],
    );

    h.coordinator
        .run(SessionAgentCall::new("s1", "implement"))
        .await
        .unwrap();

    let history = h.coordinator.state_history("s1");
    assert!(history
        .iter()
        .any(|t| t.to == ExecutionState::PhaseTransition));

    let requests = h.provider.requests();
    let second = requests[1].system_prompt.clone().unwrap_or_default();
    assert!(second.contains("Phase: Implementation"), "{}", second);
}

// ===== Pending Tool Result Tests =====

#[tokio::test]
async fn test_pending_tool_results_refuse_new_prompt() {
    let h = harness(vec![text_turn("ok")], vec![]);
    let call = ToolCall::new("call_1", "inspect", json!({}));
    h.store
        .append_message("s1", &Message::user("start"))
        .await
        .unwrap();
    h.store
        .append_message("s1", &Message::assistant_turn("", "", vec![call.clone()]))
        .await
        .unwrap();

    let err = h
        .coordinator
        .run(SessionAgentCall::new("s1", "next"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::SessionBusy(_)));
    assert_eq!(h.coordinator.state("s1"), ExecutionState::Idle);

    h.store
        .append_message("s1", &Message::tool_results(vec![ToolResult::success(&call, "fine")]))
        .await
        .unwrap();

    let outcome = h
        .coordinator
        .run(SessionAgentCall::new("s1", "next"))
        .await
        .unwrap();
    assert_eq!(outcome.stop_reason, StopReason::Completed);
}

#[tokio::test]
async fn test_concurrent_run_is_busy() {
    let h = harness(
        vec![tool_turn(vec![("block", json!({}))])],
        vec![StubTool::new("block", Behavior::Block)],
    );
    let mut states = h.coordinator.subscribe_state("s1");

    let coordinator = h.coordinator.clone();
    let first = tokio::spawn(async move {
        coordinator
            .run(SessionAgentCall::new("s1", "wait forever"))
            .await
    });
    timeout(WAIT, states.wait_for(|s| *s == ExecutionState::ExecutingTool))
        .await
        .unwrap()
        .unwrap();

    let err = h
        .coordinator
        .run(SessionAgentCall::new("s1", "me too"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::SessionBusy(_)));

    h.coordinator.cancel("s1");
    let outcome = timeout(WAIT, first).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.stop_reason, StopReason::Canceled);
}

// ===== Cancellation Tests =====

#[tokio::test]
async fn test_cancel_closes_every_open_call() {
    let h = harness(
        vec![tool_turn(vec![
            ("block", json!({})),
            ("inspect", json!({"q": 1})),
        ])],
        vec![
            StubTool::new("block", Behavior::Block),
            StubTool::new("inspect", Behavior::Succeed),
        ],
    );
    let mut states = h.coordinator.subscribe_state("s1");

    let coordinator = h.coordinator.clone();
    let run = tokio::spawn(async move {
        coordinator
            .run(SessionAgentCall::new("s1", "hang"))
            .await
    });
    timeout(WAIT, states.wait_for(|s| *s == ExecutionState::ExecutingTool))
        .await
        .unwrap()
        .unwrap();
    h.coordinator.cancel("s1");

    let outcome = timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.stop_reason, StopReason::Canceled);
    assert_eq!(outcome.state, ExecutionState::Idle);

    let messages = h.store.list_messages("s1").await.unwrap();
    let last = messages.last().unwrap();
    assert_eq!(last.role, Role::Tool);
    let results = tool_results(last);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == ToolStatus::Canceled));
    warden_agent::validator::validate(&messages).unwrap();

    let next = h
        .coordinator
        .run(SessionAgentCall::new("s1", "try again"))
        .await
        .unwrap();
    assert_eq!(next.stop_reason, StopReason::Completed);
}

// ===== Resource Pause Tests =====

#[tokio::test]
async fn test_breach_pauses_before_progress_check() {
    let monitor = test_monitor();
    let h = harness_with(
        vec![tool_turn(vec![("spike", json!({}))]), text_turn("done")],
        vec![StubTool::new("spike", Behavior::Breach(monitor.clone()))],
        |_| {},
        Some(monitor.clone()),
    );
    let mut states = h.coordinator.subscribe_state("s1");

    let coordinator = h.coordinator.clone();
    let run = tokio::spawn(async move {
        coordinator
            .run(SessionAgentCall::new("s1", "compile everything"))
            .await
    });
    timeout(WAIT, states.wait_for(|s| *s == ExecutionState::ResourcePaused))
        .await
        .unwrap()
        .unwrap();

    monitor.ingest(healthy_sample());
    assert_eq!(h.coordinator.state("s1"), ExecutionState::ResourcePaused);
    monitor.ingest(healthy_sample());

    let outcome = timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.stop_reason, StopReason::Completed);

    let history = h.coordinator.state_history("s1");
    let paused = history
        .iter()
        .position(|t| t.to == ExecutionState::ResourcePaused)
        .unwrap();
    assert_eq!(history[paused].from, ExecutionState::ExecutingTool);
    assert_eq!(history[paused + 1].from, ExecutionState::ResourcePaused);
    assert_eq!(history[paused + 1].to, ExecutionState::ProgressCheck);
}

#[tokio::test]
async fn test_cancel_while_paused() {
    let monitor = test_monitor();
    monitor.ingest(hot_sample());
    let h = harness_with(vec![text_turn("never")], vec![], |_| {}, Some(monitor));
    let mut states = h.coordinator.subscribe_state("s1");

    let coordinator = h.coordinator.clone();
    let run = tokio::spawn(async move {
        coordinator
            .run(SessionAgentCall::new("s1", "wait"))
            .await
    });
    timeout(WAIT, states.wait_for(|s| *s == ExecutionState::ResourcePaused))
        .await
        .unwrap()
        .unwrap();
    h.coordinator.cancel("s1");

    let outcome = timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.stop_reason, StopReason::Canceled);
    assert_eq!(outcome.steps, 0);
    assert!(h.provider.requests().is_empty());
}

// ===== Anomaly Tests =====

#[tokio::test]
async fn test_loop_warning_injected_before_next_request() {
    let mut turns: Vec<ScriptedTurn> = (0..5)
        .map(|_| tool_turn(vec![("inspect", json!({"query": "same"}))]))
        .collect();
    turns.push(text_turn("giving up"));
    let h = harness_with(
        turns,
        vec![StubTool::new("inspect", Behavior::Succeed)],
        |config| config.runtime.max_no_progress_turns = 20,
        None,
    );

    let outcome = h
        .coordinator
        .run(SessionAgentCall::new("s1", "find the answer"))
        .await
        .unwrap();
    assert_eq!(outcome.stop_reason, StopReason::Completed);
    assert_eq!(outcome.steps, 6);

    let requests = h.provider.requests();
    let warned_before = |index: usize| {
        requests[index].messages.iter().any(|m| {
            m.role == Role::System && m.text().contains("[LOOP DETECTED]")
        })
    };
    assert!(!warned_before(4));
    assert!(warned_before(5));

    let stored = h.store.list_messages("s1").await.unwrap();
    let warnings = stored
        .iter()
        .filter(|m| m.parts.iter().any(|p| matches!(p, ContentPart::Text { text } if text.contains("[LOOP DETECTED]"))))
        .count();
    assert_eq!(warnings, 1);
}

#[tokio::test]
async fn test_failed_edits_open_circuit_before_next_request() {
    let mut turns: Vec<ScriptedTurn> = (0..3)
        .map(|i| {
            tool_turn(vec![(
                "edit_file",
                json!({"path": "src/a.rs", "old_string": format!("attempt {}", i), "new_string": "x"}),
            )])
        })
        .collect();
    turns.push(text_turn("switched to write_file"));
    let h = harness_with(
        turns,
        vec![StubTool::new("edit_file", Behavior::Fail)],
        |config| {
            config.runtime.max_no_progress_turns = 20;
            config.runtime.consecutive_error_limit = 20;
        },
        None,
    );

    let outcome = h
        .coordinator
        .run(SessionAgentCall::new("s1", "rename the function"))
        .await
        .unwrap();
    assert_eq!(outcome.stop_reason, StopReason::Completed);

    let requests = h.provider.requests();
    let noticed_before = |index: usize| {
        requests[index].messages.iter().any(|m| {
            m.role == Role::System && m.text().contains("[EDIT CIRCUIT OPEN]")
        })
    };
    assert!(!noticed_before(2));
    assert!(noticed_before(3));
}

#[tokio::test]
async fn test_circuit_notice_counts_turn_without_progress() {
    // Every turn also writes a new file, so only the notice can stall it
    let turns = (0..5)
        .map(|i| {
            tool_turn(vec![
                (
                    "edit_file",
                    json!({"path": "src/a.rs", "old_string": format!("attempt {}", i), "new_string": "x"}),
                ),
                ("write_file", json!({"path": format!("src/b{}.rs", i)})),
            ])
        })
        .collect();
    let h = harness_with(
        turns,
        vec![
            StubTool::new("edit_file", Behavior::Fail),
            StubTool::new("write_file", Behavior::Succeed),
        ],
        |config| config.runtime.max_no_progress_turns = 1,
        None,
    );

    let outcome = h
        .coordinator
        .run(SessionAgentCall::new("s1", "rename the function"))
        .await
        .unwrap();
    assert_eq!(outcome.steps, 3);
    assert!(matches!(outcome.stop_reason, StopReason::Halted(ref r) if r.contains("without progress")));
}

// ===== Halt Tests =====

#[tokio::test]
async fn test_consecutive_errors_halt_until_reset() {
    let h = harness_with(
        vec![
            tool_turn(vec![("broken", json!({"attempt": 1}))]),
            tool_turn(vec![("broken", json!({"attempt": 2}))]),
        ],
        vec![StubTool::new("broken", Behavior::Fail)],
        |config| config.runtime.consecutive_error_limit = 2,
        None,
    );

    let outcome = h
        .coordinator
        .run(SessionAgentCall::new("s1", "fix"))
        .await
        .unwrap();
    assert!(matches!(outcome.stop_reason, StopReason::Halted(ref r) if r.contains("consecutive")));
    assert_eq!(outcome.state, ExecutionState::Halted);

    let err = h
        .coordinator
        .run(SessionAgentCall::new("s1", "again"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AgentError::SessionHalted {
            state: ExecutionState::Halted,
            ..
        }
    ));

    h.coordinator.reset("s1").await.unwrap();
    assert_eq!(h.coordinator.state("s1"), ExecutionState::Idle);

    let outcome = h
        .coordinator
        .run(SessionAgentCall::new("s1", "again"))
        .await
        .unwrap();
    assert_eq!(outcome.stop_reason, StopReason::Completed);
}

#[tokio::test]
async fn test_step_budget_halts() {
    let turns = (0..5)
        .map(|i| tool_turn(vec![("inspect", json!({"path": format!("f{}.rs", i)}))]))
        .collect();
    let h = harness_with(
        turns,
        vec![StubTool::new("inspect", Behavior::Succeed)],
        |config| config.runtime.max_steps = 2,
        None,
    );

    let outcome = h
        .coordinator
        .run(SessionAgentCall::new("s1", "keep going"))
        .await
        .unwrap();
    assert_eq!(outcome.steps, 2);
    assert!(matches!(outcome.stop_reason, StopReason::Halted(ref r) if r.contains("step budget")));
}

#[tokio::test]
async fn test_reset_requires_terminal_state() {
    let h = harness(vec![], vec![]);
    assert!(h.coordinator.reset("s1").await.is_err());
}

// ===== Provider Failure Tests =====

#[tokio::test]
async fn test_transient_provider_error_is_retried() {
    let h = harness(
        vec![Err(ProviderError::Timeout), text_turn("recovered")],
        vec![],
    );

    let outcome = h
        .coordinator
        .run(SessionAgentCall::new("s1", "hello"))
        .await
        .unwrap();
    assert_eq!(outcome.final_text.as_deref(), Some("recovered"));
    assert_eq!(h.provider.requests().len(), 2);
}

#[tokio::test]
async fn test_fatal_provider_error_moves_to_error_state() {
    let h = harness(vec![Err(ProviderError::Api("bad key".into()))], vec![]);

    let err = h
        .coordinator
        .run(SessionAgentCall::new("s1", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Provider(ProviderError::Api(_))));
    assert_eq!(h.coordinator.state("s1"), ExecutionState::Error);

    h.coordinator.reset("s1").await.unwrap();
    assert_eq!(h.coordinator.state("s1"), ExecutionState::Idle);
}

// ===== Store Failure Tests =====

#[tokio::test]
async fn test_failed_result_append_closes_open_calls() {
    let workspace = tempfile::TempDir::new().unwrap();
    // 1: prompt, 2: assistant turn with the call, 3: its results
    let store = Arc::new(FlakyStore::failing_on(vec![3]));
    let coordinator = coordinator_over(
        store.clone(),
        vec![tool_turn(vec![("inspect", json!({"path": "a.rs"}))])],
        vec![StubTool::new("inspect", Behavior::Succeed)],
        workspace.path(),
    );

    let err = coordinator
        .run(SessionAgentCall::new("s1", "edit"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Store(StoreError::Io(_))));
    assert_eq!(coordinator.state("s1"), ExecutionState::Error);

    let messages = store.list_messages("s1").await.unwrap();
    assert_eq!(messages.len(), 3);
    let results = tool_results(&messages[2]);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ToolStatus::Canceled);

    coordinator.reset("s1").await.unwrap();
    let outcome = coordinator
        .run(SessionAgentCall::new("s1", "again"))
        .await
        .unwrap();
    assert_eq!(outcome.stop_reason, StopReason::Completed);
}

#[tokio::test]
async fn test_reset_closes_calls_left_by_failed_run() {
    let workspace = tempfile::TempDir::new().unwrap();
    // The best-effort close after the failure fails too
    let store = Arc::new(FlakyStore::failing_on(vec![3, 4]));
    let coordinator = coordinator_over(
        store.clone(),
        vec![tool_turn(vec![("inspect", json!({})), ("inspect", json!({}))])],
        vec![StubTool::new("inspect", Behavior::Succeed)],
        workspace.path(),
    );

    assert!(coordinator
        .run(SessionAgentCall::new("s1", "edit"))
        .await
        .is_err());
    assert_eq!(store.list_messages("s1").await.unwrap().len(), 2);

    let err = coordinator
        .run(SessionAgentCall::new("s1", "again"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::SessionBusy(_)));

    coordinator.reset("s1").await.unwrap();
    let messages = store.list_messages("s1").await.unwrap();
    assert_eq!(messages.len(), 3);
    let results = tool_results(&messages[2]);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == ToolStatus::Canceled));

    let outcome = coordinator
        .run(SessionAgentCall::new("s1", "again"))
        .await
        .unwrap();
    assert_eq!(outcome.stop_reason, StopReason::Completed);
    assert_eq!(outcome.state, ExecutionState::Idle);
}

#[tokio::test]
async fn test_corrupt_history_fails_the_run_without_overwrite() {
    let workspace = tempfile::TempDir::new().unwrap();
    let sessions = tempfile::TempDir::new().unwrap();
    let path = sessions.path().join("s1.json");
    tokio::fs::write(&path, "{ nope").await.unwrap();

    let coordinator = coordinator_over(
        Arc::new(FileMessageStore::new(sessions.path())),
        vec![text_turn("never sent")],
        vec![],
        workspace.path(),
    );

    let err = coordinator
        .run(SessionAgentCall::new("s1", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Store(StoreError::Corrupt { .. })));
    assert_eq!(coordinator.state("s1"), ExecutionState::Error);

    // Reset cannot repair an unreadable file either
    assert!(coordinator.reset("s1").await.is_err());
    assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "{ nope");
}
