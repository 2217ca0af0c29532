//! Shared fixtures for coordinator tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use warden_agent::tools::{ToolError, ToolOutput, ToolRegistry, ToolTrait};
use warden_agent::{Coordinator, ToolEffects};
use warden_config::Config;
use warden_monitor::{ResourceMonitor, ResourceSample, Sampler, Thresholds};
use warden_provider::{
    ChatRequest, ChatStream, FinishReason, Provider, ProviderError, StreamEvent, ToolCall,
};
use warden_session::{MemoryMessageStore, MessageStore, StoreError};

pub type ScriptedTurn = Result<Vec<StreamEvent>, ProviderError>;

/// Replays queued turns; answers "done" once the script runs out
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn stream_chat(&self, request: ChatRequest) -> warden_provider::Result<ChatStream> {
        self.requests.lock().unwrap().push(request);
        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(text_events("done")));
        let events = turn?;
        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }

    fn model(&self) -> String {
        "scripted".to_string()
    }
}

pub fn text_events(text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::ContentDelta(text.to_string()),
        StreamEvent::Finish(FinishReason::Stop),
    ]
}

pub fn text_turn(text: &str) -> ScriptedTurn {
    Ok(text_events(text))
}

/// One assistant turn calling `calls` (name, arguments); ids are left for the coordinator
pub fn tool_turn(calls: Vec<(&str, Value)>) -> ScriptedTurn {
    let mut events: Vec<StreamEvent> = calls
        .into_iter()
        .map(|(name, args)| StreamEvent::ToolCall(ToolCall::new("", name, args)))
        .collect();
    events.push(StreamEvent::Finish(FinishReason::ToolCalls));
    Ok(events)
}

/// Config tuned for fast tests
pub fn test_config(workspace: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.runtime.workspace = workspace.display().to_string();
    config.runtime.continuation_cooldown_ms = 0;
    config.runtime.retry_base_delay_ms = 1;
    config.runtime.retry_max_delay_ms = 5;
    config
}

/// How a [`StubTool`] behaves
#[derive(Clone)]
pub enum Behavior {
    /// Succeed, reporting a modification of `path` when the arguments carry one
    Succeed,
    /// Soft failure
    Fail,
    /// Push a CPU breach into the monitor, then succeed
    Breach(Arc<ResourceMonitor>),
    /// Wait until canceled
    Block,
}

pub struct StubTool {
    name: String,
    behavior: Behavior,
}

impl StubTool {
    pub fn new(name: &str, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
        }
    }
}

#[async_trait]
impl ToolTrait for StubTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "test tool"
    }
    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }
    async fn execute(
        &self,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        match &self.behavior {
            Behavior::Succeed => {
                let mut output = ToolOutput::text(format!("{} ok", self.name));
                if let Some(path) = args.get("path").and_then(Value::as_str) {
                    output = output.with_effects(ToolEffects {
                        files_modified: vec![path.to_string()],
                        ..Default::default()
                    });
                }
                Ok(output)
            }
            Behavior::Fail => Ok(ToolOutput::error(format!("{} failed", self.name))),
            Behavior::Breach(monitor) => {
                monitor.ingest(ResourceSample::new(92.0, 40.0, u64::MAX));
                Ok(ToolOutput::text("spiked"))
            }
            Behavior::Block => {
                cancel.cancelled().await;
                Err(ToolError::Canceled)
            }
        }
    }
}

/// Sampler that is never polled in tests; samples are ingested directly
pub struct IdleSampler;

impl Sampler for IdleSampler {
    fn sample(&mut self) -> ResourceSample {
        healthy_sample()
    }
}

pub fn healthy_sample() -> ResourceSample {
    ResourceSample::new(20.0, 30.0, u64::MAX)
}

pub fn hot_sample() -> ResourceSample {
    ResourceSample::new(97.0, 40.0, u64::MAX)
}

pub fn test_monitor() -> Arc<ResourceMonitor> {
    Arc::new(ResourceMonitor::with_thresholds(
        Thresholds::default(),
        2,
        Duration::from_secs(60),
        Box::new(IdleSampler),
    ))
}

pub struct Harness {
    pub coordinator: Arc<Coordinator>,
    pub provider: Arc<ScriptedProvider>,
    pub store: Arc<MemoryMessageStore>,
    pub workspace: tempfile::TempDir,
}

pub fn harness(turns: Vec<ScriptedTurn>, tools: Vec<StubTool>) -> Harness {
    harness_with(turns, tools, |_| {}, None)
}

pub fn harness_with(
    turns: Vec<ScriptedTurn>,
    tools: Vec<StubTool>,
    tune: impl FnOnce(&mut Config),
    monitor: Option<Arc<ResourceMonitor>>,
) -> Harness {
    let workspace = tempfile::TempDir::new().unwrap();
    let mut config = test_config(workspace.path());
    tune(&mut config);

    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool);
    }

    let provider = Arc::new(ScriptedProvider::new(turns));
    let store = Arc::new(MemoryMessageStore::new());
    let mut coordinator = Coordinator::new(
        provider.clone(),
        store.clone(),
        Arc::new(registry),
        &config,
    );
    if let Some(monitor) = monitor {
        coordinator = coordinator.with_monitor(monitor);
    }

    Harness {
        coordinator: Arc::new(coordinator),
        provider,
        store,
        workspace,
    }
}

/// Memory store whose listed appends (1-based) fail as if the disk were full
pub struct FlakyStore {
    inner: MemoryMessageStore,
    fail_on: Vec<usize>,
    appends: AtomicUsize,
}

impl FlakyStore {
    pub fn failing_on(fail_on: Vec<usize>) -> Self {
        Self {
            inner: MemoryMessageStore::new(),
            fail_on,
            appends: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn append_message(
        &self,
        session_id: &str,
        message: &warden_provider::Message,
    ) -> warden_session::Result<()> {
        let attempt = self.appends.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.contains(&attempt) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.append_message(session_id, message).await
    }

    async fn list_messages(
        &self,
        session_id: &str,
    ) -> warden_session::Result<Vec<warden_provider::Message>> {
        self.inner.list_messages(session_id).await
    }

    async fn list_sessions(&self) -> warden_session::Result<Vec<String>> {
        self.inner.list_sessions().await
    }

    async fn archive(&self, session_id: &str) -> warden_session::Result<()> {
        self.inner.archive(session_id).await
    }
}

/// Coordinator over a caller-supplied store
pub fn coordinator_over(
    store: Arc<dyn MessageStore>,
    turns: Vec<ScriptedTurn>,
    tools: Vec<StubTool>,
    workspace: &std::path::Path,
) -> Arc<Coordinator> {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool);
    }
    Arc::new(Coordinator::new(
        Arc::new(ScriptedProvider::new(turns)),
        store,
        Arc::new(registry),
        &test_config(workspace),
    ))
}
