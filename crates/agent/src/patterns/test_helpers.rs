//! Shared test doubles for the agent crate.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thinkloop_config::ThinkingSection;
use thinkloop_core::error::{ErrorDetail, MemoryError, ProviderError, SkillError, ToolError};
use thinkloop_core::event::{EventBus, EventKind, UnifiedEvent};
use thinkloop_core::memory::{MemoryBackend, MemoryEntry, MemoryQuery};
use thinkloop_core::message::{Message, MessageToolCall};
use thinkloop_core::provider::{ChatRequest, ChatResponse, FinishReason, Provider, Usage};
use thinkloop_core::skill::{Skill, SkillContext, SkillRegistry, SkillResult};
use thinkloop_core::tool::{Tool, ToolContext, ToolRegistry, ToolResult};

use crate::dispatcher::ToolInvocationDispatcher;
use crate::patterns::react::ThinkingEngine;

/// A provider that replays a script of replies, one per call.
///
/// Once the script runs out every call fails with an `ApiError`.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<ChatResponse, ProviderError>>>,
    requests: Mutex<Vec<ChatRequest>>,
    delay: Option<Duration>,
    health_delay: Option<Duration>,
    healthy: bool,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ChatResponse>) -> Self {
        Self::from_results(replies.into_iter().map(Ok).collect())
    }

    pub fn from_results(replies: Vec<Result<ChatResponse, ProviderError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            delay: None,
            health_delay: None,
            healthy: true,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_health_delay(mut self, delay: Duration) -> Self {
        self.health_delay = Some(delay);
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ProviderError::ApiError {
                    status_code: 500,
                    message: "script exhausted".into(),
                })
            })
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        if let Some(delay) = self.health_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.healthy)
    }
}

/// A plain-text assistant reply with non-zero usage.
pub fn text_reply(text: &str) -> ChatResponse {
    ChatResponse::new("scripted-model", Message::assistant(text), FinishReason::Stop, Usage::new(10, 5))
}

/// A JSON `finish` decision carrying `answer`.
pub fn finish_reply(answer: &str) -> ChatResponse {
    let body = serde_json::json!({
        "thought": "I know the answer",
        "action": {"type": "finish", "parameters": {"answer": answer}},
    });
    text_reply(&body.to_string())
}

/// A JSON decision calling one tool.
pub fn tool_reply(name: &str, parameters: serde_json::Value) -> ChatResponse {
    let body = serde_json::json!({
        "thought": format!("use {name}"),
        "action": {"type": "tool", "name": name, "parameters": parameters},
    });
    text_reply(&body.to_string())
}

/// A native tool-call reply.
pub fn tool_call_reply(name: &str, arguments: serde_json::Value) -> ChatResponse {
    let mut message = Message::assistant("");
    message.tool_calls = vec![MessageToolCall {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }];
    ChatResponse::new("scripted-model", message, FinishReason::ToolCalls, Usage::new(10, 5))
}

/// Returns its `text` parameter.
pub struct EchoTool;

#[async_trait::async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the text parameter"
    }

    async fn run(&self, input: serde_json::Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::ok(input["text"].clone()))
    }
}

/// Always reports failure with a fixed code.
pub struct FailingTool {
    name: &'static str,
    code: &'static str,
    recoverable: bool,
}

impl FailingTool {
    pub fn recoverable(code: &'static str) -> Self {
        Self {
            name: "always_fails",
            code,
            recoverable: true,
        }
    }

    pub fn fatal(code: &'static str) -> Self {
        Self {
            name: "fatal",
            code,
            recoverable: false,
        }
    }
}

#[async_trait::async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    async fn run(&self, _input: serde_json::Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::failed(ErrorDetail::new(
            self.code,
            "index offline",
            self.recoverable,
        )))
    }
}

/// Sleeps, then echoes `text`.
pub struct SlowTool {
    delay: Duration,
}

impl SlowTool {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait::async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Echo the text parameter after a delay"
    }

    async fn run(&self, input: serde_json::Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        tokio::time::sleep(self.delay).await;
        Ok(ToolResult::ok(input["text"].clone()))
    }
}

/// Panics on every call.
pub struct CrashingTool;

#[async_trait::async_trait]
impl Tool for CrashingTool {
    fn name(&self) -> &str {
        "crash"
    }

    fn description(&self) -> &str {
        "Panics"
    }

    async fn run(&self, _input: serde_json::Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        panic!("tool bug");
    }
}

/// Uppercases `text`; records the session it ran in.
pub struct UpperSkill;

#[async_trait::async_trait]
impl Skill for UpperSkill {
    fn id(&self) -> &str {
        "upper"
    }

    fn description(&self) -> &str {
        "Uppercase the text parameter"
    }

    async fn execute(&self, input: serde_json::Value, ctx: &SkillContext) -> Result<SkillResult, SkillError> {
        let text = input["text"].as_str().ok_or_else(|| SkillError::InvalidInput {
            skill_id: "upper".into(),
            reason: "text is required".into(),
        })?;
        let mut result = SkillResult::ok(serde_json::json!(text.to_uppercase()));
        result
            .metadata
            .insert("session".into(), serde_json::json!(ctx.session_id));
        Ok(result)
    }
}

/// Keeps stored entries in a vector.
#[derive(Default)]
pub struct InMemoryBackend {
    entries: Mutex<Vec<MemoryEntry>>,
}

impl InMemoryBackend {
    pub fn entries(&self) -> Vec<MemoryEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl MemoryBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn store(&self, mut entry: MemoryEntry) -> Result<String, MemoryError> {
        let mut entries = self.entries.lock().unwrap();
        if entry.id.is_empty() {
            entry.id = format!("mem-{}", entries.len() + 1);
        }
        let id = entry.id.clone();
        entries.push(entry);
        Ok(id)
    }

    async fn search(&self, query: MemoryQuery) -> Result<Vec<MemoryEntry>, MemoryError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|e| e.content.contains(&query.text))
            .take(query.limit)
            .cloned()
            .collect())
    }
}

/// Record every event of `kinds` published on `bus`.
pub fn collect_events(bus: &EventBus, kinds: &[EventKind]) -> Arc<Mutex<Vec<UnifiedEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(kinds, move |event| sink.lock().unwrap().push(event.clone()));
    seen
}

pub fn count_kind(events: &Arc<Mutex<Vec<UnifiedEvent>>>, kind: EventKind) -> usize {
    events.lock().unwrap().iter().filter(|e| e.kind == kind).count()
}

pub fn test_tools() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));
    tools.register(Arc::new(FailingTool::recoverable("X")));
    tools.register(Arc::new(FailingTool::fatal("FATAL")));
    tools.register(Arc::new(SlowTool::new(Duration::from_millis(30))));
    tools.register(Arc::new(CrashingTool));
    tools
}

pub fn test_skills() -> SkillRegistry {
    let mut skills = SkillRegistry::new();
    skills.register(Arc::new(UpperSkill));
    skills
}

/// An engine over the test tools and skills, with its own bus.
pub fn build_engine(provider: Arc<ScriptedProvider>, settings: ThinkingSection) -> (ThinkingEngine, EventBus) {
    let bus = EventBus::new();
    let dispatcher = ToolInvocationDispatcher::new(
        "agent-test",
        Arc::new(test_tools()),
        Arc::new(test_skills()),
        provider.clone(),
        bus.clone(),
    );
    let engine = ThinkingEngine::new("agent-test", provider, Arc::new(dispatcher), bus.clone())
        .with_model("scripted-model")
        .with_settings(settings);
    (engine, bus)
}

pub fn engine_with(provider: Arc<ScriptedProvider>, settings: ThinkingSection) -> (Arc<ThinkingEngine>, EventBus) {
    let (engine, bus) = build_engine(provider, settings);
    (Arc::new(engine), bus)
}
