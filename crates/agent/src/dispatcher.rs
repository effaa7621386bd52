//! Tool and skill invocation.
//!
//! Every call gets a fresh execution context, a history record, and a
//! `tool:*` / `skill:*` event. A tool or skill that reports
//! `success: false` is normalized into the same error path as one that
//! returns `Err`, so callers see a single failure shape.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use thinkloop_core::error::{Error, ErrorDetail, SkillError, ToolError, panic_message};
use thinkloop_core::event::{EventBus, EventKind, EventMetadata};
use thinkloop_core::memory::MemoryBackend;
use thinkloop_core::provider::Provider;
use thinkloop_core::signal::AbortSignal;
use thinkloop_core::skill::{SkillContext, SkillRegistry, SkillResult};
use thinkloop_core::tool::{ToolContext, ToolRegistry, ToolResult};
use tracing::{Instrument, debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationKind {
    Tool,
    Skill,
}

/// One call to dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub kind: InvocationKind,
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Invocation {
    pub fn tool(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind: InvocationKind::Tool,
            name: name.into(),
            params,
        }
    }

    pub fn skill(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind: InvocationKind::Skill,
            name: name.into(),
            params,
        }
    }
}

/// Per-entry result of [`ToolInvocationDispatcher::invoke_many`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationOutcome {
    pub name: String,
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl InvocationOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// One entry of the bounded invocation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub execution_id: String,
    pub kind: InvocationKind,
    pub tool: String,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Who is dispatching: session and cancellation for the current call.
#[derive(Debug, Clone, Default)]
pub struct DispatchScope {
    pub session_id: Option<String>,
    pub signal: Option<AbortSignal>,
}

pub struct ToolInvocationDispatcher {
    agent_id: String,
    tools: Arc<ToolRegistry>,
    skills: Arc<SkillRegistry>,
    llm: Arc<dyn Provider>,
    memory: Option<Arc<dyn MemoryBackend>>,
    bus: EventBus,
    history: Mutex<VecDeque<InvocationRecord>>,
    history_limit: usize,
}

impl ToolInvocationDispatcher {
    pub fn new(
        agent_id: impl Into<String>,
        tools: Arc<ToolRegistry>,
        skills: Arc<SkillRegistry>,
        llm: Arc<dyn Provider>,
        bus: EventBus,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            tools,
            skills,
            llm,
            memory: None,
            bus,
            history: Mutex::new(VecDeque::new()),
            history_limit: 100,
        }
    }

    /// Memory handed to skills through their context.
    pub fn with_memory(mut self, memory: Arc<dyn MemoryBackend>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn skills(&self) -> &Arc<SkillRegistry> {
        &self.skills
    }

    /// Invoke one tool or skill and return its data.
    pub async fn invoke(&self, call: &Invocation, scope: &DispatchScope) -> Result<serde_json::Value, Error> {
        match call.kind {
            InvocationKind::Tool => {
                let result = self.invoke_tool(&call.name, call.params.clone(), scope).await?;
                Ok(result.data.unwrap_or(serde_json::Value::Null))
            }
            InvocationKind::Skill => {
                let result = self.invoke_skill(&call.name, call.params.clone(), scope).await?;
                Ok(result.data.unwrap_or(serde_json::Value::Null))
            }
        }
    }

    /// Invoke every call concurrently. The output has the same length and
    /// order as `calls`; one failure never affects its siblings.
    pub async fn invoke_many(&self, calls: &[Invocation], scope: &DispatchScope) -> Vec<InvocationOutcome> {
        let futures = calls.iter().map(|call| self.invoke_captured(call, scope));
        futures::future::join_all(futures).await
    }

    /// [`invoke`](Self::invoke) with the error captured into the outcome.
    pub async fn invoke_captured(&self, call: &Invocation, scope: &DispatchScope) -> InvocationOutcome {
        match self.invoke(call, scope).await {
            Ok(value) => InvocationOutcome {
                name: call.name.clone(),
                result: Some(value),
                error: None,
            },
            Err(e) => InvocationOutcome {
                name: call.name.clone(),
                result: None,
                error: Some(e.detail()),
            },
        }
    }

    pub async fn invoke_tool(
        &self,
        name: &str,
        input: serde_json::Value,
        scope: &DispatchScope,
    ) -> Result<ToolResult, ToolError> {
        let execution_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("tool", tool = %name, execution_id = %execution_id);
        let start_time = Utc::now();
        let started = Instant::now();

        let outcome = match self.tools.get(name) {
            None => Err(ToolError::NotFound(name.to_string())),
            Some(tool) => {
                let ctx = ToolContext {
                    execution_id: execution_id.clone(),
                    agent_id: self.agent_id.clone(),
                    log: span.clone(),
                };
                match AssertUnwindSafe(tool.run(input.clone(), &ctx).instrument(span.clone()))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result.and_then(|result| reported_tool_failure(name, result)),
                    Err(panic) => Err(ToolError::Failed {
                        tool_name: name.to_string(),
                        code: "TOOL_PANICKED".into(),
                        message: format!("tool crashed: {}", panic_message(panic.as_ref())),
                        recoverable: true,
                    }),
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let (output, error) = match &outcome {
            Ok(result) => (result.data.clone(), None),
            Err(e) => (None, Some(e.detail())),
        };

        span.in_scope(|| match &error {
            None => debug!(duration_ms, "Tool completed"),
            Some(detail) => warn!(duration_ms, code = %detail.code, "Tool failed: {}", detail.message),
        });

        self.finish(
            InvocationRecord {
                execution_id,
                kind: InvocationKind::Tool,
                tool: name.to_string(),
                input,
                output,
                error,
                start_time,
                end_time: Utc::now(),
                duration_ms,
            },
            scope,
        );

        outcome
    }

    pub async fn invoke_skill(
        &self,
        id: &str,
        input: serde_json::Value,
        scope: &DispatchScope,
    ) -> Result<SkillResult, SkillError> {
        let execution_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("skill", skill = %id, execution_id = %execution_id);
        let start_time = Utc::now();
        let started = Instant::now();

        let outcome = match self.skills.get(id) {
            None => Err(SkillError::NotFound(id.to_string())),
            Some(skill) => {
                let ctx = SkillContext {
                    execution_id: execution_id.clone(),
                    agent_id: self.agent_id.clone(),
                    session_id: scope.session_id.clone(),
                    input: input.clone(),
                    log: span.clone(),
                    llm: Arc::clone(&self.llm),
                    memory: self.memory.clone(),
                    tools: Arc::clone(&self.tools),
                    signal: scope.signal.clone(),
                };
                match AssertUnwindSafe(skill.execute(input.clone(), &ctx).instrument(span.clone()))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result.and_then(|result| reported_skill_failure(id, result)),
                    Err(panic) => Err(SkillError::Failed {
                        skill_id: id.to_string(),
                        code: "SKILL_PANICKED".into(),
                        message: format!("skill crashed: {}", panic_message(panic.as_ref())),
                        recoverable: true,
                    }),
                }
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let (output, error) = match &outcome {
            Ok(result) => (result.data.clone(), None),
            Err(e) => (None, Some(e.detail())),
        };

        span.in_scope(|| match &error {
            None => debug!(duration_ms, "Skill completed"),
            Some(detail) => warn!(duration_ms, code = %detail.code, "Skill failed: {}", detail.message),
        });

        self.finish(
            InvocationRecord {
                execution_id,
                kind: InvocationKind::Skill,
                tool: id.to_string(),
                input,
                output,
                error,
                start_time,
                end_time: Utc::now(),
                duration_ms,
            },
            scope,
        );

        outcome
    }

    /// Record history and publish the completion event.
    fn finish(&self, record: InvocationRecord, scope: &DispatchScope) {
        let kind = match (record.kind, record.error.is_some()) {
            (InvocationKind::Tool, false) => EventKind::ToolCompleted,
            (InvocationKind::Tool, true) => EventKind::ToolFailed,
            (InvocationKind::Skill, false) => EventKind::SkillCompleted,
            (InvocationKind::Skill, true) => EventKind::SkillFailed,
        };

        let mut metadata = EventMetadata::new(&self.agent_id).with_execution(&record.execution_id);
        metadata.session_id = scope.session_id.clone();

        let payload = serde_json::json!({
            "name": record.tool,
            "input": record.input,
            "output": record.output,
            "error": record.error,
            "durationMs": record.duration_ms,
        });

        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push_back(record);
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }

        self.bus.publish(kind, payload, metadata);
    }

    /// Invocation records, oldest first.
    pub fn history(&self) -> Vec<InvocationRecord> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

fn reported_tool_failure(name: &str, result: ToolResult) -> Result<ToolResult, ToolError> {
    if result.success {
        return Ok(result);
    }
    let detail = result
        .error
        .unwrap_or_else(|| ErrorDetail::new("TOOL_FAILED", "tool reported failure", true));
    Err(ToolError::Failed {
        tool_name: name.to_string(),
        code: detail.code,
        message: detail.message,
        recoverable: detail.recoverable,
    })
}

fn reported_skill_failure(id: &str, result: SkillResult) -> Result<SkillResult, SkillError> {
    if result.success {
        return Ok(result);
    }
    let detail = result
        .error
        .unwrap_or_else(|| ErrorDetail::new("SKILL_FAILED", "skill reported failure", true));
    Err(SkillError::Failed {
        skill_id: id.to_string(),
        code: detail.code,
        message: detail.message,
        recoverable: detail.recoverable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::test_helpers::{
        CrashingTool, EchoTool, FailingTool, ScriptedProvider, SlowTool, UpperSkill, collect_events,
    };
    use std::time::Duration;

    fn dispatcher(bus: &EventBus) -> ToolInvocationDispatcher {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool));
        tools.register(Arc::new(FailingTool::recoverable("X")));
        tools.register(Arc::new(SlowTool::new(Duration::from_millis(20))));
        tools.register(Arc::new(CrashingTool));
        let mut skills = SkillRegistry::new();
        skills.register(Arc::new(UpperSkill));
        ToolInvocationDispatcher::new(
            "agent-1",
            Arc::new(tools),
            Arc::new(skills),
            Arc::new(ScriptedProvider::new(vec![])),
            bus.clone(),
        )
    }

    #[tokio::test]
    async fn invoke_returns_tool_data_and_emits_completed() {
        let bus = EventBus::new();
        let events = collect_events(&bus, &[EventKind::ToolCompleted, EventKind::ToolFailed]);
        let d = dispatcher(&bus);

        let value = d
            .invoke(&Invocation::tool("echo", serde_json::json!({"text": "hi"})), &DispatchScope::default())
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!("hi"));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ToolCompleted);
        assert_eq!(events[0].payload["name"], "echo");
        assert!(events[0].metadata.execution_id.is_some());
    }

    #[tokio::test]
    async fn reported_failure_becomes_tool_error() {
        let bus = EventBus::new();
        let events = collect_events(&bus, &[EventKind::ToolFailed]);
        let d = dispatcher(&bus);

        let err = d
            .invoke_tool("always_fails", serde_json::json!({}), &DispatchScope::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "X");
        assert!(err.is_recoverable());
        assert_eq!(events.lock().unwrap()[0].payload["error"]["code"], "X");
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let d = dispatcher(&EventBus::new());
        let err = d
            .invoke(&Invocation::tool("nope", serde_json::json!({})), &DispatchScope::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool(ToolError::NotFound(_))));
    }

    #[tokio::test]
    async fn skill_gets_session_and_emits_skill_events() {
        let bus = EventBus::new();
        let events = collect_events(&bus, &[EventKind::SkillCompleted]);
        let d = dispatcher(&bus);
        let scope = DispatchScope {
            session_id: Some("s1".into()),
            signal: None,
        };

        let result = d.invoke_skill("upper", serde_json::json!({"text": "abc"}), &scope).await.unwrap();
        assert_eq!(result.data, Some(serde_json::json!("ABC")));
        assert_eq!(result.metadata["session"], "s1");
        assert_eq!(events.lock().unwrap()[0].metadata.session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn invoke_many_preserves_order_and_isolates_failures() {
        let d = dispatcher(&EventBus::new());
        let calls = vec![
            Invocation::tool("slow", serde_json::json!({"text": "first"})),
            Invocation::tool("always_fails", serde_json::json!({})),
            Invocation::tool("missing", serde_json::json!({})),
            Invocation::skill("upper", serde_json::json!({"text": "last"})),
        ];

        let outcomes = d.invoke_many(&calls, &DispatchScope::default()).await;
        assert_eq!(outcomes.len(), calls.len());
        let names: Vec<_> = outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["slow", "always_fails", "missing", "upper"]);

        assert_eq!(outcomes[0].result, Some(serde_json::json!("first")));
        assert_eq!(outcomes[1].error.as_ref().unwrap().code, "X");
        assert_eq!(outcomes[2].error.as_ref().unwrap().code, "TOOL_NOT_FOUND");
        assert!(outcomes[2].result.is_none());
        assert_eq!(outcomes[3].result, Some(serde_json::json!("LAST")));
    }

    #[tokio::test]
    async fn panicking_tool_becomes_recoverable_error() {
        let bus = EventBus::new();
        let events = collect_events(&bus, &[EventKind::ToolFailed]);
        let d = dispatcher(&bus);
        let calls = vec![
            Invocation::tool("echo", serde_json::json!({"text": "ok"})),
            Invocation::tool("crash", serde_json::json!({})),
        ];

        let outcomes = d.invoke_many(&calls, &DispatchScope::default()).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].result, Some(serde_json::json!("ok")));
        let error = outcomes[1].error.as_ref().unwrap();
        assert_eq!(error.code, "TOOL_PANICKED");
        assert!(error.recoverable);
        assert!(error.message.contains("tool bug"));
        assert_eq!(events.lock().unwrap().len(), 1);
        assert_eq!(d.history().len(), 2);
    }

    #[tokio::test]
    async fn invoke_many_on_empty_input() {
        let d = dispatcher(&EventBus::new());
        assert!(d.invoke_many(&[], &DispatchScope::default()).await.is_empty());
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let d = dispatcher(&EventBus::new()).with_history_limit(2);
        for text in ["a", "b", "c"] {
            d.invoke_tool("echo", serde_json::json!({"text": text}), &DispatchScope::default())
                .await
                .unwrap();
        }
        let history = d.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].input["text"], "b");
        assert_eq!(history[1].output, Some(serde_json::json!("c")));
        assert!(history[1].end_time >= history[1].start_time);

        d.clear_history();
        assert!(d.history().is_empty());
    }
}
