//! The top-level agent: lifecycle FSM, sessions, and the `chat` /
//! `think` / `execute_*` entry points.
//!
//! # Lifecycle
//!
//! ```text
//! IDLE ─► INITIALIZING ─► READY ─┬─► CHATTING  ─┐
//!   ▲                            ├─► THINKING  ─┼─► READY
//!   └── (health check fails)     └─► EXECUTING ─┘
//!        ─► ERROR ─► INITIALIZING ...
//! any ─► DESTROYING ─► DESTROYED (terminal)
//! ```
//!
//! Each transition publishes `state:changed {from, to}` before the call
//! that caused it returns. A call made while another entry point is
//! running fails with [`InvalidStateError::Busy`]; that guard is the only
//! concurrency control an agent needs.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use thinkloop_config::AppConfig;
use thinkloop_core::agent::AgentState;
use thinkloop_core::error::{Error, ExecutionError, InvalidStateError, ProviderError};
use thinkloop_core::event::{EventBus, EventKind, EventMetadata};
use thinkloop_core::memory::MemoryBackend;
use thinkloop_core::message::{Message, Role, Session};
use thinkloop_core::provider::{ChatRequest, ChatResponse, Provider};
use thinkloop_core::signal::AbortSignal;
use thinkloop_core::skill::{Skill, SkillRegistry, SkillResult};
use thinkloop_core::thinking::{StopReason, ThinkingResult};
use thinkloop_core::tool::{Tool, ToolRegistry};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{ContextWindowManager, TokenEstimator};
use crate::dispatcher::{DispatchScope, ToolInvocationDispatcher};
use crate::patterns::{PlanAdjuster, PlanContext, PlanExecution, PlanningCoordinator, ThinkContext, ThinkingEngine};

/// Assembles an [`AgentStateMachine`] from configuration and collaborators.
pub struct AgentBuilder {
    config: AppConfig,
    provider: Option<Arc<dyn Provider>>,
    tools: ToolRegistry,
    skills: SkillRegistry,
    memory: Option<Arc<dyn MemoryBackend>>,
    bus: Option<EventBus>,
    estimator: Option<Arc<dyn TokenEstimator>>,
    adjuster: Option<Arc<dyn PlanAdjuster>>,
    system_prompt: Option<String>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            provider: None,
            tools: ToolRegistry::new(),
            skills: SkillRegistry::new(),
            memory: None,
            bus: None,
            estimator: None,
            adjuster: None,
            system_prompt: None,
        }
    }

    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn skill(mut self, skill: Arc<dyn Skill>) -> Self {
        self.skills.register(skill);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn MemoryBackend>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Share an existing bus instead of creating one for this agent.
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn adjuster(mut self, adjuster: Arc<dyn PlanAdjuster>) -> Self {
        self.adjuster = Some(adjuster);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn build(self) -> Result<AgentStateMachine, Error> {
        self.config.validate()?;
        let provider = self.provider.ok_or_else(|| Error::Config {
            message: "an LLM provider is required".into(),
        })?;

        let config = self.config;
        let id = config
            .agent
            .id
            .clone()
            .unwrap_or_else(|| format!("agent-{}", Uuid::new_v4()));
        let bus = self.bus.unwrap_or_default();

        let mut dispatcher = ToolInvocationDispatcher::new(
            &id,
            Arc::new(self.tools),
            Arc::new(self.skills),
            Arc::clone(&provider),
            bus.clone(),
        )
        .with_history_limit(config.dispatch.history_limit);
        if let Some(memory) = &self.memory {
            dispatcher = dispatcher.with_memory(Arc::clone(memory));
        }

        let mut engine = ThinkingEngine::new(&id, Arc::clone(&provider), Arc::new(dispatcher), bus.clone())
            .with_model(config.agent.model.clone())
            .with_temperature(config.agent.temperature)
            .with_max_tokens(config.agent.max_tokens)
            .with_settings(config.thinking.clone())
            .with_window(ContextWindowManager::from_config(&config.context, self.estimator));
        if let Some(memory) = self.memory {
            engine = engine.with_memory(memory);
        }
        if let Some(prompt) = self.system_prompt {
            engine = engine.with_system_prompt(prompt);
        }
        let engine = Arc::new(engine);

        let mut coordinator = PlanningCoordinator::new(&id, Arc::clone(&engine), bus.clone())
            .with_max_adjustments(config.planning.max_adjustments);
        if let Some(adjuster) = self.adjuster {
            coordinator = coordinator.with_adjuster(adjuster);
        }

        debug!(agent_id = %id, model = %config.agent.model, "Agent built");

        Ok(AgentStateMachine {
            id,
            config,
            provider,
            bus,
            engine,
            coordinator,
            state: Mutex::new(AgentState::Idle),
            sessions: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
        })
    }
}

/// Counters since construction.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
    pub state: AgentState,
    pub requests: u64,
    pub failures: u64,
    pub total_tokens: u64,
    pub sessions: usize,
}

/// One entry point in flight.
struct Run {
    operation: &'static str,
    execution_id: String,
    signal: AbortSignal,
    meta: EventMetadata,
    started: Instant,
}

pub struct AgentStateMachine {
    id: String,
    config: AppConfig,
    provider: Arc<dyn Provider>,
    bus: EventBus,
    engine: Arc<ThinkingEngine>,
    coordinator: PlanningCoordinator,
    state: Mutex<AgentState>,
    sessions: Mutex<HashMap<String, Session>>,
    active: Mutex<Option<AbortSignal>>,
    requests: AtomicU64,
    failures: AtomicU64,
    total_tokens: AtomicU64,
}

impl AgentStateMachine {
    pub fn builder(config: AppConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn engine(&self) -> &Arc<ThinkingEngine> {
        &self.engine
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn metadata(&self) -> EventMetadata {
        EventMetadata::new(&self.id)
    }

    fn announce(&self, from: AgentState, to: AgentState) {
        debug!(agent_id = %self.id, %from, %to, "State changed");
        self.bus.publish(
            EventKind::StateChanged,
            serde_json::json!({ "from": from, "to": to }),
            self.metadata(),
        );
    }

    /// Move to `to` if the table allows it. Same-state moves are silent
    /// no-ops.
    fn transition(&self, to: AgentState) -> Result<(), InvalidStateError> {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let from = *state;
            if from == to {
                return Ok(());
            }
            if !from.can_transition_to(to) {
                return Err(InvalidStateError::IllegalTransition { from, to });
            }
            *state = to;
            from
        };
        self.announce(from, to);
        Ok(())
    }

    /// Atomically claim the agent for `operation`.
    fn try_enter(&self, operation: &str, busy: AgentState) -> Result<(), InvalidStateError> {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                AgentState::Ready => {}
                AgentState::Destroying | AgentState::Destroyed => {
                    return Err(InvalidStateError::Destroyed {
                        operation: operation.to_string(),
                    });
                }
                other => {
                    return Err(InvalidStateError::Busy {
                        operation: operation.to_string(),
                        state: other,
                    });
                }
            }
            *state = busy;
            AgentState::Ready
        };
        self.announce(from, busy);
        Ok(())
    }

    fn is_destroyed(&self) -> bool {
        matches!(self.state(), AgentState::Destroying | AgentState::Destroyed)
    }

    /// Health-check the provider and move to READY.
    ///
    /// A no-op when already READY. This is also how an agent leaves ERROR.
    pub async fn initialize(&self) -> Result<(), Error> {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                AgentState::Ready => return Ok(()),
                AgentState::Idle | AgentState::Error => {}
                AgentState::Destroying | AgentState::Destroyed => {
                    return Err(InvalidStateError::Destroyed {
                        operation: "initialize".into(),
                    }
                    .into());
                }
                other => {
                    return Err(InvalidStateError::Busy {
                        operation: "initialize".into(),
                        state: other,
                    }
                    .into());
                }
            }
            let from = *state;
            *state = AgentState::Initializing;
            from
        };
        self.announce(from, AgentState::Initializing);

        let failure = match self.provider.health_check().await {
            Ok(true) => None,
            Ok(false) => Some(Error::Provider(ProviderError::NotConfigured(format!(
                "{} failed its health check",
                self.provider.name()
            )))),
            Err(e) => Some(Error::Provider(e)),
        };

        if self.is_destroyed() {
            return Err(InvalidStateError::Destroyed {
                operation: "initialize".into(),
            }
            .into());
        }

        if let Some(error) = failure {
            warn!(agent_id = %self.id, "Initialization failed: {error}");
            if let Err(e) = self.transition(AgentState::Error) {
                debug!(agent_id = %self.id, "Could not enter ERROR: {e}");
            }
            self.bus.publish(
                EventKind::AgentError,
                serde_json::json!({ "operation": "initialize", "error": error.to_string() }),
                self.metadata(),
            );
            return Err(ExecutionError::new("initialize", error).into());
        }

        if let Err(e) = self.transition(AgentState::Ready) {
            if self.is_destroyed() {
                return Err(InvalidStateError::Destroyed {
                    operation: "initialize".into(),
                }
                .into());
            }
            return Err(e.into());
        }
        let dispatcher = self.engine.dispatcher();
        info!(agent_id = %self.id, provider = %self.provider.name(), "Agent initialized");
        self.bus.publish(
            EventKind::AgentInitialized,
            serde_json::json!({
                "name": self.config.agent.name,
                "model": self.engine.model(),
                "tools": dispatcher.tools().names(),
                "skills": dispatcher.skills().ids(),
            }),
            self.metadata(),
        );
        Ok(())
    }

    async fn begin(&self, operation: &'static str, busy: AgentState, session_id: Option<&str>) -> Result<Run, Error> {
        if self.state() == AgentState::Idle {
            self.initialize().await?;
        }
        self.try_enter(operation, busy)?;

        let signal = AbortSignal::new();
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(signal.clone());
        self.requests.fetch_add(1, Ordering::Relaxed);

        let execution_id = Uuid::new_v4().to_string();
        let mut meta = self.metadata().with_execution(&execution_id);
        meta.session_id = session_id.map(str::to_string);

        debug!(agent_id = %self.id, execution_id = %execution_id, operation, "Execution started");
        self.bus.publish(
            EventKind::ExecutionStarted,
            serde_json::json!({ "operation": operation }),
            meta.clone(),
        );

        Ok(Run {
            operation,
            execution_id,
            signal,
            meta,
            started: Instant::now(),
        })
    }

    fn release(&self) {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn destroyed_during(&self, run: &Run) -> Error {
        InvalidStateError::Destroyed {
            operation: run.operation.to_string(),
        }
        .into()
    }

    /// Back to READY and announce completion.
    fn succeed(&self, run: &Run) -> Result<(), Error> {
        self.release();
        if self.transition(AgentState::Ready).is_err() {
            return Err(self.destroyed_during(run));
        }
        self.bus.publish(
            EventKind::ExecutionCompleted,
            serde_json::json!({
                "operation": run.operation,
                "durationMs": run.started.elapsed().as_millis() as u64,
            }),
            run.meta.clone(),
        );
        Ok(())
    }

    /// Uncaught failure: move to ERROR and wrap.
    fn fail(&self, run: &Run, error: Error) -> Error {
        self.release();
        self.failures.fetch_add(1, Ordering::Relaxed);
        if self.is_destroyed() {
            return self.destroyed_during(run);
        }

        warn!(agent_id = %self.id, operation = run.operation, "Execution failed: {error}");
        if let Err(e) = self.transition(AgentState::Error) {
            debug!(agent_id = %self.id, operation = run.operation, "Could not enter ERROR: {e}");
        }
        let payload = serde_json::json!({ "operation": run.operation, "error": error.to_string() });
        self.bus.publish(EventKind::AgentError, payload.clone(), run.meta.clone());
        self.bus.publish(EventKind::ExecutionFailed, payload, run.meta.clone());
        ExecutionError::new(run.operation, error).into()
    }

    /// Recoverable failure: back to READY, hand the error to the caller.
    fn recover(&self, run: &Run, error: Error) -> Error {
        self.release();
        self.failures.fetch_add(1, Ordering::Relaxed);
        if self.transition(AgentState::Ready).is_err() {
            return self.destroyed_during(run);
        }
        self.bus.publish(
            EventKind::ExecutionFailed,
            serde_json::json!({
                "operation": run.operation,
                "error": error.to_string(),
                "recoverable": true,
            }),
            run.meta.clone(),
        );
        error
    }

    /// One chat turn.
    ///
    /// The last user message is the input; the session's stored history
    /// plus any earlier request messages form the context. Only that user
    /// message and the reply are appended to the session.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, Error> {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| self.config.agent.default_session.clone());
        let Some(pos) = request.messages.iter().rposition(|m| m.role == Role::User) else {
            return Err(Error::InvalidRequest("chat request has no user message".into()));
        };

        let run = self.begin("chat", AgentState::Chatting, Some(&session_id)).await?;
        self.bus.publish(
            EventKind::ChatStarted,
            serde_json::json!({ "sessionId": session_id, "messages": request.messages.len() }),
            run.meta.clone(),
        );

        let user_message = request.messages[pos].clone();
        let mut history = self.session(&session_id).map(|s| s.messages().to_vec()).unwrap_or_default();
        history.extend_from_slice(&request.messages[..pos]);

        let ctx = ThinkContext {
            session_id: Some(session_id.clone()),
            execution_id: Some(run.execution_id.clone()),
            history,
            max_steps: None,
            model: request.model.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            persist_turn: true,
            signal: Some(run.signal.clone()),
        };

        let result = match self.engine.think(&user_message.text(), ctx).await {
            Ok(result) => result,
            Err(e) => return Err(self.fail(&run, e)),
        };
        if self.is_destroyed() {
            self.release();
            return Err(self.destroyed_during(&run));
        }
        self.total_tokens
            .fetch_add(u64::from(result.usage.total_tokens), Ordering::Relaxed);

        let reply = reply_message(&result);
        if result.stop_reason != StopReason::Aborted {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            let session = sessions
                .entry(session_id.clone())
                .or_insert_with(|| Session::new(session_id.clone()));
            session.push(user_message);
            session.push(reply.clone());
        }

        let model = request.model.unwrap_or_else(|| self.engine.model().to_string());
        let response = ChatResponse::new(model, reply, result.stop_reason.finish_reason(), result.usage);

        self.succeed(&run)?;
        info!(
            agent_id = %self.id,
            session_id = %session_id,
            steps = result.total_steps,
            "Chat turn completed"
        );
        self.bus.publish(
            EventKind::ChatCompleted,
            serde_json::json!({
                "sessionId": session_id,
                "responseId": response.id,
                "finishReason": result.stop_reason.finish_reason(),
                "usage": response.usage,
            }),
            run.meta.clone(),
        );
        Ok(response)
    }

    /// Run one reasoning episode outside any session.
    pub async fn think(&self, input: &str, mut ctx: ThinkContext) -> Result<ThinkingResult, Error> {
        let run = self.begin("think", AgentState::Thinking, ctx.session_id.as_deref()).await?;
        ctx.execution_id = Some(run.execution_id.clone());
        ctx.signal = Some(run.signal.clone());

        match self.engine.think(input, ctx).await {
            Ok(result) => {
                self.total_tokens
                    .fetch_add(u64::from(result.usage.total_tokens), Ordering::Relaxed);
                self.succeed(&run)?;
                Ok(result)
            }
            Err(e) => Err(self.fail(&run, e)),
        }
    }

    /// Invoke one skill directly.
    ///
    /// A recoverable skill error returns the agent to READY and is handed
    /// back as [`Error::Skill`]; anything else moves the agent to ERROR.
    pub async fn execute_skill(
        &self,
        id: &str,
        input: serde_json::Value,
        session_id: Option<&str>,
    ) -> Result<SkillResult, Error> {
        let run = self.begin("execute_skill", AgentState::Executing, session_id).await?;
        let scope = DispatchScope {
            session_id: session_id.map(str::to_string),
            signal: Some(run.signal.clone()),
        };

        match self.engine.dispatcher().invoke_skill(id, input, &scope).await {
            Ok(result) => {
                self.succeed(&run)?;
                Ok(result)
            }
            Err(e) if e.is_recoverable() => Err(self.recover(&run, e.into())),
            Err(e) => Err(self.fail(&run, e.into())),
        }
    }

    /// Plan and execute a goal.
    ///
    /// A failed plan is not an error: it comes back with `success: false`
    /// and its partial step trace.
    pub async fn execute_goal(&self, goal: &str, session_id: Option<&str>) -> Result<PlanExecution, Error> {
        if goal.trim().is_empty() {
            return Err(Error::InvalidRequest("goal must not be empty".into()));
        }
        let run = self.begin("execute", AgentState::Executing, session_id).await?;
        let ctx = PlanContext {
            session_id: session_id.map(str::to_string),
            execution_id: Some(run.execution_id.clone()),
            signal: Some(run.signal.clone()),
        };

        let plan = match self.coordinator.create_plan(goal, &ctx) {
            Ok(plan) => plan,
            Err(e) => return Err(self.fail(&run, e)),
        };
        let execution = self.coordinator.execute_plan(plan, &ctx).await;
        self.succeed(&run)?;
        Ok(execution)
    }

    /// Signal the running entry point to stop at its next checkpoint.
    pub fn abort(&self) {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(signal) = active.as_ref() {
            info!(agent_id = %self.id, "Abort requested");
            signal.abort();
        }
    }

    /// Abort in-flight work, drop sessions, and move to DESTROYED.
    /// Idempotent. A shared bus is left as is.
    pub fn destroy(&self) {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, AgentState::Destroying | AgentState::Destroyed) {
                return;
            }
            let from = *state;
            *state = AgentState::Destroying;
            from
        };
        self.announce(from, AgentState::Destroying);

        self.abort();
        self.engine.abort();
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).clear();

        if let Err(e) = self.transition(AgentState::Destroyed) {
            warn!(agent_id = %self.id, "Unexpected state during destroy: {e}");
        }
        info!(agent_id = %self.id, "Agent destroyed");
        self.bus.publish(EventKind::AgentDestroyed, serde_json::json!({}), self.metadata());
    }

    /// A copy of a session's history.
    pub fn session(&self, id: &str) -> Option<Session> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Returns whether the session existed.
    pub fn clear_session(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            state: self.state(),
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            sessions: self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }
}

fn reply_message(result: &ThinkingResult) -> Message {
    let mut reply = Message::assistant(result.answer.clone());
    reply
        .metadata
        .insert("steps".into(), serde_json::json!(result.total_steps));
    if !result.tools_used.is_empty() {
        reply
            .metadata
            .insert("toolsUsed".into(), serde_json::json!(result.tools_used));
    }
    if let Some(error) = &result.error {
        reply.metadata.insert("error".into(), serde_json::json!(error));
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::test_helpers::{
        EchoTool, FailingTool, ScriptedProvider, SlowTool, UpperSkill, collect_events, count_kind, finish_reply,
        tool_reply,
    };
    use std::time::Duration;
    use thinkloop_config::ThinkingSection;
    use thinkloop_core::provider::FinishReason;

    fn config(max_steps: u32) -> AppConfig {
        AppConfig {
            thinking: ThinkingSection {
                max_steps,
                ..ThinkingSection::default()
            },
            ..AppConfig::default()
        }
    }

    fn agent(provider: ScriptedProvider, max_steps: u32) -> AgentStateMachine {
        AgentBuilder::new(config(max_steps))
            .provider(Arc::new(provider))
            .tool(Arc::new(EchoTool))
            .tool(Arc::new(FailingTool::recoverable("X")))
            .tool(Arc::new(SlowTool::new(Duration::from_millis(200))))
            .skill(Arc::new(UpperSkill))
            .build()
            .unwrap()
    }

    fn transitions(events: &Arc<Mutex<Vec<thinkloop_core::UnifiedEvent>>>) -> Vec<(String, String)> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == EventKind::StateChanged)
            .map(|e| {
                (
                    e.payload["from"].as_str().unwrap().to_string(),
                    e.payload["to"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn build_requires_a_provider() {
        let err = AgentBuilder::new(AppConfig::default()).build().err().unwrap();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn build_validates_config() {
        let mut bad = AppConfig::default();
        bad.thinking.max_steps = 0;
        let err = AgentBuilder::new(bad)
            .provider(Arc::new(ScriptedProvider::new(vec![])))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn configured_id_is_used() {
        let mut cfg = AppConfig::default();
        cfg.agent.id = Some("agent-7".into());
        let agent = AgentBuilder::new(cfg)
            .provider(Arc::new(ScriptedProvider::new(vec![])))
            .build()
            .unwrap();
        assert_eq!(agent.id(), "agent-7");
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn lifecycle_emits_exact_transition_path() {
        let agent = agent(ScriptedProvider::new(vec![finish_reply("4")]), 1);
        let events = collect_events(agent.bus(), &[EventKind::StateChanged]);

        agent.initialize().await.unwrap();
        agent.initialize().await.unwrap(); // no-op
        agent.chat(ChatRequest::user("2+2?")).await.unwrap();
        agent.destroy();
        agent.destroy(); // no-op

        let expected: Vec<(String, String)> = [
            ("idle", "initializing"),
            ("initializing", "ready"),
            ("ready", "chatting"),
            ("chatting", "ready"),
            ("ready", "destroying"),
            ("destroying", "destroyed"),
        ]
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect();
        assert_eq!(transitions(&events), expected);
        assert_eq!(agent.state(), AgentState::Destroyed);
    }

    #[tokio::test]
    async fn chat_answers_and_records_session() {
        let agent = agent(ScriptedProvider::new(vec![finish_reply("4")]), 1);
        let events = collect_events(agent.bus(), &[EventKind::ThinkingStep, EventKind::ExecutionCompleted]);

        let response = agent.chat(ChatRequest::user("2+2?")).await.unwrap();
        assert_eq!(response.content(), "4");
        assert_eq!(response.object, "chat.completion");
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(count_kind(&events, EventKind::ThinkingStep), 1);
        assert_eq!(count_kind(&events, EventKind::ExecutionCompleted), 1);

        let session = agent.session("default").unwrap();
        let roles: Vec<_> = session.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(agent.stats().total_tokens, 15);
    }

    #[tokio::test]
    async fn second_turn_sees_first_turn() {
        let provider = Arc::new(ScriptedProvider::new(vec![finish_reply("hello Ada"), finish_reply("Ada")]));
        let agent = AgentBuilder::new(config(1))
            .provider(provider.clone())
            .build()
            .unwrap();

        agent
            .chat(ChatRequest::user("I am Ada").with_session("s1"))
            .await
            .unwrap();
        agent
            .chat(ChatRequest::user("Who am I?").with_session("s1"))
            .await
            .unwrap();

        let second = &provider.requests()[1];
        let texts: Vec<String> = second.messages.iter().map(Message::text).collect();
        assert!(texts.contains(&"I am Ada".to_string()));
        assert!(texts.contains(&"hello Ada".to_string()));
        assert_eq!(agent.session("s1").unwrap().len(), 4);
        assert_eq!(agent.session_ids(), vec!["s1"]);
        assert!(agent.clear_session("s1"));
        assert!(agent.session("s1").is_none());
    }

    #[tokio::test]
    async fn chat_without_user_message_is_rejected_up_front() {
        let agent = agent(ScriptedProvider::new(vec![]), 1);
        let request = ChatRequest {
            messages: vec![Message::system("be brief")],
            ..ChatRequest::default()
        };
        let err = agent.chat(request).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn llm_failure_moves_to_error_and_initialize_recovers() {
        let agent = agent(ScriptedProvider::new(vec![]), 2);
        let events = collect_events(agent.bus(), &[EventKind::ExecutionFailed, EventKind::AgentError]);

        let err = agent.chat(ChatRequest::user("hi")).await.unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
        assert_eq!(agent.state(), AgentState::Error);
        assert_eq!(count_kind(&events, EventKind::AgentError), 1);
        assert_eq!(count_kind(&events, EventKind::ExecutionFailed), 1);

        let err = agent.chat(ChatRequest::user("again")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(InvalidStateError::Busy { .. })));

        agent.initialize().await.unwrap();
        assert_eq!(agent.state(), AgentState::Ready);
        assert_eq!(agent.stats().failures, 1);
    }

    #[tokio::test]
    async fn unhealthy_provider_fails_initialization() {
        let agent = agent(ScriptedProvider::new(vec![]).unhealthy(), 1);
        let err = agent.initialize().await.unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
        assert_eq!(agent.state(), AgentState::Error);
    }

    #[tokio::test]
    async fn concurrent_entry_is_rejected() {
        let agent = Arc::new(agent(
            ScriptedProvider::new(vec![finish_reply("slow")]).with_delay(Duration::from_millis(100)),
            1,
        ));
        agent.initialize().await.unwrap();

        let runner = Arc::clone(&agent);
        let handle = tokio::spawn(async move { runner.chat(ChatRequest::user("first")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = agent.think("second", ThinkContext::default()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState(InvalidStateError::Busy {
                state: AgentState::Chatting,
                ..
            })
        ));
        assert_eq!(handle.await.unwrap().unwrap().content(), "slow");
        assert_eq!(agent.state(), AgentState::Ready);
    }

    #[tokio::test]
    async fn abort_mid_chat_returns_aborted_response() {
        let agent = Arc::new(agent(
            ScriptedProvider::new(vec![tool_reply("slow", serde_json::json!({"text": "x"}))]),
            5,
        ));
        let runner = Arc::clone(&agent);
        let handle = tokio::spawn(async move { runner.chat(ChatRequest::user("go")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent.abort();

        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Aborted));
        assert_eq!(agent.state(), AgentState::Ready);
        assert!(agent.session("default").is_none());
    }

    #[tokio::test]
    async fn destroy_mid_chat_fails_the_call() {
        let agent = Arc::new(agent(
            ScriptedProvider::new(vec![finish_reply("late")]).with_delay(Duration::from_millis(200)),
            1,
        ));
        let runner = Arc::clone(&agent);
        let handle = tokio::spawn(async move { runner.chat(ChatRequest::user("go")).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        agent.destroy();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::InvalidState(InvalidStateError::Destroyed { .. })));
        assert_eq!(agent.state(), AgentState::Destroyed);
        assert!(agent.session_ids().is_empty());

        let err = agent.chat(ChatRequest::user("again")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(InvalidStateError::Destroyed { .. })));
    }

    #[tokio::test]
    async fn destroy_during_initialize_reports_destroyed() {
        let agent = Arc::new(agent(
            ScriptedProvider::new(vec![]).with_health_delay(Duration::from_millis(100)),
            1,
        ));
        let runner = Arc::clone(&agent);
        let handle = tokio::spawn(async move { runner.initialize().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        agent.destroy();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::InvalidState(InvalidStateError::Destroyed { .. })));
        assert_eq!(agent.state(), AgentState::Destroyed);
    }

    #[tokio::test]
    async fn panicking_state_observer_does_not_wedge_the_agent() {
        let agent = agent(ScriptedProvider::new(vec![finish_reply("4"), finish_reply("4")]), 1);
        agent.bus().subscribe(&[EventKind::StateChanged], |event| {
            if event.payload["to"] == "chatting" {
                panic!("observer bug");
            }
        });

        let response = agent.chat(ChatRequest::user("2+2?")).await.unwrap();
        assert_eq!(response.content(), "4");
        assert_eq!(agent.state(), AgentState::Ready);

        agent.chat(ChatRequest::user("2+2?")).await.unwrap();
        assert_eq!(agent.state(), AgentState::Ready);
        assert!(agent.bus().stats().handler_failures >= 2);
    }

    #[tokio::test]
    async fn think_entry_point() {
        let agent = agent(ScriptedProvider::new(vec![finish_reply("42")]), 2);
        let result = agent.think("meaning?", ThinkContext::default()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.answer, "42");
        assert_eq!(agent.state(), AgentState::Ready);
        assert_eq!(agent.stats().requests, 1);
    }

    #[tokio::test]
    async fn execute_skill_success_and_recoverable_failure() {
        let agent = agent(ScriptedProvider::new(vec![]), 1);

        let result = agent
            .execute_skill("upper", serde_json::json!({"text": "abc"}), Some("s9"))
            .await
            .unwrap();
        assert_eq!(result.data, Some(serde_json::json!("ABC")));
        assert_eq!(result.metadata["session"], "s9");

        let err = agent
            .execute_skill("upper", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Skill(_)));
        assert_eq!(agent.state(), AgentState::Ready);
    }

    #[tokio::test]
    async fn execute_goal_runs_a_plan() {
        let agent = agent(ScriptedProvider::new(vec![finish_reply("done")]), 2);
        let events = collect_events(agent.bus(), &[EventKind::PlanCreated, EventKind::PlanCompleted]);

        let run = agent.execute_goal("echo the greeting then wrap up", None).await.unwrap();
        assert!(run.success);
        assert_eq!(run.steps.len(), 2);
        assert_eq!(run.output, Some(serde_json::json!("done")));
        assert_eq!(agent.state(), AgentState::Ready);
        assert_eq!(count_kind(&events, EventKind::PlanCreated), 1);
        assert_eq!(count_kind(&events, EventKind::PlanCompleted), 1);

        let err = agent.execute_goal("  ", None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn shared_bus_survives_destroy() {
        let bus = EventBus::new();
        let seen = collect_events(&bus, &[EventKind::AgentDestroyed]);
        let agent = AgentBuilder::new(AppConfig::default())
            .provider(Arc::new(ScriptedProvider::new(vec![])))
            .event_bus(bus.clone())
            .build()
            .unwrap();
        agent.destroy();

        assert_eq!(count_kind(&seen, EventKind::AgentDestroyed), 1);
        assert_eq!(bus.stats().subscriptions, 1);
    }
}
