//! ReAct pattern: Thought → Action → Observation, one bounded episode at
//! a time.
//!
//! Each step asks the LLM for a thought and one or more actions, dispatches
//! the actions, and records the observation. The episode ends on a
//! `finish` action, when `max_steps` is exhausted, when a tool or skill
//! fails non-recoverably, or when it is aborted.
//!
//! # Cancellation
//!
//! `abort()` is cooperative. LLM calls and dispatches run as detached
//! tasks raced against the episode's [`AbortSignal`]: on abort the engine
//! stops waiting and discards whatever those tasks later produce, but
//! does not cancel them. The loop also checks the signal between steps.

use chrono::Utc;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;
use thinkloop_config::{ContextSection, ThinkingSection};
use thinkloop_core::error::{Error, ErrorDetail};
use thinkloop_core::event::{EventBus, EventKind, EventMetadata};
use thinkloop_core::memory::{MemoryBackend, MemoryEntry, MemoryKind};
use thinkloop_core::message::Message;
use thinkloop_core::provider::{ChatRequest, ChatResponse, Provider, ToolDefinition, Usage};
use thinkloop_core::signal::AbortSignal;
use thinkloop_core::thinking::{Action, ActionType, StopReason, ThinkingResult, ThinkingStep};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{ContextWindowManager, TokenEstimator, WorkingMemory};
use crate::dispatcher::{DispatchScope, Invocation, InvocationOutcome, ToolInvocationDispatcher};
use crate::patterns::decision::parse_decision;
use crate::stream_event::ThinkingEvent;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a careful assistant. Work through the task step by step, \
using the available tools and skills when they help.";

const RESPONSE_FORMAT: &str = r#"## Response Format
Reply with one JSON object:
{"thought": "<your reasoning>", "action": {"type": "tool" | "skill" | "think" | "finish", "name": "<tool or skill>", "parameters": {...}}}
Use "actions": [...] instead of "action" to propose several independent calls in one step.
When you know the final answer reply with {"thought": "...", "action": {"type": "finish", "parameters": {"answer": "<answer>"}}}."#;

const REFLECTION_PROMPT: &str = "Review the reasoning trace below. List short, concrete insights about \
how the task was approached, one per line.";

/// Per-call options for [`ThinkingEngine::think`].
#[derive(Debug, Clone, Default)]
pub struct ThinkContext {
    pub session_id: Option<String>,
    pub execution_id: Option<String>,

    /// Prior conversation, oldest first; window-managed with the input
    pub history: Vec<Message>,

    /// Overrides the configured `max_steps`
    pub max_steps: Option<u32>,

    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,

    /// Store the finished turn in memory (chat turns only)
    pub persist_turn: bool,

    /// Use this signal instead of a fresh one, so a caller can abort
    /// several episodes together
    pub signal: Option<AbortSignal>,
}

/// Drives one reasoning episode to completion or abort.
pub struct ThinkingEngine {
    agent_id: String,
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    system_prompt: String,
    settings: ThinkingSection,
    window: ContextWindowManager,
    dispatcher: Arc<ToolInvocationDispatcher>,
    memory: Option<Arc<dyn MemoryBackend>>,
    bus: EventBus,
    current: Mutex<Option<AbortSignal>>,
}

/// What one action produced.
#[derive(Debug, Clone)]
struct ActionOutcome {
    name: String,
    dispatched: bool,
    observation: String,
    error: Option<ErrorDetail>,
}

impl ActionOutcome {
    fn local(name: &str, observation: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            dispatched: false,
            observation: observation.into(),
            error: None,
        }
    }

    fn rejected(name: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            name: name.to_string(),
            dispatched: false,
            observation: format!("Error: {reason}"),
            error: Some(ErrorDetail::new("INVALID_ACTION", reason, true)),
        }
    }

    fn halts(&self) -> bool {
        self.error.as_ref().is_some_and(|e| !e.recoverable)
    }
}

impl From<InvocationOutcome> for ActionOutcome {
    fn from(outcome: InvocationOutcome) -> Self {
        let observation = match (&outcome.result, &outcome.error) {
            (_, Some(error)) => format!("Error: {}", error.message),
            (Some(value), None) => render_value(value),
            (None, None) => render_value(&serde_json::Value::Null),
        };
        Self {
            name: outcome.name,
            dispatched: true,
            observation,
            error: outcome.error,
        }
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "(no output)".into(),
        other => other.to_string(),
    }
}

/// Sends stream events; a dropped receiver aborts the episode.
struct Emitter {
    tx: Option<mpsc::Sender<ThinkingEvent>>,
    signal: AbortSignal,
}

impl Emitter {
    async fn send(&self, event: ThinkingEvent) {
        if let Some(tx) = &self.tx
            && tx.send(event).await.is_err()
        {
            debug!("Thinking stream receiver dropped; aborting episode");
            self.signal.abort();
        }
    }
}

/// Run `fut` as a detached task and wait for it unless `signal` fires
/// first. `Ok(None)` means aborted; the task keeps running unobserved.
async fn detached<T, F>(signal: &AbortSignal, fut: F) -> Result<Option<T>, Error>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    if signal.is_aborted() {
        return Ok(None);
    }
    let handle = tokio::spawn(fut);
    tokio::select! {
        biased;
        _ = signal.aborted() => Ok(None),
        joined = handle => joined
            .map(Some)
            .map_err(|e| Error::Internal(format!("detached task failed: {e}"))),
    }
}

impl ThinkingEngine {
    pub fn new(
        agent_id: impl Into<String>,
        provider: Arc<dyn Provider>,
        dispatcher: Arc<ToolInvocationDispatcher>,
        bus: EventBus,
    ) -> Self {
        let agent = thinkloop_config::AgentSection::default();
        Self {
            agent_id: agent_id.into(),
            provider,
            model: agent.model,
            temperature: agent.temperature,
            max_tokens: agent.max_tokens,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            settings: ThinkingSection::default(),
            window: ContextWindowManager::from_config(&ContextSection::default(), None),
            dispatcher,
            memory: None,
            bus,
            current: Mutex::new(None),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Max tokens per LLM completion.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_settings(mut self, settings: ThinkingSection) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_window(mut self, window: ContextWindowManager) -> Self {
        self.window = window;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryBackend>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn settings(&self) -> &ThinkingSection {
        &self.settings
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn window(&self) -> &ContextWindowManager {
        &self.window
    }

    pub fn dispatcher(&self) -> &Arc<ToolInvocationDispatcher> {
        &self.dispatcher
    }

    /// Ask the running episode to stop at its next checkpoint. Harmless
    /// when nothing is running.
    pub fn abort(&self) {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(signal) = current.as_ref() {
            info!(agent_id = %self.agent_id, "Abort requested");
            signal.abort();
        }
    }

    fn install(&self, signal: Option<AbortSignal>) -> AbortSignal {
        let signal = signal.unwrap_or_default();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(signal.clone());
        signal
    }

    /// Run one episode and return its result.
    ///
    /// Tool and skill failures become observations. Only an engine-level
    /// failure, such as the LLM call itself failing, is returned as `Err`.
    pub async fn think(&self, input: &str, mut ctx: ThinkContext) -> Result<ThinkingResult, Error> {
        let signal = self.install(ctx.signal.take());
        self.run(input, ctx, signal, None).await
    }

    /// Run one episode on a background task, yielding events as it goes.
    ///
    /// Dropping or cancelling the returned stream aborts the episode.
    pub fn think_stream(self: &Arc<Self>, input: impl Into<String>, mut ctx: ThinkContext) -> ThinkingStream {
        let (tx, rx) = mpsc::channel(64);
        let signal = self.install(ctx.signal.take());
        let engine = Arc::clone(self);
        let input = input.into();
        let task_signal = signal.clone();

        tokio::spawn(async move {
            if let Err(e) = engine.run(&input, ctx, task_signal, Some(tx)).await {
                debug!(error = %e, "Streamed episode failed");
            }
        });

        ThinkingStream {
            inner: ReceiverStream::new(rx),
            signal,
        }
    }

    async fn run(
        &self,
        input: &str,
        ctx: ThinkContext,
        signal: AbortSignal,
        tx: Option<mpsc::Sender<ThinkingEvent>>,
    ) -> Result<ThinkingResult, Error> {
        let started = Instant::now();
        let execution_id = ctx
            .execution_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut meta = EventMetadata::new(&self.agent_id).with_execution(&execution_id);
        meta.session_id = ctx.session_id.clone();

        let max_steps = ctx.max_steps.unwrap_or(self.settings.max_steps).max(1);
        let scope = DispatchScope {
            session_id: ctx.session_id.clone(),
            signal: Some(signal.clone()),
        };
        let emitter = Emitter {
            tx,
            signal: signal.clone(),
        };

        info!(agent_id = %self.agent_id, execution_id = %execution_id, max_steps, "Thinking started");
        self.bus.publish(
            EventKind::ThinkingStarted,
            serde_json::json!({ "input": input, "maxSteps": max_steps }),
            meta.clone(),
        );

        let mut wm = WorkingMemory::new(max_steps);
        let mut usage = Usage::default();
        let mut stop = StopReason::MaxSteps;
        let mut answer = None;
        let mut halt_error = None;

        while wm.tick() {
            let step = wm.iterations;
            if signal.is_aborted() {
                stop = StopReason::Aborted;
                break;
            }
            let step_started = Instant::now();

            // ── Ask the LLM ──
            let request = self.build_request(input, &ctx, &wm);
            let prompt_estimate = self.window.estimate(&request.messages);
            let provider = Arc::clone(&self.provider);
            let response = match detached(&signal, async move { provider.complete(request).await }).await {
                Ok(None) => {
                    stop = StopReason::Aborted;
                    break;
                }
                Ok(Some(Ok(response))) => response,
                Ok(Some(Err(e))) => return Err(self.engine_failure(Error::Provider(e), step, &meta, &emitter).await),
                Err(e) => return Err(self.engine_failure(e, step, &meta, &emitter).await),
            };

            let reply = response
                .message()
                .cloned()
                .unwrap_or_else(|| Message::assistant(""));
            usage.add(&self.usage_of(&response, prompt_estimate, &reply));

            let decision = parse_decision(&reply, self.dispatcher.tools(), self.dispatcher.skills());
            debug!(step, actions = decision.actions.len(), "Decision parsed");

            emitter
                .send(ThinkingEvent::Thought {
                    step,
                    content: decision.thought.clone(),
                })
                .await;
            emitter
                .send(ThinkingEvent::Actions {
                    step,
                    actions: decision.actions.clone(),
                })
                .await;

            // ── Act ──
            let finish_at = decision
                .actions
                .iter()
                .position(|a| a.action_type == ActionType::Finish);
            let to_run = &decision.actions[..finish_at.unwrap_or(decision.actions.len())];

            let outcomes = match self.act(to_run, &decision.thought, &scope, &signal).await {
                Ok(Some(outcomes)) => outcomes,
                Ok(None) => {
                    stop = StopReason::Aborted;
                    break;
                }
                Err(e) => return Err(self.engine_failure(e, step, &meta, &emitter).await),
            };

            // Results that resolve after an abort are discarded.
            if signal.is_aborted() {
                stop = StopReason::Aborted;
                break;
            }

            for outcome in outcomes.iter().filter(|o| o.dispatched) {
                wm.note_used(&outcome.name);
            }

            let finish_answer = finish_at.map(|i| {
                decision.actions[i]
                    .answer()
                    .map(str::to_string)
                    .unwrap_or_else(|| decision.thought.clone())
            });

            // ── Observe ──
            let observation = if outcomes.is_empty() {
                finish_answer.clone().unwrap_or_default()
            } else {
                emitter
                    .send(ThinkingEvent::Observations {
                        step,
                        observations: outcomes.iter().map(|o| o.observation.clone()).collect(),
                    })
                    .await;
                combine(&outcomes)
            };

            let mut actions = decision.actions.into_iter();
            let record = ThinkingStep {
                step,
                thought: decision.thought,
                action: actions.next().unwrap_or_else(|| Action::think("")),
                extra_actions: actions.collect(),
                observation,
                duration_ms: step_started.elapsed().as_millis() as u64,
            };
            self.bus.publish(
                EventKind::ThinkingStep,
                serde_json::to_value(&record).unwrap_or_default(),
                meta.clone(),
            );
            wm.record(record);

            if let Some(fatal) = outcomes.iter().find(|o| o.halts()) {
                let message = fatal
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                warn!(step, name = %fatal.name, "Non-recoverable failure; halting episode: {message}");
                halt_error = Some(format!("{} failed: {message}", fatal.name));
                stop = StopReason::Halted;
                break;
            }

            if let Some(final_answer) = finish_answer {
                answer = Some(final_answer);
                stop = StopReason::Finished;
                break;
            }
        }

        // ── Reflect ──
        let reflections = if self.settings.enable_reflection
            && matches!(stop, StopReason::Finished | StopReason::MaxSteps)
            && !wm.is_empty()
        {
            self.reflect(input, &wm, &signal, &meta, &mut usage).await
        } else {
            Vec::new()
        };

        let success = stop == StopReason::Finished;
        let error = match stop {
            StopReason::Finished => None,
            StopReason::MaxSteps => Some(format!("no final answer after {max_steps} steps")),
            StopReason::Aborted => Some("aborted".to_string()),
            StopReason::Halted => halt_error,
        };
        let answer = match stop {
            StopReason::Finished => answer.unwrap_or_default(),
            StopReason::MaxSteps => format!(
                "I reached the limit of {max_steps} reasoning steps without a final answer. \
                 Last observation: {}",
                wm.last_observation().unwrap_or("none")
            ),
            StopReason::Aborted | StopReason::Halted => String::new(),
        };
        let total_duration_ms = started.elapsed().as_millis() as u64;

        let result = ThinkingResult {
            success,
            answer,
            total_steps: wm.steps.len() as u32,
            steps: wm.steps,
            total_duration_ms,
            tools_used: wm.tools_used,
            reflections,
            error,
            stop_reason: stop,
            usage,
        };

        if stop == StopReason::Aborted {
            info!(agent_id = %self.agent_id, steps = result.total_steps, "Thinking aborted");
            self.bus.publish(
                EventKind::ThinkingAborted,
                serde_json::json!({ "steps": result.total_steps, "durationMs": total_duration_ms }),
                meta.clone(),
            );
        } else {
            info!(
                agent_id = %self.agent_id,
                success,
                steps = result.total_steps,
                stop_reason = ?stop,
                "Thinking completed"
            );
            self.bus.publish(
                EventKind::ThinkingCompleted,
                serde_json::json!({
                    "success": success,
                    "totalSteps": result.total_steps,
                    "stopReason": stop,
                    "toolsUsed": result.tools_used,
                    "durationMs": total_duration_ms,
                }),
                meta,
            );
        }

        if success && ctx.persist_turn {
            self.persist_turn(input, &result, ctx.session_id.as_deref()).await;
        }

        emitter
            .send(ThinkingEvent::Complete {
                result: Box::new(result.clone()),
            })
            .await;

        Ok(result)
    }

    /// Dispatch the step's actions on a detached task.
    async fn act(
        &self,
        actions: &[Action],
        thought: &str,
        scope: &DispatchScope,
        signal: &AbortSignal,
    ) -> Result<Option<Vec<ActionOutcome>>, Error> {
        if actions.is_empty() {
            return Ok(Some(Vec::new()));
        }
        let dispatcher = Arc::clone(&self.dispatcher);
        let actions = actions.to_vec();
        let thought = thought.to_string();
        let scope = scope.clone();
        let parallel = self.settings.enable_parallel_tools;

        detached(signal, async move {
            if parallel && actions.len() > 1 {
                perform_parallel(&dispatcher, &actions, &thought, &scope).await
            } else {
                perform_sequential(&dispatcher, &actions, &thought, &scope).await
            }
        })
        .await
    }

    fn build_request(&self, input: &str, ctx: &ThinkContext, wm: &WorkingMemory) -> ChatRequest {
        let system = Message::system(self.system_text());

        let mut conversation = ctx.history.clone();
        conversation.push(Message::user(input));
        if !wm.is_empty() {
            conversation.push(Message::user(format!("{}\nDecide the next step.", wm.render())));
        }

        let budget = self
            .window
            .budget()
            .saturating_sub(self.window.estimator().estimate_message(&system));
        let mut messages = vec![system];
        messages.extend(self.window.fit(&conversation, budget));

        ChatRequest {
            messages,
            model: Some(ctx.model.clone().unwrap_or_else(|| self.model.clone())),
            stream: false,
            temperature: Some(ctx.temperature.unwrap_or(self.temperature)),
            max_tokens: Some(ctx.max_tokens.unwrap_or(self.max_tokens)),
            tools: self.tool_definitions(),
            session_id: ctx.session_id.clone(),
        }
    }

    fn system_text(&self) -> String {
        let mut out = self.system_prompt.clone();
        let tools = self.dispatcher.tools();
        let skills = self.dispatcher.skills();

        if !tools.is_empty() {
            out.push_str("\n\n## Tools\n");
            for def in tools.definitions() {
                out.push_str(&format!("- {}: {}\n", def.name, def.description));
            }
        }
        if !skills.is_empty() {
            out.push_str("\n## Skills\n");
            for (id, description) in skills.descriptions() {
                out.push_str(&format!("- {id}: {description}\n"));
            }
        }
        out.push_str("\n\n");
        out.push_str(RESPONSE_FORMAT);
        out
    }

    /// Tool definitions plus one object-typed definition per skill, so
    /// providers with native tool calling can reach skills too.
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = self.dispatcher.tools().definitions();
        defs.extend(
            self.dispatcher
                .skills()
                .descriptions()
                .into_iter()
                .map(|(id, description)| ToolDefinition {
                    name: id,
                    description,
                    parameters: serde_json::json!({ "type": "object" }),
                }),
        );
        defs
    }

    /// Provider usage, or an estimate when the provider reported none.
    fn usage_of(&self, response: &ChatResponse, prompt_estimate: usize, reply: &Message) -> Usage {
        if !response.usage.is_empty() {
            return response.usage;
        }
        let completion = self.window.estimator().estimate_message(reply);
        Usage::new(prompt_estimate as u32, completion as u32)
    }

    async fn reflect(
        &self,
        input: &str,
        wm: &WorkingMemory,
        signal: &AbortSignal,
        meta: &EventMetadata,
        usage: &mut Usage,
    ) -> Vec<String> {
        let request = ChatRequest {
            messages: vec![
                Message::system(REFLECTION_PROMPT),
                Message::user(format!("Task: {input}\n\n{}", wm.render())),
            ],
            model: Some(self.model.clone()),
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..ChatRequest::default()
        };
        let prompt_estimate = self.window.estimate(&request.messages);
        let provider = Arc::clone(&self.provider);

        let response = match detached(signal, async move { provider.complete(request).await }).await {
            Ok(Some(Ok(response))) => response,
            Ok(Some(Err(e))) => {
                warn!("Reflection failed: {e}");
                return Vec::new();
            }
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("Reflection failed: {e}");
                return Vec::new();
            }
        };

        let reply = response.message().cloned().unwrap_or_else(|| Message::assistant(""));
        usage.add(&self.usage_of(&response, prompt_estimate, &reply));

        let reflections: Vec<String> = reply
            .text()
            .lines()
            .map(|l| l.trim().trim_start_matches(['-', '*', '•']).trim())
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        if !reflections.is_empty() {
            self.bus.publish(
                EventKind::ThinkingReflection,
                serde_json::json!({ "reflections": reflections }),
                meta.clone(),
            );
        }
        reflections
    }

    async fn persist_turn(&self, input: &str, result: &ThinkingResult, session_id: Option<&str>) {
        let Some(memory) = &self.memory else {
            return;
        };
        if !self.settings.persist_turns {
            return;
        }

        let entry = MemoryEntry {
            id: String::new(),
            content: format!("User: {input}\nAssistant: {}", result.answer),
            kind: MemoryKind::Message,
            importance: importance(result),
            tags: vec!["chat".into()],
            source: session_id.map(str::to_string),
            created_at: Utc::now(),
            score: 0.0,
        };

        match memory.store(entry).await {
            Ok(id) => debug!(memory_id = %id, "Stored chat turn"),
            Err(e) => warn!("Failed to store chat turn: {e}"),
        }
    }

    async fn engine_failure(&self, error: Error, step: u32, meta: &EventMetadata, emitter: &Emitter) -> Error {
        warn!(agent_id = %self.agent_id, step, "Thinking failed: {error}");
        self.bus.publish(
            EventKind::ThinkingError,
            serde_json::json!({ "step": step, "error": error.to_string() }),
            meta.clone(),
        );
        emitter
            .send(ThinkingEvent::Error {
                message: error.to_string(),
            })
            .await;
        error
    }
}

/// Importance of a stored turn, in [0, 1].
fn importance(result: &ThinkingResult) -> f32 {
    let mut score = 0.3;
    if !result.tools_used.is_empty() {
        score += 0.2;
    }
    if result.answer.chars().count() > 200 {
        score += 0.2;
    }
    score += 0.1 * result.reflections.len() as f32;
    score.min(1.0)
}

fn combine(outcomes: &[ActionOutcome]) -> String {
    match outcomes {
        [single] => single.observation.clone(),
        many => many
            .iter()
            .map(|o| format!("[{}] {}", o.name, o.observation))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Validate an action; dispatchable ones come back as an [`Invocation`],
/// everything else is resolved locally.
fn prepare(dispatcher: &ToolInvocationDispatcher, action: &Action, thought: &str) -> Result<Invocation, ActionOutcome> {
    if let Err(reason) = action.validate() {
        return Err(ActionOutcome::rejected(&action.name, reason));
    }
    match action.action_type {
        ActionType::Tool if !dispatcher.tools().contains(&action.name) => {
            Err(ActionOutcome::rejected(&action.name, format!("unknown tool '{}'", action.name)))
        }
        ActionType::Skill if !dispatcher.skills().contains(&action.name) => {
            Err(ActionOutcome::rejected(&action.name, format!("unknown skill '{}'", action.name)))
        }
        ActionType::Tool => Ok(Invocation::tool(&action.name, action.parameters.clone())),
        ActionType::Skill => Ok(Invocation::skill(&action.name, action.parameters.clone())),
        ActionType::Think => {
            let note = action
                .parameters
                .get("thought")
                .and_then(|v| v.as_str())
                .unwrap_or(thought);
            Err(ActionOutcome::local(&action.name, note))
        }
        ActionType::Reflect => Err(ActionOutcome::local(&action.name, "Reflection noted")),
        ActionType::Finish => Err(ActionOutcome::local(&action.name, "")),
    }
}

async fn perform_sequential(
    dispatcher: &ToolInvocationDispatcher,
    actions: &[Action],
    thought: &str,
    scope: &DispatchScope,
) -> Vec<ActionOutcome> {
    let mut outcomes = Vec::with_capacity(actions.len());
    for action in actions {
        let outcome = match prepare(dispatcher, action, thought) {
            Ok(call) => ActionOutcome::from(dispatcher.invoke_captured(&call, scope).await),
            Err(local) => local,
        };
        let halts = outcome.halts();
        outcomes.push(outcome);
        if halts {
            break;
        }
    }
    outcomes
}

async fn perform_parallel(
    dispatcher: &ToolInvocationDispatcher,
    actions: &[Action],
    thought: &str,
    scope: &DispatchScope,
) -> Vec<ActionOutcome> {
    let mut slots: Vec<Option<ActionOutcome>> = Vec::with_capacity(actions.len());
    let mut pending = Vec::new();
    for (i, action) in actions.iter().enumerate() {
        match prepare(dispatcher, action, thought) {
            Ok(call) => {
                slots.push(None);
                pending.push((i, call));
            }
            Err(local) => slots.push(Some(local)),
        }
    }

    let calls: Vec<Invocation> = pending.iter().map(|(_, c)| c.clone()).collect();
    let results = dispatcher.invoke_many(&calls, scope).await;
    for ((i, _), outcome) in pending.into_iter().zip(results) {
        slots[i] = Some(ActionOutcome::from(outcome));
    }
    slots.into_iter().flatten().collect()
}

/// A streamed episode. Implements [`Stream`]; dropping it or calling
/// [`cancel`](Self::cancel) aborts the episode.
pub struct ThinkingStream {
    inner: ReceiverStream<ThinkingEvent>,
    signal: AbortSignal,
}

impl ThinkingStream {
    pub fn cancel(&self) {
        self.signal.abort();
    }
}

impl Stream for ThinkingStream {
    type Item = ThinkingEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for ThinkingStream {
    fn drop(&mut self) {
        self.signal.abort();
    }
}
