//! Planning pattern: pick a strategy for a goal, break it into steps,
//! run the steps in order.
//!
//! ```text
//!  goal ──► select_strategy ──► build_plan ──► execute_plan
//!                                                  │ step failed
//!                                                  ▼
//!                                         PlanAdjuster::adjust
//!                                        None │        │ Some(plan)
//!                                             ▼        ▼
//!                                         give up   re-execute (bounded)
//! ```
//!
//! Step dependencies are recorded but not resolved: steps run in
//! declaration order. `think` steps go through the [`ThinkingEngine`],
//! `tool` and `skill` steps straight through the dispatcher.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thinkloop_core::error::Error;
use thinkloop_core::event::{EventBus, EventKind, EventMetadata};
use thinkloop_core::plan::{Plan, PlanStep, StepStatus, StepType, Strategy};
use thinkloop_core::signal::AbortSignal;
use thinkloop_core::skill::SkillRegistry;
use thinkloop_core::tool::ToolRegistry;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchScope, Invocation};
use crate::patterns::react::{ThinkContext, ThinkingEngine};

const MCTS_KEYWORDS: &[&str] = &[
    "optimize", "optimal", "best possible", "explore all", "search space", "simulate", "game",
    "maximize", "minimize",
];
const HTN_KEYWORDS: &[&str] = &[
    "build", "implement", "develop", "deploy", "migrate", "workflow", "pipeline", "project",
    "multi-step", "decompose",
];
const TOT_KEYWORDS: &[&str] = &[
    "compare", "alternatives", "evaluate", "options", "brainstorm", "pros and cons", "trade-off",
    "design",
];
const REACT_KEYWORDS: &[&str] = &[
    "find", "search", "look up", "lookup", "what is", "calculate", "check", "fetch", "get",
];

/// Lowercase, keep word characters, collapse everything else to single
/// spaces, and pad both ends so whole words match as `" word "`.
fn normalize(text: &str) -> String {
    let mapped: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    let words: Vec<&str> = mapped.split_whitespace().collect();
    format!(" {} ", words.join(" "))
}

fn mentions(normalized: &str, phrase: &str) -> bool {
    normalized.contains(&format!(" {phrase} "))
}

/// Keyword heuristic over the goal. High-complexity buckets are checked
/// first; no match gives [`Strategy::Hybrid`].
pub fn select_strategy(goal: &str) -> Strategy {
    let goal = normalize(goal);
    let buckets = [
        (Strategy::Mcts, MCTS_KEYWORDS),
        (Strategy::Htn, HTN_KEYWORDS),
        (Strategy::Tot, TOT_KEYWORDS),
        (Strategy::React, REACT_KEYWORDS),
    ];
    buckets
        .into_iter()
        .find(|(_, keywords)| keywords.iter().any(|k| mentions(&goal, k)))
        .map(|(strategy, _)| strategy)
        .unwrap_or(Strategy::Hybrid)
}

/// Break `goal` into a step plan. Pure: depends only on the goal, the
/// strategy, and which tool and skill names are registered.
pub fn build_plan(goal: &str, strategy: Strategy, tools: &ToolRegistry, skills: &SkillRegistry) -> Plan {
    let tool_names = tools.names();
    let skill_ids = skills.ids();

    let mut parts = clauses(goal);
    if parts.is_empty() {
        parts.push(goal.trim().to_string());
    }

    let mut steps: Vec<PlanStep> = Vec::with_capacity(parts.len() + 1);
    for (i, clause) in parts.into_iter().enumerate() {
        let id = format!("step-{}", i + 1);
        let words = normalize(&clause);
        let input = serde_json::json!({ "input": clause });

        let step = if let Some(tool) = tool_names.iter().find(|t| mentions(&words, &t.to_lowercase())) {
            PlanStep::new(id, clause, StepType::Tool)
                .with_target(tool.clone())
                .with_input(input)
        } else if let Some(skill) = skill_ids.iter().find(|s| mentions(&words, &s.to_lowercase())) {
            PlanStep::new(id, clause, StepType::Skill)
                .with_target(skill.clone())
                .with_input(input)
        } else {
            PlanStep::new(id, clause, StepType::Think)
        };

        let step = match steps.last() {
            Some(prev) => step.depends_on([prev.id.clone()]),
            None => step,
        };
        steps.push(step);
    }

    if matches!(strategy, Strategy::Tot | Strategy::Mcts) {
        let all: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
        steps.push(
            PlanStep::new(
                format!("step-{}", steps.len() + 1),
                format!("Compare the results so far and give the best answer to: {}", goal.trim()),
                StepType::Think,
            )
            .depends_on(all),
        );
    }

    Plan::new(goal.trim(), strategy, steps)
}

fn clauses(goal: &str) -> Vec<String> {
    goal.split(['\n', ';'])
        .map(strip_list_marker)
        .flat_map(split_sentences)
        .flat_map(|s| split_then(&s))
        .map(|s| clean(&s))
        .filter(|s| !s.is_empty())
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(['-', '*', '•']) {
        return rest.trim_start();
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0
        && let Some(after) = line[digits..].strip_prefix(['.', ')'])
        && (after.is_empty() || after.starts_with(char::is_whitespace))
    {
        return after.trim_start();
    }
    line
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '?' | '!') && chars.peek().is_some_and(|(_, next)| next.is_whitespace()) {
            let end = i + c.len_utf8();
            out.push(text[start..end].to_string());
            start = end;
        }
    }
    out.push(text[start..].to_string());
    out
}

fn split_then(text: &str) -> Vec<String> {
    const SEP: &str = " then ";
    let lower = text.to_ascii_lowercase();
    let mut out = Vec::new();
    let mut start = 0;
    for (i, _) in lower.match_indices(SEP) {
        out.push(text[start..i].to_string());
        start = i + SEP.len();
    }
    out.push(text[start..].to_string());
    out
}

fn clean(clause: &str) -> String {
    let mut s = clause.trim();
    for lead in ["and ", "then "] {
        if let Some(prefix) = s.get(..lead.len())
            && prefix.eq_ignore_ascii_case(lead)
        {
            s = s[lead.len()..].trim_start();
        }
    }
    s.trim_end_matches([',', '.', '!', '?', ':']).trim().to_string()
}

/// Recovery hook invoked when a plan step fails.
#[async_trait]
pub trait PlanAdjuster: Send + Sync {
    /// A replacement plan to re-execute, or `None` to give up.
    async fn adjust(&self, plan: &Plan, failed_step: &PlanStep, error: &str) -> Option<Plan>;
}

/// Never adjusts: a failed step fails the plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConservativeAdjuster;

#[async_trait]
impl PlanAdjuster for ConservativeAdjuster {
    async fn adjust(&self, _plan: &Plan, failed_step: &PlanStep, error: &str) -> Option<Plan> {
        debug!(step = %failed_step.id, "No adjustment for failed step: {error}");
        None
    }
}

/// Outcome of [`PlanningCoordinator::execute_plan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecution {
    /// Id of the plan that ran last (a replacement plan after adjustment)
    pub plan_id: String,
    pub strategy: Strategy,
    pub success: bool,

    /// Result of the last step
    pub output: Option<serde_json::Value>,

    /// Step trace of the last attempt, partial on failure
    pub steps: Vec<PlanStep>,

    pub adjusted: bool,
    pub adjustments: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Who is running the plan.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    pub session_id: Option<String>,
    pub execution_id: Option<String>,
    pub signal: Option<AbortSignal>,
}

impl PlanContext {
    fn is_aborted(&self) -> bool {
        self.signal.as_ref().is_some_and(AbortSignal::is_aborted)
    }

    fn scope(&self) -> DispatchScope {
        DispatchScope {
            session_id: self.session_id.clone(),
            signal: self.signal.clone(),
        }
    }
}

struct StepFailure {
    step: usize,
    error: String,
    aborted: bool,
}

pub struct PlanningCoordinator {
    agent_id: String,
    engine: Arc<ThinkingEngine>,
    adjuster: Arc<dyn PlanAdjuster>,
    bus: EventBus,
    max_adjustments: u32,
}

impl PlanningCoordinator {
    pub fn new(agent_id: impl Into<String>, engine: Arc<ThinkingEngine>, bus: EventBus) -> Self {
        Self {
            agent_id: agent_id.into(),
            engine,
            adjuster: Arc::new(ConservativeAdjuster),
            bus,
            max_adjustments: 1,
        }
    }

    pub fn with_adjuster(mut self, adjuster: Arc<dyn PlanAdjuster>) -> Self {
        self.adjuster = adjuster;
        self
    }

    /// Upper bound on re-executions after adjustment; 0 disables them.
    pub fn with_max_adjustments(mut self, max: u32) -> Self {
        self.max_adjustments = max;
        self
    }

    fn metadata(&self, ctx: &PlanContext) -> EventMetadata {
        let mut meta = EventMetadata::new(&self.agent_id);
        meta.session_id = ctx.session_id.clone();
        meta.execution_id = ctx.execution_id.clone();
        meta
    }

    /// Select a strategy and build the plan for `goal`.
    pub fn create_plan(&self, goal: &str, ctx: &PlanContext) -> Result<Plan, Error> {
        if goal.trim().is_empty() {
            return Err(Error::InvalidRequest("goal must not be empty".into()));
        }
        let dispatcher = self.engine.dispatcher();
        let strategy = select_strategy(goal);
        let plan = build_plan(goal, strategy, dispatcher.tools(), dispatcher.skills());

        info!(plan_id = %plan.id, strategy = %strategy, steps = plan.steps.len(), "Plan created");
        self.bus.publish(
            EventKind::PlanCreated,
            serde_json::to_value(&plan).unwrap_or_default(),
            self.metadata(ctx),
        );
        Ok(plan)
    }

    /// Run `plan` to completion. Step failures never return `Err`; they
    /// show up in the returned [`PlanExecution`].
    pub async fn execute_plan(&self, mut plan: Plan, ctx: &PlanContext) -> PlanExecution {
        let mut adjustments = 0;

        loop {
            let failure = match self.run_steps(&mut plan, ctx).await {
                Ok(output) => return self.conclude(plan, ctx, adjustments, Ok(output)),
                Err(failure) => failure,
            };

            if failure.aborted || adjustments >= self.max_adjustments {
                return self.conclude(plan, ctx, adjustments, Err(failure.error));
            }

            let failed_step = plan.steps[failure.step].clone();
            let Some(next) = self.adjuster.adjust(&plan, &failed_step, &failure.error).await else {
                return self.conclude(plan, ctx, adjustments, Err(failure.error));
            };

            adjustments += 1;
            info!(
                previous = %plan.id,
                plan_id = %next.id,
                attempt = adjustments,
                "Plan adjusted after step {} failed",
                failed_step.id
            );
            self.bus.publish(
                EventKind::PlanAdjusted,
                serde_json::json!({
                    "previousPlanId": plan.id,
                    "planId": next.id,
                    "failedStep": failed_step.id,
                    "error": failure.error,
                    "attempt": adjustments,
                }),
                self.metadata(ctx),
            );
            plan = next;
        }
    }

    fn conclude(
        &self,
        plan: Plan,
        ctx: &PlanContext,
        adjustments: u32,
        outcome: Result<Option<serde_json::Value>, String>,
    ) -> PlanExecution {
        let (success, output, error) = match outcome {
            Ok(output) => (true, output, None),
            Err(error) => (false, None, Some(error)),
        };

        self.bus.publish(
            EventKind::PlanCompleted,
            serde_json::json!({
                "planId": plan.id,
                "success": success,
                "steps": plan.steps.len(),
                "adjusted": adjustments > 0,
                "error": error,
            }),
            self.metadata(ctx),
        );

        PlanExecution {
            plan_id: plan.id,
            strategy: plan.strategy,
            success,
            output,
            steps: plan.steps,
            adjusted: adjustments > 0,
            adjustments,
            error,
        }
    }

    async fn run_steps(&self, plan: &mut Plan, ctx: &PlanContext) -> Result<Option<serde_json::Value>, StepFailure> {
        let mut output = None;

        for i in 0..plan.steps.len() {
            let (done, rest) = plan.steps.split_at_mut(i);
            let step = &mut rest[0];

            // Steps never reached stay pending.
            if ctx.is_aborted() {
                return Err(StepFailure {
                    step: i,
                    error: "aborted".into(),
                    aborted: true,
                });
            }

            if step
                .dependencies
                .iter()
                .all(|dep| done.iter().any(|d| &d.id == dep && d.status == StepStatus::Completed))
            {
                step.status = StepStatus::Ready;
            }
            step.start();
            self.bus.publish(
                EventKind::PlanStepStarted,
                serde_json::json!({ "planId": plan.id, "stepId": step.id, "type": step.step_type }),
                self.metadata(ctx),
            );

            match self.run_step(&plan.goal, step, done, ctx).await {
                Ok(result) => {
                    debug!(plan_id = %plan.id, step = %step.id, "Plan step completed");
                    self.bus.publish(
                        EventKind::PlanStepCompleted,
                        serde_json::json!({ "planId": plan.id, "stepId": step.id, "result": result }),
                        self.metadata(ctx),
                    );
                    step.complete(result.clone());
                    output = Some(result);
                }
                Err(error) => {
                    warn!(plan_id = %plan.id, step = %step.id, "Plan step failed: {error}");
                    self.bus.publish(
                        EventKind::PlanStepFailed,
                        serde_json::json!({ "planId": plan.id, "stepId": step.id, "error": error }),
                        self.metadata(ctx),
                    );
                    step.fail(error.clone());
                    return Err(StepFailure {
                        step: i,
                        error,
                        aborted: ctx.is_aborted(),
                    });
                }
            }
        }

        Ok(output)
    }

    async fn run_step(
        &self,
        goal: &str,
        step: &PlanStep,
        done: &[PlanStep],
        ctx: &PlanContext,
    ) -> Result<serde_json::Value, String> {
        let input = || step.input.clone().unwrap_or_else(|| serde_json::json!({}));
        let call = match (step.step_type, step.target.as_deref()) {
            (StepType::Think, _) => return self.think_step(goal, step, done, ctx).await,
            (StepType::Tool, Some(target)) => Invocation::tool(target, input()),
            (StepType::Skill, Some(target)) => Invocation::skill(target, input()),
            (_, None) => return Err(format!("{} step has no target", step.id)),
        };

        self.engine
            .dispatcher()
            .invoke(&call, &ctx.scope())
            .await
            .map_err(|e| e.detail().message)
    }

    async fn think_step(
        &self,
        goal: &str,
        step: &PlanStep,
        done: &[PlanStep],
        ctx: &PlanContext,
    ) -> Result<serde_json::Value, String> {
        let mut prompt = format!("Goal: {goal}\nCurrent step: {}\n", step.description);
        let finished: Vec<&PlanStep> = done.iter().filter(|s| s.status == StepStatus::Completed).collect();
        if !finished.is_empty() {
            prompt.push_str("\nCompleted steps:\n");
            for s in finished {
                let result = s.result.as_ref().map(render_result).unwrap_or_default();
                prompt.push_str(&format!("- {} ({}): {result}\n", s.id, s.description));
            }
        }

        let think_ctx = ThinkContext {
            session_id: ctx.session_id.clone(),
            execution_id: ctx.execution_id.clone(),
            signal: ctx.signal.clone(),
            ..ThinkContext::default()
        };

        match self.engine.think(&prompt, think_ctx).await {
            Ok(result) if result.success => Ok(serde_json::Value::String(result.answer)),
            Ok(result) => Err(result.error.unwrap_or_else(|| "no answer".into())),
            Err(e) => Err(e.to_string()),
        }
    }
}

fn render_result(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::test_helpers::{
        ScriptedProvider, collect_events, count_kind, engine_with, finish_reply, test_skills, test_tools,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use thinkloop_config::ThinkingSection;

    fn coordinator(replies: Vec<thinkloop_core::ChatResponse>) -> (PlanningCoordinator, EventBus) {
        let provider = Arc::new(ScriptedProvider::new(replies));
        let (engine, bus) = engine_with(
            provider,
            ThinkingSection {
                max_steps: 2,
                ..ThinkingSection::default()
            },
        );
        (PlanningCoordinator::new("agent-test", engine, bus.clone()), bus)
    }

    /// Replaces the failing tool with `echo` on every call.
    struct Reroute {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PlanAdjuster for Reroute {
        async fn adjust(&self, plan: &Plan, failed_step: &PlanStep, _error: &str) -> Option<Plan> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut next = plan.reset();
            for step in &mut next.steps {
                if step.id == failed_step.id {
                    step.target = Some("echo".into());
                    step.input = Some(serde_json::json!({"text": "rerouted"}));
                }
            }
            Some(next)
        }
    }

    /// Always hands back the same failing plan.
    struct Stubborn {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PlanAdjuster for Stubborn {
        async fn adjust(&self, plan: &Plan, _failed_step: &PlanStep, _error: &str) -> Option<Plan> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(plan.reset())
        }
    }

    fn failing_plan() -> Plan {
        Plan::new(
            "flaky",
            Strategy::React,
            vec![PlanStep::new("step-1", "call the flaky tool", StepType::Tool).with_target("always_fails")],
        )
    }

    #[test]
    fn strategy_buckets() {
        assert_eq!(select_strategy("Optimize the cache layout"), Strategy::Mcts);
        assert_eq!(select_strategy("Build and deploy the service"), Strategy::Htn);
        assert_eq!(select_strategy("Compare the pros and cons of both"), Strategy::Tot);
        assert_eq!(select_strategy("What is the capital of France?"), Strategy::React);
        assert_eq!(select_strategy("Write a haiku"), Strategy::Hybrid);
    }

    #[test]
    fn strategy_matches_whole_words() {
        // "together" contains "get", "designate" contains "design"
        assert_eq!(select_strategy("bring it together and designate"), Strategy::Hybrid);
        // higher bucket wins
        assert_eq!(select_strategy("find the optimal route"), Strategy::Mcts);
    }

    #[test]
    fn build_plan_maps_clauses_to_steps() {
        let plan = build_plan(
            "1. echo the greeting\n2. upper the greeting\n3. explain why it matters",
            Strategy::Htn,
            &test_tools(),
            &test_skills(),
        );
        assert_eq!(plan.steps.len(), 3);

        let types: Vec<_> = plan.steps.iter().map(|s| s.step_type).collect();
        assert_eq!(types, vec![StepType::Tool, StepType::Skill, StepType::Think]);
        assert_eq!(plan.steps[0].target.as_deref(), Some("echo"));
        assert_eq!(plan.steps[0].input, Some(serde_json::json!({"input": "echo the greeting"})));
        assert_eq!(plan.steps[1].target.as_deref(), Some("upper"));
        assert_eq!(plan.steps[2].description, "explain why it matters");

        assert!(plan.steps[0].dependencies.is_empty());
        assert_eq!(plan.steps[1].dependencies, vec!["step-1"]);
        assert_eq!(plan.steps[2].dependencies, vec!["step-2"]);
        assert!(plan.steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn build_plan_splits_sentences_and_then() {
        let plan = build_plan(
            "Look at the logs, then summarize them. After that, draft a reply; and send it!",
            Strategy::Hybrid,
            &ToolRegistry::new(),
            &SkillRegistry::new(),
        );
        let descriptions: Vec<_> = plan.steps.iter().map(|s| s.description.as_str()).collect();
        assert_eq!(
            descriptions,
            vec!["Look at the logs", "summarize them", "After that, draft a reply", "send it"]
        );
    }

    #[test]
    fn tot_plans_end_with_synthesis() {
        let plan = build_plan("evaluate option A. evaluate option B", Strategy::Tot, &test_tools(), &test_skills());
        assert_eq!(plan.steps.len(), 3);
        let last = plan.steps.last().unwrap();
        assert_eq!(last.step_type, StepType::Think);
        assert_eq!(last.dependencies, vec!["step-1", "step-2"]);
    }

    #[test]
    fn create_plan_rejects_empty_goal_and_announces_plans() {
        let (coordinator, bus) = coordinator(vec![]);
        let events = collect_events(&bus, &[EventKind::PlanCreated]);

        let err = coordinator.create_plan("   ", &PlanContext::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let plan = coordinator
            .create_plan("echo hello then explain", &PlanContext::default())
            .unwrap();
        assert_eq!(plan.strategy, Strategy::Hybrid);
        assert_eq!(count_kind(&events, EventKind::PlanCreated), 1);
        assert_eq!(events.lock().unwrap()[0].payload["goal"], "echo hello then explain");
    }

    #[tokio::test]
    async fn execute_plan_runs_steps_in_order() {
        let (coordinator, bus) = coordinator(vec![finish_reply("it says hi")]);
        let events = collect_events(
            &bus,
            &[
                EventKind::PlanStepStarted,
                EventKind::PlanStepCompleted,
                EventKind::PlanCompleted,
            ],
        );
        let plan = Plan::new(
            "echo then explain",
            Strategy::Hybrid,
            vec![
                PlanStep::new("step-1", "echo", StepType::Tool)
                    .with_target("echo")
                    .with_input(serde_json::json!({"text": "hi"})),
                PlanStep::new("step-2", "explain", StepType::Think).depends_on(["step-1".to_string()]),
            ],
        );

        let run = coordinator.execute_plan(plan, &PlanContext::default()).await;
        assert!(run.success);
        assert!(!run.adjusted);
        assert_eq!(run.output, Some(serde_json::json!("it says hi")));
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(run.steps[0].result, Some(serde_json::json!("hi")));

        let kinds: Vec<_> = events.lock().unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::PlanStepStarted,
                EventKind::PlanStepCompleted,
                EventKind::PlanStepStarted,
                EventKind::PlanStepCompleted,
                EventKind::PlanCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn failure_without_adjustment_surfaces_partial_trace() {
        let (coordinator, bus) = coordinator(vec![]);
        let adjusted = collect_events(&bus, &[EventKind::PlanAdjusted]);

        let run = coordinator.execute_plan(failing_plan(), &PlanContext::default()).await;
        assert!(!run.success);
        assert_eq!(run.error.as_deref(), Some("index offline"));
        assert_eq!(run.steps[0].status, StepStatus::Failed);
        assert_eq!(run.output, None);
        assert!(adjusted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn adjustment_reexecutes_replacement_plan() {
        let (coordinator, bus) = coordinator(vec![]);
        let adjuster = Arc::new(Reroute {
            calls: AtomicU32::new(0),
        });
        let coordinator = coordinator.with_adjuster(adjuster.clone());
        let adjusted = collect_events(&bus, &[EventKind::PlanAdjusted]);

        let original = failing_plan();
        let original_id = original.id.clone();
        let run = coordinator.execute_plan(original, &PlanContext::default()).await;

        assert!(run.success);
        assert!(run.adjusted);
        assert_ne!(run.plan_id, original_id);
        assert_eq!(run.output, Some(serde_json::json!("rerouted")));
        assert_eq!(adjuster.calls.load(Ordering::SeqCst), 1);
        assert_eq!(adjusted.lock().unwrap()[0].payload["previousPlanId"], original_id.as_str());
    }

    #[tokio::test]
    async fn adjustments_are_bounded() {
        let (coordinator, _bus) = coordinator(vec![]);
        let adjuster = Arc::new(Stubborn {
            calls: AtomicU32::new(0),
        });
        let coordinator = coordinator.with_adjuster(adjuster.clone()).with_max_adjustments(2);

        let run = coordinator.execute_plan(failing_plan(), &PlanContext::default()).await;
        assert!(!run.success);
        assert_eq!(run.adjustments, 2);
        assert_eq!(adjuster.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_adjustments_never_consults_adjuster() {
        let (coordinator, _bus) = coordinator(vec![]);
        let adjuster = Arc::new(Stubborn {
            calls: AtomicU32::new(0),
        });
        let coordinator = coordinator.with_adjuster(adjuster.clone()).with_max_adjustments(0);

        let run = coordinator.execute_plan(failing_plan(), &PlanContext::default()).await;
        assert!(!run.success);
        assert_eq!(adjuster.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn aborted_plan_is_not_adjusted() {
        let (coordinator, _bus) = coordinator(vec![]);
        let adjuster = Arc::new(Reroute {
            calls: AtomicU32::new(0),
        });
        let coordinator = coordinator.with_adjuster(adjuster.clone());
        let signal = AbortSignal::new();
        signal.abort();

        let ctx = PlanContext {
            signal: Some(signal),
            ..PlanContext::default()
        };
        let run = coordinator.execute_plan(failing_plan(), &ctx).await;
        assert!(!run.success);
        assert_eq!(run.error.as_deref(), Some("aborted"));
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(adjuster.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_think_step_fails_the_plan() {
        let (coordinator, _bus) = coordinator(vec![]);
        let plan = Plan::new(
            "ponder",
            Strategy::Hybrid,
            vec![PlanStep::new("step-1", "ponder", StepType::Think)],
        );
        let run = coordinator.execute_plan(plan, &PlanContext::default()).await;
        assert!(!run.success);
        assert!(run.error.unwrap().contains("script exhausted"));
    }
}
