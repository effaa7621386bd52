//! Plans: a goal broken into ordered steps that are mutated in place as
//! they execute.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reasoning strategy chosen for a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Strategy {
    React,
    /// Monte-Carlo tree search
    Mcts,
    /// Tree of thoughts
    Tot,
    /// Hierarchical task network
    Htn,
    Hybrid,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::React => "REACT",
            Self::Mcts => "MCTS",
            Self::Tot => "TOT",
            Self::Htn => "HTN",
            Self::Hybrid => "HYBRID",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    /// Run a reasoning episode on the description
    Think,
    Tool,
    Skill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,

    #[serde(rename = "type")]
    pub step_type: StepType,

    /// Tool name or skill id for `tool`/`skill` steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,

    /// Recorded only; steps run in declaration order
    #[serde(default)]
    pub dependencies: Vec<String>,

    pub status: StepStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            step_type,
            target: None,
            input: None,
            dependencies: Vec::new(),
            status: StepStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.dependencies.extend(ids);
        self
    }

    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        self.error = None;
    }

    pub fn complete(&mut self, result: serde_json::Value) {
        self.status = StepStatus::Completed;
        self.result = Some(result);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub goal: String,
    pub steps: Vec<PlanStep>,
    pub strategy: Strategy,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(goal: impl Into<String>, strategy: Strategy, steps: Vec<PlanStep>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            goal: goal.into(),
            steps,
            strategy,
            created_at: Utc::now(),
        }
    }

    /// A fresh copy with every step back to `pending`.
    pub fn reset(&self) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4().to_string();
        copy.created_at = Utc::now();
        for step in &mut copy.steps {
            step.status = StepStatus::Pending;
            step.result = None;
            step.error = None;
        }
        copy
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_plan() -> Plan {
        Plan::new(
            "search then summarize",
            Strategy::Htn,
            vec![
                PlanStep::new("step-1", "search", StepType::Tool).with_target("search"),
                PlanStep::new("step-2", "summarize", StepType::Think).depends_on(["step-1".to_string()]),
            ],
        )
    }

    #[test]
    fn step_lifecycle() {
        let mut plan = two_step_plan();
        plan.steps[0].start();
        assert_eq!(plan.steps[0].status, StepStatus::Running);
        plan.steps[0].complete(serde_json::json!("ok"));
        plan.steps[1].start();
        plan.steps[1].fail("boom");
        assert_eq!(plan.steps[1].status, StepStatus::Failed);
        assert_eq!(plan.steps[1].error.as_deref(), Some("boom"));
        assert!(!plan.is_complete());
    }

    #[test]
    fn reset_clears_progress_and_renews_id() {
        let mut plan = two_step_plan();
        plan.steps[0].complete(serde_json::json!(1));
        let fresh = plan.reset();
        assert_ne!(fresh.id, plan.id);
        assert!(fresh.steps.iter().all(|s| s.status == StepStatus::Pending && s.result.is_none()));
    }

    #[test]
    fn wire_shape() {
        let json = serde_json::to_value(two_step_plan()).unwrap();
        assert_eq!(json["strategy"], "HTN");
        assert_eq!(json["steps"][0]["type"], "tool");
        assert_eq!(json["steps"][0]["status"], "pending");
        assert_eq!(json["steps"][1]["dependencies"][0], "step-1");
    }
}
