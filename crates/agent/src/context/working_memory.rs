//! Working memory: the scratchpad of one reasoning episode.
//!
//! Holds the steps taken so far, the tools and skills used, and the
//! iteration counter. It is rendered into each subsequent prompt so the
//! LLM sees its own trace, and is discarded when the episode ends.

use serde::{Deserialize, Serialize};
use thinkloop_core::thinking::{Action, ActionType, ThinkingStep};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemory {
    pub steps: Vec<ThinkingStep>,

    /// Tool and skill names in first-use order
    pub tools_used: Vec<String>,

    /// Current iteration counter
    pub iterations: u32,

    pub max_steps: u32,
}

impl WorkingMemory {
    pub fn new(max_steps: u32) -> Self {
        Self {
            steps: Vec::new(),
            tools_used: Vec::new(),
            iterations: 0,
            max_steps,
        }
    }

    /// Increment the iteration counter. Returns `false` once `max_steps`
    /// is exceeded.
    pub fn tick(&mut self) -> bool {
        if self.iterations >= self.max_steps {
            return false;
        }
        self.iterations += 1;
        true
    }

    pub fn record(&mut self, step: ThinkingStep) {
        self.steps.push(step);
    }

    pub fn note_used(&mut self, name: &str) {
        if !self.tools_used.iter().any(|n| n == name) {
            self.tools_used.push(name.to_string());
        }
    }

    pub fn last_observation(&self) -> Option<&str> {
        self.steps.last().map(|s| s.observation.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Render the step trace for injection into the next prompt.
    pub fn render(&self) -> String {
        let mut out = String::from("## Previous Steps\n");
        for step in &self.steps {
            out.push_str(&format!("### Step {}\n", step.step));
            if !step.thought.is_empty() {
                out.push_str(&format!("Thought: {}\n", step.thought));
            }
            for action in std::iter::once(&step.action).chain(&step.extra_actions) {
                out.push_str(&format!("Action: {}\n", describe(action)));
            }
            out.push_str(&format!("Observation: {}\n", step.observation));
        }
        out.push_str(&format!("\nSteps used: {}/{}\n", self.iterations, self.max_steps));
        out
    }
}

fn describe(action: &Action) -> String {
    match action.action_type {
        ActionType::Tool | ActionType::Skill => {
            format!("{} {}({})", action.action_type.as_str(), action.name, action.parameters)
        }
        other => other.as_str().to_string(),
    }
}
