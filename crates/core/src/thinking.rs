//! Reasoning-episode value types: actions, steps, and the terminal result.

use serde::{Deserialize, Serialize};

use crate::provider::{FinishReason, Usage};

/// What an action asks the runtime to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Tool,
    Skill,
    /// Internal reasoning; nothing is dispatched
    Think,
    /// End the episode with an answer
    Finish,
    Reflect,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Skill => "skill",
            Self::Think => "think",
            Self::Finish => "finish",
            Self::Reflect => "reflect",
        }
    }
}

/// One decision proposed by the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl Action {
    pub fn tool(name: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            action_type: ActionType::Tool,
            name: name.into(),
            parameters,
        }
    }

    pub fn skill(name: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            action_type: ActionType::Skill,
            name: name.into(),
            parameters,
        }
    }

    pub fn finish(answer: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::Finish,
            name: "finish".into(),
            parameters: serde_json::json!({ "answer": answer.into() }),
        }
    }

    pub fn think(thought: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::Think,
            name: "think".into(),
            parameters: serde_json::json!({ "thought": thought.into() }),
        }
    }

    /// Whether this action goes through the dispatcher.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self.action_type, ActionType::Tool | ActionType::Skill)
    }

    /// Structural validation, done before dispatch.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.is_dispatchable() && self.name.trim().is_empty() {
            return Err(format!("{} action is missing a name", self.action_type.as_str()));
        }
        match &self.parameters {
            serde_json::Value::Null | serde_json::Value::Object(_) => Ok(()),
            other => Err(format!(
                "parameters for '{}' must be an object, got {}",
                self.name,
                json_kind(other)
            )),
        }
    }

    /// `parameters.answer` of a finish action.
    pub fn answer(&self) -> Option<&str> {
        self.parameters.get("answer").and_then(|v| v.as_str())
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// One loop iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingStep {
    pub step: u32,
    pub thought: String,

    /// The primary action of this step
    pub action: Action,

    /// Further actions proposed in the same step
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_actions: Vec<Action>,

    pub observation: String,

    pub duration_ms: u64,
}

/// Why an episode ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A `finish` action was reached
    Finished,
    /// `max_steps` exhausted
    MaxSteps,
    Aborted,
    /// A non-recoverable tool or skill failure
    Halted,
}

impl StopReason {
    pub fn finish_reason(self) -> FinishReason {
        match self {
            Self::Finished => FinishReason::Stop,
            Self::MaxSteps => FinishReason::Length,
            Self::Aborted => FinishReason::Aborted,
            Self::Halted => FinishReason::Error,
        }
    }
}

/// Terminal artifact of one reasoning episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingResult {
    /// True only when a `finish` action was reached
    pub success: bool,
    pub answer: String,
    pub steps: Vec<ThinkingStep>,
    pub total_steps: u32,
    pub total_duration_ms: u64,

    /// Tools and skills dispatched, in first-use order
    pub tools_used: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reflections: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub stop_reason: StopReason,

    #[serde(default)]
    pub usage: Usage,
}
