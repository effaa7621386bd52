//! Incremental events of a streamed reasoning episode.
//!
//! A stream yields, per step, a `thought`, then the proposed `actions`,
//! then their `observations`, and ends with exactly one `complete` or
//! `error`. It is finite and cannot be restarted.

use serde::{Deserialize, Serialize};
use thinkloop_core::thinking::{Action, ThinkingResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThinkingEvent {
    /// The LLM's reasoning for a step.
    Thought { step: u32, content: String },

    /// Actions proposed in a step, before dispatch.
    Actions { step: u32, actions: Vec<Action> },

    /// One observation per dispatched action, in action order.
    Observations { step: u32, observations: Vec<String> },

    /// The episode ended; carries the full result.
    Complete { result: Box<ThinkingResult> },

    /// The episode failed at the engine level.
    Error { message: String },
}

impl ThinkingEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Thought { .. } => "thought",
            Self::Actions { .. } => "actions",
            Self::Observations { .. } => "observations",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this is the last event of its stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}
