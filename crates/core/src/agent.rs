//! Agent lifecycle states and the legal-transition table.
//!
//! The state machine in `thinkloop-agent` is the only writer; this module
//! only answers "is `from → to` legal?".

use serde::{Deserialize, Serialize};

/// Lifecycle state of one agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Constructed but not yet initialized
    #[default]
    Idle,
    Initializing,
    /// Accepting work
    Ready,
    Thinking,
    Executing,
    Chatting,
    /// An entry point failed; `initialize()` is the way back
    Error,
    Destroying,
    /// Terminal
    Destroyed,
}

impl AgentState {
    /// States in which a new `chat`/`think`/`execute` call is accepted.
    pub fn accepts_work(self) -> bool {
        matches!(self, Self::Idle | Self::Ready)
    }

    /// Whether the agent is in the middle of an entry point.
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Thinking | Self::Executing | Self::Chatting)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// Whether `self → next` is a legal transition.
    ///
    /// A same-state "transition" is never legal here; callers treat it as a
    /// no-op before consulting this table.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;

        if self == next {
            return false;
        }

        match (self, next) {
            (Destroyed, _) => false,
            (Destroying, Destroyed) => true,
            (Destroying, _) => false,
            (_, Destroying) => true,
            (_, Destroyed) => false,
            (_, Error) => true,

            (Idle, Initializing) => true,
            (Error, Initializing) => true,
            (Initializing, Ready) | (Initializing, Idle) => true,

            (Ready, Thinking) | (Ready, Executing) | (Ready, Chatting) => true,
            (Thinking, Ready) | (Executing, Ready) | (Chatting, Ready) => true,

            _ => false,
        }
    }

    /// Wire name used in `state:changed` payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Thinking => "thinking",
            Self::Executing => "executing",
            Self::Chatting => "chatting",
            Self::Error => "error",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
