//! # ThinkLoop Core
//!
//! Domain types, collaborator traits, and error definitions for the ThinkLoop
//! agent runtime. The execution core in `thinkloop-agent` is written against
//! these types; LLM providers, tools, skills, and memory backends plug in
//! through the traits defined here.
//!
//! ## Layout
//!
//! - Domain model: messages and sessions, thinking steps, plans, agent state
//! - Collaborator contracts: [`Provider`], [`Tool`], [`Skill`], [`MemoryBackend`]
//! - The typed [`EventBus`] every lifecycle and step event goes through
//! - The error taxonomy rooted at [`Error`]

pub mod agent;
pub mod error;
pub mod event;
pub mod memory;
pub mod message;
pub mod plan;
pub mod provider;
pub mod signal;
pub mod skill;
pub mod thinking;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use agent::AgentState;
pub use error::{
    Error, ErrorDetail, ExecutionError, InvalidStateError, MemoryError, ProviderError, Result, SkillError, ToolError,
};
pub use event::{EventBus, EventBusStats, EventKind, EventMetadata, Subscription, UnifiedEvent};
pub use memory::{MemoryBackend, MemoryEntry, MemoryKind, MemoryQuery};
pub use message::{ContentPart, Message, MessageContent, MessageToolCall, Role, Session};
pub use plan::{Plan, PlanStep, StepStatus, StepType, Strategy};
pub use provider::{ChatRequest, ChatResponse, ChatStreamChunk, Choice, FinishReason, Provider, ToolDefinition, Usage};
pub use signal::AbortSignal;
pub use skill::{Skill, SkillContext, SkillRegistry, SkillResult};
pub use thinking::{Action, ActionType, StopReason, ThinkingResult, ThinkingStep};
pub use tool::{Tool, ToolContext, ToolRegistry, ToolResult};
