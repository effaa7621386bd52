//! The agent execution core.
//!
//! An [`AgentStateMachine`] owns one agent's lifecycle and sessions and
//! drives work through:
//!
//! 1. **Context** ([`context`]): token estimation, window truncation, and
//!    the per-episode scratchpad
//! 2. **Dispatch** ([`dispatcher`]): tool and skill invocation with
//!    history and events
//! 3. **Reasoning** ([`patterns::react`]): the bounded ReAct loop, with
//!    streaming and abort
//! 4. **Planning** ([`patterns::coordinator`]): strategy selection, step
//!    plans, and bounded adjustment
//!
//! Everything observable is published on the agent's [`EventBus`].
//!
//! [`EventBus`]: thinkloop_core::EventBus

pub mod context;
pub mod dispatcher;
pub mod patterns;
pub mod state_machine;
pub mod stream_event;

pub use context::{CharRatioEstimator, ContextWindowManager, TokenEstimator, WorkingMemory};
pub use dispatcher::{
    DispatchScope, Invocation, InvocationKind, InvocationOutcome, InvocationRecord, ToolInvocationDispatcher,
};
pub use patterns::{
    ConservativeAdjuster, Decision, PlanAdjuster, PlanContext, PlanExecution, PlanningCoordinator, ThinkContext,
    ThinkingEngine, ThinkingStream, build_plan, parse_decision, select_strategy,
};
pub use state_machine::{AgentBuilder, AgentStateMachine, AgentStats};
pub use stream_event::ThinkingEvent;
