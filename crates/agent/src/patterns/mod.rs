//! Reasoning patterns.
//!
//! - **ReAct** ([`react`]): Thought → Action → Observation with a visible
//!   step trace, streaming, and cooperative abort.
//! - **Planning** ([`coordinator`]): strategy selection, step plans, and
//!   bounded re-execution after adjustment.

pub mod coordinator;
pub mod decision;
pub mod react;

pub use coordinator::{
    ConservativeAdjuster, PlanAdjuster, PlanContext, PlanExecution, PlanningCoordinator, build_plan,
    select_strategy,
};
pub use decision::{Decision, parse_decision};
pub use react::{ThinkContext, ThinkingEngine, ThinkingStream};

#[cfg(test)]
pub(crate) mod test_helpers;
