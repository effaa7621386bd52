//! `thinkloop plan`: preview strategy selection and step decomposition
//! without calling a model.

use std::sync::Arc;
use thinkloop_agent::{build_plan, select_strategy};
use thinkloop_core::error::ToolError;
use thinkloop_core::plan::Plan;
use thinkloop_core::skill::SkillRegistry;
use thinkloop_core::tool::{Tool, ToolContext, ToolRegistry, ToolResult};

/// Stands in for a tool that would be registered at runtime, so plans
/// can target it by name.
struct NamedTool(String);

#[async_trait::async_trait]
impl Tool for NamedTool {
    fn name(&self) -> &str {
        &self.0
    }

    fn description(&self) -> &str {
        "preview placeholder"
    }

    async fn run(&self, _input: serde_json::Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        Err(ToolError::NotFound(self.0.clone()))
    }
}

pub fn preview(goal: &str, tool_names: &[String]) -> Plan {
    let mut tools = ToolRegistry::new();
    for name in tool_names {
        tools.register(Arc::new(NamedTool(name.clone())));
    }
    let strategy = select_strategy(goal);
    build_plan(goal, strategy, &tools, &SkillRegistry::new())
}

pub fn run(goal: &str, tool_names: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if goal.trim().is_empty() {
        return Err("goal must not be empty".into());
    }
    let plan = preview(goal, tool_names);
    tracing::debug!(strategy = ?plan.strategy, steps = plan.steps.len(), "Built plan");
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}
