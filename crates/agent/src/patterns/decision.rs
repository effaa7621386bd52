//! Turning an LLM reply into a thought and a list of actions.
//!
//! Three reply shapes are understood, tried in order:
//!
//! 1. Native tool calls: each call becomes a `tool` action (or `skill`
//!    when the name is a registered skill id), the text is the thought.
//! 2. A JSON object, bare or in a ```` ``` ```` fence, with `thought` and
//!    one of `action`, `actions`, or `answer`.
//! 3. Anything else: the text is the final answer.

use serde_json::Value;
use thinkloop_core::message::Message;
use thinkloop_core::skill::SkillRegistry;
use thinkloop_core::thinking::{Action, ActionType};
use thinkloop_core::tool::ToolRegistry;
use tracing::warn;

/// What the LLM proposed for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub thought: String,
    pub actions: Vec<Action>,
}

pub fn parse_decision(message: &Message, tools: &ToolRegistry, skills: &SkillRegistry) -> Decision {
    let text = message.text();

    if !message.tool_calls.is_empty() {
        let actions = message
            .tool_calls
            .iter()
            .map(|call| {
                let parameters = serde_json::from_str(&call.arguments)
                    .unwrap_or_else(|_| Value::String(call.arguments.clone()));
                Action {
                    action_type: kind_for(&call.name, tools, skills),
                    name: call.name.clone(),
                    parameters,
                }
            })
            .collect();
        return Decision {
            thought: text.trim().to_string(),
            actions,
        };
    }

    if let Some(decision) = extract_json(&text).and_then(|obj| from_json(obj, tools, skills)) {
        return decision;
    }

    let answer = text.trim().to_string();
    Decision {
        thought: answer.clone(),
        actions: vec![Action::finish(answer)],
    }
}

fn kind_for(name: &str, tools: &ToolRegistry, skills: &SkillRegistry) -> ActionType {
    if !tools.contains(name) && skills.contains(name) {
        ActionType::Skill
    } else {
        ActionType::Tool
    }
}

/// The first JSON object in `text`, looking inside a code fence first.
fn extract_json(text: &str) -> Option<serde_json::Map<String, Value>> {
    let trimmed = text.trim();
    let body = match trimmed.find("```") {
        Some(open) => {
            let after = &trimmed[open + 3..];
            let after = after.strip_prefix("json").unwrap_or(after);
            match after.find("```") {
                Some(close) => &after[..close],
                None => after,
            }
        }
        None => trimmed,
    };

    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&body[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn from_json(
    obj: serde_json::Map<String, Value>,
    tools: &ToolRegistry,
    skills: &SkillRegistry,
) -> Option<Decision> {
    let recognized = ["thought", "action", "actions", "answer"];
    if !recognized.iter().any(|k| obj.contains_key(*k)) {
        return None;
    }

    let thought = obj
        .get("thought")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    let mut actions: Vec<Action> = match (obj.get("actions"), obj.get("action")) {
        (Some(Value::Array(items)), _) => items.iter().filter_map(|v| action_from(v, tools, skills)).collect(),
        (_, Some(single)) => action_from(single, tools, skills).into_iter().collect(),
        _ => Vec::new(),
    };

    if actions.is_empty() {
        let action = match obj.get("answer") {
            Some(Value::String(answer)) => Action::finish(answer.clone()),
            Some(other) => Action::finish(other.to_string()),
            None => Action::think(thought.clone()),
        };
        actions.push(action);
    }

    Some(Decision { thought, actions })
}

/// Lenient action parsing: `type` may be omitted for registered names,
/// and `input`/`args` are accepted in place of `parameters`.
fn action_from(value: &Value, tools: &ToolRegistry, skills: &SkillRegistry) -> Option<Action> {
    let obj = value.as_object()?;
    let name = obj
        .get("name")
        .or_else(|| obj.get("tool"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let action_type = match obj.get("type") {
        Some(t) => match serde_json::from_value::<ActionType>(t.clone()) {
            Ok(kind) => kind,
            Err(_) => {
                warn!(action_type = %t, "Ignoring action with unknown type");
                return None;
            }
        },
        None if name.is_empty() => return None,
        None => kind_for(&name, tools, skills),
    };

    let parameters = obj
        .get("parameters")
        .or_else(|| obj.get("input"))
        .or_else(|| obj.get("args"))
        .cloned()
        .unwrap_or(Value::Null);

    let name = if name.is_empty() && !matches!(action_type, ActionType::Tool | ActionType::Skill) {
        action_type.as_str().to_string()
    } else {
        name
    };

    Some(Action {
        action_type,
        name,
        parameters,
    })
}
