//! Skill trait: higher-level capabilities that may use the LLM, memory,
//! and tools themselves.
//!
//! Unlike a [`Tool`](crate::tool::Tool), a skill receives the agent's
//! collaborators through its [`SkillContext`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ErrorDetail, SkillError};
use crate::memory::MemoryBackend;
use crate::provider::Provider;
use crate::signal::AbortSignal;
use crate::tool::ToolRegistry;

/// The result of a skill execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillResult {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SkillResult {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn failed(error: ErrorDetail) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Per-call context handed to [`Skill::execute`].
#[derive(Clone)]
pub struct SkillContext {
    pub execution_id: String,
    pub agent_id: String,
    pub session_id: Option<String>,

    /// The input this skill was invoked with
    pub input: serde_json::Value,

    /// Span carrying `execution_id`
    pub log: tracing::Span,

    pub llm: Arc<dyn Provider>,
    pub memory: Option<Arc<dyn MemoryBackend>>,
    pub tools: Arc<ToolRegistry>,

    /// Set when the invoking episode is aborted
    pub signal: Option<AbortSignal>,
}

impl SkillContext {
    pub fn is_aborted(&self) -> bool {
        self.signal.as_ref().is_some_and(AbortSignal::is_aborted)
    }
}

#[async_trait]
pub trait Skill: Send + Sync {
    /// Stable id used for lookup and dispatch.
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &SkillContext,
    ) -> std::result::Result<SkillResult, SkillError>;
}

/// A registry of available skills keyed by id.
#[derive(Default, Clone)]
pub struct SkillRegistry {
    skills: HashMap<String, Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a skill. Replaces any existing skill with the same id.
    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        self.skills.insert(skill.id().to_string(), skill);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Skill>> {
        self.skills.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.skills.contains_key(id)
    }

    /// `(id, description)` pairs sorted by id, for prompts.
    pub fn descriptions(&self) -> Vec<(String, String)> {
        let mut out: Vec<_> = self
            .skills
            .values()
            .map(|s| (s.id().to_string(), s.description().to_string()))
            .collect();
        out.sort();
        out
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.skills.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}
