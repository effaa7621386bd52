//! `thinkloop trim`: run a saved message list through the context window.

use serde_json::json;
use std::path::Path;
use thinkloop_agent::ContextWindowManager;
use thinkloop_config::AppConfig;
use thinkloop_core::message::Message;

pub struct TrimReport {
    pub messages: Vec<Message>,
    pub dropped: usize,
    pub estimated_tokens: usize,
    pub budget: usize,
}

/// Parse `raw` as a JSON array of messages and fit it to the window
/// configured in `config`, or to `max_tokens` when given.
pub fn trim(config: &AppConfig, raw: &str, max_tokens: Option<usize>) -> Result<TrimReport, serde_json::Error> {
    let messages: Vec<Message> = serde_json::from_str(raw)?;
    let window = ContextWindowManager::from_config(&config.context, None);

    let kept = window.manage(&messages, max_tokens);
    Ok(TrimReport {
        dropped: messages.len() - kept.len(),
        estimated_tokens: window.estimate(&kept),
        budget: window.budget_for(max_tokens),
        messages: kept,
    })
}

pub fn run(config: &AppConfig, file: &Path, max_tokens: Option<usize>) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(file).map_err(|e| format!("cannot read {}: {e}", file.display()))?;
    let report = trim(config, &raw, max_tokens)?;
    tracing::debug!(dropped = report.dropped, budget = report.budget, "Trimmed messages");

    let out = json!({
        "messages": report.messages,
        "dropped": report.dropped,
        "estimated_tokens": report.estimated_tokens,
        "budget": report.budget,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
