//! Context window management: keep the most recent messages that fit a
//! token budget.

use std::sync::Arc;
use thinkloop_config::ContextSection;
use thinkloop_core::message::Message;
use tracing::debug;

use super::token::{CharRatioEstimator, TokenEstimator};

/// Truncates message lists to `limit - reserved` estimated tokens.
///
/// Truncation keeps a contiguous suffix of the input: walking from newest
/// to oldest, messages are kept until the first one that does not fit.
/// The newest message is always kept, even when it alone is over budget.
#[derive(Debug, Clone)]
pub struct ContextWindowManager<E = Arc<dyn TokenEstimator>> {
    estimator: E,
    max_tokens: usize,
    reserved_tokens: usize,
}

impl ContextWindowManager<CharRatioEstimator> {
    pub fn new(max_tokens: usize, reserved_tokens: usize) -> Self {
        Self::with_estimator(CharRatioEstimator::default(), max_tokens, reserved_tokens)
    }
}

impl ContextWindowManager<Arc<dyn TokenEstimator>> {
    pub fn from_config(config: &ContextSection, estimator: Option<Arc<dyn TokenEstimator>>) -> Self {
        let estimator =
            estimator.unwrap_or_else(|| Arc::new(CharRatioEstimator::new(config.chars_per_token)) as Arc<dyn TokenEstimator>);
        Self::with_estimator(estimator, config.max_tokens, config.reserved_tokens)
    }
}

impl<E: TokenEstimator> ContextWindowManager<E> {
    pub fn with_estimator(estimator: E, max_tokens: usize, reserved_tokens: usize) -> Self {
        Self {
            estimator,
            max_tokens,
            reserved_tokens,
        }
    }

    pub fn estimator(&self) -> &E {
        &self.estimator
    }

    /// The configured budget: `max_tokens - reserved_tokens`.
    pub fn budget(&self) -> usize {
        self.budget_for(None)
    }

    /// Budget for an explicit limit, falling back to the configured one.
    pub fn budget_for(&self, max_tokens: Option<usize>) -> usize {
        max_tokens
            .unwrap_or(self.max_tokens)
            .saturating_sub(self.reserved_tokens)
    }

    pub fn estimate(&self, messages: &[Message]) -> usize {
        self.estimator.estimate_messages(messages)
    }

    /// Truncate `messages` to the budget derived from `max_tokens` (or the
    /// configured limit). Input under budget is returned unchanged.
    pub fn manage(&self, messages: &[Message], max_tokens: Option<usize>) -> Vec<Message> {
        self.fit(messages, self.budget_for(max_tokens))
    }

    /// Truncate `messages` to an already-computed token budget.
    pub fn fit(&self, messages: &[Message], budget: usize) -> Vec<Message> {
        let costs: Vec<usize> = messages
            .iter()
            .map(|m| self.estimator.estimate_message(m))
            .collect();
        let total: usize = costs.iter().sum();

        if total <= budget {
            return messages.to_vec();
        }

        let mut used = 0usize;
        let mut start = messages.len();
        for (i, cost) in costs.iter().enumerate().rev() {
            let newest = i + 1 == messages.len();
            if !newest && used + cost > budget {
                break;
            }
            used += cost;
            start = i;
        }

        debug!(
            kept = messages.len() - start,
            dropped = start,
            total_tokens = total,
            kept_tokens = used,
            budget,
            "Context window truncated"
        );

        messages[start..].to_vec()
    }
}
