//! Token estimation.
//!
//! The default estimator is a character-count heuristic, not a tokenizer:
//! budgets computed with it are approximate and will drift from the
//! provider's own counts, mostly on non-English text and code. Plug in a
//! real tokenizer through [`TokenEstimator`] when that matters.

use std::sync::Arc;
use thinkloop_core::message::Message;

pub trait TokenEstimator: Send + Sync {
    /// Estimated tokens for a piece of text.
    fn estimate(&self, text: &str) -> usize;

    /// Estimated tokens for one message: its text plus any tool calls.
    fn estimate_message(&self, message: &Message) -> usize {
        let calls: usize = message
            .tool_calls
            .iter()
            .map(|c| self.estimate(&c.name) + self.estimate(&c.arguments))
            .sum();
        self.estimate(&message.text()) + calls
    }

    fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }
}

impl<T: TokenEstimator + ?Sized> TokenEstimator for Arc<T> {
    fn estimate(&self, text: &str) -> usize {
        (**self).estimate(text)
    }

    fn estimate_message(&self, message: &Message) -> usize {
        (**self).estimate_message(message)
    }
}

/// `ceil(chars / chars_per_token)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    /// A ratio of 0 is treated as 1.
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thinkloop_core::message::MessageToolCall;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(CharRatioEstimator::default().estimate(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(CharRatioEstimator::default().estimate("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(CharRatioEstimator::default().estimate("hello"), 2);
    }

    #[test]
    fn counts_chars_not_bytes() {
        // 4 chars, 8 bytes
        assert_eq!(CharRatioEstimator::default().estimate("éééé"), 1);
    }

    #[test]
    fn custom_ratio() {
        let est = CharRatioEstimator::new(2);
        assert_eq!(est.estimate("hello"), 3);
        assert_eq!(CharRatioEstimator::new(0).estimate("abc"), 3);
    }

    #[test]
    fn message_has_no_overhead() {
        let est = CharRatioEstimator::default();
        assert_eq!(est.estimate_message(&Message::user("test")), 1);
        let msgs = vec![Message::user("hello"), Message::assistant("world")];
        assert_eq!(est.estimate_messages(&msgs), 4);
    }

    #[test]
    fn tool_calls_are_counted() {
        let est = CharRatioEstimator::default();
        let mut msg = Message::assistant("");
        msg.tool_calls.push(MessageToolCall {
            id: "call_1".into(),
            name: "calc".into(),
            arguments: r#"{"x":1}"#.into(),
        });
        assert_eq!(est.estimate_message(&msg), 1 + 2);
    }

    #[test]
    fn shared_estimator_delegates() {
        let est: Arc<dyn TokenEstimator> = Arc::new(CharRatioEstimator::new(1));
        assert_eq!(est.estimate("abc"), 3);
    }
}
