//! Context handling for the reasoning loop.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`TokenEstimator`] | Pluggable token cost of text and messages |
//! | [`ContextWindowManager`] | Truncates history to a token budget |
//! | [`WorkingMemory`] | Per-episode scratchpad rendered into each prompt |

pub mod token;
pub mod window;
pub mod working_memory;

pub use token::{CharRatioEstimator, TokenEstimator};
pub use window::ContextWindowManager;
pub use working_memory::WorkingMemory;
