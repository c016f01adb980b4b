//! Dense Candle implementation of the attention node.
//!
//! Favours clarity over speed and serves as the baseline the arena kernel is
//! checked against.

pub mod exact;

pub use exact::{softmax_row_sums, ExactAttention};
