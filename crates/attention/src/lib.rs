//! Multi-head scaled dot-product attention for the arena runtime.
//!
//! The node takes ten inputs: `query` and `value` activations of rank >= 2,
//! plus query/key/value projection kernels and biases and an output kernel
//! and bias (see [`io::AttentionInput`] for the fixed order). All leading
//! dimensions of the activations are flattened into batch rows; the last
//! dimension is the feature axis.
//!
//! The kernel never allocates. [`prepare`] validates every shape once and
//! reserves a scratch region sized `2 * value_batches * key_dim + 2 * key_dim`
//! floats; [`kernel::forward`] then runs entirely inside that region. Heads
//! share the region and run one after another.
//!
//! Scores are exponentiated directly, without max subtraction, and the
//! accumulation order is fixed, so outputs are reproducible bit for bit;
//! [`reference`] provides a numerically stable Candle version for comparison.

pub mod core;
pub mod io;
pub mod kernel;
pub mod op;
pub mod prepare;
pub mod reference;
pub mod shape;
pub mod state;

/// Name under which the operator is registered.
pub const OP_NAME: &str = "MultiHeadAttention";

pub use crate::core::{AttentionError, OperatorConfig};
pub use io::{AttentionInput, AttentionInputs, OUTPUT_INDEX};
pub use op::{add_attention_node, register, MultiHeadAttention};
pub use shape::ShapeInfo;
pub use state::{OperatorState, ScratchLayout, ScratchViews};
