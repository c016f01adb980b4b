//! Registration of the attention kernel with the arena runtime.

use arena_runtime::{InvokeContext, ModelBuilder, OpResolver, Operator, PrepareContext};

use crate::core::{AttentionError, OperatorConfig};
use crate::io::AttentionInputs;
use crate::state::OperatorState;
use crate::{kernel, prepare, OP_NAME};

/// Multi-head scaled dot-product attention over the arena.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiHeadAttention;

impl Operator for MultiHeadAttention {
    type State = OperatorState;
    type Error = AttentionError;

    fn init(&self, options: &[u8]) -> Result<OperatorState, AttentionError> {
        let config = OperatorConfig::decode(options)?;
        log::info!(
            "{} init num_heads={} key_dim={}",
            OP_NAME,
            config.num_heads,
            config.key_dim
        );
        Ok(OperatorState::new(config))
    }

    fn prepare(
        &self,
        ctx: &mut PrepareContext<'_>,
        state: &mut OperatorState,
    ) -> Result<(), AttentionError> {
        prepare::prepare(ctx, state).map(|_| ())
    }

    fn invoke(
        &self,
        ctx: &mut InvokeContext<'_>,
        state: &OperatorState,
    ) -> Result<(), AttentionError> {
        kernel::invoke(ctx, state)
    }
}

/// Registers [`MultiHeadAttention`] under [`OP_NAME`].
pub fn register(resolver: &mut OpResolver) -> Result<(), AttentionError> {
    resolver.add(OP_NAME, MultiHeadAttention)?;
    Ok(())
}

/// Appends an attention node wired to the given tensor ids.
pub fn add_attention_node(
    builder: &mut ModelBuilder,
    config: &OperatorConfig,
    inputs: &AttentionInputs<usize>,
    output: usize,
) -> Result<usize, AttentionError> {
    let options = config.to_options()?;
    Ok(builder.add_node(OP_NAME, options, inputs.to_vec(), vec![output]))
}
