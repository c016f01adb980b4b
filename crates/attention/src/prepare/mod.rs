//! Shape validation and scratch sizing.
//!
//! Expected shapes, with `qf`/`vf` the query/value feature counts:
//!
//! | input           | shape                        |
//! |-----------------|------------------------------|
//! | `query_kernel`  | `[qf, num_heads, key_dim]`   |
//! | `query_bias`    | `[num_heads, key_dim]`       |
//! | `key_kernel`    | `[vf, num_heads, key_dim]`   |
//! | `key_bias`      | `[num_heads, key_dim]`       |
//! | `value_kernel`  | `[vf, num_heads, key_dim]`   |
//! | `value_bias`    | `[num_heads, key_dim]`       |
//! | `output_kernel` | `[num_heads, key_dim, qf]`   |
//! | `output_bias`   | `[qf]`                       |
//!
//! The output must hold `query_batches * qf` elements.

use arena_runtime::{tensor::element_count, PrepareContext};

use crate::core::{AttentionError, OperatorConfig};
use crate::io::{AttentionInput, AttentionInputs, OUTPUT_INDEX};
use crate::shape::ShapeInfo;
use crate::state::{OperatorState, ScratchLayout};

/// Checks every input and output shape against `config`.
///
/// Pure: touches no memory and may be called any number of times.
pub fn validate(
    config: &OperatorConfig,
    inputs: &AttentionInputs<&[usize]>,
    output: &[usize],
) -> Result<ShapeInfo, AttentionError> {
    config.validate()?;
    let info = ShapeInfo::resolve(inputs.query, inputs.value)?;
    let heads = config.num_heads;
    let key_dim = config.key_dim;
    let qf = info.query_features;
    let vf = info.value_features;

    let expected = [
        (AttentionInput::QueryKernel, vec![qf, heads, key_dim]),
        (AttentionInput::QueryBias, vec![heads, key_dim]),
        (AttentionInput::KeyKernel, vec![vf, heads, key_dim]),
        (AttentionInput::KeyBias, vec![heads, key_dim]),
        (AttentionInput::ValueKernel, vec![vf, heads, key_dim]),
        (AttentionInput::ValueBias, vec![heads, key_dim]),
        (AttentionInput::OutputKernel, vec![heads, key_dim, qf]),
        (AttentionInput::OutputBias, vec![qf]),
    ];
    for (input, dims) in &expected {
        expect_dims(*input, inputs.get(*input), dims)?;
    }

    if element_count(output) != Some(info.output_len()) {
        return Err(AttentionError::shape(
            "attention_output",
            format!(
                "expected {} elements ({} x {}), got {:?}",
                info.output_len(),
                info.query_batches,
                qf,
                output
            ),
        ));
    }
    Ok(info)
}

fn expect_dims(input: AttentionInput, actual: &[usize], expected: &[usize]) -> Result<(), AttentionError> {
    if actual.len() != expected.len() {
        return Err(AttentionError::shape(
            input.name(),
            format!("expected rank {}, got {:?}", expected.len(), actual),
        ));
    }
    if actual != expected {
        return Err(AttentionError::shape(
            input.name(),
            format!("expected {expected:?}, got {actual:?}"),
        ));
    }
    Ok(())
}

/// Validates the node and reserves its scratch region.
///
/// Shape handles are released before the scratch request, on success and on
/// every early return.
pub fn prepare(
    ctx: &mut PrepareContext<'_>,
    state: &mut OperatorState,
) -> Result<ScratchLayout, AttentionError> {
    let (info, layout) = {
        let shapes_ctx: &PrepareContext<'_> = ctx;
        let temps =
            AttentionInputs::try_from_fn(move |input| shapes_ctx.acquire_input(input.index()))?;
        let output = shapes_ctx.acquire_output(OUTPUT_INDEX)?;
        let shapes = temps.map(|_, temp| temp.dims());
        let info = validate(&state.config, &shapes, output.dims())?;
        (info, ScratchLayout::new(info.value_batches, state.config.key_dim)?)
    };

    let handle = ctx.request_scratch(layout.bytes())?;
    state.scratch = Some(handle);
    log::debug!(
        "node {}: query {}x{}, value {}x{}, scratch {} floats ({} bytes)",
        ctx.node(),
        info.query_batches,
        info.query_features,
        info.value_batches,
        info.value_features,
        layout.len(),
        layout.bytes()
    );
    Ok(layout)
}
