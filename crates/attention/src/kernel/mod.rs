//! Forward pass over flat `f32` buffers.
//!
//! For every head the key and value projections of all value rows are staged
//! in scratch, then each query row is projected, scored against every key
//! row, and the softmax-weighted value vector is pushed through the head's
//! slice of the output kernel. Heads accumulate into the output, which starts
//! as `output_bias`.
//!
//! Accumulation order is fixed (head, then query row, then value row, each
//! sum starting from its bias and adding features in ascending order) so two
//! runs over the same inputs are bit-identical. Scores are exponentiated
//! without subtracting the row maximum; large projections overflow to
//! `inf`/`NaN` instead of being rescaled.

use std::sync::OnceLock;

use arena_runtime::InvokeContext;

use crate::core::{AttentionError, OperatorConfig};
use crate::io::{AttentionInput, AttentionInputs, OUTPUT_INDEX};
use crate::shape::ShapeInfo;
use crate::state::{OperatorState, ScratchLayout, ScratchViews};

static NON_FINITE_WARNED: OnceLock<()> = OnceLock::new();

/// A `[features, num_heads, key_dim]` kernel with its `[num_heads, key_dim]` bias.
struct Projection<'a> {
    kernel: &'a [f32],
    bias: &'a [f32],
    num_heads: usize,
    key_dim: usize,
}

impl<'a> Projection<'a> {
    fn new(kernel: &'a [f32], bias: &'a [f32], config: &OperatorConfig) -> Self {
        Self {
            kernel,
            bias,
            num_heads: config.num_heads,
            key_dim: config.key_dim,
        }
    }

    fn project_row(&self, head: usize, row: &[f32], out: &mut [f32]) {
        let stride = self.num_heads * self.key_dim;
        let offset = head * self.key_dim;
        let bias = &self.bias[offset..offset + self.key_dim];
        for (k, slot) in out.iter_mut().enumerate() {
            let mut sum = bias[k];
            for (f, x) in row.iter().enumerate() {
                sum += x * self.kernel[f * stride + offset + k];
            }
            *slot = sum;
        }
    }

    fn project_rows(&self, head: usize, rows: &[f32], features: usize, out: &mut [f32]) {
        for (row, dst) in rows
            .chunks_exact(features)
            .zip(out.chunks_exact_mut(self.key_dim))
        {
            self.project_row(head, row, dst);
        }
    }
}

/// Runs one forward pass.
///
/// `scratch` contents on entry are irrelevant; every region is overwritten
/// before it is read.
pub fn forward(
    config: &OperatorConfig,
    info: &ShapeInfo,
    inputs: &AttentionInputs<&[f32]>,
    scratch: ScratchViews<'_>,
    output: &mut [f32],
) -> Result<(), AttentionError> {
    check_lengths(config, info, inputs, output.len())?;
    let ScratchViews {
        kproj,
        vproj,
        qbuf,
        vbuf,
    } = scratch;

    let key_dim = config.key_dim;
    let qf = info.query_features;
    let vf = info.value_features;
    let inv_sqrt = 1.0f32 / (key_dim as f32).sqrt();
    let query_proj = Projection::new(inputs.query_kernel, inputs.query_bias, config);
    let key_proj = Projection::new(inputs.key_kernel, inputs.key_bias, config);
    let value_proj = Projection::new(inputs.value_kernel, inputs.value_bias, config);
    let mut non_finite = false;

    for row in output.chunks_exact_mut(qf) {
        row.copy_from_slice(inputs.output_bias);
    }

    for head in 0..config.num_heads {
        key_proj.project_rows(head, inputs.value, vf, kproj);
        value_proj.project_rows(head, inputs.value, vf, vproj);
        let head_kernel = &inputs.output_kernel[head * key_dim * qf..(head + 1) * key_dim * qf];

        for (query_row, out_row) in inputs
            .query
            .chunks_exact(qf)
            .zip(output.chunks_exact_mut(qf))
        {
            query_proj.project_row(head, query_row, qbuf);
            vbuf.fill(0.0);

            let mut exp_sum = 0.0f32;
            for (key_row, value_row) in kproj
                .chunks_exact(key_dim)
                .zip(vproj.chunks_exact(key_dim))
            {
                let mut score = 0.0f32;
                for (q, k) in qbuf.iter().zip(key_row) {
                    score += q * k;
                }
                let weight = (score * inv_sqrt).exp();
                exp_sum += weight;
                for (acc, v) in vbuf.iter_mut().zip(value_row) {
                    *acc += weight * v;
                }
            }

            non_finite |= !exp_sum.is_finite();
            let inv_exp_sum = 1.0f32 / exp_sum;
            for acc in vbuf.iter_mut() {
                *acc *= inv_exp_sum;
            }

            for (f, slot) in out_row.iter_mut().enumerate() {
                let mut sum = 0.0f32;
                for (k, weighted) in vbuf.iter().enumerate() {
                    sum += weighted * head_kernel[k * qf + f];
                }
                *slot += sum;
            }
        }
    }

    if non_finite && NON_FINITE_WARNED.set(()).is_ok() {
        log::warn!(
            "attention exponential sum overflowed (key_dim={}, heads={}); outputs are not finite",
            key_dim,
            config.num_heads
        );
    }
    Ok(())
}

fn check_lengths(
    config: &OperatorConfig,
    info: &ShapeInfo,
    inputs: &AttentionInputs<&[f32]>,
    output_len: usize,
) -> Result<(), AttentionError> {
    config.validate()?;
    if info.has_zero_extent() {
        return Err(AttentionError::shape(
            "query",
            format!("extents must be non-zero, got {info:?}"),
        ));
    }
    // Saturated products never equal a real slice length.
    let projection = config.num_heads.saturating_mul(config.key_dim);
    let expected = |input: AttentionInput| match input {
        AttentionInput::Query => info.output_len(),
        AttentionInput::Value => info.value_batches.saturating_mul(info.value_features),
        AttentionInput::QueryKernel | AttentionInput::OutputKernel => {
            info.query_features.saturating_mul(projection)
        }
        AttentionInput::KeyKernel | AttentionInput::ValueKernel => {
            info.value_features.saturating_mul(projection)
        }
        AttentionInput::QueryBias | AttentionInput::KeyBias | AttentionInput::ValueBias => {
            projection
        }
        AttentionInput::OutputBias => info.query_features,
    };
    for input in AttentionInput::ALL {
        let len = inputs.get(input).len();
        if len != expected(input) {
            return Err(AttentionError::shape(
                input.name(),
                format!("expected {} values, got {}", expected(input), len),
            ));
        }
    }
    if output_len != info.output_len() {
        return Err(AttentionError::shape(
            "attention_output",
            format!("expected {} values, got {}", info.output_len(), output_len),
        ));
    }
    Ok(())
}

/// Runs the node against the views handed out by the host.
pub fn invoke(ctx: &mut InvokeContext<'_>, state: &OperatorState) -> Result<(), AttentionError> {
    let handle = state.scratch.ok_or(AttentionError::MissingState)?;
    let views = AttentionInputs::try_from_fn(|input| ctx.input(input.index()))?;
    let info = ShapeInfo::resolve(views.query.dims(), views.value.dims())?;
    let data = views.map(|_, view| view.data());

    let mut output = ctx.output(OUTPUT_INDEX)?;
    let scratch = ctx.scratch(handle)?;
    let layout = ScratchLayout::new(info.value_batches, state.config.key_dim)?;
    forward(
        &state.config,
        &info,
        &data,
        layout.split(scratch)?,
        output.data_mut(),
    )
}
