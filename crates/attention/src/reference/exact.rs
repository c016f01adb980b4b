//! Candle implementation of the multi-head attention node.
//!
//! Computes the same function as [`crate::kernel::forward`] with dense
//! matmuls and a max-subtracted softmax, in `f32` on the tensors' device.

use std::sync::OnceLock;

use candle_core::{DType, Result as CandleResult, Tensor, D};
use candle_nn::ops::softmax_last_dim;

use crate::core::{AttentionError, OperatorConfig};
use crate::io::AttentionInputs;
use crate::shape::ShapeInfo;

/// Dense reference for one attention node.
#[derive(Debug)]
pub struct ExactAttention {
    config: OperatorConfig,
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new(config: OperatorConfig) -> Self {
        Self {
            config,
            first_call: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Returns a tensor with the query's shape.
    pub fn attend(&self, inputs: &AttentionInputs<Tensor>) -> Result<Tensor, AttentionError> {
        self.config.validate()?;
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init heads={} key_dim={} device={:?}",
                self.config.num_heads,
                self.config.key_dim,
                inputs.query.device().location()
            );
        }

        let device = inputs.query.device();
        if !device.same_device(inputs.value.device()) {
            return Err(AttentionError::shape(
                "value",
                "query and value must reside on the same device",
            ));
        }

        let info = ShapeInfo::resolve(inputs.query.dims(), inputs.value.dims())?;
        let heads = self.config.num_heads;
        let key_dim = self.config.key_dim;
        let qf = info.query_features;
        let vf = info.value_features;

        let f32_of = |tensor: &Tensor| tensor.to_dtype(DType::F32);
        let query = f32_of(&inputs.query)?.reshape((info.query_batches, qf))?;
        let value = f32_of(&inputs.value)?.reshape((info.value_batches, vf))?;
        let query_kernel = f32_of(&inputs.query_kernel)?.reshape((qf, heads, key_dim))?;
        let key_kernel = f32_of(&inputs.key_kernel)?.reshape((vf, heads, key_dim))?;
        let value_kernel = f32_of(&inputs.value_kernel)?.reshape((vf, heads, key_dim))?;
        let query_bias = f32_of(&inputs.query_bias)?.reshape((heads, key_dim))?;
        let key_bias = f32_of(&inputs.key_bias)?.reshape((heads, key_dim))?;
        let value_bias = f32_of(&inputs.value_bias)?.reshape((heads, key_dim))?;
        let output_kernel = f32_of(&inputs.output_kernel)?.reshape((heads, key_dim, qf))?;
        let output_bias = f32_of(&inputs.output_bias)?.reshape(qf)?;

        let scale = 1.0 / (key_dim as f32).sqrt();
        let mut output = output_bias
            .unsqueeze(0)?
            .broadcast_as((info.query_batches, qf))?
            .contiguous()?;

        for head in 0..heads {
            let q = project(&query, &query_kernel, &query_bias, head)?;
            let k = project(&value, &key_kernel, &key_bias, head)?;
            let v = project(&value, &value_kernel, &value_bias, head)?;

            let scores = q.matmul(&k.t()?.contiguous()?)?.mul_scalar(scale)?;
            let weights = softmax_last_dim(&scores)?;
            let mixed = weights.matmul(&v)?;
            let head_out = mixed.matmul(&output_kernel.get(head)?.contiguous()?)?;
            output = (output + head_out)?;
        }

        Ok(output.reshape(inputs.query.dims())?)
    }
}

/// `rows @ kernel[:, head, :] + bias[head]`.
fn project(rows: &Tensor, kernel: &Tensor, bias: &Tensor, head: usize) -> CandleResult<Tensor> {
    let weight = kernel.narrow(1, head, 1)?.squeeze(1)?.contiguous()?;
    let bias = bias.get(head)?;
    rows.matmul(&weight)?.broadcast_add(&bias.unsqueeze(0)?)
}

/// Row sums of softmax weights; used to check normalization.
pub fn softmax_row_sums(scores: &Tensor) -> CandleResult<Tensor> {
    softmax_last_dim(scores)?.sum(D::Minus1)
}

trait MulScalarExt {
    fn mul_scalar(&self, value: f32) -> CandleResult<Tensor>;
}

impl MulScalarExt for Tensor {
    fn mul_scalar(&self, value: f32) -> CandleResult<Tensor> {
        let scalar = Tensor::new(value, self.device())?;
        let scalar = scalar.broadcast_as(self.shape())?;
        self.mul(&scalar)
    }
}
