//! Conversions between Candle tensors and arena-resident tensors.
//!
//! Candle is the host-side tensor library: weights are generated or loaded
//! as `candle_core::Tensor`s, copied into the model container, and results
//! are read back as tensors for comparison against reference kernels.

use candle_core::{DType, Device, Tensor};

use crate::errors::{Result, RuntimeError};
use crate::interpreter::Interpreter;
use crate::model::ModelBuilder;

fn flatten_f32(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

impl ModelBuilder {
    /// Adds a constant tensor copied from `tensor`.
    pub fn add_constant_tensor(&mut self, name: impl Into<String>, tensor: &Tensor) -> Result<usize> {
        let dims = tensor.dims().to_vec();
        self.add_constant(name, &dims, flatten_f32(tensor)?)
    }
}

impl Interpreter<'_> {
    /// Copies `tensor` into graph input `index`; shapes must match exactly.
    pub fn set_input_tensor(&mut self, index: usize, tensor: &Tensor) -> Result<()> {
        let expected = self.input_dims(index)?.to_vec();
        if tensor.dims() != expected.as_slice() {
            return Err(RuntimeError::InvalidModel(format!(
                "input {index} expects shape {:?}, got {:?}",
                expected,
                tensor.dims()
            )));
        }
        let values = flatten_f32(tensor)?;
        self.input_mut(index)?.copy_from_slice(&values);
        Ok(())
    }

    /// Copies graph output `index` into a CPU tensor.
    pub fn output_tensor(&self, index: usize) -> Result<Tensor> {
        let dims = self.output_dims(index)?.to_vec();
        let data = self.output(index)?;
        Ok(Tensor::from_slice(data, dims, &Device::Cpu)?)
    }
}
