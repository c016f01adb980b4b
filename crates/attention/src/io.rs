//! Named view of the node's ten inputs.
//!
//! The host addresses node tensors by position. Everything inside the crate
//! goes through [`AttentionInputs`], and the positional contract lives only in
//! [`AttentionInput::index`].

use std::fmt;

/// Position of the single output tensor.
pub const OUTPUT_INDEX: usize = 0;

/// The ten inputs of an attention node in host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttentionInput {
    Query,
    Value,
    QueryKernel,
    QueryBias,
    KeyKernel,
    KeyBias,
    ValueKernel,
    ValueBias,
    OutputKernel,
    OutputBias,
}

impl AttentionInput {
    pub const ALL: [AttentionInput; 10] = [
        AttentionInput::Query,
        AttentionInput::Value,
        AttentionInput::QueryKernel,
        AttentionInput::QueryBias,
        AttentionInput::KeyKernel,
        AttentionInput::KeyBias,
        AttentionInput::ValueKernel,
        AttentionInput::ValueBias,
        AttentionInput::OutputKernel,
        AttentionInput::OutputBias,
    ];

    pub const fn index(self) -> usize {
        match self {
            AttentionInput::Query => 0,
            AttentionInput::Value => 1,
            AttentionInput::QueryKernel => 2,
            AttentionInput::QueryBias => 3,
            AttentionInput::KeyKernel => 4,
            AttentionInput::KeyBias => 5,
            AttentionInput::ValueKernel => 6,
            AttentionInput::ValueBias => 7,
            AttentionInput::OutputKernel => 8,
            AttentionInput::OutputBias => 9,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            AttentionInput::Query => "query",
            AttentionInput::Value => "value",
            AttentionInput::QueryKernel => "query_kernel",
            AttentionInput::QueryBias => "query_bias",
            AttentionInput::KeyKernel => "key_kernel",
            AttentionInput::KeyBias => "key_bias",
            AttentionInput::ValueKernel => "value_kernel",
            AttentionInput::ValueBias => "value_bias",
            AttentionInput::OutputKernel => "output_kernel",
            AttentionInput::OutputBias => "output_bias",
        }
    }
}

impl fmt::Display for AttentionInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One value per attention input, addressed by name.
///
/// `T` is whatever the caller works with at that boundary: shape lists during
/// prepare, data slices during invoke, tensor ids while building a model, or
/// candle tensors on the reference path.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionInputs<T> {
    pub query: T,
    pub value: T,
    pub query_kernel: T,
    pub query_bias: T,
    pub key_kernel: T,
    pub key_bias: T,
    pub value_kernel: T,
    pub value_bias: T,
    pub output_kernel: T,
    pub output_bias: T,
}

impl<T> AttentionInputs<T> {
    /// Builds the descriptor by calling `f` once per input in index order,
    /// stopping at the first error.
    pub fn try_from_fn<E>(
        mut f: impl FnMut(AttentionInput) -> Result<T, E>,
    ) -> Result<Self, E> {
        Ok(Self {
            query: f(AttentionInput::Query)?,
            value: f(AttentionInput::Value)?,
            query_kernel: f(AttentionInput::QueryKernel)?,
            query_bias: f(AttentionInput::QueryBias)?,
            key_kernel: f(AttentionInput::KeyKernel)?,
            key_bias: f(AttentionInput::KeyBias)?,
            value_kernel: f(AttentionInput::ValueKernel)?,
            value_bias: f(AttentionInput::ValueBias)?,
            output_kernel: f(AttentionInput::OutputKernel)?,
            output_bias: f(AttentionInput::OutputBias)?,
        })
    }

    pub fn get(&self, input: AttentionInput) -> &T {
        match input {
            AttentionInput::Query => &self.query,
            AttentionInput::Value => &self.value,
            AttentionInput::QueryKernel => &self.query_kernel,
            AttentionInput::QueryBias => &self.query_bias,
            AttentionInput::KeyKernel => &self.key_kernel,
            AttentionInput::KeyBias => &self.key_bias,
            AttentionInput::ValueKernel => &self.value_kernel,
            AttentionInput::ValueBias => &self.value_bias,
            AttentionInput::OutputKernel => &self.output_kernel,
            AttentionInput::OutputBias => &self.output_bias,
        }
    }

    pub fn map<'s, U>(
        &'s self,
        mut f: impl FnMut(AttentionInput, &'s T) -> U,
    ) -> AttentionInputs<U> {
        AttentionInputs {
            query: f(AttentionInput::Query, &self.query),
            value: f(AttentionInput::Value, &self.value),
            query_kernel: f(AttentionInput::QueryKernel, &self.query_kernel),
            query_bias: f(AttentionInput::QueryBias, &self.query_bias),
            key_kernel: f(AttentionInput::KeyKernel, &self.key_kernel),
            key_bias: f(AttentionInput::KeyBias, &self.key_bias),
            value_kernel: f(AttentionInput::ValueKernel, &self.value_kernel),
            value_bias: f(AttentionInput::ValueBias, &self.value_bias),
            output_kernel: f(AttentionInput::OutputKernel, &self.output_kernel),
            output_bias: f(AttentionInput::OutputBias, &self.output_bias),
        }
    }

    /// Values in host index order.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        AttentionInput::ALL
            .iter()
            .map(|&input| self.get(input).clone())
            .collect()
    }
}
