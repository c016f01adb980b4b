//! In-memory model container.
//!
//! A [`Model`] lists tensors (constants carry their data, everything else is
//! an activation placed in the arena), the nodes that consume them, and the
//! graph inputs/outputs. Models round-trip through JSON so the demo can load
//! and dump them.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, RuntimeError};
use crate::tensor::{byte_len, element_count};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
    /// Present for constant (weight) tensors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<f32>>,
}

impl TensorSpec {
    pub fn is_constant(&self) -> bool {
        self.data.is_some()
    }

    /// `None` when the shape's element count overflows `usize`.
    pub fn element_count(&self) -> Option<usize> {
        element_count(&self.shape)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub op: String,
    /// Serialized operator options, opaque to the runtime.
    #[serde(default)]
    pub options: Vec<u8>,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub tensors: Vec<TensorSpec>,
    pub nodes: Vec<NodeSpec>,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

impl Model {
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let model: Model = serde_json::from_str(contents)?;
        model.validate()?;
        Ok(model)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    /// Checks structural invariants; all violations are reported together.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let count = self.tensors.len();

        for tensor in &self.tensors {
            if byte_len(&tensor.shape).is_none() {
                errors.push(format!(
                    "tensor '{}' with shape {:?} is too large to address",
                    tensor.name, tensor.shape
                ));
                continue;
            }
            if let Some(data) = &tensor.data {
                if Some(data.len()) != tensor.element_count() {
                    errors.push(format!(
                        "constant '{}' has {} values for shape {:?}",
                        tensor.name,
                        data.len(),
                        tensor.shape
                    ));
                }
            }
        }

        for (position, node) in self.nodes.iter().enumerate() {
            if node.op.trim().is_empty() {
                errors.push(format!("node {position} has an empty op name"));
            }
            for &index in node.inputs.iter().chain(&node.outputs) {
                if index >= count {
                    errors.push(format!(
                        "node {position} references tensor {index} ({count} tensors)"
                    ));
                }
            }
            for &index in &node.outputs {
                if self.tensors.get(index).is_some_and(TensorSpec::is_constant) {
                    errors.push(format!(
                        "node {position} writes constant tensor {index}"
                    ));
                }
            }
        }

        for (kind, list) in [("input", &self.inputs), ("output", &self.outputs)] {
            for &index in list {
                match self.tensors.get(index) {
                    None => errors.push(format!(
                        "graph {kind} {index} out of range ({count} tensors)"
                    )),
                    Some(tensor) if tensor.is_constant() => errors.push(format!(
                        "graph {kind} '{}' must not be a constant",
                        tensor.name
                    )),
                    Some(_) => {}
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::InvalidModel(errors.join("; ")))
        }
    }
}

/// Incremental constructor for [`Model`].
#[derive(Debug, Default)]
pub struct ModelBuilder {
    model: Model,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an activation tensor placed in the arena.
    pub fn add_tensor(&mut self, name: impl Into<String>, shape: &[usize]) -> usize {
        self.model.tensors.push(TensorSpec {
            name: name.into(),
            shape: shape.to_vec(),
            data: None,
        });
        self.model.tensors.len() - 1
    }

    /// Adds a constant tensor whose data lives in the model.
    pub fn add_constant(
        &mut self,
        name: impl Into<String>,
        shape: &[usize],
        data: Vec<f32>,
    ) -> Result<usize> {
        let name = name.into();
        let expected = element_count(shape).ok_or_else(|| {
            RuntimeError::InvalidModel(format!(
                "constant '{name}' with shape {shape:?} is too large to address"
            ))
        })?;
        if data.len() != expected {
            return Err(RuntimeError::ElementCount {
                name,
                expected,
                got: data.len(),
            });
        }
        self.model.tensors.push(TensorSpec {
            name,
            shape: shape.to_vec(),
            data: Some(data),
        });
        Ok(self.model.tensors.len() - 1)
    }

    pub fn add_node(
        &mut self,
        op: impl Into<String>,
        options: Vec<u8>,
        inputs: Vec<usize>,
        outputs: Vec<usize>,
    ) -> usize {
        self.model.nodes.push(NodeSpec {
            op: op.into(),
            options,
            inputs,
            outputs,
        });
        self.model.nodes.len() - 1
    }

    pub fn mark_input(&mut self, tensor: usize) -> &mut Self {
        self.model.inputs.push(tensor);
        self
    }

    pub fn mark_output(&mut self, tensor: usize) -> &mut Self {
        self.model.outputs.push(tensor);
        self
    }

    pub fn build(self) -> Result<Model> {
        self.model.validate()?;
        Ok(self.model)
    }
}
