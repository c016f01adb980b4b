//! Per-stage contexts exposed to operator kernels.
//!
//! [`PrepareContext`] only exposes shapes: kernels acquire scoped
//! [`TempTensor`] guards to inspect them and reserve scratch space in the
//! arena. [`InvokeContext`] exposes data views resolved fresh for every
//! invocation; nothing handed out here outlives the call.

use std::cell::Cell;

use crate::arena::{AllocationKind, Arena, ArenaRegion};
use crate::errors::{Result, RuntimeError};
use crate::tensor::{TempTensor, TensorMut, TensorRef};

/// Opaque identifier of a scratch region reserved by one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScratchHandle(usize);

impl ScratchHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

pub struct PrepareContext<'a> {
    node: usize,
    inputs: Vec<&'a [usize]>,
    outputs: Vec<&'a [usize]>,
    arena: &'a mut Arena,
    scratch: &'a mut Vec<ArenaRegion>,
    outstanding: Cell<usize>,
}

impl<'a> PrepareContext<'a> {
    pub(crate) fn new(
        node: usize,
        inputs: Vec<&'a [usize]>,
        outputs: Vec<&'a [usize]>,
        arena: &'a mut Arena,
        scratch: &'a mut Vec<ArenaRegion>,
    ) -> Self {
        Self {
            node,
            inputs,
            outputs,
            arena,
            scratch,
            outstanding: Cell::new(0),
        }
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Acquires a temporary shape handle for input `index`.
    pub fn acquire_input(&self, index: usize) -> Result<TempTensor<'_>> {
        let dims = self
            .inputs
            .get(index)
            .copied()
            .ok_or(RuntimeError::TensorIndex {
                node: self.node,
                kind: "input",
                index,
                count: self.inputs.len(),
            })?;
        Ok(TempTensor::acquire(dims, &self.outstanding))
    }

    /// Acquires a temporary shape handle for output `index`.
    pub fn acquire_output(&self, index: usize) -> Result<TempTensor<'_>> {
        let dims = self
            .outputs
            .get(index)
            .copied()
            .ok_or(RuntimeError::TensorIndex {
                node: self.node,
                kind: "output",
                index,
                count: self.outputs.len(),
            })?;
        Ok(TempTensor::acquire(dims, &self.outstanding))
    }

    /// Number of temporary handles not yet released.
    pub fn outstanding_temps(&self) -> usize {
        self.outstanding.get()
    }

    /// Reserves `bytes` of node-owned scratch space in the arena.
    pub fn request_scratch(&mut self, bytes: usize) -> Result<ScratchHandle> {
        let label = format!("node {} scratch {}", self.node, self.scratch.len());
        let region = self
            .arena
            .allocate(AllocationKind::Scratch, label, bytes)?;
        self.scratch.push(region);
        Ok(ScratchHandle(self.scratch.len() - 1))
    }
}

pub struct InvokeContext<'a> {
    node: usize,
    inputs: Vec<TensorRef<'a>>,
    outputs: Vec<Option<TensorMut<'a>>>,
    scratch: Vec<Option<&'a mut [f32]>>,
}

impl<'a> InvokeContext<'a> {
    pub(crate) fn new(
        node: usize,
        inputs: Vec<TensorRef<'a>>,
        outputs: Vec<TensorMut<'a>>,
        scratch: Vec<&'a mut [f32]>,
    ) -> Self {
        Self {
            node,
            inputs,
            outputs: outputs.into_iter().map(Some).collect(),
            scratch: scratch.into_iter().map(Some).collect(),
        }
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, index: usize) -> Result<TensorRef<'a>> {
        self.inputs
            .get(index)
            .copied()
            .ok_or(RuntimeError::TensorIndex {
                node: self.node,
                kind: "input",
                index,
                count: self.inputs.len(),
            })
    }

    /// Takes the writable view of output `index`; each output can be taken once.
    pub fn output(&mut self, index: usize) -> Result<TensorMut<'a>> {
        let count = self.outputs.len();
        let slot = self
            .outputs
            .get_mut(index)
            .ok_or(RuntimeError::TensorIndex {
                node: self.node,
                kind: "output",
                index,
                count,
            })?;
        slot.take().ok_or(RuntimeError::ViewTaken {
            node: self.node,
            kind: "output",
            index,
        })
    }

    /// Resolves a scratch handle to its buffer for this invocation.
    pub fn scratch(&mut self, handle: ScratchHandle) -> Result<&'a mut [f32]> {
        self.scratch
            .get_mut(handle.0)
            .and_then(Option::take)
            .ok_or(RuntimeError::ScratchHandle {
                node: self.node,
                handle: handle.0,
            })
    }
}
