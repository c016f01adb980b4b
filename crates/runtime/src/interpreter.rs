//! Graph interpreter driving registered kernels over a single arena.
//!
//! Building a graph walks every node through `Unconfigured -> Configured ->
//! Prepared -> Ready`. Any failure on the way is terminal: the interpreter
//! refuses to invoke until a fresh one is built.

use std::any::Any;

use crate::arena::{AllocationKind, AllocationReport, Arena, ArenaRegion};
use crate::context::{InvokeContext, PrepareContext};
use crate::errors::{Result, RuntimeError};
use crate::model::Model;
use crate::resolver::{OpResolver, StageFailure};
use crate::tensor::{byte_len, TensorMut, TensorRef};

/// Lifecycle stage of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStage {
    Unconfigured,
    Configured,
    Prepared,
    Ready,
}

#[derive(Debug)]
enum Storage {
    Constant(Vec<f32>),
    Arena(ArenaRegion),
    Unallocated,
}

#[derive(Debug)]
struct TensorSlot {
    name: String,
    dims: Vec<usize>,
    storage: Storage,
}

#[derive(Debug)]
struct NodeRuntime {
    op: String,
    options: Vec<u8>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    scratch: Vec<ArenaRegion>,
    stage: NodeStage,
}

pub struct Interpreter<'r> {
    resolver: &'r OpResolver,
    arena: Arena,
    tensors: Vec<TensorSlot>,
    nodes: Vec<NodeRuntime>,
    /// Per-node persistent state, indexed by node position.
    states: Vec<Option<Box<dyn Any>>>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

impl<'r> Interpreter<'r> {
    pub fn new(model: Model, resolver: &'r OpResolver, arena_bytes: usize) -> Result<Self> {
        model.validate()?;
        let Model {
            tensors,
            nodes,
            inputs,
            outputs,
        } = model;

        let tensors = tensors
            .into_iter()
            .map(|spec| TensorSlot {
                name: spec.name,
                dims: spec.shape,
                storage: match spec.data {
                    Some(data) => Storage::Constant(data),
                    None => Storage::Unallocated,
                },
            })
            .collect();
        let nodes: Vec<NodeRuntime> = nodes
            .into_iter()
            .map(|spec| NodeRuntime {
                op: spec.op,
                options: spec.options,
                inputs: spec.inputs,
                outputs: spec.outputs,
                scratch: Vec::new(),
                stage: NodeStage::Unconfigured,
            })
            .collect();
        let states = nodes.iter().map(|_| None).collect();

        Ok(Self {
            resolver,
            arena: Arena::new(arena_bytes),
            tensors,
            nodes,
            states,
            inputs,
            outputs,
        })
    }

    /// Decodes, places and prepares the whole graph.
    pub fn allocate_tensors(&mut self) -> Result<()> {
        for index in 0..self.nodes.len() {
            self.configure_node(index)?;
        }
        self.place_activations()?;
        for index in 0..self.nodes.len() {
            self.prepare_node(index)?;
        }
        for node in &mut self.nodes {
            node.stage = NodeStage::Ready;
        }
        log::info!(
            "graph ready: nodes={} arena_used={} / {} bytes",
            self.nodes.len(),
            self.arena.used_bytes(),
            self.arena.capacity_bytes()
        );
        Ok(())
    }

    fn configure_node(&mut self, index: usize) -> Result<()> {
        let node = &mut self.nodes[index];
        expect_stage(index, node.stage, NodeStage::Unconfigured)?;
        let operator = self.resolver.find(&node.op)?;
        self.arena.allocate_persistent(
            format!("node {index} ({}) state", node.op),
            operator.state_bytes(),
        )?;
        let state = operator
            .init(&node.options)
            .map_err(|source| RuntimeError::Kernel {
                op: node.op.clone(),
                node: index,
                source,
            })?;
        self.states[index] = Some(state);
        node.stage = NodeStage::Configured;
        Ok(())
    }

    fn place_activations(&mut self) -> Result<()> {
        for slot in &mut self.tensors {
            if let Storage::Unallocated = slot.storage {
                let bytes = byte_len(&slot.dims).ok_or_else(|| {
                    RuntimeError::InvalidModel(format!(
                        "tensor '{}' with shape {:?} is too large to address",
                        slot.name, slot.dims
                    ))
                })?;
                let region = self
                    .arena
                    .allocate(AllocationKind::Tensor, slot.name.clone(), bytes)?;
                slot.storage = Storage::Arena(region);
            }
        }
        Ok(())
    }

    fn prepare_node(&mut self, index: usize) -> Result<()> {
        let Self {
            resolver,
            arena,
            tensors,
            nodes,
            states,
            ..
        } = self;
        let node = &mut nodes[index];
        expect_stage(index, node.stage, NodeStage::Configured)?;
        let operator = resolver.find(&node.op)?;
        let state = states[index]
            .as_mut()
            .ok_or(RuntimeError::MissingState { node: index })?;

        let input_dims = node
            .inputs
            .iter()
            .map(|&tensor| tensors[tensor].dims.as_slice())
            .collect();
        let output_dims = node
            .outputs
            .iter()
            .map(|&tensor| tensors[tensor].dims.as_slice())
            .collect();
        let mut ctx = PrepareContext::new(index, input_dims, output_dims, arena, &mut node.scratch);

        let outcome = operator.prepare(&mut ctx, &mut **state);
        let outstanding = ctx.outstanding_temps();
        drop(ctx);
        if outstanding != 0 {
            if let Err(err) = stage_result(outcome, &node.op, index) {
                log::error!("{err}");
            }
            return Err(RuntimeError::TempTensorLeak {
                node: index,
                outstanding,
            });
        }
        stage_result(outcome, &node.op, index)?;
        node.stage = NodeStage::Prepared;
        Ok(())
    }

    pub fn invoke(&mut self) -> Result<()> {
        for index in 0..self.nodes.len() {
            self.invoke_node(index)?;
        }
        Ok(())
    }

    fn invoke_node(&mut self, index: usize) -> Result<()> {
        let Self {
            resolver,
            arena,
            tensors,
            nodes,
            states,
            ..
        } = self;
        let node = &nodes[index];
        expect_stage(index, node.stage, NodeStage::Ready)?;
        let operator = resolver.find(&node.op)?;
        let state = states[index]
            .as_ref()
            .ok_or(RuntimeError::MissingState { node: index })?;

        let mut reads = Vec::new();
        for &tensor in &node.inputs {
            if let Storage::Arena(region) = tensors[tensor].storage {
                reads.push(region);
            }
        }
        let mut writes = Vec::with_capacity(node.outputs.len() + node.scratch.len());
        for &tensor in &node.outputs {
            match tensors[tensor].storage {
                Storage::Arena(region) => writes.push(region),
                _ => {
                    return Err(RuntimeError::InvalidModel(format!(
                        "node {index} output '{}' has no arena storage",
                        tensors[tensor].name
                    )))
                }
            }
        }
        writes.extend(node.scratch.iter().copied());

        let carved = arena.carve(&reads, &writes)?;
        let mut arena_reads = carved.reads.into_iter();
        let mut arena_writes = carved.writes.into_iter();

        let mut inputs = Vec::with_capacity(node.inputs.len());
        for &tensor in &node.inputs {
            let slot = &tensors[tensor];
            let data = match &slot.storage {
                Storage::Constant(data) => data.as_slice(),
                Storage::Arena(_) => arena_reads.next().ok_or_else(|| {
                    RuntimeError::InvalidModel(format!(
                        "node {index}: no arena view for input '{}'",
                        slot.name
                    ))
                })?,
                Storage::Unallocated => {
                    return Err(RuntimeError::InvalidModel(format!(
                        "tensor '{}' was never allocated",
                        slot.name
                    )))
                }
            };
            inputs.push(TensorRef::new(&slot.dims, data));
        }
        let outputs = node
            .outputs
            .iter()
            .zip(arena_writes.by_ref())
            .map(|(&tensor, data)| TensorMut::new(&tensors[tensor].dims, data))
            .collect();
        let scratch = arena_writes.collect();

        let mut ctx = InvokeContext::new(index, inputs, outputs, scratch);
        stage_result(operator.invoke(&mut ctx, &**state), &node.op, index)
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn input_dims(&self, index: usize) -> Result<&[usize]> {
        let tensor = graph_tensor(&self.inputs, "input", index)?;
        Ok(&self.tensors[tensor].dims)
    }

    pub fn output_dims(&self, index: usize) -> Result<&[usize]> {
        let tensor = graph_tensor(&self.outputs, "output", index)?;
        Ok(&self.tensors[tensor].dims)
    }

    /// Writable data of graph input `index`; valid after [`Self::allocate_tensors`].
    pub fn input_mut(&mut self, index: usize) -> Result<&mut [f32]> {
        let tensor = graph_tensor(&self.inputs, "input", index)?;
        let region = self.arena_region(tensor)?;
        Ok(self.arena.slice_mut(region))
    }

    pub fn output(&self, index: usize) -> Result<&[f32]> {
        let tensor = graph_tensor(&self.outputs, "output", index)?;
        let region = self.arena_region(tensor)?;
        Ok(self.arena.slice(region))
    }

    pub fn node_stage(&self, index: usize) -> Option<NodeStage> {
        self.nodes.get(index).map(|node| node.stage)
    }

    pub fn allocation_report(&self) -> AllocationReport {
        self.arena.report()
    }

    fn arena_region(&self, tensor: usize) -> Result<ArenaRegion> {
        let slot = &self.tensors[tensor];
        match slot.storage {
            Storage::Arena(region) => Ok(region),
            _ => Err(RuntimeError::InvalidModel(format!(
                "tensor '{}' has no arena storage; call allocate_tensors first",
                slot.name
            ))),
        }
    }
}

fn graph_tensor(list: &[usize], kind: &'static str, index: usize) -> Result<usize> {
    list.get(index).copied().ok_or(RuntimeError::GraphIndex {
        kind,
        index,
        count: list.len(),
    })
}

fn expect_stage(node: usize, found: NodeStage, expected: NodeStage) -> Result<()> {
    if found == expected {
        Ok(())
    } else {
        Err(RuntimeError::InvalidStage {
            node,
            expected,
            found,
        })
    }
}

fn stage_result(
    outcome: std::result::Result<(), StageFailure>,
    op: &str,
    node: usize,
) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(StageFailure::MissingState) => Err(RuntimeError::MissingState { node }),
        Err(StageFailure::Kernel(source)) => Err(RuntimeError::Kernel {
            op: op.to_string(),
            node,
            source,
        }),
    }
}
