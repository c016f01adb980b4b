//! Arena-backed interpreter for float tensor kernels.
//!
//! The runtime owns a single pre-sized [`Arena`], a [`Model`] describing the
//! graph, and an [`OpResolver`] mapping op names to [`Operator`]
//! implementations. Kernels never allocate: they see shapes through a
//! [`PrepareContext`] when the graph is built, reserve scratch memory there,
//! and receive borrowed views through an [`InvokeContext`] on every run.
//!
//! Only `f32` tensors are supported.

pub mod arena;
pub mod context;
pub mod errors;
pub mod interop;
pub mod interpreter;
pub mod model;
pub mod resolver;
pub mod tensor;

pub use arena::{AllocationKind, AllocationReport, Arena, ArenaRegion};
pub use context::{InvokeContext, PrepareContext, ScratchHandle};
pub use errors::{Result, RuntimeError};
pub use interpreter::{Interpreter, NodeStage};
pub use model::{Model, ModelBuilder, NodeSpec, TensorSpec};
pub use resolver::{OpResolver, Operator};
pub use tensor::{TempTensor, TensorMut, TensorRef};
