//! Error types emitted by the arena runtime.

use thiserror::Error;

use crate::interpreter::NodeStage;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Failures raised while building or running a graph.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("arena exhausted: requested {requested} bytes, {available} bytes available")]
    ArenaExhausted { requested: usize, available: usize },

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("operator '{0}' is not registered")]
    UnknownOperator(String),

    #[error("operator '{0}' is already registered")]
    DuplicateOperator(String),

    #[error("op resolver is full ({capacity} operators)")]
    ResolverFull { capacity: usize },

    #[error("node {node}: {kind} index {index} out of range ({count} available)")]
    TensorIndex {
        node: usize,
        kind: &'static str,
        index: usize,
        count: usize,
    },

    #[error("graph {kind} index {index} out of range ({count} available)")]
    GraphIndex {
        kind: &'static str,
        index: usize,
        count: usize,
    },

    #[error("node {node}: scratch handle {handle} is not reserved or already resolved")]
    ScratchHandle { node: usize, handle: usize },

    #[error("node {node}: {kind} view {index} was already taken")]
    ViewTaken {
        node: usize,
        kind: &'static str,
        index: usize,
    },

    #[error("arena region at word offset {offset} with {len} words exceeds the arena")]
    RegionOutOfBounds { offset: usize, len: usize },

    #[error("arena regions overlap at word offset {offset}")]
    OverlappingRegions { offset: usize },

    #[error("node {node}: {outstanding} temporary tensor(s) not released after prepare")]
    TempTensorLeak { node: usize, outstanding: usize },

    #[error("node {node}: expected stage {expected:?}, found {found:?}")]
    InvalidStage {
        node: usize,
        expected: NodeStage,
        found: NodeStage,
    },

    #[error("node {node}: persistent state is missing or has an unexpected type")]
    MissingState { node: usize },

    #[error("tensor '{name}' expects {expected} elements, got {got}")]
    ElementCount {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("operator '{op}' failed at node {node}: {source}")]
    Kernel {
        op: String,
        node: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde_json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}
