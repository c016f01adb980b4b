//! Persistent per-node state and the scratch layout it points to.

use std::mem::size_of;

use arena_runtime::ScratchHandle;

use crate::core::{AttentionError, OperatorConfig};

/// State kept by the host for one attention node.
#[derive(Debug, Clone)]
pub struct OperatorState {
    pub config: OperatorConfig,
    /// Set by a successful prepare.
    pub scratch: Option<ScratchHandle>,
}

impl OperatorState {
    pub fn new(config: OperatorConfig) -> Self {
        Self {
            config,
            scratch: None,
        }
    }
}

/// Layout of the node's scratch region, in floats:
///
/// | region | length                     |
/// |--------|----------------------------|
/// | kproj  | `value_batches * key_dim`  |
/// | vproj  | `value_batches * key_dim`  |
/// | qbuf   | `key_dim`                  |
/// | vbuf   | `key_dim`                  |
///
/// Heads run one after another and reuse the same four regions, so the size
/// does not depend on `num_heads`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchLayout {
    projection: usize,
    key_dim: usize,
    len: usize,
}

/// Disjoint views into one scratch region.
#[derive(Debug)]
pub struct ScratchViews<'a> {
    pub kproj: &'a mut [f32],
    pub vproj: &'a mut [f32],
    pub qbuf: &'a mut [f32],
    pub vbuf: &'a mut [f32],
}

impl ScratchLayout {
    /// Fails when the region, in bytes, would not fit in `usize`.
    pub fn new(value_batches: usize, key_dim: usize) -> Result<Self, AttentionError> {
        let projection = value_batches.checked_mul(key_dim);
        let len = projection
            .and_then(|projection| projection.checked_add(key_dim))
            .and_then(|half| half.checked_mul(2));
        match (projection, len) {
            (Some(projection), Some(len)) if len.checked_mul(size_of::<f32>()).is_some() => {
                Ok(Self {
                    projection,
                    key_dim,
                    len,
                })
            }
            _ => Err(AttentionError::shape(
                "value",
                format!(
                    "scratch for {value_batches} rows of key_dim {key_dim} is too large to address"
                ),
            )),
        }
    }

    /// Total length in floats.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size to request from the arena.
    pub fn bytes(&self) -> usize {
        self.len * size_of::<f32>()
    }

    /// Splits `buffer` into the four regions. Extra trailing space is ignored.
    pub fn split<'a>(&self, buffer: &'a mut [f32]) -> Result<ScratchViews<'a>, AttentionError> {
        let required = self.len();
        if buffer.len() < required {
            return Err(AttentionError::ScratchTooSmall {
                required,
                available: buffer.len(),
            });
        }
        let (kproj, rest) = buffer[..required].split_at_mut(self.projection);
        let (vproj, rest) = rest.split_at_mut(self.projection);
        let (qbuf, vbuf) = rest.split_at_mut(self.key_dim);
        Ok(ScratchViews {
            kproj,
            vproj,
            qbuf,
            vbuf,
        })
    }
}
