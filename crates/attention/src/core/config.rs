//! Per-node operator configuration.
//!
//! The host stores the configuration as a FlexBuffers map with two integer
//! entries, `key_dim` and `num_heads`. FlexBuffers keeps map keys sorted, so
//! the decoder reads the values by position: `key_dim` first, `num_heads`
//! second. Key names are not checked; a buffer written with other names
//! decodes to whatever values sit in those positions.

use flexbuffers::{MapReader, Reader};
use serde::{Deserialize, Serialize};

use super::errors::AttentionError;

/// Decoded configuration of one attention node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Number of independent attention heads.
    pub num_heads: usize,
    /// Width of each head's query/key/value projection.
    pub key_dim: usize,
}

#[derive(Serialize, Deserialize)]
struct EncodedOptions {
    key_dim: i32,
    num_heads: i32,
}

impl OperatorConfig {
    pub fn new(num_heads: usize, key_dim: usize) -> Self {
        Self { num_heads, key_dim }
    }

    /// Decodes the options buffer attached to a node.
    ///
    /// Zero values are accepted here and rejected at prepare time; negative
    /// values cannot be represented and fail immediately.
    pub fn decode(buffer: &[u8]) -> Result<Self, AttentionError> {
        if buffer.is_empty() {
            return Err(AttentionError::config("options buffer is empty"));
        }
        let root = Reader::get_root(buffer)
            .map_err(|err| AttentionError::config(format!("malformed options buffer: {err}")))?;
        let map = root
            .get_map()
            .map_err(|err| AttentionError::config(format!("options are not a map: {err}")))?;
        if map.len() < 2 {
            return Err(AttentionError::config(format!(
                "expected 2 options, found {}",
                map.len()
            )));
        }
        let key_dim = read_count(&map, 0, "key_dim")?;
        let num_heads = read_count(&map, 1, "num_heads")?;
        Ok(Self { num_heads, key_dim })
    }

    /// Encodes the configuration the way the model container stores it.
    pub fn to_options(&self) -> Result<Vec<u8>, AttentionError> {
        let encoded = EncodedOptions {
            key_dim: to_i32(self.key_dim, "key_dim")?,
            num_heads: to_i32(self.num_heads, "num_heads")?,
        };
        flexbuffers::to_vec(&encoded)
            .map_err(|err| AttentionError::config(format!("failed to encode options: {err}")))
    }

    /// Rejects configurations the kernel cannot run.
    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.num_heads == 0 {
            return Err(AttentionError::InvalidArgument {
                arg: "num_heads",
                reason: "must be greater than zero".into(),
            });
        }
        if self.key_dim == 0 {
            return Err(AttentionError::InvalidArgument {
                arg: "key_dim",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

fn read_count(
    map: &MapReader<&[u8]>,
    position: usize,
    field: &'static str,
) -> Result<usize, AttentionError> {
    let value = map.index(position).map_err(|err| {
        AttentionError::config(format!("{field} (entry {position}) unreadable: {err}"))
    })?;
    let raw = match value.get_i64() {
        Ok(raw) => raw,
        Err(_) => {
            let unsigned = value.get_u64().map_err(|err| {
                AttentionError::config(format!("{field} (entry {position}) is not an integer: {err}"))
            })?;
            i64::try_from(unsigned)
                .map_err(|_| AttentionError::config(format!("{field} overflows: {unsigned}")))?
        }
    };
    usize::try_from(raw).map_err(|_| AttentionError::InvalidArgument {
        arg: field,
        reason: format!("must not be negative, got {raw}"),
    })
}

fn to_i32(value: usize, field: &'static str) -> Result<i32, AttentionError> {
    i32::try_from(value).map_err(|_| AttentionError::InvalidArgument {
        arg: field,
        reason: format!("{value} does not fit in i32"),
    })
}
