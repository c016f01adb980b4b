//! Flattened batch/feature extents of the query and value activations.

use arena_runtime::tensor::element_count;

use crate::core::AttentionError;

/// Extents derived from the query and value shapes.
///
/// `*_features` is the last dimension, `*_batches` the product of all leading
/// dimensions. Recomputed at prepare and at every invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeInfo {
    pub query_batches: usize,
    pub query_features: usize,
    pub value_batches: usize,
    pub value_features: usize,
}

impl ShapeInfo {
    pub fn resolve(query: &[usize], value: &[usize]) -> Result<Self, AttentionError> {
        let (query_batches, query_features) = split_extent("query", query)?;
        let (value_batches, value_features) = split_extent("value", value)?;
        Ok(Self {
            query_batches,
            query_features,
            value_batches,
            value_features,
        })
    }

    /// Saturates on overflow.
    pub fn output_len(&self) -> usize {
        self.query_batches.saturating_mul(self.query_features)
    }

    pub(crate) fn has_zero_extent(&self) -> bool {
        self.query_batches == 0
            || self.query_features == 0
            || self.value_batches == 0
            || self.value_features == 0
    }
}

fn split_extent(tensor: &'static str, dims: &[usize]) -> Result<(usize, usize), AttentionError> {
    match dims {
        [leading @ .., features] if !leading.is_empty() => {
            if dims.contains(&0) {
                return Err(AttentionError::shape(
                    tensor,
                    format!("dimensions must be non-zero, got {dims:?}"),
                ));
            }
            let too_large =
                || AttentionError::shape(tensor, format!("{dims:?} is too large to address"));
            let batches = element_count(leading).ok_or_else(too_large)?;
            batches.checked_mul(*features).ok_or_else(too_large)?;
            Ok((batches, *features))
        }
        _ => Err(AttentionError::shape(
            tensor,
            format!("expected rank >= 2, got {dims:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_two_maps_directly() {
        let info = ShapeInfo::resolve(&[3, 5], &[7, 2]).unwrap();
        assert_eq!(
            info,
            ShapeInfo {
                query_batches: 3,
                query_features: 5,
                value_batches: 7,
                value_features: 2,
            }
        );
        assert_eq!(info.output_len(), 15);
    }

    #[test]
    fn leading_dimensions_are_flattened() {
        let info = ShapeInfo::resolve(&[2, 3, 4], &[1, 2, 3, 6]).unwrap();
        assert_eq!(info.query_batches, 6);
        assert_eq!(info.query_features, 4);
        assert_eq!(info.value_batches, 6);
        assert_eq!(info.value_features, 6);
    }

    #[test]
    fn resolution_is_idempotent() {
        let first = ShapeInfo::resolve(&[4, 8], &[9, 8]).unwrap();
        let second = ShapeInfo::resolve(&[4, 8], &[9, 8]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rank_below_two_is_rejected() {
        assert!(matches!(
            ShapeInfo::resolve(&[4], &[2, 2]),
            Err(AttentionError::InvalidShape { tensor: "query", .. })
        ));
        assert!(matches!(
            ShapeInfo::resolve(&[2, 2], &[]),
            Err(AttentionError::InvalidShape { tensor: "value", .. })
        ));
    }

    #[test]
    fn zero_extents_are_rejected() {
        assert!(ShapeInfo::resolve(&[0, 4], &[2, 2]).is_err());
        assert!(ShapeInfo::resolve(&[2, 4], &[2, 0]).is_err());
    }

    #[test]
    fn oversized_extents_are_rejected() {
        assert!(matches!(
            ShapeInfo::resolve(&[usize::MAX, 2, 3], &[1, 1]),
            Err(AttentionError::InvalidShape { tensor: "query", .. })
        ));
        assert!(matches!(
            ShapeInfo::resolve(&[2, 2], &[1 << 40, 1 << 40]),
            Err(AttentionError::InvalidShape { tensor: "value", .. })
        ));
    }
}
