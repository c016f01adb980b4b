//! Borrowed tensor views handed to kernels.

use std::cell::Cell;

/// Number of elements described by a dimension list, or `None` when the
/// product does not fit in `usize`.
pub fn element_count(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |count, &dim| count.checked_mul(dim))
}

/// Size in bytes of an `f32` tensor with these dimensions.
pub fn byte_len(dims: &[usize]) -> Option<usize> {
    element_count(dims)?.checked_mul(std::mem::size_of::<f32>())
}

/// Read-only view over a float tensor.
#[derive(Debug, Clone, Copy)]
pub struct TensorRef<'a> {
    dims: &'a [usize],
    data: &'a [f32],
}

impl<'a> TensorRef<'a> {
    pub fn new(dims: &'a [usize], data: &'a [f32]) -> Self {
        Self { dims, data }
    }

    pub fn dims(&self) -> &'a [usize] {
        self.dims
    }

    pub fn data(&self) -> &'a [f32] {
        self.data
    }
}

/// Writable view over a float tensor.
#[derive(Debug)]
pub struct TensorMut<'a> {
    dims: &'a [usize],
    data: &'a mut [f32],
}

impl<'a> TensorMut<'a> {
    pub fn new(dims: &'a [usize], data: &'a mut [f32]) -> Self {
        Self { dims, data }
    }

    pub fn dims(&self) -> &'a [usize] {
        self.dims
    }

    pub fn data(&self) -> &[f32] {
        &*self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut *self.data
    }
}

/// Shape-only handle acquired during prepare.
///
/// Dropping the guard releases the handle back to the context that issued it.
#[derive(Debug)]
pub struct TempTensor<'c> {
    dims: &'c [usize],
    outstanding: &'c Cell<usize>,
}

impl<'c> TempTensor<'c> {
    pub(crate) fn acquire(dims: &'c [usize], outstanding: &'c Cell<usize>) -> Self {
        outstanding.set(outstanding.get() + 1);
        Self { dims, outstanding }
    }

    pub fn dims(&self) -> &'c [usize] {
        self.dims
    }

    pub fn element_count(&self) -> Option<usize> {
        element_count(self.dims)
    }
}

impl Drop for TempTensor<'_> {
    fn drop(&mut self) {
        self.outstanding.set(self.outstanding.get() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_count_multiplies_dims() {
        assert_eq!(element_count(&[2, 3, 4]), Some(24));
        assert_eq!(element_count(&[]), Some(1));
        assert_eq!(byte_len(&[2, 3]), Some(24));
    }

    #[test]
    fn overflowing_dims_have_no_size() {
        assert_eq!(element_count(&[usize::MAX, 2]), None);
        assert_eq!(byte_len(&[1 << 62, 8]), None);
        assert_eq!(byte_len(&[usize::MAX / 2]), None);
    }
}
