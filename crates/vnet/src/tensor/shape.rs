//! Lightweight wrapper for tensor shapes and dimension bookkeeping.

use anyhow::{ensure, Result};

/// Stores the logical dimensions of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions.
    ///
    /// Panics if `dims` is empty, ensuring every tensor has at least one axis.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        let dims = dims.into();
        assert!(!dims.is_empty(), "shape must have at least one dimension");
        Shape { dims }
    }

    /// Fallible counterpart of [`Shape::new`] for dimensions read from untrusted input.
    pub fn try_new<D: Into<Vec<usize>>>(dims: D) -> Result<Self> {
        let dims = dims.into();
        ensure!(!dims.is_empty(), "shape must have at least one dimension");
        Ok(Shape { dims })
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_elements() {
        let shape = Shape::new([2, 3, 4, 5]);
        assert_eq!(shape.rank(), 4);
        assert_eq!(shape.num_elements(), 120);
    }

    #[test]
    fn rejects_empty_dims() {
        assert!(Shape::try_new(Vec::<usize>::new()).is_err());
    }
}
