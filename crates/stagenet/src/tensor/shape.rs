//! Tensor shapes and axis bookkeeping.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{ensure_shape, NetError, NetResult};

/// Largest rank a tensor may take.
pub const MAX_AXES: usize = 32;

/// Logical dimensions of a tensor. A rank-0 shape describes a scalar (one element).
///
/// Every constructor checks that the product of the nonzero dimensions fits in `usize`, so
/// element counts over any axis range never overflow.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    /// Builds a shape, rejecting ranks above [`MAX_AXES`].
    pub fn new(dims: impl AsRef<[usize]>) -> NetResult<Self> {
        let dims = dims.as_ref();
        ensure_shape!(
            dims.len() <= MAX_AXES,
            "rank {} exceeds the maximum of {} axes",
            dims.len(),
            MAX_AXES
        );
        let fits = dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d.max(1)))
            .is_some();
        ensure_shape!(fits, "element count of {:?} overflows usize", dims);
        Ok(Shape {
            dims: SmallVec::from_slice(dims),
        })
    }

    /// Builds a shape from signed dimensions as they appear in descriptions.
    pub fn from_signed(dims: &[i64]) -> NetResult<Self> {
        let mut unsigned = SmallVec::<[usize; 4]>::with_capacity(dims.len());
        for (axis, &dim) in dims.iter().enumerate() {
            ensure_shape!(dim >= 0, "dimension {} is negative ({})", axis, dim);
            unsigned.push(dim as usize);
        }
        Shape::new(unsigned.as_slice())
    }

    /// One axis of length zero; the shape of a tensor that has never been reshaped.
    pub fn empty() -> Self {
        Shape {
            dims: SmallVec::from_slice(&[0]),
        }
    }

    /// Shape of a scalar.
    pub fn scalar() -> Self {
        Shape::default()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total element count; a scalar holds one element.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Product of the dimensions in `start..end`.
    pub fn count_range(&self, start: usize, end: usize) -> NetResult<usize> {
        ensure_shape!(
            start <= end && end <= self.rank(),
            "axis range {}..{} is invalid for rank {}",
            start,
            end,
            self.rank()
        );
        Ok(self.dims[start..end].iter().product())
    }

    /// Product of the dimensions from `start` to the last axis.
    pub fn count_from(&self, start: usize) -> NetResult<usize> {
        self.count_range(start, self.rank())
    }

    /// Resolves a possibly negative axis index (`-1` is the last axis).
    pub fn canonical_axis(&self, axis: i64) -> NetResult<usize> {
        let rank = self.rank() as i64;
        ensure_shape!(
            axis >= -rank && axis < rank,
            "axis {} is out of range for a tensor of rank {}",
            axis,
            rank
        );
        let resolved = if axis < 0 { axis + rank } else { axis };
        Ok(resolved as usize)
    }

    /// Size of a possibly negative axis.
    pub fn dim(&self, axis: i64) -> NetResult<usize> {
        Ok(self.dims[self.canonical_axis(axis)?])
    }

    /// Returns a copy with `axis` replaced by `size`.
    pub fn with_dim(&self, axis: usize, size: usize) -> NetResult<Self> {
        ensure_shape!(
            axis < self.rank(),
            "axis {} is out of range for rank {}",
            axis,
            self.rank()
        );
        let mut dims = self.dims.clone();
        dims[axis] = size;
        Shape::new(dims.as_slice())
    }
}

impl TryFrom<Vec<usize>> for Shape {
    type Error = NetError;

    fn try_from(dims: Vec<usize>) -> NetResult<Self> {
        Shape::new(dims)
    }
}

impl From<Shape> for Vec<usize> {
    fn from(shape: Shape) -> Self {
        shape.dims.into_vec()
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "{} ({})", parts.join(" "), self.num_elements())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_has_one_element() {
        assert_eq!(Shape::scalar().num_elements(), 1);
        assert_eq!(Shape::scalar().rank(), 0);
    }

    #[test]
    fn rejects_negative_and_oversized() {
        assert!(Shape::from_signed(&[2, -1]).is_err());
        assert!(Shape::new(vec![1; MAX_AXES + 1]).is_err());
        assert!(Shape::new(vec![1; MAX_AXES]).is_ok());
    }

    #[test]
    fn rejects_overflowing_element_counts() {
        assert!(matches!(
            Shape::new([1usize << 33, 1 << 33]),
            Err(NetError::Shape(_))
        ));
        assert!(Shape::new([0, 1usize << 33, 1 << 33]).is_err());
        assert!(Shape::new([0, usize::MAX]).is_ok());
        let wide = Shape::new([1usize << 20, 4]).unwrap();
        assert!(wide.with_dim(1, 1 << 50).is_err());
        assert!(serde_json::from_str::<Shape>("[8589934592, 8589934592]").is_err());
        assert_eq!(serde_json::from_str::<Shape>("[2, 3]").unwrap(), Shape::new([2, 3]).unwrap());
    }

    #[test]
    fn axis_helpers() {
        let shape = Shape::new([2, 3, 4, 5]).unwrap();
        assert_eq!(shape.canonical_axis(-1).unwrap(), 3);
        assert_eq!(shape.dim(1).unwrap(), 3);
        assert_eq!(shape.count_from(1).unwrap(), 60);
        assert_eq!(shape.count_range(1, 3).unwrap(), 12);
        assert!(shape.canonical_axis(4).is_err());
        assert!(shape.canonical_axis(-5).is_err());
    }
}
