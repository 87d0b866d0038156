use std::sync::Arc;

use derive_more::{Display, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("shape error: shape must have at least one axis")]
    Empty,
    #[error("shape error: shape {0:?} has a zero-sized axis")]
    Zero(Vec<usize>),
}

/// Dimensions of a blob. The last axis is the batch axis.
///
/// Elements are stored with the first axis varying fastest, so every sample along the batch axis
/// occupies a contiguous run of [`Shape::sample_len`] elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Into)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "Vec<usize>", into = "Vec<usize>"))]
#[display("[{}]", _0.iter().format(", "))]
pub struct Shape(Arc<[usize]>);

impl TryFrom<Vec<usize>> for Shape {
    type Error = ShapeError;

    fn try_from(dims: Vec<usize>) -> Result<Self, Self::Error> {
        Self::new(dims)
    }
}

impl From<Shape> for Vec<usize> {
    fn from(shape: Shape) -> Self {
        shape.0.to_vec()
    }
}

impl Shape {
    /// Creates a shape, rejecting empty shapes and zero-sized axes.
    pub fn new(dims: impl Into<Vec<usize>>) -> Result<Self, ShapeError> {
        let dims: Vec<usize> = dims.into();
        if dims.is_empty() {
            return Err(ShapeError::Empty);
        }
        if dims.contains(&0) {
            return Err(ShapeError::Zero(dims));
        }
        Ok(Self(dims.into()))
    }

    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of axes.
    #[inline]
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements.
    #[inline]
    pub fn count(&self) -> usize {
        self.0.iter().product()
    }

    /// Size of the batch (last) axis.
    #[inline]
    pub fn batch(&self) -> usize {
        self.0[self.0.len() - 1]
    }

    /// Number of elements in one sample, i.e. the product of all non-batch axes.
    #[inline]
    pub fn sample_len(&self) -> usize {
        self.count() / self.batch()
    }
}

pub trait IntoShape {
    fn into_shape(self) -> Result<Shape, ShapeError>;
}

impl IntoShape for Shape {
    #[inline]
    fn into_shape(self) -> Result<Shape, ShapeError> {
        Ok(self)
    }
}

impl IntoShape for &Shape {
    #[inline]
    fn into_shape(self) -> Result<Shape, ShapeError> {
        Ok(self.clone())
    }
}

impl<const N: usize> IntoShape for [usize; N] {
    #[inline]
    fn into_shape(self) -> Result<Shape, ShapeError> {
        Shape::new(self)
    }
}

impl IntoShape for Vec<usize> {
    #[inline]
    fn into_shape(self) -> Result<Shape, ShapeError> {
        Shape::new(self)
    }
}

impl IntoShape for &[usize] {
    #[inline]
    fn into_shape(self) -> Result<Shape, ShapeError> {
        Shape::new(self)
    }
}
