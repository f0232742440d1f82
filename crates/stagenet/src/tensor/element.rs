//! Scalar element types a tensor can hold.

use std::fmt;

use num_traits::{Float, NumAssign};

/// Logical dtype identifier used in diagnostics and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit IEEE-754 float.
    F32,
    /// 64-bit IEEE-754 float.
    F64,
    /// 32-bit signed integer, mostly for labels and indices.
    I32,
    /// 32-bit unsigned integer.
    U32,
}

impl DType {
    /// Returns the number of bytes required per scalar element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 | DType::U32 => 4,
            DType::F64 => 8,
        }
    }

    /// Reports whether gradient steps and reductions are defined for the dtype.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

/// Trait describing the numeric behaviour tensor storage relies on.
pub trait Element:
    NumAssign + Copy + Default + PartialOrd + fmt::Debug + Send + Sync + 'static
{
    const DTYPE: DType;

    /// Absolute value; identity for unsigned types.
    fn abs_value(self) -> Self;

    fn of_f64(v: f64) -> Self;

    fn as_f64(self) -> f64;
}

/// Floating element types; every graph computes in one of these.
pub trait FloatElement: Element + Float {}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn abs_value(self) -> Self {
        self.abs()
    }

    fn of_f64(v: f64) -> Self {
        v as f32
    }

    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;

    fn abs_value(self) -> Self {
        self.abs()
    }

    fn of_f64(v: f64) -> Self {
        v
    }

    fn as_f64(self) -> f64 {
        self
    }
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;

    fn abs_value(self) -> Self {
        self.wrapping_abs()
    }

    fn of_f64(v: f64) -> Self {
        v as i32
    }

    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl Element for u32 {
    const DTYPE: DType = DType::U32;

    fn abs_value(self) -> Self {
        self
    }

    fn of_f64(v: f64) -> Self {
        v as u32
    }

    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl FloatElement for f32 {}
impl FloatElement for f64 {}

/// Converts an `f64` constant into the element type.
#[inline]
pub fn cast<T: Element>(v: f64) -> T {
    T::of_f64(v)
}
