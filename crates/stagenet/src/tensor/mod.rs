//! Tensor primitives: shapes, element types, mirrored host/device storage and the
//! value/gradient pair that flows between stages.

mod element;
mod paired;
mod shape;
mod synced;

pub use element::{cast, DType, Element, FloatElement};
pub use paired::Tensor;
pub use shape::{Shape, MAX_AXES};
pub use synced::{BufferHead, SyncedBuffer};
