//! Accelerator contract: allocate, copy to and from host memory, and a handful of
//! vector primitives so reductions and gradient steps can run where the data lives.
//!
//! Device memory is opaque to the engine. A device hands out [`DeviceAllocation`]s that
//! wrap a type-erased handle; only the device that produced an allocation knows how to
//! downcast it back to its concrete representation.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::{NetError, NetResult};
use crate::tensor::Element;

/// Opaque block of device memory holding `len` elements.
pub struct DeviceAllocation {
    handle: Box<dyn Any + Send + Sync>,
    len: usize,
}

impl DeviceAllocation {
    /// Wraps a device-specific handle. Only device implementations call this.
    pub fn new<H: Any + Send + Sync>(handle: H, len: usize) -> Self {
        DeviceAllocation {
            handle: Box::new(handle),
            len,
        }
    }

    /// Number of elements the allocation can hold.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Recovers the device-specific handle.
    pub fn downcast_ref<H: Any>(&self) -> NetResult<&H> {
        self.handle
            .downcast_ref::<H>()
            .ok_or_else(|| NetError::no_device("allocation belongs to a different device"))
    }

    /// Recovers the device-specific handle mutably.
    pub fn downcast_mut<H: Any>(&mut self) -> NetResult<&mut H> {
        self.handle
            .downcast_mut::<H>()
            .ok_or_else(|| NetError::no_device("allocation belongs to a different device"))
    }
}

impl fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("len", &self.len)
            .finish()
    }
}

/// Minimal accelerator capability consumed by synchronized buffers.
///
/// Implementations must block until every transfer or primitive has completed before
/// returning, so callers observe a sequentially consistent view of memory.
pub trait Device<T: Element>: Send + Sync + fmt::Debug {
    /// Human-readable identifier (e.g. `"ref"`, `"cuda:0"`).
    fn name(&self) -> &str;

    /// Allocates `len` zero-initialized elements.
    fn allocate(&self, len: usize) -> NetResult<DeviceAllocation>;

    /// Copies `src` into the front of `dst`.
    fn upload(&self, src: &[T], dst: &mut DeviceAllocation) -> NetResult<()>;

    /// Copies the front of `src` into `dst`.
    fn download(&self, src: &DeviceAllocation, dst: &mut [T]) -> NetResult<()>;

    /// `y[..n] += alpha * x[..n]`
    fn axpy(&self, n: usize, alpha: T, x: &DeviceAllocation, y: &mut DeviceAllocation)
        -> NetResult<()>;

    /// `sum(|x[..n]|)`
    fn asum(&self, n: usize, x: &DeviceAllocation) -> NetResult<T>;

    /// `sum(x[..n] * y[..n])`
    fn dot(&self, n: usize, x: &DeviceAllocation, y: &DeviceAllocation) -> NetResult<T>;

    /// `x[..n] *= alpha`
    fn scal(&self, n: usize, alpha: T, x: &mut DeviceAllocation) -> NetResult<()>;

    /// `x[..n] = alpha`
    fn fill(&self, n: usize, alpha: T, x: &mut DeviceAllocation) -> NetResult<()>;
}

/// Shared handle to a device.
pub type DeviceRef<T> = Arc<dyn Device<T>>;
